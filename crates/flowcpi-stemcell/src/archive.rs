//! Stemcell tarball creation

use crate::error::{Result, StemcellError};
use crate::manifest::LightStemcell;
use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tar::{Builder, Header};

pub const MANIFEST_ENTRY: &str = "stemcell.MF";
pub const IMAGE_ENTRY: &str = "image";

impl LightStemcell {
    /// Write `<name>-<version>.tgz` into `output_dir` and return its path
    ///
    /// The archive is written to a temporary file next to the target and
    /// renamed into place, so an interrupted run never leaves half an archive.
    pub fn package(&self, output_dir: &Path) -> Result<PathBuf> {
        self.validate()?;
        fs::create_dir_all(output_dir)?;

        // light stemcells carry no image bytes
        let image: &[u8] = &[];
        let manifest = self.render_manifest(image)?;

        let target = output_dir.join(self.archive_name());
        tracing::debug!("Packaging stemcell into {}", target.display());

        let staging = tempfile::NamedTempFile::new_in(output_dir)?;
        {
            let encoder = GzEncoder::new(staging.as_file(), Compression::default());
            let mut tar = Builder::new(encoder);

            append(&mut tar, MANIFEST_ENTRY, manifest.as_bytes())?;
            append(&mut tar, IMAGE_ENTRY, image)?;

            let mut encoder = tar.into_inner()?;
            encoder.flush()?;
            encoder.finish()?;
        }

        staging.persist(&target).map_err(|e| StemcellError::Write {
            path: target.clone(),
            source: e.error,
        })?;

        tracing::info!(
            name = %self.name,
            version = %self.version,
            "Stemcell written to {}",
            target.display()
        );
        Ok(target)
    }
}

fn append<W: Write>(tar: &mut Builder<W>, path: &str, data: &[u8]) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_path(path)?;
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    tar.append(&header, data)?;
    Ok(())
}
