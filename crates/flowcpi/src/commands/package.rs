use flowcpi_stemcell::LightStemcell;
use std::path::Path;

pub fn handle(
    name: &str,
    version: &str,
    os: &str,
    image_id: &str,
    output_dir: &Path,
) -> anyhow::Result<()> {
    let stemcell = LightStemcell::new(name, version, os, image_id);
    let archive = stemcell.package(output_dir)?;
    println!("{}", archive.display());
    Ok(())
}
