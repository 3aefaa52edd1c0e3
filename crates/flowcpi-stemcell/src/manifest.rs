//! `stemcell.MF` rendering

use crate::error::{Result, StemcellError};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tera::{Context, Tera};

/// Stemcell API version written into every manifest
pub const STEMCELL_API_VERSION: u32 = 3;

pub const STEMCELL_FORMAT: &str = "flowcpi-light";

const MANIFEST_TEMPLATE: &str = r#"---
name: {{ name }}
version: '{{ version }}'
operating_system: {{ operating_system }}
api_version: {{ api_version }}
sha1: sha256:{{ image_digest }}
stemcell_formats:
- {{ format }}
cloud_properties:
  image_id: '{{ image_id }}'
"#;

/// A stemcell that only points at an image already uploaded to the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LightStemcell {
    pub name: String,
    pub version: String,
    pub operating_system: String,
    pub image_id: String,
}

impl LightStemcell {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        operating_system: impl Into<String>,
        image_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            operating_system: operating_system.into(),
            image_id: image_id.into(),
        }
    }

    /// Reject values that would break the manifest or the archive name
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("name", &self.name),
            ("version", &self.version),
            ("operating_system", &self.operating_system),
            ("image_id", &self.image_id),
        ] {
            if value.trim().is_empty() {
                return Err(StemcellError::EmptyField(field));
            }
            if value.chars().any(|c| c == '\'' || c == '/' || c.is_control()) {
                return Err(StemcellError::InvalidField {
                    field,
                    value: value.clone(),
                });
            }
        }
        Ok(())
    }

    /// `<name>-<version>.tgz`
    pub fn archive_name(&self) -> String {
        format!("{}-{}.tgz", self.name, self.version)
    }

    /// Render `stemcell.MF` for an image whose bytes are `image`
    pub fn render_manifest(&self, image: &[u8]) -> Result<String> {
        let mut context = Context::from_serialize(self)?;
        context.insert("api_version", &STEMCELL_API_VERSION);
        context.insert("format", STEMCELL_FORMAT);
        context.insert("image_digest", &sha256_hex(image));

        Ok(Tera::one_off(MANIFEST_TEMPLATE, &context, false)?)
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stemcell() -> LightStemcell {
        LightStemcell::new("bosh-sakura-ubuntu-jammy", "1.42", "ubuntu-jammy", "113000000042")
    }

    #[test]
    fn test_render_manifest() {
        let manifest = stemcell().render_manifest(&[]).unwrap();

        assert!(manifest.contains("name: bosh-sakura-ubuntu-jammy\n"));
        assert!(manifest.contains("version: '1.42'\n"));
        assert!(manifest.contains("operating_system: ubuntu-jammy\n"));
        assert!(manifest.contains("api_version: 3\n"));
        assert!(manifest.contains("- flowcpi-light\n"));
        assert!(manifest.contains("  image_id: '113000000042'\n"));
        assert!(manifest.contains(
            "sha1: sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        ));
    }

    #[test]
    fn test_validate() {
        stemcell().validate().unwrap();

        let mut empty = stemcell();
        empty.image_id = " ".into();
        assert!(matches!(
            empty.validate(),
            Err(StemcellError::EmptyField("image_id"))
        ));

        let mut quoted = stemcell();
        quoted.version = "1.0'".into();
        assert!(matches!(
            quoted.validate(),
            Err(StemcellError::InvalidField { field: "version", .. })
        ));

        let mut nested = stemcell();
        nested.name = "../escape".into();
        assert!(nested.validate().is_err());
    }

    #[test]
    fn test_archive_name() {
        assert_eq!(stemcell().archive_name(), "bosh-sakura-ubuntu-jammy-1.42.tgz");
    }
}
