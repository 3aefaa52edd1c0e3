//! FlowCPI light stemcell packaging
//!
//! Builds a stemcell tarball that references an image already present in the
//! backend instead of embedding its bytes:
//!
//! ```text
//! <name>-<version>.tgz
//! ├── stemcell.MF   (manifest, cloud_properties.image_id)
//! └── image         (empty)
//! ```

pub mod archive;
pub mod error;
pub mod manifest;

pub use archive::{IMAGE_ENTRY, MANIFEST_ENTRY};
pub use error::{Result, StemcellError};
pub use manifest::{LightStemcell, STEMCELL_API_VERSION, STEMCELL_FORMAT, sha256_hex};
