//! Backend adapter trait definition

use crate::error::{CpiError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// IaaS backend abstraction
///
/// Each backend (Sakura Cloud, in-memory) implements this trait. Every method
/// either returns a value or a [`CpiError`] that is already classified, so
/// callers never need to inspect backend-specific failures.
#[async_trait]
pub trait CloudBackend: Send + Sync {
    /// Backend name for logs (e.g., "sakura-cloud", "memory")
    fn name(&self) -> &str;

    async fn create_vm(&self, spec: &VmSpec) -> Result<String>;

    /// Deleting an absent VM succeeds
    async fn delete_vm(&self, vm_id: &str) -> Result<()>;

    async fn vm_exists(&self, vm_id: &str) -> Result<bool>;

    async fn set_vm_metadata(&self, vm_id: &str, metadata: &HashMap<String, String>) -> Result<()>;

    async fn reboot_vm(&self, vm_id: &str) -> Result<()> {
        Err(CpiError::NotSupported(format!(
            "{} cannot reboot vm {}",
            self.name(),
            vm_id
        )))
    }

    async fn create_disk(&self, spec: &DiskSpec) -> Result<String>;

    /// Deleting an absent disk succeeds
    async fn delete_disk(&self, disk_id: &str) -> Result<()>;

    async fn disk_exists(&self, disk_id: &str) -> Result<bool>;

    async fn attach_disk(&self, vm_id: &str, disk_id: &str) -> Result<()>;

    async fn detach_disk(&self, vm_id: &str, disk_id: &str) -> Result<()>;

    /// Disks currently attached to a VM
    async fn get_disks(&self, vm_id: &str) -> Result<Vec<DiskInfo>>;

    async fn snapshot_disk(&self, disk_id: &str, metadata: &HashMap<String, String>)
    -> Result<String>;

    /// Deleting an absent snapshot succeeds
    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()>;
}

/// Everything a backend needs to create a VM
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VmSpec {
    pub agent_id: String,

    /// Backend image the VM boots from
    pub stemcell_id: String,

    /// Backend-specific VM properties (plan, zone overrides, ...)
    pub cloud_properties: serde_json::Value,

    pub networks: serde_json::Value,

    /// Disks the VM should be placed near
    pub disk_locality: Vec<String>,

    pub env: serde_json::Value,
}

impl VmSpec {
    /// Get a cloud property as a specific type
    pub fn property<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.cloud_properties
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// Everything a backend needs to create a disk
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiskSpec {
    pub size_gb: u32,

    pub cloud_properties: serde_json::Value,

    /// VM the disk should be placed near
    pub vm_locality: Option<String>,

    /// Scratch disk that lives and dies with one VM
    pub ephemeral: bool,
}

impl DiskSpec {
    pub fn new(size_gb: u32) -> Self {
        Self {
            size_gb,
            cloud_properties: serde_json::Value::Null,
            vm_locality: None,
            ephemeral: false,
        }
    }

    pub fn with_properties(mut self, cloud_properties: serde_json::Value) -> Self {
        self.cloud_properties = cloud_properties;
        self
    }

    pub fn near(mut self, vm_id: Option<String>) -> Self {
        self.vm_locality = vm_id;
        self
    }

    pub fn ephemeral(mut self) -> Self {
        self.ephemeral = true;
        self
    }
}

/// Disk attached to a VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskInfo {
    pub id: String,
    pub ephemeral: bool,
}

/// Round a size in MiB up to whole GiB
pub fn mib_to_gib(size_mib: u64) -> u32 {
    u32::try_from(size_mib.div_ceil(1024)).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mib_to_gib_rounds_up() {
        assert_eq!(mib_to_gib(1), 1);
        assert_eq!(mib_to_gib(1024), 1);
        assert_eq!(mib_to_gib(1025), 2);
        assert_eq!(mib_to_gib(10240), 10);
    }

    #[test]
    fn test_vm_spec_property() {
        let spec = VmSpec {
            cloud_properties: serde_json::json!({"plan": "2core-4gb", "disk": 20}),
            ..Default::default()
        };
        assert_eq!(spec.property::<String>("plan").as_deref(), Some("2core-4gb"));
        assert_eq!(spec.property::<u32>("disk"), Some(20));
        assert_eq!(spec.property::<u32>("missing"), None);
    }
}
