//! Sakura Cloud backend implementation

use crate::error::SakuraError;
use crate::usacloud::{CreateDiskConfig, CreateServerConfig, EPHEMERAL_TAG, Usacloud};
use async_trait::async_trait;
use flowcpi_cloud::{CloudBackend, CpiError, DiskInfo, DiskSpec, Result, VmSpec};
use std::collections::HashMap;
use std::time::Duration;

const DEFAULT_SYSTEM_DISK_GB: i32 = 20;

/// Parse plan string like "2core-4gb" to (core, memory_gb)
fn parse_plan(plan: Option<&str>) -> std::result::Result<(i32, i32), SakuraError> {
    let Some(p) = plan else {
        return Ok((1, 1)); // Default: 1 core, 1GB
    };

    let parts: Vec<&str> = p.split('-').collect();
    if let [core, memory] = parts.as_slice() {
        let core = core.trim_end_matches("core").parse::<i32>();
        let memory = memory.trim_end_matches("gb").parse::<i32>();
        if let (Ok(core), Ok(memory)) = (core, memory) {
            return Ok((core, memory));
        }
    }
    Err(SakuraError::InvalidPlan(p.to_string()))
}

/// Render metadata as sorted `key=value` tags
fn metadata_tags(metadata: &HashMap<String, String>) -> Vec<String> {
    let mut tags: Vec<String> = metadata
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    tags.sort();
    tags
}

/// Sakura Cloud backend
pub struct SakuraBackend {
    usacloud: Usacloud,
}

impl SakuraBackend {
    pub fn new(zone: impl Into<String>) -> Self {
        Self {
            usacloud: Usacloud::new(zone),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.usacloud = self.usacloud.with_timeout(timeout);
        self
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.usacloud = self.usacloud.with_binary(binary);
        self
    }

    pub fn zone(&self) -> &str {
        self.usacloud.zone()
    }

    async fn require_server(&self, vm_id: &str) -> std::result::Result<(), SakuraError> {
        match self.usacloud.get_server(vm_id).await? {
            Some(_) => Ok(()),
            None => Err(SakuraError::ServerNotFound(vm_id.to_string())),
        }
    }
}

#[async_trait]
impl CloudBackend for SakuraBackend {
    fn name(&self) -> &str {
        "sakura-cloud"
    }

    async fn create_vm(&self, spec: &VmSpec) -> Result<String> {
        let plan = spec.property::<String>("plan");
        let (core, memory) = parse_plan(plan.as_deref())?;

        let config = CreateServerConfig {
            name: format!("vm-{}", spec.agent_id),
            core,
            memory,
            disk_size: spec
                .property::<i32>("system_disk_gb")
                .unwrap_or(DEFAULT_SYSTEM_DISK_GB),
            source_archive_id: spec.stemcell_id.clone(),
            tags: vec![format!("agent_id={}", spec.agent_id)],
        };

        tracing::info!(agent_id = %spec.agent_id, zone = %self.zone(), "Creating server");
        let server = self.usacloud.create_server(&config).await?;
        Ok(server.id)
    }

    async fn delete_vm(&self, vm_id: &str) -> Result<()> {
        if self.usacloud.get_server(vm_id).await?.is_none() {
            tracing::debug!(vm_id, "Server already absent");
            return Ok(());
        }
        self.usacloud.delete_server(vm_id).await?;
        Ok(())
    }

    async fn vm_exists(&self, vm_id: &str) -> Result<bool> {
        Ok(self.usacloud.get_server(vm_id).await?.is_some())
    }

    async fn set_vm_metadata(&self, vm_id: &str, metadata: &HashMap<String, String>) -> Result<()> {
        let server = self
            .usacloud
            .get_server(vm_id)
            .await?
            .ok_or_else(|| CpiError::VmNotFound(vm_id.to_string()))?;

        // keep tags whose key is not being replaced
        let mut tags: Vec<String> = server
            .tags
            .into_iter()
            .filter(|t| {
                let key = t.split('=').next().unwrap_or_default();
                !metadata.contains_key(key)
            })
            .collect();
        tags.extend(metadata_tags(metadata));

        self.usacloud.set_server_tags(vm_id, &tags).await?;
        Ok(())
    }

    async fn reboot_vm(&self, vm_id: &str) -> Result<()> {
        self.require_server(vm_id).await?;
        self.usacloud.reset_server(vm_id).await?;
        Ok(())
    }

    async fn create_disk(&self, spec: &DiskSpec) -> Result<String> {
        let mut tags = Vec::new();
        if spec.ephemeral {
            tags.push(EPHEMERAL_TAG.to_string());
        }
        if let Some(ref vm_id) = spec.vm_locality {
            tags.push(format!("near={}", vm_id));
        }

        let config = CreateDiskConfig {
            name: format!("flowcpi-disk-{}gb", spec.size_gb),
            size_gb: spec.size_gb,
            plan: spec
                .cloud_properties
                .get("plan")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            tags,
        };

        let disk = self.usacloud.create_disk(&config).await?;
        Ok(disk.id)
    }

    async fn delete_disk(&self, disk_id: &str) -> Result<()> {
        if self.usacloud.get_disk(disk_id).await?.is_none() {
            tracing::debug!(disk_id, "Disk already absent");
            return Ok(());
        }
        self.usacloud.delete_disk(disk_id).await?;
        Ok(())
    }

    async fn disk_exists(&self, disk_id: &str) -> Result<bool> {
        Ok(self.usacloud.get_disk(disk_id).await?.is_some())
    }

    async fn attach_disk(&self, vm_id: &str, disk_id: &str) -> Result<()> {
        self.require_server(vm_id).await?;
        let disk = self
            .usacloud
            .get_disk(disk_id)
            .await?
            .ok_or_else(|| CpiError::DiskNotFound(disk_id.to_string()))?;

        match disk.server() {
            Some(owner) if owner == vm_id => {
                tracing::debug!(vm_id, disk_id, "Disk already connected");
                Ok(())
            }
            Some(owner) => Err(CpiError::InvalidCall(format!(
                "disk {} is already attached to vm {}",
                disk_id, owner
            ))),
            None => {
                self.usacloud.connect_disk(disk_id, vm_id).await?;
                Ok(())
            }
        }
    }

    async fn detach_disk(&self, vm_id: &str, disk_id: &str) -> Result<()> {
        self.require_server(vm_id).await?;
        let disk = self
            .usacloud
            .get_disk(disk_id)
            .await?
            .ok_or_else(|| CpiError::DiskNotFound(disk_id.to_string()))?;

        if disk.server().as_deref() != Some(vm_id) {
            return Err(SakuraError::DiskNotConnected {
                server: vm_id.to_string(),
                disk: disk_id.to_string(),
            }
            .into());
        }
        self.usacloud.disconnect_disk(disk_id).await?;
        Ok(())
    }

    async fn get_disks(&self, vm_id: &str) -> Result<Vec<DiskInfo>> {
        self.require_server(vm_id).await?;
        let disks = self
            .usacloud
            .list_disks()
            .await?
            .into_iter()
            .filter(|d| d.server().as_deref() == Some(vm_id))
            .map(|d| DiskInfo {
                ephemeral: d.is_ephemeral(),
                id: d.id,
            })
            .collect();
        Ok(disks)
    }

    async fn snapshot_disk(
        &self,
        disk_id: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<String> {
        if self.usacloud.get_disk(disk_id).await?.is_none() {
            return Err(CpiError::DiskNotFound(disk_id.to_string()));
        }

        let name = format!("snapshot-{}", disk_id);
        let archive = self
            .usacloud
            .create_archive(&name, disk_id, &metadata_tags(metadata))
            .await?;
        Ok(archive.id)
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()> {
        if self.usacloud.get_archive(snapshot_id).await?.is_none() {
            tracing::debug!(snapshot_id, "Archive already absent");
            return Ok(());
        }
        self.usacloud.delete_archive(snapshot_id).await?;
        Ok(())
    }
}
