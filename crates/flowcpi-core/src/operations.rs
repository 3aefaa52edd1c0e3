//! CPI operations
//!
//! Each public method is one director-facing call. Multi-resource workflows
//! go through a [`Lifecycle`] so that a failure part way through leaves
//! nothing behind.

use crate::lifecycle::{CleanupPolicy, Lifecycle};
use crate::pool::{WorkerPool, catch_panic};
use flowcpi_cloud::{
    CloudBackend, CpiError, DiskSpec, InMemoryBackend, ResourceKind, Result, VmSpec, mib_to_gib,
};
use flowcpi_cloud_sakura::SakuraBackend;
use flowcpi_config::{CloudPlugin, CpiConfig};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub const API_VERSION: u32 = 2;
pub const STEMCELL_FORMAT: &str = "flowcpi-light";

/// The operation set, bound to one backend for the life of the process
pub struct Cpi {
    backend: Arc<dyn CloudBackend>,
    pool: WorkerPool,
}

impl Cpi {
    pub fn new(backend: Arc<dyn CloudBackend>, pool: WorkerPool) -> Self {
        Self { backend, pool }
    }

    /// Build the backend selected by `cloud.plugin`
    pub fn from_config(config: &CpiConfig) -> Self {
        let backend: Arc<dyn CloudBackend> = match &config.cloud {
            CloudPlugin::Memory => Arc::new(InMemoryBackend::new()),
            CloudPlugin::Sakura(props) => Arc::new(
                SakuraBackend::new(&props.zone)
                    .with_timeout(Duration::from_secs(props.command_timeout_secs))
                    .with_binary(&props.usacloud_path),
            ),
        };
        tracing::debug!(backend = backend.name(), "Configured cloud backend");
        Self::new(backend, WorkerPool::new(config.pool.max_concurrency))
    }

    pub fn backend(&self) -> &Arc<dyn CloudBackend> {
        &self.backend
    }

    fn lifecycle(&self, workflow: &str) -> Lifecycle {
        Lifecycle::new(workflow, self.pool.clone())
    }

    pub fn info(&self) -> Value {
        json!({
            "api_version": API_VERSION,
            "stemcell_formats": [STEMCELL_FORMAT],
        })
    }

    /// Register a light stemcell; the image already lives in the backend
    pub fn create_stemcell(&self, image_path: &str, cloud_properties: &Value) -> Result<String> {
        match cloud_properties.get("image_id").and_then(Value::as_str) {
            Some(image_id) => {
                tracing::info!(image_id, "Using light stemcell image");
                Ok(image_id.to_string())
            }
            None => Err(CpiError::NotSupported(format!(
                "stemcell {} has no cloud_properties.image_id; only light stemcells are supported",
                image_path
            ))),
        }
    }

    pub fn delete_stemcell(&self, stemcell_id: &str) -> Result<()> {
        tracing::debug!(stemcell_id, "Light stemcell owns no backend image");
        Ok(())
    }

    pub async fn create_vm(
        &self,
        agent_id: String,
        stemcell_id: String,
        cloud_properties: Value,
        networks: Value,
        disk_cids: Vec<String>,
        env: Value,
    ) -> Result<String> {
        let ephemeral_mib = match cloud_properties.pointer("/ephemeral_disk/size") {
            None | Some(Value::Null) => None,
            Some(size) => match size.as_u64() {
                Some(mib) if mib >= 1 => Some(mib),
                _ => {
                    return Err(CpiError::InvalidCall(format!(
                        "cloud_properties.ephemeral_disk.size must be a positive integer (MiB), got {}",
                        size
                    )));
                }
            },
        };

        let mut metadata = HashMap::from([("agent_id".to_string(), agent_id.clone())]);
        if let Some(tags) = env.pointer("/bosh/tags").and_then(Value::as_object) {
            metadata.extend(stringify(tags.clone()));
        }

        let spec = VmSpec {
            agent_id,
            stemcell_id,
            cloud_properties,
            networks,
            disk_locality: disk_cids,
            env,
        };

        let backend = self.backend.as_ref();
        let mut lifecycle = self.lifecycle("create_vm");
        let outcome: Result<String> = catch_panic("create_vm", async {
            let releaser = self.backend.clone();
            let vm_id = lifecycle
                .acquire(
                    "create vm",
                    ResourceKind::Vm,
                    CleanupPolicy::OnFailure,
                    backend.create_vm(&spec),
                    move |id| async move { releaser.delete_vm(&id).await },
                )
                .await?;

            if let Some(size_mib) = ephemeral_mib {
                let disk_spec = DiskSpec::new(mib_to_gib(size_mib))
                    .near(Some(vm_id.clone()))
                    .ephemeral();
                let releaser = self.backend.clone();
                let disk_id = lifecycle
                    .acquire(
                        "create ephemeral disk",
                        ResourceKind::Disk,
                        CleanupPolicy::OnFailure,
                        backend.create_disk(&disk_spec),
                        move |id| async move { releaser.delete_disk(&id).await },
                    )
                    .await?;

                let releaser = self.backend.clone();
                let owner = vm_id.clone();
                lifecycle
                    .acquire(
                        "attach ephemeral disk",
                        ResourceKind::Disk,
                        CleanupPolicy::OnFailure,
                        async {
                            backend.attach_disk(&vm_id, &disk_id).await?;
                            Ok::<_, CpiError>(disk_id.clone())
                        },
                        move |id| async move { releaser.detach_disk(&owner, &id).await },
                    )
                    .await?;
            }

            let exists = lifecycle
                .step("verify vm", backend.vm_exists(&vm_id))
                .await?;
            if !exists {
                return Err(CpiError::VmCreationFailed(format!(
                    "vm {} disappeared right after creation",
                    vm_id
                )));
            }

            lifecycle
                .step("set vm metadata", backend.set_vm_metadata(&vm_id, &metadata))
                .await?;
            Ok::<_, CpiError>(vm_id)
        })
        .await;

        lifecycle.finish(outcome).await
    }

    /// Tear a VM down: detach everything, delete it, then drop its scratch disks
    pub async fn delete_vm(&self, vm_id: &str) -> Result<()> {
        if !self.backend.vm_exists(vm_id).await? {
            tracing::info!(vm_id, "Vm already absent");
            return Ok(());
        }

        let disks = self.backend.get_disks(vm_id).await?;
        let attached: Vec<String> = disks.iter().map(|d| d.id.clone()).collect();
        let ephemeral: Vec<String> = disks
            .iter()
            .filter(|d| d.ephemeral)
            .map(|d| d.id.clone())
            .collect();

        let mut lifecycle = self.lifecycle("delete_vm");

        // pushed in reverse of the order they run
        let releaser = self.backend.clone();
        lifecycle.defer_each(
            "delete ephemeral disks",
            ResourceKind::Disk,
            ephemeral,
            CleanupPolicy::Always,
            move |id| {
                let backend = releaser.clone();
                async move { backend.delete_disk(&id).await }
            },
        );

        let releaser = self.backend.clone();
        lifecycle.defer(
            "delete vm",
            ResourceKind::Vm,
            vm_id,
            CleanupPolicy::Always,
            move |id| async move { releaser.delete_vm(&id).await },
        );

        let releaser = self.backend.clone();
        let owner = vm_id.to_string();
        lifecycle.defer_each(
            "detach disks",
            ResourceKind::Disk,
            attached,
            CleanupPolicy::Always,
            move |id| {
                let backend = releaser.clone();
                let owner = owner.clone();
                async move { backend.detach_disk(&owner, &id).await }
            },
        );

        lifecycle.teardown().await
    }

    pub async fn has_vm(&self, vm_id: &str) -> Result<bool> {
        self.backend.vm_exists(vm_id).await
    }

    pub async fn reboot_vm(&self, vm_id: &str) -> Result<()> {
        self.require_vm(vm_id).await?;
        self.backend.reboot_vm(vm_id).await
    }

    pub async fn set_vm_metadata(&self, vm_id: &str, metadata: Map<String, Value>) -> Result<()> {
        self.require_vm(vm_id).await?;
        self.backend
            .set_vm_metadata(vm_id, &stringify(metadata))
            .await
    }

    pub async fn create_disk(
        &self,
        size_mib: u64,
        cloud_properties: Value,
        vm_locality: Option<String>,
    ) -> Result<String> {
        if size_mib < 1 {
            return Err(CpiError::InvalidCall(format!(
                "disk size must be at least 1 MiB, got {}",
                size_mib
            )));
        }

        let snapshot_check = cloud_properties
            .get("snapshot_check")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let spec = DiskSpec::new(mib_to_gib(size_mib))
            .with_properties(cloud_properties)
            .near(vm_locality);

        let backend = self.backend.as_ref();
        let mut lifecycle = self.lifecycle("create_disk");
        let outcome: Result<String> = catch_panic("create_disk", async {
            let releaser = self.backend.clone();
            let disk_id = lifecycle
                .acquire(
                    "create disk",
                    ResourceKind::Disk,
                    CleanupPolicy::OnFailure,
                    backend.create_disk(&spec),
                    move |id| async move { releaser.delete_disk(&id).await },
                )
                .await?;

            if snapshot_check {
                let metadata =
                    HashMap::from([("purpose".to_string(), "snapshot_check".to_string())]);
                let releaser = self.backend.clone();
                lifecycle
                    .acquire(
                        "snapshot check",
                        ResourceKind::Snapshot,
                        CleanupPolicy::Always,
                        backend.snapshot_disk(&disk_id, &metadata),
                        move |id| async move { releaser.delete_snapshot(&id).await },
                    )
                    .await?;
            }

            Ok::<_, CpiError>(disk_id)
        })
        .await;

        lifecycle.finish(outcome).await
    }

    pub async fn delete_disk(&self, disk_id: &str) -> Result<()> {
        self.backend.delete_disk(disk_id).await
    }

    pub async fn has_disk(&self, disk_id: &str) -> Result<bool> {
        self.backend.disk_exists(disk_id).await
    }

    pub async fn attach_disk(&self, vm_id: &str, disk_id: &str) -> Result<()> {
        self.require_vm(vm_id).await?;
        self.require_disk(disk_id).await?;
        self.backend.attach_disk(vm_id, disk_id).await
    }

    pub async fn detach_disk(&self, vm_id: &str, disk_id: &str) -> Result<()> {
        self.require_vm(vm_id).await?;
        self.require_disk(disk_id).await?;
        self.backend.detach_disk(vm_id, disk_id).await
    }

    pub async fn get_disks(&self, vm_id: &str) -> Result<Vec<String>> {
        self.require_vm(vm_id).await?;
        let disks = self.backend.get_disks(vm_id).await?;
        Ok(disks.into_iter().map(|d| d.id).collect())
    }

    pub async fn snapshot_disk(&self, disk_id: &str, metadata: Map<String, Value>) -> Result<String> {
        self.require_disk(disk_id).await?;
        self.backend
            .snapshot_disk(disk_id, &stringify(metadata))
            .await
    }

    pub async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()> {
        self.backend.delete_snapshot(snapshot_id).await
    }

    async fn require_vm(&self, vm_id: &str) -> Result<()> {
        if self.backend.vm_exists(vm_id).await? {
            Ok(())
        } else {
            Err(CpiError::VmNotFound(vm_id.to_string()))
        }
    }

    async fn require_disk(&self, disk_id: &str) -> Result<()> {
        if self.backend.disk_exists(disk_id).await? {
            Ok(())
        } else {
            Err(CpiError::DiskNotFound(disk_id.to_string()))
        }
    }
}

/// Metadata values as the backends store them
fn stringify(map: Map<String, Value>) -> HashMap<String, String> {
    map.into_iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            (key, value)
        })
        .collect()
}
