//! In-memory backend
//!
//! Keeps every resource as a [`ResourceHandle`] and enforces the lifecycle
//! state machines. Used by `cloud.plugin: memory` and by tests.

use crate::error::{CpiError, Result};
use crate::provider::{CloudBackend, DiskInfo, DiskSpec, VmSpec};
use crate::state::{ResourceHandle, ResourceKind, ResourceStatus};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct Inventory {
    next_id: u64,
    resources: HashMap<String, ResourceHandle>,
}

impl Inventory {
    fn allocate_id(&mut self, kind: ResourceKind) -> String {
        self.next_id += 1;
        format!("{}-{}", kind, self.next_id)
    }

    fn get(&self, id: &str, kind: ResourceKind) -> Option<&ResourceHandle> {
        self.resources.get(id).filter(|h| h.kind == kind)
    }

    fn get_mut(&mut self, id: &str, kind: ResourceKind) -> Option<&mut ResourceHandle> {
        self.resources.get_mut(id).filter(|h| h.kind == kind)
    }

    fn vm(&self, vm_id: &str) -> Result<&ResourceHandle> {
        self.get(vm_id, ResourceKind::Vm)
            .ok_or_else(|| CpiError::VmNotFound(vm_id.to_string()))
    }

    fn disk_mut(&mut self, disk_id: &str) -> Result<&mut ResourceHandle> {
        self.get_mut(disk_id, ResourceKind::Disk)
            .ok_or_else(|| CpiError::DiskNotFound(disk_id.to_string()))
    }

    fn attached_to<'a>(&'a self, vm_id: &'a str) -> impl Iterator<Item = &'a ResourceHandle> + 'a {
        self.resources.values().filter(move |h| {
            h.kind == ResourceKind::Disk && h.is_attached() && h.parent.as_deref() == Some(vm_id)
        })
    }
}

/// Backend keeping all resources in process memory
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    inventory: Mutex<Inventory>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current copy of a resource, if it exists
    pub async fn handle(&self, id: &str) -> Option<ResourceHandle> {
        self.inventory.lock().await.resources.get(id).cloned()
    }

    /// Number of live resources of a kind
    pub async fn count(&self, kind: ResourceKind) -> usize {
        self.inventory
            .lock()
            .await
            .resources
            .values()
            .filter(|h| h.kind == kind)
            .count()
    }
}

#[async_trait]
impl CloudBackend for InMemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create_vm(&self, spec: &VmSpec) -> Result<String> {
        if spec.stemcell_id.is_empty() {
            return Err(CpiError::InvalidCall("stemcell id must not be empty".into()));
        }

        let mut inventory = self.inventory.lock().await;
        let id = inventory.allocate_id(ResourceKind::Vm);
        let mut vm = ResourceHandle::new(&id, ResourceKind::Vm);
        vm.transition_to(ResourceStatus::Creating)?;
        vm.transition_to(ResourceStatus::Exists)?;
        vm.metadata
            .insert("agent_id".to_string(), spec.agent_id.clone());
        inventory.resources.insert(id.clone(), vm);

        tracing::debug!(vm_id = %id, stemcell = %spec.stemcell_id, "Created vm");
        Ok(id)
    }

    async fn delete_vm(&self, vm_id: &str) -> Result<()> {
        let mut inventory = self.inventory.lock().await;
        let Some(vm) = inventory.get_mut(vm_id, ResourceKind::Vm) else {
            tracing::debug!(vm_id, "Vm already absent");
            return Ok(());
        };
        vm.transition_to(ResourceStatus::Deleting)?;

        // the backend releases whatever is still attached
        let attached: Vec<String> = inventory.attached_to(vm_id).map(|d| d.id.clone()).collect();
        for disk_id in attached {
            let disk = inventory.disk_mut(&disk_id)?;
            disk.transition_to(ResourceStatus::Detached)?;
            disk.parent = None;
        }

        if let Some(mut vm) = inventory.resources.remove(vm_id) {
            vm.transition_to(ResourceStatus::Absent)?;
        }
        Ok(())
    }

    async fn vm_exists(&self, vm_id: &str) -> Result<bool> {
        Ok(self
            .inventory
            .lock()
            .await
            .get(vm_id, ResourceKind::Vm)
            .is_some())
    }

    async fn set_vm_metadata(&self, vm_id: &str, metadata: &HashMap<String, String>) -> Result<()> {
        let mut inventory = self.inventory.lock().await;
        let vm = inventory
            .get_mut(vm_id, ResourceKind::Vm)
            .ok_or_else(|| CpiError::VmNotFound(vm_id.to_string()))?;
        vm.transition_to(ResourceStatus::MetadataSet)?;
        vm.metadata
            .extend(metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn reboot_vm(&self, vm_id: &str) -> Result<()> {
        self.inventory.lock().await.vm(vm_id)?;
        tracing::debug!(vm_id, "Rebooted vm");
        Ok(())
    }

    async fn create_disk(&self, spec: &DiskSpec) -> Result<String> {
        if spec.size_gb == 0 {
            return Err(CpiError::InvalidCall("disk size must be at least 1 GiB".into()));
        }

        let mut inventory = self.inventory.lock().await;
        let id = inventory.allocate_id(ResourceKind::Disk);
        let mut disk = ResourceHandle::new(&id, ResourceKind::Disk)
            .with_size(spec.size_gb)
            .ephemeral(spec.ephemeral);
        disk.transition_to(ResourceStatus::Created)?;
        inventory.resources.insert(id.clone(), disk);

        tracing::debug!(disk_id = %id, size_gb = spec.size_gb, "Created disk");
        Ok(id)
    }

    async fn delete_disk(&self, disk_id: &str) -> Result<()> {
        let mut inventory = self.inventory.lock().await;
        let Some(disk) = inventory.get_mut(disk_id, ResourceKind::Disk) else {
            tracing::debug!(disk_id, "Disk already absent");
            return Ok(());
        };
        disk.transition_to(ResourceStatus::Absent)?;
        inventory.resources.remove(disk_id);
        Ok(())
    }

    async fn disk_exists(&self, disk_id: &str) -> Result<bool> {
        Ok(self
            .inventory
            .lock()
            .await
            .get(disk_id, ResourceKind::Disk)
            .is_some())
    }

    async fn attach_disk(&self, vm_id: &str, disk_id: &str) -> Result<()> {
        let mut inventory = self.inventory.lock().await;
        inventory.vm(vm_id)?;
        let disk = inventory.disk_mut(disk_id)?;
        if let (true, Some(owner)) = (disk.is_attached(), disk.parent.as_deref()) {
            return Err(CpiError::InvalidCall(format!(
                "disk {} is already attached to vm {}",
                disk_id, owner
            )));
        }
        disk.transition_to(ResourceStatus::Attached)?;
        disk.parent = Some(vm_id.to_string());
        Ok(())
    }

    async fn detach_disk(&self, vm_id: &str, disk_id: &str) -> Result<()> {
        let mut inventory = self.inventory.lock().await;
        inventory.vm(vm_id)?;
        let disk = inventory.disk_mut(disk_id)?;
        if !disk.is_attached() || disk.parent.as_deref() != Some(vm_id) {
            return Err(CpiError::DiskNotAttached {
                vm_id: vm_id.to_string(),
                disk_id: disk_id.to_string(),
            });
        }
        disk.transition_to(ResourceStatus::Detached)?;
        disk.parent = None;
        Ok(())
    }

    async fn get_disks(&self, vm_id: &str) -> Result<Vec<DiskInfo>> {
        let inventory = self.inventory.lock().await;
        inventory.vm(vm_id)?;
        let mut disks: Vec<DiskInfo> = inventory
            .attached_to(vm_id)
            .map(|d| DiskInfo {
                id: d.id.clone(),
                ephemeral: d.ephemeral,
            })
            .collect();
        disks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(disks)
    }

    async fn snapshot_disk(
        &self,
        disk_id: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<String> {
        let mut inventory = self.inventory.lock().await;
        inventory.disk_mut(disk_id)?;
        let id = inventory.allocate_id(ResourceKind::Snapshot);
        let mut snapshot = ResourceHandle::new(&id, ResourceKind::Snapshot).with_parent(disk_id);
        snapshot.metadata = metadata.clone();
        snapshot.transition_to(ResourceStatus::Taken)?;
        inventory.resources.insert(id.clone(), snapshot);
        Ok(id)
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()> {
        let mut inventory = self.inventory.lock().await;
        let Some(snapshot) = inventory.get_mut(snapshot_id, ResourceKind::Snapshot) else {
            tracing::debug!(snapshot_id, "Snapshot already absent");
            return Ok(());
        };
        snapshot.transition_to(ResourceStatus::Absent)?;
        inventory.resources.remove(snapshot_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn vm_spec() -> VmSpec {
        VmSpec {
            agent_id: "agent-1".into(),
            stemcell_id: "img-1".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_delete_absent_is_noop() {
        let backend = InMemoryBackend::new();
        backend.delete_vm("vm-404").await.unwrap();
        backend.delete_disk("disk-404").await.unwrap();
        backend.delete_snapshot("snapshot-404").await.unwrap();
    }

    #[tokio::test]
    async fn test_attach_detach_cycle() {
        let backend = InMemoryBackend::new();
        let vm = backend.create_vm(&vm_spec()).await.unwrap();
        let disk = backend.create_disk(&DiskSpec::new(10)).await.unwrap();

        backend.attach_disk(&vm, &disk).await.unwrap();
        assert_eq!(
            backend.get_disks(&vm).await.unwrap(),
            vec![DiskInfo {
                id: disk.clone(),
                ephemeral: false
            }]
        );

        let err = backend.attach_disk(&vm, &disk).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidCall);

        backend.detach_disk(&vm, &disk).await.unwrap();
        let err = backend.detach_disk(&vm, &disk).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DiskNotAttached);
    }

    #[tokio::test]
    async fn test_missing_resources_are_classified() {
        let backend = InMemoryBackend::new();
        let vm = backend.create_vm(&vm_spec()).await.unwrap();

        let err = backend.attach_disk(&vm, "disk-404").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DiskNotFound);

        let err = backend.attach_disk("vm-404", "disk-404").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::VmNotFound);

        let err = backend
            .snapshot_disk("disk-404", &HashMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DiskNotFound);
    }

    #[tokio::test]
    async fn test_delete_vm_releases_attached_disks() {
        let backend = InMemoryBackend::new();
        let vm = backend.create_vm(&vm_spec()).await.unwrap();
        let disk = backend.create_disk(&DiskSpec::new(1)).await.unwrap();
        backend.attach_disk(&vm, &disk).await.unwrap();

        backend.delete_vm(&vm).await.unwrap();

        assert!(!backend.vm_exists(&vm).await.unwrap());
        let handle = backend.handle(&disk).await.unwrap();
        assert_eq!(handle.status, ResourceStatus::Detached);
        assert!(handle.parent.is_none());
    }

    #[tokio::test]
    async fn test_attached_disk_delete_is_rejected() {
        let backend = InMemoryBackend::new();
        let vm = backend.create_vm(&vm_spec()).await.unwrap();
        let disk = backend.create_disk(&DiskSpec::new(1)).await.unwrap();
        backend.attach_disk(&vm, &disk).await.unwrap();

        let err = backend.delete_disk(&disk).await.unwrap_err();
        assert!(!err.ok_to_retry());
        assert!(backend.disk_exists(&disk).await.unwrap());
    }

    #[tokio::test]
    async fn test_metadata_merges() {
        let backend = InMemoryBackend::new();
        let vm = backend.create_vm(&vm_spec()).await.unwrap();
        let metadata: HashMap<String, String> =
            [("deployment".to_string(), "cf".to_string())].into();
        backend.set_vm_metadata(&vm, &metadata).await.unwrap();
        backend.set_vm_metadata(&vm, &metadata).await.unwrap();

        let handle = backend.handle(&vm).await.unwrap();
        assert_eq!(handle.status, ResourceStatus::MetadataSet);
        assert_eq!(handle.metadata.get("deployment").map(String::as_str), Some("cf"));
        assert_eq!(handle.metadata.get("agent_id").map(String::as_str), Some("agent-1"));
    }
}
