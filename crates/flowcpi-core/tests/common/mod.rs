use async_trait::async_trait;
use flowcpi_cloud::{
    CloudBackend, CpiError, DiskInfo, DiskSpec, InMemoryBackend, ResourceKind, Result, VmSpec,
};
use flowcpi_core::{Cpi, Dispatcher, WorkerPool};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// In-memory backend that records every call and can be told to fail
pub struct RecordingBackend {
    inner: InMemoryBackend,
    calls: Mutex<Vec<(&'static str, String)>>,
    faults: Mutex<HashMap<&'static str, CpiError>>,
    panics: Mutex<HashSet<&'static str>>,
}

impl RecordingBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryBackend::new(),
            calls: Mutex::new(Vec::new()),
            faults: Mutex::new(HashMap::new()),
            panics: Mutex::new(HashSet::new()),
        })
    }

    /// Make every later call to `method` fail with `error`
    pub fn fail(&self, method: &'static str, error: CpiError) {
        self.faults.lock().unwrap().insert(method, error);
    }

    /// Make every later call to `method` panic
    #[allow(dead_code)]
    pub fn panic_on(&self, method: &'static str) {
        self.panics.lock().unwrap().insert(method);
    }

    /// Method names in call order
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().iter().map(|(m, _)| *m).collect()
    }

    #[allow(dead_code)]
    pub fn calls_to(&self, method: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| *m == method)
            .map(|(_, target)| target.clone())
            .collect()
    }

    pub async fn count(&self, kind: ResourceKind) -> usize {
        self.inner.count(kind).await
    }

    fn record(&self, method: &'static str, target: &str) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push((method, target.to_string()));
        let panics = self.panics.lock().unwrap().contains(method);
        if panics {
            panic!("{} blew up on {}", method, target);
        }
        match self.faults.lock().unwrap().get(method) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl CloudBackend for RecordingBackend {
    fn name(&self) -> &str {
        "recording"
    }

    async fn create_vm(&self, spec: &VmSpec) -> Result<String> {
        self.record("create_vm", &spec.agent_id)?;
        self.inner.create_vm(spec).await
    }

    async fn delete_vm(&self, vm_id: &str) -> Result<()> {
        self.record("delete_vm", vm_id)?;
        self.inner.delete_vm(vm_id).await
    }

    async fn vm_exists(&self, vm_id: &str) -> Result<bool> {
        self.record("vm_exists", vm_id)?;
        self.inner.vm_exists(vm_id).await
    }

    async fn set_vm_metadata(&self, vm_id: &str, metadata: &HashMap<String, String>) -> Result<()> {
        self.record("set_vm_metadata", vm_id)?;
        self.inner.set_vm_metadata(vm_id, metadata).await
    }

    async fn create_disk(&self, spec: &DiskSpec) -> Result<String> {
        self.record("create_disk", &spec.size_gb.to_string())?;
        self.inner.create_disk(spec).await
    }

    async fn delete_disk(&self, disk_id: &str) -> Result<()> {
        self.record("delete_disk", disk_id)?;
        self.inner.delete_disk(disk_id).await
    }

    async fn disk_exists(&self, disk_id: &str) -> Result<bool> {
        self.record("disk_exists", disk_id)?;
        self.inner.disk_exists(disk_id).await
    }

    async fn attach_disk(&self, vm_id: &str, disk_id: &str) -> Result<()> {
        self.record("attach_disk", disk_id)?;
        self.inner.attach_disk(vm_id, disk_id).await
    }

    async fn detach_disk(&self, vm_id: &str, disk_id: &str) -> Result<()> {
        self.record("detach_disk", disk_id)?;
        self.inner.detach_disk(vm_id, disk_id).await
    }

    async fn get_disks(&self, vm_id: &str) -> Result<Vec<DiskInfo>> {
        self.record("get_disks", vm_id)?;
        self.inner.get_disks(vm_id).await
    }

    async fn snapshot_disk(
        &self,
        disk_id: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<String> {
        self.record("snapshot_disk", disk_id)?;
        self.inner.snapshot_disk(disk_id, metadata).await
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()> {
        self.record("delete_snapshot", snapshot_id)?;
        self.inner.delete_snapshot(snapshot_id).await
    }
}

/// Dispatcher over a recording backend
pub fn dispatcher(backend: &Arc<RecordingBackend>) -> Dispatcher {
    Dispatcher::new(Cpi::new(backend.clone(), WorkerPool::new(2)))
}
