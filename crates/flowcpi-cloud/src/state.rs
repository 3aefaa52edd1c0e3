//! Resource handles and their lifecycle states
//!
//! A [`ResourceHandle`] is what an adapter keeps for each VM, disk or snapshot
//! it manages. The orchestrator never sees handles, only their ids.

use crate::error::{CpiError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Kind of a managed resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Vm,
    Disk,
    Snapshot,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Vm => write!(f, "vm"),
            ResourceKind::Disk => write!(f, "disk"),
            ResourceKind::Snapshot => write!(f, "snapshot"),
        }
    }
}

/// Lifecycle state of a resource
///
/// - VM: `Absent → Creating → Exists → MetadataSet → Deleting → Absent`
/// - Disk: `Absent → Created → Attached → Detached → Absent`
/// - Snapshot: `Absent → Taken → Absent`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    Absent,
    Creating,
    Exists,
    MetadataSet,
    Deleting,
    Created,
    Attached,
    Detached,
    Taken,
}

impl std::fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceStatus::Absent => write!(f, "absent"),
            ResourceStatus::Creating => write!(f, "creating"),
            ResourceStatus::Exists => write!(f, "exists"),
            ResourceStatus::MetadataSet => write!(f, "metadata_set"),
            ResourceStatus::Deleting => write!(f, "deleting"),
            ResourceStatus::Created => write!(f, "created"),
            ResourceStatus::Attached => write!(f, "attached"),
            ResourceStatus::Detached => write!(f, "detached"),
            ResourceStatus::Taken => write!(f, "taken"),
        }
    }
}

impl ResourceKind {
    /// Whether `from → to` is a legal step for this kind
    pub fn allows(&self, from: ResourceStatus, to: ResourceStatus) -> bool {
        use ResourceStatus::*;
        match self {
            ResourceKind::Vm => matches!(
                (from, to),
                (Absent, Creating)
                    | (Creating, Exists)
                    | (Creating, Deleting)
                    | (Exists, MetadataSet)
                    | (MetadataSet, MetadataSet)
                    | (Exists, Deleting)
                    | (MetadataSet, Deleting)
                    | (Deleting, Absent)
            ),
            // a detached disk can move to another VM
            ResourceKind::Disk => matches!(
                (from, to),
                (Absent, Created)
                    | (Created, Attached)
                    | (Detached, Attached)
                    | (Attached, Detached)
                    | (Created, Absent)
                    | (Detached, Absent)
            ),
            ResourceKind::Snapshot => matches!((from, to), (Absent, Taken) | (Taken, Absent)),
        }
    }
}

/// An adapter-owned resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceHandle {
    /// Backend resource id
    pub id: String,

    pub kind: ResourceKind,

    pub status: ResourceStatus,

    /// Attached VM for a disk, source disk for a snapshot
    pub parent: Option<String>,

    /// Disk created as scratch space for a single VM
    pub ephemeral: bool,

    pub size_gb: Option<u32>,

    pub metadata: HashMap<String, String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl ResourceHandle {
    pub fn new(id: impl Into<String>, kind: ResourceKind) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            kind,
            status: ResourceStatus::Absent,
            parent: None,
            ephemeral: false,
            size_gb: None,
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn with_size(mut self, size_gb: u32) -> Self {
        self.size_gb = Some(size_gb);
        self
    }

    pub fn ephemeral(mut self, ephemeral: bool) -> Self {
        self.ephemeral = ephemeral;
        self
    }

    /// Move to `next`, rejecting transitions the kind does not allow
    pub fn transition_to(&mut self, next: ResourceStatus) -> Result<()> {
        let from = self.status;
        if !self.kind.allows(from, next) {
            return Err(CpiError::InvalidCall(format!(
                "{} {} cannot go from {} to {}",
                self.kind, self.id, from, next
            )));
        }

        self.status = next;
        self.updated_at = Utc::now();

        tracing::trace!(
            kind = %self.kind,
            id = %self.id,
            from = %from,
            to = %next,
            "Transitioned resource state"
        );
        Ok(())
    }

    pub fn is_absent(&self) -> bool {
        self.status == ResourceStatus::Absent
    }

    pub fn is_attached(&self) -> bool {
        self.status == ResourceStatus::Attached
    }
}
