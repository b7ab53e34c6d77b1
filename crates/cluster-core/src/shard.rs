//! Shard identity and per-copy routing entries
//!
//! A `ShardRouting` describes one copy (primary or replica) of one shard. Copies are
//! values: every lifecycle transition returns a new `ShardRouting`, the old one is never
//! mutated in place.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::node::NodeId;
use crate::unassigned::UnassignedInfo;

/// Index identity: name plus the uuid assigned at creation
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Index {
    pub name: String,
    pub uuid: String,
}

impl Index {
    pub fn new(name: impl Into<String>, uuid: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uuid: uuid.into(),
        }
    }
}

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}/{}]", self.name, self.uuid)
    }
}

/// Shard identity: (index, ordinal)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId {
    pub index: Index,
    pub id: u32,
}

impl ShardId {
    pub fn new(index: Index, id: u32) -> Self {
        Self { index, id }
    }

    pub fn index_name(&self) -> &str {
        &self.index.name
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}][{}]", self.index.name, self.id)
    }
}

/// Lifecycle state of a shard copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShardRoutingState {
    /// Not assigned to any node
    Unassigned,
    /// Assigned, recovery in progress
    Initializing,
    /// Active on its node
    Started,
    /// Active, and being copied to another node
    Relocating,
}

impl fmt::Display for ShardRoutingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardRoutingState::Unassigned => write!(f, "UNASSIGNED"),
            ShardRoutingState::Initializing => write!(f, "INITIALIZING"),
            ShardRoutingState::Started => write!(f, "STARTED"),
            ShardRoutingState::Relocating => write!(f, "RELOCATING"),
        }
    }
}

/// Where an initializing copy gets its data from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecoverySource {
    /// Brand new, empty store
    EmptyStore,
    /// Data already present on the node; `force_stale` accepts a copy outside the in-sync set
    ExistingStore { force_stale: bool },
    /// Copy from the active primary
    Peer,
    /// Restore from a snapshot repository
    Snapshot { repository: String, snapshot: String },
}

impl fmt::Display for RecoverySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoverySource::EmptyStore => write!(f, "new shard recovery"),
            RecoverySource::ExistingStore { force_stale: false } => {
                write!(f, "existing store recovery")
            }
            RecoverySource::ExistingStore { force_stale: true } => {
                write!(f, "existing store recovery; bootstrap_history_uuid=true")
            }
            RecoverySource::Peer => write!(f, "peer recovery"),
            RecoverySource::Snapshot { repository, snapshot } => {
                write!(f, "snapshot recovery [{}:{}]", repository, snapshot)
            }
        }
    }
}

/// Identifier of one allocation of a shard copy
///
/// During a relocation the source and the target reference each other through
/// `relocation_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllocationId {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relocation_id: Option<String>,
}

impl AllocationId {
    /// Fresh id for a newly initialized copy
    pub fn new_initializing() -> Self {
        Self::with_id(Uuid::new_v4().to_string())
    }

    /// Reuse an id recorded on disk
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            relocation_id: None,
        }
    }

    /// Id of a relocation source: keeps its id, points at a fresh target id
    fn start_relocation(&self) -> Self {
        Self {
            id: self.id.clone(),
            relocation_id: Some(Uuid::new_v4().to_string()),
        }
    }

    fn clear_relocation(&self) -> Self {
        Self::with_id(self.id.clone())
    }
}

impl fmt::Display for AllocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.relocation_id {
            Some(rid) => write!(f, "[id={}, rId={}]", self.id, rid),
            None => write!(f, "[id={}]", self.id),
        }
    }
}

/// One copy of one shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRouting {
    pub shard_id: ShardId,
    /// Node holding the copy (None when unassigned)
    pub current_node_id: Option<NodeId>,
    /// RELOCATING source: the target node. Relocation target: the source node.
    pub relocating_node_id: Option<NodeId>,
    pub primary: bool,
    pub state: ShardRoutingState,
    /// Only set while unassigned or initializing
    pub recovery_source: Option<RecoverySource>,
    pub allocation_id: Option<AllocationId>,
    /// Present iff the copy is unassigned
    pub unassigned_info: Option<UnassignedInfo>,
    /// Size estimate used by disk-based deciders while the copy recovers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_shard_size: Option<u64>,
    /// Allocation failures carried while the copy is initializing
    #[serde(default, skip_serializing_if = "is_zero")]
    pub prior_failures: u32,
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

impl ShardRouting {
    /// Create an unassigned copy
    pub fn new_unassigned(
        shard_id: ShardId,
        primary: bool,
        recovery_source: RecoverySource,
        unassigned_info: UnassignedInfo,
    ) -> Self {
        Self {
            shard_id,
            current_node_id: None,
            relocating_node_id: None,
            primary,
            state: ShardRoutingState::Unassigned,
            recovery_source: Some(recovery_source),
            allocation_id: None,
            unassigned_info: Some(unassigned_info),
            expected_shard_size: None,
            prior_failures: 0,
        }
    }

    pub fn unassigned(&self) -> bool {
        self.state == ShardRoutingState::Unassigned
    }

    pub fn initializing(&self) -> bool {
        self.state == ShardRoutingState::Initializing
    }

    pub fn started(&self) -> bool {
        self.state == ShardRoutingState::Started
    }

    pub fn relocating(&self) -> bool {
        self.state == ShardRoutingState::Relocating
    }

    /// Started or relocating: the copy serves requests
    pub fn active(&self) -> bool {
        self.started() || self.relocating()
    }

    pub fn assigned_to_node(&self) -> bool {
        self.current_node_id.is_some()
    }

    /// Initializing copy created by a relocation
    pub fn is_relocation_target(&self) -> bool {
        self.initializing() && self.relocating_node_id.is_some()
    }

    pub fn allocation_id_str(&self) -> Option<&str> {
        self.allocation_id.as_ref().map(|a| a.id.as_str())
    }

    pub fn node_id(&self) -> Option<&str> {
        self.current_node_id.as_deref()
    }

    /// Retry counter: the unassigned count, or the one carried while initializing
    pub fn failed_allocations(&self) -> u32 {
        self.unassigned_info
            .as_ref()
            .map(|i| i.failed_allocations)
            .unwrap_or(self.prior_failures)
    }

    /// Same copy: same shard, same allocation id
    pub fn is_same_allocation(&self, other: &ShardRouting) -> bool {
        self.shard_id == other.shard_id
            && self.allocation_id.is_some()
            && self.allocation_id_str() == other.allocation_id_str()
    }

    /// UNASSIGNED -> INITIALIZING on `node_id`
    ///
    /// `existing_allocation_id` reuses the id of a copy already on disk.
    pub fn initialize(
        &self,
        node_id: &str,
        existing_allocation_id: Option<&str>,
        expected_shard_size: Option<u64>,
    ) -> ShardRouting {
        debug_assert!(self.unassigned(), "expected unassigned shard {}", self);
        let allocation_id = match existing_allocation_id {
            Some(id) => AllocationId::with_id(id),
            None => AllocationId::new_initializing(),
        };
        ShardRouting {
            shard_id: self.shard_id.clone(),
            current_node_id: Some(node_id.to_string()),
            relocating_node_id: None,
            primary: self.primary,
            state: ShardRoutingState::Initializing,
            recovery_source: self.recovery_source.clone(),
            allocation_id: Some(allocation_id),
            unassigned_info: None,
            expected_shard_size,
            prior_failures: self.failed_allocations(),
        }
    }

    /// INITIALIZING -> STARTED
    pub fn move_to_started(&self) -> ShardRouting {
        debug_assert!(self.initializing(), "expected initializing shard {}", self);
        let mut started = if self.is_relocation_target() {
            self.remove_relocation_source()
        } else {
            self.clone()
        };
        started.state = ShardRoutingState::Started;
        started.recovery_source = None;
        started.expected_shard_size = None;
        started.prior_failures = 0;
        started
    }

    /// STARTED -> RELOCATING towards `target_node`
    pub fn relocate(&self, target_node: &str, expected_shard_size: Option<u64>) -> ShardRouting {
        debug_assert!(self.started(), "expected started shard {}", self);
        ShardRouting {
            relocating_node_id: Some(target_node.to_string()),
            state: ShardRoutingState::Relocating,
            allocation_id: self.allocation_id.as_ref().map(AllocationId::start_relocation),
            expected_shard_size,
            ..self.clone()
        }
    }

    /// The INITIALIZING copy on the target node of a RELOCATING source
    pub fn target_relocating_shard(&self) -> Option<ShardRouting> {
        if !self.relocating() {
            return None;
        }
        let source_id = self.allocation_id.as_ref()?;
        let target_id = source_id.relocation_id.clone()?;
        Some(ShardRouting {
            shard_id: self.shard_id.clone(),
            current_node_id: self.relocating_node_id.clone(),
            relocating_node_id: self.current_node_id.clone(),
            primary: self.primary,
            state: ShardRoutingState::Initializing,
            recovery_source: Some(RecoverySource::Peer),
            allocation_id: Some(AllocationId {
                id: target_id,
                relocation_id: Some(source_id.id.clone()),
            }),
            unassigned_info: None,
            expected_shard_size: self.expected_shard_size,
            prior_failures: 0,
        })
    }

    /// RELOCATING -> STARTED on the source node
    pub fn cancel_relocation(&self) -> ShardRouting {
        debug_assert!(self.relocating(), "expected relocating shard {}", self);
        ShardRouting {
            relocating_node_id: None,
            state: ShardRoutingState::Started,
            allocation_id: self.allocation_id.as_ref().map(AllocationId::clear_relocation),
            expected_shard_size: None,
            ..self.clone()
        }
    }

    /// Detach a relocation target from its source
    pub fn remove_relocation_source(&self) -> ShardRouting {
        ShardRouting {
            relocating_node_id: None,
            allocation_id: self.allocation_id.as_ref().map(AllocationId::clear_relocation),
            ..self.clone()
        }
    }

    /// Any state -> UNASSIGNED
    pub fn move_to_unassigned(&self, info: UnassignedInfo) -> ShardRouting {
        let recovery_source = if self.active() {
            if self.primary {
                RecoverySource::ExistingStore { force_stale: false }
            } else {
                RecoverySource::Peer
            }
        } else {
            self.recovery_source
                .clone()
                .unwrap_or(RecoverySource::ExistingStore { force_stale: false })
        };
        ShardRouting {
            shard_id: self.shard_id.clone(),
            current_node_id: None,
            relocating_node_id: None,
            primary: self.primary,
            state: ShardRoutingState::Unassigned,
            recovery_source: Some(recovery_source),
            allocation_id: None,
            unassigned_info: Some(info),
            expected_shard_size: None,
            prior_failures: 0,
        }
    }

    /// Demote an unassigned primary to an unassigned replica
    pub fn move_unassigned_from_primary(&self) -> ShardRouting {
        debug_assert!(self.unassigned() && self.primary);
        ShardRouting {
            primary: false,
            recovery_source: Some(RecoverySource::Peer),
            ..self.clone()
        }
    }

    /// Promote an active replica to primary
    pub fn move_active_replica_to_primary(&self) -> ShardRouting {
        debug_assert!(self.active() && !self.primary);
        ShardRouting {
            primary: true,
            ..self.clone()
        }
    }

    /// Replace the unassigned info and recovery source of an unassigned copy
    pub fn update_unassigned(&self, info: UnassignedInfo, recovery_source: RecoverySource) -> ShardRouting {
        debug_assert!(self.unassigned());
        ShardRouting {
            unassigned_info: Some(info),
            recovery_source: Some(recovery_source),
            ..self.clone()
        }
    }

    /// Check the per-copy structural invariants
    pub fn check_invariants(&self) -> Result<(), String> {
        match self.state {
            ShardRoutingState::Unassigned => {
                if self.current_node_id.is_some() || self.relocating_node_id.is_some() {
                    return Err(format!("unassigned shard {} is bound to a node", self));
                }
                if self.unassigned_info.is_none() {
                    return Err(format!("unassigned shard {} has no unassigned info", self));
                }
                if self.allocation_id.is_some() {
                    return Err(format!("unassigned shard {} has an allocation id", self));
                }
            }
            ShardRoutingState::Relocating => {
                if self.current_node_id.is_none() || self.relocating_node_id.is_none() {
                    return Err(format!("relocating shard {} is missing a node", self));
                }
                if self.current_node_id == self.relocating_node_id {
                    return Err(format!("shard {} relocates to its own node", self));
                }
            }
            ShardRoutingState::Initializing | ShardRoutingState::Started => {
                if self.current_node_id.is_none() {
                    return Err(format!("assigned shard {} has no node", self));
                }
            }
        }
        if self.state != ShardRoutingState::Unassigned {
            if self.unassigned_info.is_some() {
                return Err(format!("assigned shard {} still has unassigned info", self));
            }
            if self.allocation_id.is_none() {
                return Err(format!("assigned shard {} has no allocation id", self));
            }
        }
        Ok(())
    }
}

impl fmt::Display for ShardRouting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}, node[{}]",
            self.shard_id,
            self.current_node_id.as_deref().unwrap_or("null")
        )?;
        if let Some(relocating) = &self.relocating_node_id {
            if self.relocating() {
                write!(f, ", relocating [{}]", relocating)?;
            } else {
                write!(f, ", recovering from [{}]", relocating)?;
            }
        }
        write!(f, ", [{}]", if self.primary { "P" } else { "R" })?;
        if let Some(source) = &self.recovery_source {
            write!(f, ", recovery_source[{}]", source)?;
        }
        write!(f, ", s[{}]", self.state)?;
        if let Some(aid) = &self.allocation_id {
            write!(f, ", a{}", aid)?;
        }
        if let Some(info) = &self.unassigned_info {
            write!(f, ", unassigned_info[{}]", info.short_summary())?;
        }
        Ok(())
    }
}
