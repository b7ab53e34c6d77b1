//! Cluster state data model
//!
//! Immutable building blocks shared by the allocation engine and the cluster manager:
//! - Shard identity and per-copy routing entries
//! - Routing tables (index -> shard -> copies)
//! - Index and cluster metadata, including dynamic allocation settings
//! - Discovery nodes and the published `ClusterState`
//! - Health projection (green / yellow / red)

pub mod error;
pub mod filters;
pub mod health;
pub mod metadata;
pub mod node;
pub mod routing;
pub mod shard;
pub mod state;
pub mod unassigned;

// Re-export commonly used types
pub use error::CoreError;
pub use filters::NodeFilters;
pub use health::{ClusterHealth, HealthStatus, IndexHealth, ShardHealth};
pub use metadata::{
    AllocationSettings, AutoExpandReplicas, AwarenessSettings, BalanceSettings,
    ClusterRebalanceType, ClusterSettings, DiskThresholdSettings, EnableAllocation,
    EnableRebalance, IndexMetadata, IndexMetadataBuilder, IndexSettings, IndexState, Metadata,
    MetadataBuilder, StorePool, Watermark,
};
pub use node::{DiscoveryNode, DiscoveryNodes, NodeId, NodeRole, NodesDelta};
pub use routing::{
    IndexRoutingTable, IndexShardRoutingTable, RoutingTable, RoutingTableBuilder,
};
pub use shard::{
    AllocationId, Index, RecoverySource, ShardId, ShardRouting, ShardRoutingState,
};
pub use state::{ClusterState, ClusterStateBuilder};
pub use unassigned::{AllocationStatus, UnassignedInfo, UnassignedReason};
