//! Shard allocation engine
//!
//! Decides, for every copy of every shard, which node hosts it:
//! - `deciders`: the ordered chain of placement rules
//! - `gateway`: primaries recovered from existing copies, replica copy matching
//! - `allocator`: the balanced, weight-based placement of everything else
//! - `service`: the `AllocationService` turning cluster events into new cluster states
//! - `commands` and `explain`: the operator surface

pub mod allocation;
pub mod allocator;
pub mod changes;
pub mod commands;
pub mod deciders;
pub mod decision;
pub mod error;
pub mod explain;
pub mod gateway;
pub mod info;
pub mod routing_nodes;
pub mod service;

pub use allocation::{DebugMode, RoutingAllocation};
pub use allocator::{
    AllocateUnassignedDecision, AllocationDecision, BalancedShardsAllocator, MoveDecision,
    NodeAllocationResult, RebalanceDecision, ShardAllocationDecision, ShardsAllocator,
    WeightFunction,
};
pub use changes::RoutingChanges;
pub use commands::{AllocationCommand, AllocationCommands, RerouteExplanation, RerouteOptions};
pub use deciders::{AllocationDecider, AllocationDeciders};
pub use decision::{Decision, DecisionKind};
pub use error::{AllocationError, Result};
pub use explain::{ClusterAllocationExplainRequest, ClusterAllocationExplanation};
pub use gateway::{FetchResult, GatewayAllocator, NoShardStates, NodeShardState, ShardStateFetcher};
pub use info::{
    ClusterInfo, ClusterInfoService, DiskUsage, EmptyClusterInfoService, EmptySnapshotsInfoService,
    RestoreShardState, SnapshotsInfo, SnapshotsInfoService,
};
pub use routing_nodes::{RoutingNode, RoutingNodes};
pub use service::{
    AllocationService, Clock, CommandsResult, FailedShardEntry, ManualClock, StaleShard,
    StartedShardEntry, SystemClock,
};
