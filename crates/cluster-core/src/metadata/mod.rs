//! Cluster metadata definitions
//!
//! Index metadata, cluster-wide allocation settings and the `Metadata` container

mod cluster;
mod index;
mod settings;

pub use cluster::{Metadata, MetadataBuilder};
pub use index::{
    AutoExpandReplicas, IndexMetadata, IndexMetadataBuilder, IndexSettings, IndexState, StorePool,
};
pub use settings::{
    AllocationSettings, AwarenessSettings, BalanceSettings, ClusterRebalanceType, ClusterSettings,
    DiskThresholdSettings, EnableAllocation, EnableRebalance, Watermark,
};
