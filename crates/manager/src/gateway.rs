//! Gateway: cluster state recovery after a full restart
//!
//! The metadata persisted by the cluster-manager-eligible nodes is collected, the
//! freshest copy of the global metadata and of every index is elected, and the result is
//! turned into a fresh cluster state whose shards all wait to be recovered from disk.

use allocation::{AllocationError, AllocationService};
use async_trait::async_trait;
use cluster_core::{
    ClusterSettings, ClusterState, CoreError, DiscoveryNode, DiscoveryNodes, IndexMetadata, Metadata,
    NodeId, RoutingTableBuilder,
};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::storage::{FileStorage, StorageError};

/// Gateway error
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Not enough nodes answered with their metadata: found {found}, required {required}, total {total}")]
    InsufficientResponses {
        found: usize,
        required: usize,
        total: usize,
    },
    #[error("Node {0} did not answer")]
    Unreachable(NodeId),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error(transparent)]
    Allocation(#[from] AllocationError),
}

/// Source of the metadata a node persisted
#[async_trait]
pub trait MetaStateFetcher: Send + Sync {
    /// `Ok(None)` when the node answered but has no metadata yet
    async fn fetch(&self, node: &DiscoveryNode) -> Result<Option<Metadata>, GatewayError>;
}

/// Reads the state file under `<data_dir>/<node_id>`
pub struct FileMetaStateFetcher {
    data_dir: PathBuf,
}

impl FileMetaStateFetcher {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }
}

#[async_trait]
impl MetaStateFetcher for FileMetaStateFetcher {
    async fn fetch(&self, node: &DiscoveryNode) -> Result<Option<Metadata>, GatewayError> {
        let storage = FileStorage::new(self.data_dir.join(&node.id));
        // no directory at all: the node never ran here
        if !storage.exists() {
            return Err(GatewayError::Unreachable(node.id.clone()));
        }
        Ok(storage.load().await?)
    }
}

/// Fixed answers; nodes without an entry do not answer
#[derive(Default)]
pub struct StaticMetaStateFetcher {
    states: BTreeMap<NodeId, Option<Metadata>>,
}

impl StaticMetaStateFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(mut self, node_id: impl Into<NodeId>, metadata: Option<Metadata>) -> Self {
        self.states.insert(node_id.into(), metadata);
        self
    }
}

#[async_trait]
impl MetaStateFetcher for StaticMetaStateFetcher {
    async fn fetch(&self, node: &DiscoveryNode) -> Result<Option<Metadata>, GatewayError> {
        self.states
            .get(&node.id)
            .cloned()
            .ok_or_else(|| GatewayError::Unreachable(node.id.clone()))
    }
}

pub struct Gateway {
    fetcher: Arc<dyn MetaStateFetcher>,
    required_allocation: usize,
}

impl Gateway {
    pub fn new(fetcher: Arc<dyn MetaStateFetcher>, required_allocation: usize) -> Self {
        Self {
            fetcher,
            required_allocation,
        }
    }

    /// Collect the persisted metadata and elect the freshest
    ///
    /// Returns None when every answering node is empty.
    pub async fn recover_metadata(&self, nodes: &DiscoveryNodes) -> Result<Option<Metadata>, GatewayError> {
        let candidates: Vec<&DiscoveryNode> = nodes.cluster_manager_eligible_nodes().collect();
        let total = candidates.len();
        let mut found = 0;
        let mut responses = Vec::new();

        for node in candidates {
            match self.fetcher.fetch(node).await {
                Ok(Some(metadata)) => {
                    debug!(
                        "Node {} has metadata version {} with {} indices",
                        node.id,
                        metadata.version,
                        metadata.indices.len()
                    );
                    found += 1;
                    responses.push((node.id.clone(), metadata));
                }
                Ok(None) => {
                    debug!("Node {} has no metadata", node.id);
                    found += 1;
                }
                Err(e) => warn!("Failed to fetch metadata from node {}: {}", node.id, e),
            }
        }

        if found < self.required_allocation {
            return Err(GatewayError::InsufficientResponses {
                found,
                required: self.required_allocation,
                total,
            });
        }
        Ok(elect(&responses)?)
    }

    /// Build the recovered cluster state and run the first reroute
    ///
    /// A cluster without any persisted metadata starts empty with `initial_settings`.
    pub async fn perform_state_recovery(
        &self,
        cluster_name: &str,
        nodes: DiscoveryNodes,
        initial_settings: ClusterSettings,
        service: &AllocationService,
    ) -> Result<ClusterState, GatewayError> {
        let metadata = match self.recover_metadata(&nodes).await? {
            Some(metadata) => metadata,
            None => {
                info!("No persisted metadata found, starting a new cluster");
                Metadata::builder().settings(initial_settings).build()?
            }
        };

        let now = service.now();
        let mut routing = RoutingTableBuilder::new();
        for meta in metadata.iter().filter(|m| m.is_open()) {
            routing.add_as_recovery(meta, now)?;
        }
        let routing_table = routing.build();
        routing_table.validate(&metadata)?;

        info!(
            "Recovered cluster metadata version {} with {} indices from {} nodes",
            metadata.version,
            metadata.indices.len(),
            nodes.len()
        );
        let state = ClusterState::new(cluster_name, metadata, nodes)
            .builder()
            .routing_table(routing_table)
            .build();
        Ok(service.reroute(&state, "state recovered")?)
    }
}

/// Elect global and per-index metadata from the answers, given in node id order
///
/// The highest version wins; on equal versions the lowest node id wins.
fn elect(responses: &[(NodeId, Metadata)]) -> Result<Option<Metadata>, CoreError> {
    let Some((global_node, global)) = responses
        .iter()
        .fold(None::<&(NodeId, Metadata)>, |best, candidate| match best {
            Some(best) if best.1.version >= candidate.1.version => Some(best),
            _ => Some(candidate),
        })
    else {
        return Ok(None);
    };
    debug!("Electing global metadata version {} from node {}", global.version, global_node);

    let mut chosen: BTreeMap<&str, (&NodeId, &IndexMetadata)> = BTreeMap::new();
    for (node_id, metadata) in responses {
        for index in metadata.iter() {
            match chosen.entry(index.name()) {
                Entry::Vacant(entry) => {
                    entry.insert((node_id, index));
                }
                Entry::Occupied(mut entry) => {
                    let (holder, current) = *entry.get();
                    if index.version > current.version {
                        entry.insert((node_id, index));
                    } else if index.version == current.version && index != current {
                        warn!(
                            "Index [{}] version {} differs between nodes {} and {}, keeping the copy of {}",
                            index.name(),
                            index.version,
                            holder,
                            node_id,
                            holder
                        );
                    }
                }
            }
        }
    }

    let mut builder = Metadata::builder()
        .cluster_uuid(global.cluster_uuid.clone())
        .version(global.version)
        .settings(global.settings.clone());
    for (name, (node_id, index)) in chosen {
        // rebuilding resizes the per-shard vectors to the shard count
        match index.to_builder().build() {
            Ok(index) => builder = builder.put(index),
            Err(e) => warn!("Dropping index [{}] found on node {}: {}", name, node_id, e),
        }
    }
    builder.build().map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster_core::ShardRoutingState;

    fn nodes(ids: &[&str]) -> DiscoveryNodes {
        ids.iter().fold(DiscoveryNodes::new(), |acc, id| {
            acc.with_node(DiscoveryNode::new(*id, format!("{}:9300", id)))
        })
    }

    fn metadata(version: u64, indices: &[(&str, u64)]) -> Metadata {
        indices
            .iter()
            .fold(Metadata::builder().cluster_uuid("c1").version(version), |b, (name, v)| {
                b.put(
                    IndexMetadata::builder(*name)
                        .uuid(format!("{}-uuid", name))
                        .version(*v)
                        .number_of_shards(1)
                        .number_of_replicas(0)
                        .build()
                        .unwrap(),
                )
            })
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_highest_versions_win() {
        let fetcher = StaticMetaStateFetcher::new()
            .with_state("n1", Some(metadata(5, &[("logs", 3)])))
            .with_state("n2", Some(metadata(7, &[("logs", 2), ("metrics", 1)])))
            .with_state("n3", None);
        let gateway = Gateway::new(Arc::new(fetcher), 2);

        let elected = gateway
            .recover_metadata(&nodes(&["n1", "n2", "n3"]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(elected.version, 7);
        assert_eq!(elected.index("logs").unwrap().version, 3);
        assert!(elected.has_index("metrics"));
    }

    #[tokio::test]
    async fn test_not_enough_answers() {
        let fetcher = StaticMetaStateFetcher::new().with_state("n1", Some(metadata(1, &[])));
        let gateway = Gateway::new(Arc::new(fetcher), 2);

        match gateway.recover_metadata(&nodes(&["n1", "n2", "n3"])).await {
            Err(GatewayError::InsufficientResponses { found, required, total }) => {
                assert_eq!((found, required, total), (1, 2, 3));
            }
            other => panic!("unexpected {:?}", other.map(|m| m.map(|m| m.version))),
        }
    }

    #[tokio::test]
    async fn test_equal_versions_prefer_lowest_node() {
        let mut divergent = metadata(4, &[]);
        let index = IndexMetadata::builder("logs")
            .uuid("other-uuid")
            .version(2)
            .number_of_shards(2)
            .build()
            .unwrap();
        divergent.indices.insert("logs".to_string(), index);

        let fetcher = StaticMetaStateFetcher::new()
            .with_state("n2", Some(divergent))
            .with_state("n1", Some(metadata(4, &[("logs", 2)])));
        let gateway = Gateway::new(Arc::new(fetcher), 1);

        let elected = gateway.recover_metadata(&nodes(&["n1", "n2"])).await.unwrap().unwrap();
        assert_eq!(elected.index("logs").unwrap().index.uuid, "logs-uuid");
    }

    #[tokio::test]
    async fn test_recovery_builds_routing() {
        let fetcher = StaticMetaStateFetcher::new().with_state("n1", Some(metadata(3, &[("logs", 1)])));
        let gateway = Gateway::new(Arc::new(fetcher), 1);
        let service = AllocationService::default();

        let state = gateway
            .perform_state_recovery("test", nodes(&["n1"]), ClusterSettings::default(), &service)
            .await
            .unwrap();
        assert_eq!(state.metadata().version, 3);
        // never started before: recovered from an empty store right away
        let primary = state
            .routing_table()
            .all_shards()
            .find(|s| s.primary)
            .unwrap();
        assert_eq!(primary.state, ShardRoutingState::Initializing);
    }

    #[tokio::test]
    async fn test_fresh_cluster_uses_initial_settings() {
        let fetcher = StaticMetaStateFetcher::new().with_state("n1", None);
        let gateway = Gateway::new(Arc::new(fetcher), 1);
        let mut settings = ClusterSettings::default();
        settings.allocation.node_initial_primaries_recoveries = 1;

        let state = gateway
            .perform_state_recovery("test", nodes(&["n1"]), settings.clone(), &AllocationService::default())
            .await
            .unwrap();
        assert_eq!(state.metadata().settings, settings);
        assert!(state.metadata().indices.is_empty());
    }
}
