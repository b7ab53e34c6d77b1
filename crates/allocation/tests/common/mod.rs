#![allow(dead_code)]

pub mod test_cluster;

use cluster_core::{DiscoveryNode, IndexMetadata, IndexMetadataBuilder};

pub fn node(id: &str) -> DiscoveryNode {
    DiscoveryNode::new(id, format!("{}.local:9300", id))
}

pub fn node_in_zone(id: &str, zone: &str) -> DiscoveryNode {
    node(id).with_attribute("zone", zone)
}

/// Index builder with a stable uuid; departed nodes are not waited for
pub fn index(name: &str, shards: u32, replicas: u32) -> IndexMetadataBuilder {
    IndexMetadata::builder(name)
        .uuid(format!("{}-uuid", name))
        .number_of_shards(shards)
        .number_of_replicas(replicas)
        .node_left_delayed_timeout_ms(0)
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
