//! Key layout of the topology store

use crate::metadata::ShardId;

pub const PROCEDURE_PREFIX: &str = "/procedures/";
pub const PROCEDURE_ID_COUNTER: &str = "/counters/procedure_id";

pub fn cluster(cluster: &str) -> String {
    format!("/clusters/{}", cluster)
}

pub fn nodes_prefix(cluster: &str) -> String {
    format!("/clusters/{}/nodes/", cluster)
}

pub fn node(cluster: &str, node: &str) -> String {
    format!("{}{}", nodes_prefix(cluster), node)
}

pub fn shards_prefix(cluster: &str) -> String {
    format!("/clusters/{}/shards/", cluster)
}

/// Shard IDs are zero-padded so that key order equals numeric order
pub fn shard(cluster: &str, shard_id: ShardId) -> String {
    format!("{}{:010}", shards_prefix(cluster), shard_id)
}

pub fn tables_prefix(cluster: &str) -> String {
    format!("/clusters/{}/tables/", cluster)
}

pub fn table(cluster: &str, schema: &str, table: &str) -> String {
    format!("{}{}/{}", tables_prefix(cluster), schema, table)
}

pub fn shard_id_counter(cluster: &str) -> String {
    format!("/clusters/{}/counters/shard_id", cluster)
}

pub fn table_id_counter(cluster: &str) -> String {
    format!("/clusters/{}/counters/table_id", cluster)
}

pub fn procedure(id: u64) -> String {
    format!("{}{:020}", PROCEDURE_PREFIX, id)
}
