#![allow(dead_code)]

pub mod mock_shard_client;
pub mod test_server;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}
