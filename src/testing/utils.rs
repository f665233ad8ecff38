use crate::types::{KeyspaceId, Row};
use bytes::Bytes;

/// Install a fmt subscriber once per test binary.
#[cfg(test)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// `count` rows with ids `1..=count`, keyspace ids spread over the whole range.
pub fn seed_rows(count: u64) -> Vec<Row> {
    (1..=count)
        .map(|id| {
            // Fibonacci hashing interleaves neighbouring ids across shards.
            let keyspace_id = KeyspaceId(id.wrapping_mul(0x9E37_79B9_7F4A_7C15));
            Row::new(
                id,
                keyspace_id,
                vec![
                    Bytes::from(format!("msg-{}", id)),
                    Bytes::copy_from_slice(&keyspace_id.to_bytes()),
                ],
            )
        })
        .collect()
}
