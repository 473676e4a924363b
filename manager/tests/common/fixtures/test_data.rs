//! Common test data and constants

/// Common test network names
pub mod networks {
    pub const MAINNET: &str = "mainnet";
    pub const TESTNET: &str = "testnet";
}

/// Common test node directory names
pub mod nodes {
    pub const NODE_1: &str = "node1";
    pub const NODE_2: &str = "node2";
}

/// Chain names and chain data ids
pub mod chains {
    pub const PRIMARY: &str = "C";
    pub const CHAIN_DATA_ID: &str = "2ZW6HUePBW2dP7dBGa5stjXe1uvuLpzmnFHoHxTeemQwMGUZ7i";
}

/// Snapshot identifiers
pub mod snapshots {
    pub const DAY_1: &str = "2024-03-01";
    pub const DAY_2: &str = "2024-03-02";
    pub const DAY_3: &str = "2024-03-03";
}

/// Unit labels as they appear in reports
pub mod labels {
    pub const MAINNET_NODE_1: &str = "mainnet/chain_node1";
    pub const MAINNET_NODE_2: &str = "mainnet/chain_node2";
    pub const TESTNET_NODE_1: &str = "testnet/chain_node1";
    pub const MAINNET_NODE_1_CHAIN_DATA: &str = "mainnet/chaindata_node1_2ZW6HUePBW2dP7dB";
}

/// `count` deterministic key/value pairs starting at `start`
pub fn sample_entries(start: usize, count: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
    (start..start + count)
        .map(|i| {
            (
                format!("key-{:05}", i).into_bytes(),
                format!("value-{}-{}", i, "x".repeat(i % 17)).into_bytes(),
            )
        })
        .collect()
}
