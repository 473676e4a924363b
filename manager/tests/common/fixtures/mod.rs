//! This module provides reusable test utilities:
//! - A runs-tree builder backed by real `FileStore` databases
//! - Test configuration builders
//! - Common test data

// Allow unused code in test fixtures - not every test binary uses every helper
#![allow(dead_code)]
#![allow(unused_imports)]

pub mod test_config;
pub mod test_data;
pub mod test_layout;

// Re-export commonly used items
pub use test_config::TestConfigBuilder;
pub use test_data::*;
pub use test_layout::TestLayout;
