//! Test configuration builder for creating config directories programmatically

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Builder for a config directory with main.toml and one file per network
pub struct TestConfigBuilder {
    temp_dir: TempDir,
    main_toml: String,
    network_files: BTreeMap<String, String>,
}

impl TestConfigBuilder {
    /// Start from a main.toml pointing at `base_dir`
    pub fn new(base_dir: &Path) -> Self {
        Self {
            temp_dir: TempDir::new().expect("Failed to create temp dir"),
            main_toml: format!("base_dir = {:?}\n", base_dir.to_string_lossy()),
            network_files: BTreeMap::new(),
        }
    }

    /// Append raw TOML to main.toml
    pub fn with_main(mut self, toml: &str) -> Self {
        self.main_toml.push_str(toml);
        self.main_toml.push('\n');
        self
    }

    /// Add `<file_stem>.toml` with the given contents
    pub fn with_network_file(mut self, file_stem: &str, toml: &str) -> Self {
        self.network_files.insert(file_stem.to_string(), toml.to_string());
        self
    }

    /// Write the files and return the config directory
    pub fn build(self) -> TestConfig {
        let config_dir = self.temp_dir.path().join("config");
        fs::create_dir_all(&config_dir).expect("Failed to create config dir");
        fs::write(config_dir.join("main.toml"), &self.main_toml).expect("Failed to write main.toml");

        for (stem, toml) in &self.network_files {
            fs::write(config_dir.join(format!("{}.toml", stem)), toml)
                .expect("Failed to write network config");
        }

        TestConfig {
            _temp_dir: self.temp_dir,
            config_dir,
        }
    }
}

pub struct TestConfig {
    _temp_dir: TempDir,
    pub config_dir: PathBuf,
}
