//! Process config loader (strict YAML).

pub mod schema;

use std::fs;

use hasten_core::error::{Result, RpcError};

pub use schema::{ClientSection, DiscoverySection, HastenConfig, RegistrySection, ServerSection};

pub fn load_from_file(path: &str) -> Result<HastenConfig> {
    let s = fs::read_to_string(path).map_err(|e| RpcError::Config(format!("read config {path}: {e}")))?;
    load_from_str(&s)
}

pub fn load_from_str(s: &str) -> Result<HastenConfig> {
    let cfg: HastenConfig =
        serde_yaml::from_str(s).map_err(|e| RpcError::Config(format!("invalid yaml: {e}")))?;
    cfg.validate()?;
    Ok(cfg)
}
