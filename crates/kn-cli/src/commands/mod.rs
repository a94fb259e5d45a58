pub mod run;
pub mod validate;

use std::path::Path;

use anyhow::Context;
use kn_core::config::Config;
use kn_core::types::ProjectSpec;

pub fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Config::load().context("loading ~/.kiln/config.toml"),
    }
}

pub fn load_spec(path: &Path) -> anyhow::Result<ProjectSpec> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading spec {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing spec {}", path.display()))
}
