pub mod commands;
pub mod scan;
pub mod validate;

pub use commands::{Cli, Commands};

use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;

use templar::catalog::DiskCatalog;
use templar::config::{self, EngineOptions};

/// Options from the config file when one is given, defaults otherwise.
pub(crate) async fn load_options(path: Option<&str>) -> anyhow::Result<EngineOptions> {
    match path {
        Some(path) => config::parse_config(&PathBuf::from(path))
            .await
            .with_context(|| format!("Failed to load config {}", path)),
        None => Ok(EngineOptions::default()),
    }
}

pub(crate) fn catalog(options: &EngineOptions) -> Arc<DiskCatalog> {
    Arc::new(DiskCatalog::new(
        options.templates_directory.clone(),
        options.allow_local_file_access,
    ))
}
