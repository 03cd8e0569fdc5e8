//! Manifest discovery and service registration.
//!
//! Finds the concierge manifest, loads it and registers every declared
//! service with a fresh manager.

use anyhow::{bail, Context, Result};
use boss::{Config, DependencyGraph, FactoryRegistry, ServiceManager};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Standard locations for the manifest (in search order)
pub const STANDARD_CONFIG_LOCATIONS: &[&str] = &[
    boss::DEFAULT_CONFIG_PATH,
    "/usr/share/concierge/concierge.toml",
];

/// Detect the manifest path
///
/// Searches in order:
/// 1. User-specified path (--config or CONCIERGE_CONFIG)
/// 2. Standard system locations
/// 3. ./concierge.toml (current directory - for development)
pub fn detect_config_path(custom_path: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = custom_path {
        if !path.is_file() {
            bail!("Manifest not found: {}", path.display());
        }
        return Ok(path.to_path_buf());
    }

    let mut search_paths: Vec<PathBuf> = STANDARD_CONFIG_LOCATIONS.iter().map(PathBuf::from).collect();
    search_paths.push(PathBuf::from("./concierge.toml"));

    if let Some(path) = search_paths.iter().find(|p| p.is_file()) {
        debug!(path = %path.display(), "Found manifest");
        return Ok(path.clone());
    }

    bail!(
        "Could not find a concierge manifest.\n\
        \n\
        Searched locations:\n{}\n\
        \n\
        Set CONCIERGE_CONFIG or use --config to specify the location.",
        search_paths
            .iter()
            .map(|p| format!("  - {}", p.display()))
            .collect::<Vec<_>>()
            .join("\n")
    )
}

/// Load and validate the manifest.
pub fn load_config(path: &Path) -> Result<Config> {
    Config::from_file(path).with_context(|| format!("Failed to load manifest {}", path.display()))
}

/// Start order of the services declared in `config`.
pub fn start_order(config: &Config) -> Result<Vec<String>> {
    let descriptors = FactoryRegistry::new().descriptors(config)?;
    let order = DependencyGraph::from_descriptors(&descriptors).start_order()?;
    Ok(order)
}

/// Create a manager with every declared service registered.
pub async fn build_manager(config: Config) -> Result<ServiceManager> {
    let descriptors = FactoryRegistry::new().descriptors(&config)?;
    let manager = ServiceManager::new(config);

    for descriptor in descriptors {
        let name = descriptor.name.clone();
        manager
            .register_service(descriptor)
            .await
            .with_context(|| format!("Failed to register {}", name))?;
    }

    info!(services = manager.list_services().await.len(), "Services registered");
    Ok(manager)
}
