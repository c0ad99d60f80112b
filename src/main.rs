//! ObjMapper server entry point.
//!
//! The launcher consumes environment-tunable flags (see
//! [`objmapper::config::ServerConfig::from_env`]), registers the
//! configured backends, rebuilds indexes, starts cache maintenance, and
//! serves on the selected transport until terminated. Exit code 0 on
//! success, 1 on configuration or startup failure.

use std::sync::Arc;

use objmapper::{BackendManager, Server, ServerConfig};

fn main() -> anyhow::Result<()> {
    // Initialize logging with configurable level
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    log::info!("═══════════════════════════════════════════════════════════");
    log::info!("  ObjMapper - Multi-Tier Object-Mapper Server");
    log::info!("  Version: {}", objmapper::VERSION);
    log::info!("═══════════════════════════════════════════════════════════");

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("Configuration error: {e}");
            return Err(e.into());
        }
    };
    log::info!("Transport: {:?}", config.transport);
    log::info!("Backing dir: {}", config.backing_dir.display());
    if let Some(cache_dir) = &config.cache_dir {
        log::info!(
            "Cache dir: {} (limit {} bytes)",
            cache_dir.display(),
            config.cache_limit
        );
    }

    let manager = Arc::new(BackendManager::new());
    let server = Server::new(manager, config);
    if let Err(e) = server.bootstrap() {
        log::error!("Startup failed: {e}");
        return Err(e.into());
    }

    let result = server.run();
    if let Err(e) = server.manager().shutdown() {
        log::error!("Shutdown flush failed: {e}");
    }
    match result {
        Ok(()) => {
            log::info!("ObjMapper shutdown complete");
            Ok(())
        }
        Err(e) => {
            log::error!("Server error: {e}");
            Err(e.into())
        }
    }
}
