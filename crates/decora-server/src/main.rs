//! Decora Wi-Fi bridge
//!
//! Loads `decora.yaml` and the stored config entries, sets up the Decora
//! Wi-Fi integration and serves the REST API until Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use decora_api::AppState;
use decora_config::BridgeConfig;
use decora_config_entries::{ConfigEntries, FlowManager};
use decora_runtime::Hub;
use decora_wifi::{import_credentials, session_factory, DecoraWifi};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Command line for the `decora-bridge` binary
#[derive(Parser, Debug, PartialEq)]
#[command(name = "decora-bridge", version, about = "Leviton Decora Wi-Fi bridge")]
struct Args {
    /// Directory holding decora.yaml, secrets.yaml and .storage/
    #[arg(long = "config", short = 'c', default_value = "./config")]
    config_dir: PathBuf,

    /// Address for the REST API, overriding `bridge.bind`
    #[arg(long)]
    bind: Option<String>,
}

/// Everything the running bridge holds on to
struct Bridge {
    hub: Hub,
    entries: Arc<ConfigEntries>,
    flows: Arc<FlowManager>,
    bind: String,
}

impl Bridge {
    /// Load configuration and storage, then set up every config entry
    async fn start(args: Args) -> Result<Self> {
        std::fs::create_dir_all(&args.config_dir)
            .with_context(|| format!("creating {}", args.config_dir.display()))?;
        let config = BridgeConfig::load(&args.config_dir)?;
        info!(name = %config.bridge.name, config_dir = %args.config_dir.display(), "Starting Decora Wi-Fi bridge");

        let hub = Hub::new(&args.config_dir);
        hub.registries.load_all().await?;

        let entries = Arc::new(ConfigEntries::new(hub.clone()));
        entries.load().await?;
        let flows = Arc::new(FlowManager::new(Arc::clone(&entries)));

        let integration = Arc::new(DecoraWifi::new(
            hub.clone(),
            session_factory(config.bridge.api_base_url.clone()),
        ));
        integration.register(&entries, &flows)?;

        if let Some(creds) = &config.decora_wifi {
            import_credentials(&entries, &creds.username, &creds.password).await?;
        }

        for (entry_id, result) in entries.setup_all().await {
            if let Err(err) = result {
                warn!(%entry_id, %err, "Config entry did not set up");
            }
        }
        info!(entities = hub.states.entity_count(), "Bridge initialized");

        Ok(Self {
            hub,
            entries,
            flows,
            bind: args.bind.unwrap_or(config.bridge.bind),
        })
    }

    fn app_state(&self) -> AppState {
        AppState {
            hub: self.hub.clone(),
            entries: Arc::clone(&self.entries),
            flows: Arc::clone(&self.flows),
        }
    }

    async fn stop(self) -> Result<()> {
        info!("Shutting down...");
        self.hub.fire_stop();
        self.entries.unload_all().await;
        self.hub.registries.save_all().await?;
        self.entries.save().await?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let args = Args::parse();
    let bridge = Bridge::start(args).await?;

    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(%err, "Failed to listen for Ctrl-C");
        }
    };
    decora_api::serve(bridge.app_state(), &bridge.bind, shutdown).await?;

    bridge.stop().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use decora_config_entries::{ConfigEntrySource, ConfigEntryState};
    use tempfile::TempDir;

    fn args(list: &[&str]) -> Result<Args, clap::Error> {
        Args::try_parse_from(std::iter::once("decora-bridge").chain(list.iter().copied()))
    }

    #[test]
    fn test_parse_args() {
        assert_eq!(
            args(&[]).unwrap(),
            Args {
                config_dir: PathBuf::from("./config"),
                bind: None,
            }
        );
        assert_eq!(
            args(&["--config", "/etc/decora", "--bind", "127.0.0.1:9000"]).unwrap(),
            Args {
                config_dir: PathBuf::from("/etc/decora"),
                bind: Some("127.0.0.1:9000".to_string()),
            }
        );
        assert_eq!(
            args(&["-c", "/srv/decora"]).unwrap().config_dir,
            PathBuf::from("/srv/decora")
        );
        assert!(args(&["--config"]).is_err());
        assert!(args(&["--verbose"]).is_err());

        let help = args(&["--help"]).unwrap_err();
        assert_eq!(help.kind(), clap::error::ErrorKind::DisplayHelp);
    }

    #[tokio::test]
    async fn test_start_without_credentials() {
        let dir = TempDir::new().unwrap();
        let bridge = Bridge::start(Args {
            config_dir: dir.path().to_path_buf(),
            bind: None,
        })
        .await
        .unwrap();

        assert!(bridge.entries.is_empty());
        assert_eq!(bridge.bind, "0.0.0.0:8124");
        assert!(bridge.hub.services.has_service("light", "turn_on"));
        bridge.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_imports_yaml_credentials() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("decora.yaml"),
            "bridge:\n  bind: 127.0.0.1:0\n  api_base_url: http://127.0.0.1:9\n\
             decora_wifi:\n  username: me@example.com\n  password: pw\n",
        )
        .unwrap();

        let bridge = Bridge::start(Args {
            config_dir: dir.path().to_path_buf(),
            bind: None,
        })
        .await
        .unwrap();

        let entries = bridge.entries.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].source, ConfigEntrySource::Import);
        // Nothing listens on the API URL, so setup waits for a retry
        assert_eq!(entries[0].state, ConfigEntryState::SetupRetry);
        assert_eq!(bridge.bind, "127.0.0.1:0");
        bridge.stop().await.unwrap();
    }
}
