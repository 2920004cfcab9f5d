use clap::Parser;
use log::{error, info, warn};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

mod certs;
mod common;
mod config;
mod core;
mod httpd;
mod metrics;
mod networking;
mod oidc;
mod traffic;

use crate::core::proxy::Proxy;
use certs::acme::AcmeManager;
use certs::ephemeral::EphemeralCertManager;
use certs::CertManager;
use config::Config;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "tlsgate.yaml")]
    config: PathBuf,

    /// Issue certificates from an in-process CA instead of ACME.
    /// Clients must trust the ephemeral root; only useful for testing.
    #[arg(long)]
    ephemeral_certs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    networking::tls::init_crypto();
    let args = Args::parse();

    let config_content = std::fs::read_to_string(&args.config)?;
    let config: Config = serde_yaml::from_str(&config_content)?;
    config.validate()?;
    info!("Loaded configuration with {} backends", config.backends.len());

    let mut acme: Option<Arc<AcmeManager>> = None;
    let cert_manager: Arc<dyn CertManager> = if args.ephemeral_certs {
        warn!("Using ephemeral certificates; clients must trust the in-process CA");
        Arc::new(EphemeralCertManager::new()?)
    } else {
        let manager = Arc::new(AcmeManager::new(
            &config.email,
            config.acme_directory.as_deref(),
            &config.cache_dir,
        )?);
        acme = Some(manager.clone());
        manager
    };

    let proxy = Proxy::new(config, cert_manager)?;
    proxy.start().await?;
    if let Some(acme) = &acme {
        acme.spawn_renewal(proxy.cancel_token().clone());
    }

    // Hot reload on config file changes.
    let (tx, mut rx) = mpsc::channel(1);
    let mut watcher = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                if event.kind.is_modify() {
                    let _ = tx.blocking_send(());
                }
            }
        },
        notify::Config::default(),
    )?;
    watcher.watch(&args.config, RecursiveMode::NonRecursive)?;
    info!("Watching config file for changes...");

    loop {
        tokio::select! {
            _ = shutdown_signal() => {
                info!("Shutdown signal received, stopping...");
                break;
            }
            changed = rx.recv() => {
                if changed.is_none() {
                    break;
                }
                info!("Config change detected, reloading...");
                match std::fs::read_to_string(&args.config) {
                    Ok(content) => match serde_yaml::from_str::<Config>(&content) {
                        Ok(new_config) => {
                            if let Err(e) = proxy.reconfigure(new_config).await {
                                error!("Failed to apply new config: {}", e);
                            }
                        }
                        Err(e) => error!("Failed to parse new config: {}", e),
                    },
                    Err(e) => error!("Failed to read config file: {}", e),
                }
            }
        }
    }

    proxy.stop();
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
