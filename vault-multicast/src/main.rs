use std::time::Duration;
use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use shared::ServiceDescriptor;
use vault_multicast::{Config, DiscoveryService, Lifecycle, Publisher, RegistryEvent};

const METRICS_LOG_INTERVAL: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("vault_multicast=info,vault_multicastd=info"))
        )
        .init();

    tracing::info!("Starting vault-multicastd");

    // Load config; defaults when no path is given
    let config = match std::env::args().nth(1) {
        Some(path) => {
            let config = Config::load(&path)
                .with_context(|| format!("Failed to load config from {}", path))?;
            tracing::info!("Loaded config from {}", path);
            config
        }
        None => {
            tracing::info!("No config file given, using defaults");
            Config::default()
        }
    };

    let discovery = DiscoveryService::from_config(&config)
        .context("Failed to create discovery service")?;
    discovery
        .start()
        .context("Failed to start multicast listener")?;

    let cancel = CancellationToken::new();

    // Spawn registry event logger
    let events = discovery.events();
    let mut digest = discovery.watch_digest();
    tracing::info!("Initial registry hash: {}", *digest.borrow_and_update());
    let events_cancel = cancel.clone();
    let events_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv_async() => match event {
                    Ok(event) => log_event(&event),
                    Err(_) => break,
                },
                changed = digest.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    tracing::info!("Registry hash: {}", *digest.borrow_and_update());
                }
                _ = events_cancel.cancelled() => break,
            }
        }
    });

    let publisher = if config.publisher.enabled {
        let message = announcement(&config)?;
        let publisher = Publisher::new(config.multicast.clone(), config.publisher.clone(), message)
            .context("Failed to create publisher")?;
        publisher
            .start()
            .context("Failed to start multicast publisher")?;
        tracing::info!("Publishing: {}", publisher.message());
        Some(publisher)
    } else {
        None
    };

    let mut metrics_interval = tokio::time::interval(METRICS_LOG_INTERVAL);
    metrics_interval.tick().await;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    // Wait for shutdown signal
    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                result.context("Failed to listen for ctrl-c")?;
                break;
            }
            _ = metrics_interval.tick() => {
                log_metrics("listener", &discovery.metrics());
                if let Some(publisher) = &publisher {
                    log_metrics("publisher", &publisher.metrics());
                }
            }
        }
    }

    tracing::info!("Shutdown signal received");
    cancel.cancel();

    let stop_timeout = config.shutdown.stop_timeout();
    if let Some(publisher) = &publisher {
        publisher.stop(stop_timeout).await;
        log_metrics("publisher", &publisher.metrics());
    }
    discovery.stop(stop_timeout).await;
    log_metrics("listener", &discovery.metrics());

    let _ = events_handle.await;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Payload to publish: the configured message verbatim, or an announcement
/// built from the publisher settings and the host name
fn announcement(config: &Config) -> Result<String> {
    let publisher = &config.publisher;
    if !publisher.message.is_empty() {
        return Ok(publisher.message.clone());
    }

    let hostname = hostname::get()
        .context("Failed to get system hostname")?
        .to_string_lossy()
        .to_string();

    let addr = if publisher.addr.is_empty() {
        format!("{}:{}", hostname, config.multicast.port)
    } else {
        publisher.addr.clone()
    };
    let name = if publisher.name.is_empty() {
        hostname
    } else {
        publisher.name.clone()
    };

    Ok(ServiceDescriptor::announce(publisher.service_type.as_str(), addr)
        .with_name(name)
        .with_timestamp()
        .to_payload())
}

fn log_event(event: &RegistryEvent) {
    match event {
        RegistryEvent::Discovered(entry) => {
            tracing::info!("New service: {} at {}", entry.name(), entry.addr);
        }
        RegistryEvent::Updated(entry) => {
            tracing::debug!("Service refreshed: {} (seen {} times)", entry.addr, entry.seen_count);
        }
        RegistryEvent::Expired(addr) => {
            tracing::info!("Service gone: {}", addr);
        }
        RegistryEvent::Cleared => {
            tracing::info!("Service list cleared");
        }
    }
}

fn log_metrics(role: &str, m: &vault_multicast::MetricsSnapshot) {
    tracing::info!(
        role,
        packets_sent = m.packets_sent,
        packets_received = m.packets_received,
        bytes_sent = m.bytes_sent,
        bytes_received = m.bytes_received,
        errors = m.errors,
        active_services = m.active_services,
        uptime_secs = m.uptime_seconds as u64,
        packets_per_second = m.packets_per_second,
        "Metrics"
    );
}
