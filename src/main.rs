//! # switchboard
//!
//! Server binary: loads settings, sets up logging and metrics, registers the
//! demo topics and serves WebSocket clients until Ctrl-C.

#![deny(unsafe_code)]

mod topics;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use switchboard_server::{Dispatcher, ServerConfig, SwitchboardServer, TopicRegistry};
use switchboard_settings::{LogFormat, SwitchboardSettings};
use switchboard_telemetry::{init_telemetry, parse_level, TelemetryConfig};
use tracing::{info, warn, Level};

/// Topic-routed WebSocket message dispatcher.
#[derive(Parser, Debug)]
#[command(name = "switchboard", about = "Topic-routed WebSocket message dispatcher")]
struct Cli {
    /// Path to the JSON settings file.
    #[arg(long, default_value = "switchboard.json")]
    config: PathBuf,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (overrides settings, 0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Skip the Prometheus `/metrics` endpoint.
    #[arg(long)]
    no_metrics: bool,
}

/// Settings after CLI overrides.
fn resolve_settings(cli: &Cli) -> Result<SwitchboardSettings> {
    let mut settings = switchboard_settings::load_settings_from_path(&cli.config)
        .with_context(|| format!("Failed to load settings from {}", cli.config.display()))?;
    if let Some(host) = &cli.host {
        settings.server.host.clone_from(host);
    }
    if let Some(port) = cli.port {
        settings.server.port = port;
    }
    Ok(settings)
}

fn telemetry_config(settings: &SwitchboardSettings) -> TelemetryConfig {
    let module_levels = settings
        .logging
        .modules
        .iter()
        .filter_map(|(module, level)| parse_level(level).map(|l| (module.clone(), l)))
        .collect();
    TelemetryConfig {
        log_level: parse_level(&settings.logging.level).unwrap_or(Level::INFO),
        module_levels,
        json: settings.logging.format == LogFormat::Json,
    }
}

fn server_config(settings: &SwitchboardSettings) -> ServerConfig {
    let s = &settings.server;
    ServerConfig {
        host: s.host.clone(),
        port: s.port,
        ws_path: s.ws_path.clone(),
        max_message_size: s.max_message_size,
        allowed_origins: s.allowed_origins.clone(),
    }
}

fn build_dispatcher() -> Dispatcher {
    let mut registry = TopicRegistry::new();
    topics::register_demo_topics(&mut registry);

    Dispatcher::builder(registry)
        .add_pre_hook(|conn| {
            topics::init_counter(conn.values());
            info!(
                connection_id = conn.id(),
                user_agent = conn.metadata().header("user-agent").unwrap_or("-"),
                "client connected"
            );
        })
        .add_post_hook(|conn| {
            info!(
                connection_id = conn.id(),
                age_ms = u64::try_from(conn.age().as_millis()).unwrap_or(u64::MAX),
                "client disconnected"
            );
        })
        .build()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = resolve_settings(&cli)?;
    let _ = init_telemetry(&telemetry_config(&settings));

    let mut server = SwitchboardServer::new(server_config(&settings), build_dispatcher());
    if !cli.no_metrics {
        match switchboard_server::metrics::install_recorder() {
            Ok(handle) => server = server.with_metrics(handle),
            Err(e) => warn!(error = %e, "metrics disabled"),
        }
    }

    let topic_names = server.dispatcher().registry().topics();
    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    info!(
        "switchboard listening on ws://{addr}{} ({} topics: {})",
        server.config().ws_path,
        topic_names.len(),
        topic_names.join(", ")
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    info!("Shutting down...");
    let drained = server
        .shutdown()
        .drain(vec![handle], Some(Duration::from_secs(10)))
        .await;
    if !drained {
        warn!(
            connections = server.dispatcher().active_connections(),
            "connections still open at exit"
        );
    }
    info!("Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults() {
        let cli = Cli::parse_from(["switchboard"]);
        assert_eq!(cli.config, PathBuf::from("switchboard.json"));
        assert_eq!(cli.host, None);
        assert_eq!(cli.port, None);
        assert!(!cli.no_metrics);
    }

    #[test]
    fn cli_overrides_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        std::fs::write(&path, r#"{"server":{"host":"10.0.0.1","port":1000}}"#).unwrap();
        let cli = Cli::parse_from([
            "switchboard",
            "--config",
            path.to_str().unwrap(),
            "--port",
            "2000",
        ]);
        let settings = resolve_settings(&cli).unwrap();
        assert_eq!(settings.server.host, "10.0.0.1");
        assert_eq!(settings.server.port, 2000);
    }

    #[test]
    fn bad_settings_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        std::fs::write(&path, "not json").unwrap();
        let cli = Cli::parse_from(["switchboard", "--config", path.to_str().unwrap()]);
        let err = resolve_settings(&cli).unwrap_err();
        assert!(err.to_string().contains("Failed to load settings"));
    }

    #[test]
    fn settings_map_to_server_config() {
        let mut settings = SwitchboardSettings::default();
        settings.server.ws_path = "/live".into();
        settings.server.allowed_origins = vec!["https://a.example".into()];
        let config = server_config(&settings);
        assert_eq!(config.ws_path, "/live");
        assert_eq!(config.port, settings.server.port);
        assert_eq!(config.allowed_origins, settings.server.allowed_origins);
    }

    #[test]
    fn logging_settings_map_to_telemetry() {
        let mut settings = SwitchboardSettings::default();
        settings.logging.level = "debug".into();
        settings.logging.format = LogFormat::Json;
        settings.logging.modules = [("hyper", "warn"), ("bogus", "nope")]
            .into_iter()
            .map(|(m, l)| (m.to_owned(), l.to_owned()))
            .collect();
        let config = telemetry_config(&settings);
        assert_eq!(config.log_level, Level::DEBUG);
        assert!(config.json);
        assert_eq!(config.module_levels, vec![("hyper".to_string(), Level::WARN)]);
    }

    #[test]
    fn dispatcher_has_demo_topics() {
        let dispatcher = build_dispatcher();
        assert!(dispatcher.registry().has_topic("echo"));
        assert!(dispatcher.registry().has_topic("ping"));
    }
}
