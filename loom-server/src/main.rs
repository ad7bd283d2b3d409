//! Loom relay — collaborative text rooms over WebSocket.
//!
//! Usage: `loom-server [BIND_ADDR] [OPTIONS]`. Clients connect to
//! `ws://BIND_ADDR/<room>`. Every option can also be set through its
//! `LOOM_*` environment variable (see `--help`). Logging follows `RUST_LOG`.

use std::time::Duration;

use clap::Parser;
use log::info;

use loom_collab::{ServerConfig, SyncServer};

/// Relay server for collaborative text rooms.
#[derive(Debug, Parser)]
#[command(name = "loom-server", version, about, long_about = None)]
struct Cli {
    /// Address to listen on [default: 127.0.0.1:1234]
    #[arg(env = "LOOM_BIND_ADDR")]
    bind_addr: Option<String>,

    /// Frames buffered per session before it lags and gets resynced
    #[arg(long, env = "LOOM_BROADCAST_CAPACITY")]
    broadcast_capacity: Option<usize>,

    /// Seconds of silence after which a client's presence is removed
    #[arg(long, env = "LOOM_AWARENESS_TIMEOUT_SECS")]
    awareness_timeout_secs: Option<u64>,

    /// Seconds between awareness sweeps
    #[arg(long, env = "LOOM_SWEEP_INTERVAL_SECS", value_parser = clap::value_parser!(u64).range(1..))]
    sweep_interval_secs: Option<u64>,

    /// Largest accepted WebSocket message, in bytes
    #[arg(long, env = "LOOM_MAX_FRAME_BYTES")]
    max_frame_bytes: Option<usize>,

    /// Room used when the request path is empty
    #[arg(long, env = "LOOM_DEFAULT_ROOM")]
    default_room: Option<String>,
}

impl Cli {
    /// Defaults overridden by whatever was given on the command line or in
    /// the environment.
    fn into_config(self) -> ServerConfig {
        let mut config = ServerConfig::default();
        if let Some(addr) = self.bind_addr {
            config.bind_addr = addr;
        }
        if let Some(capacity) = self.broadcast_capacity {
            config.broadcast_capacity = capacity;
        }
        if let Some(secs) = self.awareness_timeout_secs {
            config.awareness_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.sweep_interval_secs {
            config.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(max) = self.max_frame_bytes {
            config.max_frame_bytes = max;
        }
        if let Some(room) = self.default_room {
            config.default_room = room;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = Cli::parse().into_config();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!(
        "Starting Loom relay on {} (awareness timeout {:?})",
        config.bind_addr, config.awareness_timeout
    );
    let server = SyncServer::new(config);

    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats().await;
            info!(
                "Shutting down: {} connection(s) served, {} room(s), {} frame(s) relayed",
                stats.total_connections, stats.active_rooms, stats.total_frames
            );
            for (room, snapshot) in server.registry().snapshots().await {
                info!("Room {room:?}: {}", serde_json::to_string(&snapshot)?);
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_flags_override_defaults() {
        let config = Cli::try_parse_from([
            "loom-server",
            "0.0.0.0:8080",
            "--broadcast-capacity",
            "64",
            "--awareness-timeout-secs",
            "10",
            "--sweep-interval-secs",
            "2",
            "--max-frame-bytes",
            "4096",
            "--default-room",
            "lobby",
        ])
        .unwrap()
        .into_config();
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.broadcast_capacity, 64);
        assert_eq!(config.awareness_timeout, Duration::from_secs(10));
        assert_eq!(config.sweep_interval, Duration::from_secs(2));
        assert_eq!(config.max_frame_bytes, 4096);
        assert_eq!(config.default_room, "lobby");
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(Cli::try_parse_from(["loom-server", "--sweep-interval-secs", "0"]).is_err());
        assert!(Cli::try_parse_from(["loom-server", "--max-frame-bytes", "lots"]).is_err());
    }
}
