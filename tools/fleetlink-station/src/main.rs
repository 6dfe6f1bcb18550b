// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fleetlink station CLI
//!
//! Runs the engine tick loop against real UDP/TCP sockets.
//!
//! # Usage
//!
//! ```bash
//! # Host station, one UI device and two robots before Running
//! fleetlink-station --min-ui 1 --min-robots 2
//!
//! # Robots only, connect to whatever advertises
//! fleetlink-station --role client --auto-connect
//!
//! # Using configuration file
//! fleetlink-station --config station.toml
//! ```
//!
//! While running, commands are read from stdin one per line:
//!
//! ```text
//! connect robot 7
//! disconnect ui 1
//! start
//! restart
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use fleetlink::{
    standard_dispatch, EngineCommand, EngineConfig, EngineEvent, EngineHandle,
    EngineOrchestrator, EngineRole, LinkKind, NetConnector, PeerKind,
};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// Fleetlink robot station
#[derive(Parser, Debug)]
#[command(name = "fleetlink-station")]
#[command(about = "Fleetlink station - robot and UI discovery, links and engine state")]
#[command(version)]
struct Args {
    /// Configuration file path (TOML, or JSON by extension)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Which channels this station opens
    #[arg(long, value_enum, default_value = "host")]
    role: Role,

    /// Host the discovery endpoints bind on
    #[arg(long, conflicts_with = "config")]
    advertising_host: Option<String>,

    /// Robot discovery port
    #[arg(long, conflicts_with = "config")]
    robot_port: Option<u16>,

    /// UI discovery port
    #[arg(long, conflicts_with = "config")]
    ui_port: Option<u16>,

    /// Robot link transport
    #[arg(long, value_enum, conflicts_with = "config")]
    robot_link: Option<Link>,

    /// UI devices required before waiting for robots
    #[arg(long, conflicts_with = "config")]
    min_ui: Option<usize>,

    /// Robots required before Running
    #[arg(long, conflicts_with = "config")]
    min_robots: Option<usize>,

    /// Connect every advertising robot automatically
    #[arg(long)]
    auto_connect: bool,

    /// Statistics reporting interval (seconds, 0 to disable)
    #[arg(long, default_value = "10")]
    stats_interval: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate example configuration file
    GenConfig {
        /// Output file path
        #[arg(short, long, default_value = "station.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Role {
    Host,
    Client,
    UiOnly,
}

impl From<Role> for EngineRole {
    fn from(role: Role) -> Self {
        match role {
            Role::Host => EngineRole::host(),
            Role::Client => EngineRole::client(),
            Role::UiOnly => EngineRole::ui_only(),
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Link {
    Stream,
    Datagram,
}

impl From<Link> for LinkKind {
    fn from(link: Link) -> Self {
        match link {
            Link::Stream => LinkKind::Stream,
            Link::Datagram => LinkKind::Datagram,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if let Some(cmd) = args.command {
        return match cmd {
            Commands::GenConfig { output } => cmd_gen_config(output),
            Commands::Validate { config } => cmd_validate(config),
        };
    }

    let config = build_config(&args)?;
    let tick_period = config.tick_period();

    let mut engine = EngineOrchestrator::new(
        args.role.into(),
        Arc::new(NetConnector),
        standard_dispatch()?,
    );
    engine.init(config)?;
    let events = engine.subscribe();
    engine.start()?;

    println!("Fleetlink Station v{}", env!("CARGO_PKG_VERSION"));
    println!("=====================================");
    println!();
    if let Some(cfg) = engine.config() {
        println!("Role:   {:?}", args.role);
        println!(
            "Robots: {}:{} ({:?})",
            cfg.advertising_host, cfg.robot_advertising_port, cfg.robot_link
        );
        if engine.role().is_host {
            println!(
                "UI:     {}:{} ({:?})",
                cfg.advertising_host, cfg.ui_advertising_port, cfg.ui_link
            );
        }
        println!("Tick:   {} ms", cfg.tick_period_ms);
    }
    println!();
    println!("Commands: connect <robot|ui> <id>, disconnect <robot|ui> <id>, start, restart");
    println!("Press Ctrl+C to stop...");
    println!();

    spawn_command_reader(engine.handle());

    let mut ticker = tick_interval(tick_period);
    let stats_every = Duration::from_secs(args.stats_interval);
    let mut last_stats = Instant::now();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = Instant::now();
                if let Err(e) = engine.update(now) {
                    tracing::error!("Tick failed: {}", e);
                }
                for event in events.try_iter() {
                    log_event(&event);
                }
                if !stats_every.is_zero() && now.duration_since(last_stats) >= stats_every {
                    print_stats(&engine);
                    last_stats = now;
                }
            }
            _ = &mut shutdown => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    engine.shutdown();
    for event in events.try_iter() {
        log_event(&event);
    }

    println!("\nFinal Statistics:");
    print_stats(&engine);
    Ok(())
}

/// Engine ticker. An overrun tick pushes the schedule back instead of
/// skipping a period, so the engine never sees a gap of two periods.
fn tick_interval(period: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker
}

fn build_config(args: &Args) -> Result<EngineConfig, fleetlink::ConfigError> {
    if let Some(ref config_path) = args.config {
        let mut config = EngineConfig::from_file(config_path)?;
        config.auto_connect_robots |= args.auto_connect;
        return Ok(config);
    }

    let mut config = EngineConfig::default();
    if let Some(ref host) = args.advertising_host {
        config.advertising_host = host.clone();
    }
    if let Some(port) = args.robot_port {
        config.robot_advertising_port = port;
    }
    if let Some(port) = args.ui_port {
        config.ui_advertising_port = port;
    }
    if let Some(link) = args.robot_link {
        config.robot_link = link.into();
    }
    if let Some(n) = args.min_ui {
        config.min_ui_devices = n;
    }
    if let Some(n) = args.min_robots {
        config.min_robots = n;
    }
    config.auto_connect_robots = args.auto_connect;
    config.validate()?;
    Ok(config)
}

/// Read operator commands from stdin on a plain thread; the engine applies
/// them on its next tick.
fn spawn_command_reader(handle: EngineHandle) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match parse_command(line) {
                Some(cmd) => {
                    if !handle.send(cmd) {
                        tracing::warn!("Command dropped: {}", line);
                    }
                }
                None => tracing::warn!("Unknown command: {}", line),
            }
        }
    });
}

fn parse_command(line: &str) -> Option<EngineCommand> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    match parts.as_slice() {
        ["start"] => Some(EngineCommand::Start),
        ["restart"] | ["reinit"] => Some(EngineCommand::Reinitialize),
        [verb, kind, id] => {
            let kind = match *kind {
                "robot" => PeerKind::Robot,
                "ui" => PeerKind::Ui,
                _ => return None,
            };
            let id = id.parse().ok()?;
            match *verb {
                "connect" => Some(EngineCommand::Connect(kind, id)),
                "disconnect" => Some(EngineCommand::Disconnect(kind, id)),
                _ => None,
            }
        }
        _ => None,
    }
}

fn log_event(event: &EngineEvent) {
    match event {
        EngineEvent::StateChanged { old, new } => {
            tracing::info!("State {} -> {}", old, new);
        }
        EngineEvent::PeerAvailable { kind, peer_id } => {
            tracing::info!("{} {} is advertising", kind, peer_id);
        }
        EngineEvent::PeerConnected {
            kind,
            peer_id,
            success,
        } => {
            if *success {
                tracing::info!("{} {} connected", kind, peer_id);
            } else {
                tracing::warn!("{} {} connection failed", kind, peer_id);
            }
        }
        EngineEvent::PeerDisconnected {
            kind,
            peer_id,
            reason,
        } => {
            tracing::info!("{} {} disconnected ({})", kind, peer_id, reason);
        }
        EngineEvent::HandshakeComplete { peer_id } => {
            tracing::info!("robot {} clock synchronized", peer_id);
        }
        EngineEvent::Message {
            kind,
            peer_id,
            message,
        } => {
            tracing::debug!("{} {}: {}", kind, peer_id, message.name());
        }
    }
}

fn cmd_gen_config(output: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = EngineConfig {
        robot_listen_port: Some(5101),
        ui_listen_port: Some(5104),
        min_ui_devices: 1,
        min_robots: 2,
        auto_connect_robots: true,
        send_budget_bytes_per_tick: Some(64 * 1024),
        ..EngineConfig::default()
    };

    let toml_str = config.to_toml_string()?;

    let content = format!(
        r#"# Fleetlink Station Configuration
# Generated by fleetlink-station gen-config

{}
"#,
        toml_str
    );

    std::fs::write(&output, content)?;
    println!("Generated configuration file: {}", output.display());
    Ok(())
}

fn cmd_validate(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    match EngineConfig::from_file(&config_path) {
        Ok(config) => {
            println!("Configuration valid!");
            println!();
            println!(
                "Robots:  {}:{} ({:?}), need {}",
                config.advertising_host,
                config.robot_advertising_port,
                config.robot_link,
                config.min_robots
            );
            println!(
                "UI:      {}:{} ({:?}), need {}",
                config.advertising_host,
                config.ui_advertising_port,
                config.ui_link,
                config.min_ui_devices
            );
            println!(
                "Timeouts: robot {} ms, ui {} ms, staleness {} ms",
                config.disconnect_timeout_ms,
                config.ui_disconnect_timeout_ms,
                config.advertisement_staleness_ms
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration invalid: {}", e);
            std::process::exit(1);
        }
    }
}

fn print_stats(engine: &EngineOrchestrator) {
    let stats = engine.stats();
    println!("--- Station Statistics ---");
    println!(
        "  State {}: {} ticks ({} late), {} state changes, {} commands",
        engine.state(),
        stats.ticks,
        stats.late_ticks,
        stats.state_changes,
        stats.commands_applied
    );
    println!(
        "  Delivered {} msgs, evicted {} silent / {} broken, {} events ({} dropped)",
        stats.messages_delivered,
        stats.silence_evictions,
        stats.transport_evictions,
        stats.events_published,
        stats.events_dropped
    );
    for kind in [PeerKind::Robot, PeerKind::Ui] {
        let Some(channel) = engine.channel(kind) else {
            continue;
        };
        let ch = channel.stats();
        println!(
            "  {}: {} active, {} advertising, {} in / {} out packets ({} / {}), {} evictions",
            kind,
            engine.list_active_peers(kind).len(),
            engine.list_advertising_peers(kind).len(),
            ch.packets_received,
            ch.packets_sent,
            format_bytes(ch.bytes_received),
            format_bytes(ch.bytes_sent),
            ch.evictions
        );
        if let Some(h) = engine.handler_stats(kind) {
            println!(
                "    handler: {} delivered, {} unknown, {} decode errors, {} resyncs ({})",
                h.delivered,
                h.unknown_tag,
                h.decode_errors,
                h.resync_events,
                format_bytes(h.bytes_discarded)
            );
        }
    }
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
