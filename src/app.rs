//! Core application runner for `tb-ble-bridge`.
//!
//! This module is decoupled from logger setup and process exit codes so the
//! main loop can be tested with injected BLE, gateway and signal collaborators.

use crate::ble::{BleCentral, ScanError};
use crate::discovery::{DeviceTable, DiscoveryOptions, rescan};
use crate::duration::parse_duration;
use crate::poller::{PollOptions, tick};
use crate::registry::{ConfigError, Registry};
use crate::signal::{RescanSignal, Shutdown};
use crate::sink::thingsboard::GatewayConfig;
use crate::sink::{TelemetrySink, TransportError};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line configuration.
#[derive(Parser, Debug, Clone)]
#[command(author, about, version)]
pub struct Options {
    /// ThingsBoard MQTT host
    #[arg(short = 's', long, default_value = "localhost")]
    pub server: String,

    /// ThingsBoard MQTT port
    #[arg(short = 'p', long, default_value_t = 1883)]
    pub port: u16,

    /// Access token of the gateway device
    #[arg(short = 't', long)]
    pub token: String,

    /// Registration file mapping extension ids to advertised names
    #[arg(
        short = 'e',
        long,
        value_name = "PATH",
        default_value = "extensions/registered_extensions.json"
    )]
    pub extensions: PathBuf,

    /// Length of one BLE scan window.
    /// Accepts duration with suffix: 3s, 1m, 500ms, 2h.
    /// Without suffix, value is interpreted as seconds.
    #[arg(long, default_value = "15s", value_parser = parse_duration)]
    pub scan_window: Duration,

    /// Fixed pause after a failed scan
    #[arg(long, default_value = "1s", value_parser = parse_duration)]
    pub scan_retry_delay: Duration,

    /// Pause between two polling ticks
    #[arg(long, default_value = "1s", value_parser = parse_duration)]
    pub poll_interval: Duration,

    /// How long to wait for a notification from a device per tick
    #[arg(long, default_value = "1s", value_parser = parse_duration)]
    pub notify_timeout: Duration,

    #[arg(long, default_value = "10s", value_parser = parse_duration)]
    pub connect_timeout: Duration,

    #[arg(long, default_value = "10s", value_parser = parse_duration)]
    pub poll_timeout: Duration,

    /// Verbose output, log every advertisement field and decoded reading
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

impl Options {
    pub fn settings(&self) -> Settings {
        Settings {
            discovery: DiscoveryOptions {
                scan_window: self.scan_window,
                retry_delay: self.scan_retry_delay,
            },
            polling: PollOptions {
                connect_timeout: self.connect_timeout,
                poll_timeout: self.poll_timeout,
                notify_timeout: self.notify_timeout,
            },
            poll_interval: self.poll_interval,
        }
    }

    pub fn gateway(&self) -> GatewayConfig {
        GatewayConfig {
            server: self.server.clone(),
            port: self.port,
            token: self.token.clone(),
        }
    }
}

/// Timing of the main loop.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Settings {
    pub discovery: DiscoveryOptions,
    pub polling: PollOptions,
    pub poll_interval: Duration,
}

/// Startup failures. Once the main loop runs, only shutdown ends it.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Alternate rescans and polling ticks until shutdown is requested.
///
/// A rescan runs whenever `rescan_signal` is set, including before the first
/// tick when the signal starts set. A request arriving while the loop sleeps
/// between ticks cuts the sleep short.
pub async fn run_with(
    settings: &Settings,
    registry: &Registry,
    central: &dyn BleCentral,
    sink: &dyn TelemetrySink,
    rescan_signal: &RescanSignal,
    shutdown: &Shutdown,
) {
    let mut table = DeviceTable::new();

    loop {
        if rescan_signal.take() {
            let discovered = rescan(
                &mut table,
                registry,
                central,
                sink,
                &settings.discovery,
                shutdown,
            )
            .await;
            if discovered.is_err() {
                break;
            }
        }

        match tick(&mut table, sink, &settings.polling, shutdown).await {
            Ok(report) => log::debug!(
                "Tick done: {} published, {} empty, {} failed",
                report.published,
                report.empty,
                report.failed
            ),
            Err(_) => break,
        }

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = rescan_signal.requested() => log::info!("Rescan requested"),
            _ = tokio::time::sleep(settings.poll_interval) => {}
        }
    }

    log::info!("Exiting the application");
}

/// Start the BlueZ and gateway sessions and run until shutdown.
#[cfg(feature = "bluer")]
pub async fn run(options: &Options, shutdown: &Shutdown) -> Result<(), RunError> {
    use crate::ble::bluer::BluerCentral;
    use crate::command::CommandChannel;
    use crate::registry::builtin_factories;
    use crate::sink::thingsboard::GatewayClient;

    let registry = Registry::load(&options.extensions, &builtin_factories())?;
    if registry.is_empty() {
        log::warn!("No extensions registered, no device will ever be discovered");
    }

    let central = BluerCentral::new().await?;
    let rescan_signal = RescanSignal::default();
    let gateway =
        GatewayClient::connect(&options.gateway(), CommandChannel::new(rescan_signal.clone()))
            .await?;

    run_with(
        &options.settings(),
        &registry,
        &central,
        &gateway,
        &rescan_signal,
        shutdown,
    )
    .await;

    gateway.disconnect().await;
    Ok(())
}
