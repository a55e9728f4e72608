use anyhow::Result;
use astro_client::domain::settings::{Settings, SettingsService};
use astro_client::infrastructure::logging::init_logger;
use clap::{Parser, Subcommand};
use std::sync::{Arc, Mutex};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "astro", version, about = "Configure and trigger Astro camera devices over Bluetooth LE")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
#[cfg_attr(not(windows), allow(dead_code))]
enum Command {
    /// List nearby devices
    Scan {
        /// How long to listen for advertisements
        #[arg(short, long, default_value_t = 10)]
        seconds: u64,
        /// Show every BLE device, not only Astro devices
        #[arg(long)]
        all: bool,
    },
    /// Connect and print configuration updates until interrupted
    Connect {
        /// Device address, e.g. 00:11:22:AA:BB:CC. Defaults to the last connected device.
        #[arg(short, long)]
        address: Option<String>,
    },
    /// Read configuration items (the well-known ones if none are given)
    Get {
        #[arg(short, long)]
        address: Option<String>,
        ids: Vec<String>,
        /// Seconds to wait for each answer
        #[arg(long, default_value_t = 3)]
        timeout: u64,
    },
    /// Write a configuration item
    Set {
        #[arg(short, long)]
        address: Option<String>,
        id: String,
        value: String,
    },
    /// Trigger a timed capture sequence
    Capture {
        #[arg(short, long)]
        address: Option<String>,
        /// Number of exposures (defaults to the configured value)
        #[arg(short, long)]
        takes: Option<u32>,
        /// Seconds between exposures (defaults to the configured value)
        #[arg(short, long)]
        interval: Option<f64>,
    },
}

fn load_settings() -> SettingsService {
    SettingsService::new().unwrap_or_else(|e| {
        eprintln!("Failed to load settings, using defaults: {}", e);
        SettingsService::in_memory(Settings::default())
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = load_settings();
    let _log_guard = init_logger(&settings.get().log_settings)?;
    info!("Starting Astro client");

    run(cli.command, Arc::new(Mutex::new(settings))).await
}

#[cfg(not(windows))]
async fn run(_command: Command, _settings: Arc<Mutex<SettingsService>>) -> Result<()> {
    anyhow::bail!("Bluetooth LE access is only implemented for Windows")
}

#[cfg(windows)]
async fn run(command: Command, settings: Arc<Mutex<SettingsService>>) -> Result<()> {
    windows_app::run(command, settings).await
}

#[cfg(windows)]
mod windows_app {
    use super::Command;
    use anyhow::{Context, Result};
    use astro_client::domain::capture::CapturePlan;
    use astro_client::domain::config::WELL_KNOWN_CONFIG;
    use astro_client::domain::models::{AppEvent, MessageSeverity};
    use astro_client::domain::peers::parse_address;
    use astro_client::domain::settings::SettingsService;
    use astro_client::infrastructure::bluetooth::scanner::BleScanner;
    use astro_client::infrastructure::bluetooth::winrt::WinRtTransport;
    use astro_client::infrastructure::bluetooth::{protocol, CameraService};
    use std::sync::{Arc, Mutex, PoisonError};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use tracing::{error, info, trace, warn};

    fn resolve_address(arg: Option<&str>, settings: &Mutex<SettingsService>) -> Result<u64> {
        match arg {
            Some(text) => {
                parse_address(text).with_context(|| format!("Invalid Bluetooth address '{}'", text))
            }
            None => settings
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get()
                .last_connected_address
                .context("No address given and no device has been connected before"),
        }
    }

    /// Forward service events to the log and print configuration updates.
    async fn report_events(mut events: mpsc::UnboundedReceiver<AppEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                AppEvent::LogMessage(msg) => match msg.severity {
                    MessageSeverity::Info | MessageSeverity::Success => info!("{}", msg.message),
                    MessageSeverity::Warning => warn!("{}", msg.message),
                    MessageSeverity::Error => error!("{}", msg.message),
                },
                AppEvent::ConfigUpdated(entry) => {
                    let lock = if entry.is_read_only { " (read-only)" } else { "" };
                    println!("{} [{}] = {}{}", entry.display_name, entry.id, entry.value, lock);
                    if !entry.choices.is_empty() {
                        println!("    choices: {}", entry.choices.join(", "));
                    }
                }
                AppEvent::ConnectionStatus(status) => info!("Connection status: {}", status),
                other => trace!("{:?}", other),
            }
        }
    }

    pub async fn run(command: Command, settings: Arc<Mutex<SettingsService>>) -> Result<()> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let reporter = tokio::spawn(report_events(event_rx));
        let mut service = CameraService::new(Arc::new(WinRtTransport::new()), event_tx, Arc::clone(&settings));

        let cancel = CancellationToken::new();
        let interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                interrupt.cancel();
            }
        });

        let result: Result<()> = async {
            match command {
                Command::Scan { seconds, all } => {
                    let (service_uuid, show_all) = {
                        let settings = settings.lock().unwrap_or_else(PoisonError::into_inner);
                        let s = settings.get();
                        let uuid = uuid::Uuid::parse_str(&s.ble_service_uuid)
                            .unwrap_or(protocol::SERVICE_UUID);
                        (uuid, all || s.scan_show_all_devices)
                    };

                    let mut scanner = BleScanner::new(service.ble_sender());
                    service.begin_scan();
                    scanner.start(service_uuid, show_all)?;
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(seconds)) => {}
                        _ = cancel.cancelled() => {}
                    }
                    scanner.stop()?;
                    service.process_pending_events();

                    for peer in service.peers().peers() {
                        let marker = if peer.advertises(&service_uuid) { "*" } else { " " };
                        println!(
                            "{} {}  {:>4} dBm  {}",
                            marker, peer.formatted_address, peer.signal_strength, peer.name
                        );
                    }
                }
                Command::Connect { address } => {
                    let address = resolve_address(address.as_deref(), &settings)?;
                    service.connect(address, &cancel).await?;
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            more = service.process_next_event() => if !more { break },
                        }
                    }
                }
                Command::Get {
                    address,
                    ids,
                    timeout,
                } => {
                    let address = resolve_address(address.as_deref(), &settings)?;
                    service.connect(address, &cancel).await?;
                    let ids: Vec<String> = if ids.is_empty() {
                        WELL_KNOWN_CONFIG.iter().map(|(id, _)| id.to_string()).collect()
                    } else {
                        ids
                    };
                    for id in ids {
                        if service
                            .fetch_config(&id, Duration::from_secs(timeout))
                            .await?
                            .is_none()
                        {
                            warn!("No answer for '{}'", id);
                        }
                    }
                }
                Command::Set { address, id, value } => {
                    let address = resolve_address(address.as_deref(), &settings)?;
                    service.connect(address, &cancel).await?;
                    // Learn whether the item is read-only before writing
                    service.fetch_config(&id, Duration::from_secs(3)).await?;
                    service.write_config(&id, &value).await?;
                    service.fetch_config(&id, Duration::from_secs(3)).await?;
                }
                Command::Capture {
                    address,
                    takes,
                    interval,
                } => {
                    let plan = {
                        let settings = settings.lock().unwrap_or_else(PoisonError::into_inner);
                        let s = settings.get();
                        CapturePlan::from_secs(
                            takes.unwrap_or(s.capture_takes),
                            interval.unwrap_or(s.capture_interval_secs),
                        )
                    };
                    let address = resolve_address(address.as_deref(), &settings)?;
                    service.connect(address, &cancel).await?;
                    let outcome = service.capture_sequence(plan, cancel.clone()).await?;
                    println!("{:?}", outcome);
                }
            }
            Ok(())
        }
        .await;

        service.disconnect().await;
        drop(service);
        let _ = reporter.await;
        result
    }
}
