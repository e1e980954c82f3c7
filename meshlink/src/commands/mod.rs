use anyhow::{Context, Result, bail};
use colored::Colorize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use tokio::sync::Notify;
use tracing::{info, warn};

use meshlink_core::framing;
use meshlink_core::packet;
use meshlink_core::processor::{
    MessageProcessor, MessageStore, NodeDirectory, NotificationPrefs, Notifier, TextMessage,
};
use meshlink_core::reconnect::{ReconnectHooks, ReconnectManager};
use meshlink_core::transport::ble::BleTransport;
use meshlink_core::transport::serial::SerialTransport;
use meshlink_core::{DeviceInfo, Transport};

use crate::cli::{Cli, Commands};

pub async fn handle_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Scan => scan(&cli).await,
        Commands::Listen { notify } => listen(&cli, notify).await,
        Commands::Send {
            ref text,
            ref dest,
            channel,
        } => send(&cli, text, dest.as_deref(), channel).await,
    }
}

/// Pick the transport variant from the command line and resolve the target
/// device, scanning when the wireless variant needs discovery first.
async fn select_transport(cli: &Cli) -> Result<(Arc<dyn Transport>, DeviceInfo)> {
    if let Some(port) = &cli.port {
        let transport: Arc<dyn Transport> = Arc::new(SerialTransport::new());
        return Ok((transport, DeviceInfo::serial_port(port)));
    }

    if let Some(wanted) = &cli.ble {
        let transport = Arc::new(BleTransport::new().await?);
        let mut devices = transport.scan(cli.timeout.into()).await?;
        while let Some(device) = devices.recv().await {
            if device.name.eq_ignore_ascii_case(wanted)
                || device.address.eq_ignore_ascii_case(wanted)
            {
                info!(device = %device.name, "found target device");
                return Ok((transport, device));
            }
        }
        bail!("no device named {wanted} found within {}", cli.timeout);
    }

    bail!("specify a device with --port or --ble")
}

async fn scan(cli: &Cli) -> Result<()> {
    let mut found = Vec::new();

    // Wired ports first; enumeration needs no radio.
    let serial = SerialTransport::new();
    let mut ports = serial.scan(cli.timeout.into()).await?;
    while let Some(device) = ports.recv().await {
        found.push(device);
    }

    // Wireless discovery is best-effort: no adapter is not an error here.
    match BleTransport::new().await {
        Ok(ble) => {
            println!(
                "{}",
                format!("Scanning for {}...", cli.timeout).dimmed()
            );
            let mut devices = ble.scan(cli.timeout.into()).await?;
            while let Some(device) = devices.recv().await {
                if !cli.json {
                    print_device(&device);
                }
                found.push(device);
            }
        }
        Err(e) => warn!("bluetooth unavailable: {e}"),
    }

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&found)?);
    } else {
        for device in found.iter().filter(|d| d.transport == meshlink_core::TransportType::Serial) {
            print_device(device);
        }
        if found.is_empty() {
            println!("{}", "No devices found".yellow());
        }
    }

    Ok(())
}

fn print_device(device: &DeviceInfo) {
    let rssi = device
        .rssi
        .map(|rssi| format!(" ({rssi} dBm)"))
        .unwrap_or_default();
    println!(
        "{} {} [{}]{}",
        device.transport.to_string().cyan(),
        device.name.bold(),
        device.address,
        rssi.dimmed()
    );
}

async fn listen(cli: &Cli, notify: bool) -> Result<()> {
    let (transport, device) = select_transport(cli).await?;

    transport
        .connect(&device)
        .await
        .with_context(|| format!("failed to connect to {}", device.name))?;
    println!("{} {}", "Connected to".green(), device.name.bold());

    let processor = MessageProcessor::new(
        Arc::new(NoDirectory),
        Arc::new(ConsoleStore { json: cli.json }),
        Arc::new(ConsoleNotifier),
        Arc::new(StaticPrefs { notify }),
    );
    processor.init();
    processor.set_processing_enabled(true);
    processor.set_notifications_enabled(notify);
    processor.start(transport.as_ref());

    // Reconnect on unexpected drops; ctrl-c marks the drop user-initiated.
    let quitting = Arc::new(AtomicBool::new(false));
    let exhausted = Arc::new(Notify::new());
    let mut reconnect = ReconnectManager::new();
    reconnect.start(Arc::clone(&transport), ReconnectHooks {
        reconnect: {
            let transport = Arc::clone(&transport);
            let device = device.clone();
            Arc::new(move || {
                let transport = Arc::clone(&transport);
                let device = device.clone();
                Box::pin(async move {
                    match transport.connect(&device).await {
                        Ok(()) => true,
                        Err(e) => {
                            warn!("reconnect attempt failed: {e}");
                            false
                        }
                    }
                })
            })
        },
        user_disconnected: {
            let quitting = Arc::clone(&quitting);
            Arc::new(move || quitting.load(Ordering::SeqCst))
        },
        on_exhausted: {
            let exhausted = Arc::clone(&exhausted);
            Arc::new(move || exhausted.notify_one())
        },
    });

    println!("{}", "Listening for messages (ctrl-c to quit)...".dimmed());
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            quitting.store(true, Ordering::SeqCst);
            println!("\n{}", "Disconnecting...".dimmed());
        }
        _ = exhausted.notified() => {
            eprintln!("{}", "Connection lost and reconnect attempts exhausted".red());
        }
    }

    reconnect.dispose();
    let buffered = processor.take_pending().len();
    if buffered > 0 {
        info!(buffered, "frames left for a foreground consumer");
    }
    processor.dispose();
    transport.disconnect().await?;
    transport.dispose().await;
    Ok(())
}

async fn send(cli: &Cli, text: &str, dest: Option<&str>, channel: u32) -> Result<()> {
    let destination = dest
        .map(|d| u32::from_str_radix(d.trim_start_matches('!'), 16))
        .transpose()
        .context("destination must be a hex node number")?;

    let (transport, device) = select_transport(cli).await?;
    transport
        .connect(&device)
        .await
        .with_context(|| format!("failed to connect to {}", device.name))?;

    let (packet_id, frame) = packet::build_text_packet(destination, channel, text);
    let wire = if transport.requires_framing() {
        framing::encode(&frame)
    } else {
        frame
    };
    transport.send(&wire).await.context("send failed")?;

    println!(
        "{} {:08x} {}",
        "Sent message".green(),
        packet_id,
        match destination {
            Some(node) => format!("to {node:08x} on channel {channel}"),
            None => format!("as broadcast on channel {channel}"),
        }
        .dimmed()
    );

    transport.disconnect().await?;
    transport.dispose().await;
    Ok(())
}

/// The CLI has no node database; every sender falls back to its hex id.
struct NoDirectory;

impl NodeDirectory for NoDirectory {
    fn long_name(&self, _node: u32) -> Option<String> {
        None
    }

    fn short_name(&self, _node: u32) -> Option<String> {
        None
    }
}

/// Persistence collaborator that prints each stored message to stdout.
struct ConsoleStore {
    json: bool,
}

static NEXT_MESSAGE_ID: AtomicI64 = AtomicI64::new(1);

impl MessageStore for ConsoleStore {
    fn save(&self, message: &TextMessage) -> Result<i64> {
        if self.json {
            println!("{}", serde_json::to_string(message)?);
        } else {
            let time = chrono::DateTime::from_timestamp(message.rx_time as i64, 0)
                .map(|dt| dt.format("%H:%M:%S").to_string())
                .unwrap_or_default();
            let target = if message.to_node == packet::BROADCAST_ADDR {
                format!("ch{}", message.channel).cyan()
            } else {
                "direct".magenta()
            };
            println!(
                "{} {} {} {}",
                time.dimmed(),
                message.from_long_name.bold(),
                target,
                message.text
            );
        }
        Ok(NEXT_MESSAGE_ID.fetch_add(1, Ordering::SeqCst))
    }
}

struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
    fn notify_direct(&self, sender: &str, text: &str, _from: u32) {
        eprintln!("{} {sender}: {text}", "[notify]".yellow());
    }

    fn notify_channel(
        &self,
        sender: &str,
        text: &str,
        _from: u32,
        channel_label: &str,
        _channel: u32,
    ) {
        eprintln!("{} {channel_label} {sender}: {text}", "[notify]".yellow());
    }
}

struct StaticPrefs {
    notify: bool,
}

impl NotificationPrefs for StaticPrefs {
    fn notifications_enabled(&self) -> bool {
        self.notify
    }

    fn direct_message_alerts(&self) -> bool {
        true
    }

    fn channel_message_alerts(&self) -> bool {
        true
    }
}
