//! Headless consumer of a transport's inbound frame stream.
//!
//! Decodes envelopes, deduplicates mesh retransmissions, resolves sender
//! identity, persists text messages, and optionally dispatches notifications.
//! Frames the headless path cannot resolve are buffered verbatim for the
//! foreground handoff to finish interpreting.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dedupe::{DedupeKey, PacketDedupe};
use crate::framing::FrameDecoder;
use crate::packet::{self, Classification, InboundText};
use crate::transport::{Transport, TransportType};

/// Resolves a sender id to display names. Never mutated by this component.
pub trait NodeDirectory: Send + Sync {
    fn long_name(&self, node: u32) -> Option<String>;
    fn short_name(&self, node: u32) -> Option<String>;
}

/// Message persistence. Write-only from this component's perspective;
/// returns the stable id assigned to the stored message.
pub trait MessageStore: Send + Sync {
    fn save(&self, message: &TextMessage) -> Result<i64>;
}

/// OS-level user notification dispatch. Invoked only after every gating
/// check in the pipeline passes.
pub trait Notifier: Send + Sync {
    fn notify_direct(&self, sender: &str, text: &str, from: u32);
    fn notify_channel(&self, sender: &str, text: &str, from: u32, channel_label: &str, channel: u32);
}

/// Notification preference switches, read at dispatch time.
pub trait NotificationPrefs: Send + Sync {
    /// Master switch; when off, nothing fires regardless of categories.
    fn notifications_enabled(&self) -> bool;
    fn direct_message_alerts(&self) -> bool;
    fn channel_message_alerts(&self) -> bool;
}

/// A persisted application message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextMessage {
    pub from: String,
    pub from_node: u32,
    pub to: String,
    pub to_node: u32,
    pub channel: u32,
    pub text: String,
    pub received: bool,
    pub source: TransportType,
    pub packet_id: u32,
    pub from_long_name: String,
    pub from_short_name: String,
    pub rx_time: u64,
}

struct ProcessorInner {
    directory: Arc<dyn NodeDirectory>,
    store: Arc<dyn MessageStore>,
    notifier: Arc<dyn Notifier>,
    prefs: Arc<dyn NotificationPrefs>,
    dedupe: Mutex<PacketDedupe>,
    pending: Mutex<Vec<Vec<u8>>>,
    persisted: Mutex<HashSet<i64>>,
    notified: Mutex<HashSet<i64>>,
    processing_enabled: AtomicBool,
    notifications_enabled: AtomicBool,
}

impl ProcessorInner {
    fn handle_frame(&self, frame: Vec<u8>, source: TransportType) {
        let inbound = match packet::classify(&frame) {
            Classification::Text(inbound) => inbound,
            Classification::Passthrough => {
                // Not resolvable headlessly; the foreground drains these.
                self.pending.lock().unwrap().push(frame);
                return;
            }
            Classification::Malformed => {
                // One bad frame never tears down the subscription.
                warn!(len = frame.len(), "dropping undecodable frame");
                return;
            }
        };

        if !self.processing_enabled.load(Ordering::SeqCst) {
            // A foreground consumer owns the stream right now; handling the
            // message here too would double-persist it.
            return;
        }

        let key = DedupeKey::text(inbound.from, inbound.packet_id, inbound.channel);
        if !self.dedupe.lock().unwrap().check_and_mark(key) {
            // Expected mesh retransmission, not an error.
            debug!(from = inbound.from, packet_id = inbound.packet_id, "duplicate discarded");
            return;
        }

        let text = packet::sanitize_text(&inbound.payload);
        if text.is_empty() {
            debug!("empty message after sanitization");
            return;
        }

        let fallback = format!("{:08x}", inbound.from);
        let long_name = self
            .directory
            .long_name(inbound.from)
            .unwrap_or_else(|| fallback.clone());
        let short_name = self
            .directory
            .short_name(inbound.from)
            .unwrap_or_else(|| fallback.clone());

        let message = TextMessage {
            from: format!("{:08x}", inbound.from),
            from_node: inbound.from,
            to: format!("{:08x}", inbound.to),
            to_node: inbound.to,
            channel: inbound.channel,
            text: text.clone(),
            received: true,
            source,
            packet_id: inbound.packet_id,
            from_long_name: long_name.clone(),
            from_short_name: short_name,
            rx_time: chrono::Utc::now().timestamp() as u64,
        };

        let id = match self.store.save(&message) {
            Ok(id) => id,
            Err(e) => {
                warn!("failed to persist message: {e:#}");
                return;
            }
        };
        self.persisted.lock().unwrap().insert(id);
        debug!(id, from = %message.from, "message persisted");

        if !self.notifications_enabled.load(Ordering::SeqCst) {
            return;
        }
        self.maybe_notify(id, &inbound, &long_name, &text);
    }

    fn maybe_notify(&self, id: i64, inbound: &InboundText, sender: &str, text: &str) {
        // The master switch always wins; categories only refine it.
        if !self.prefs.notifications_enabled() {
            return;
        }
        let is_channel = inbound.is_channel_message();
        let category_enabled = if is_channel {
            self.prefs.channel_message_alerts()
        } else {
            self.prefs.direct_message_alerts()
        };
        if !category_enabled {
            return;
        }
        // Announce each stored message at most once per session.
        if !self.notified.lock().unwrap().insert(id) {
            return;
        }

        if is_channel {
            let label = format!("Channel {}", inbound.channel);
            self.notifier
                .notify_channel(sender, text, inbound.from, &label, inbound.channel);
        } else {
            self.notifier.notify_direct(sender, text, inbound.from);
        }
    }
}

/// Headless message pipeline with an explicit init/start/stop/dispose
/// lifecycle, constructed and owned by its orchestrator.
pub struct MessageProcessor {
    inner: Arc<ProcessorInner>,
    initialized: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MessageProcessor {
    pub fn new(
        directory: Arc<dyn NodeDirectory>,
        store: Arc<dyn MessageStore>,
        notifier: Arc<dyn Notifier>,
        prefs: Arc<dyn NotificationPrefs>,
    ) -> Self {
        Self::with_dedupe_ttl(directory, store, notifier, prefs, crate::dedupe::DEFAULT_DEDUPE_TTL)
    }

    pub fn with_dedupe_ttl(
        directory: Arc<dyn NodeDirectory>,
        store: Arc<dyn MessageStore>,
        notifier: Arc<dyn Notifier>,
        prefs: Arc<dyn NotificationPrefs>,
        dedupe_ttl: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(ProcessorInner {
                directory,
                store,
                notifier,
                prefs,
                dedupe: Mutex::new(PacketDedupe::with_ttl(dedupe_ttl)),
                pending: Mutex::new(Vec::new()),
                persisted: Mutex::new(HashSet::new()),
                notified: Mutex::new(HashSet::new()),
                processing_enabled: AtomicBool::new(false),
                notifications_enabled: AtomicBool::new(false),
            }),
            initialized: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    /// Open the pipeline for use. Idempotent.
    pub fn init(&self) {
        if !self.initialized.swap(true, Ordering::SeqCst) {
            debug!("message processor initialized");
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().unwrap().is_some()
    }

    /// Headless persistence gate for pipeline steps beyond pass-through
    /// buffering. Off by default so a foreground consumer stays the sole
    /// processor while the UI is active.
    pub fn set_processing_enabled(&self, enabled: bool) {
        self.inner.processing_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Notification dispatch gate. Off by default.
    pub fn set_notifications_enabled(&self, enabled: bool) {
        self.inner
            .notifications_enabled
            .store(enabled, Ordering::SeqCst);
    }

    /// Subscribe to the transport's frame stream. No-op when uninitialized
    /// or already running.
    pub fn start(&self, transport: &dyn Transport) {
        if !self.is_initialized() {
            warn!("start ignored: processor not initialized");
            return;
        }
        let mut slot = self.task.lock().unwrap();
        if slot.is_some() {
            debug!("start ignored: processor already running");
            return;
        }

        let rx = transport.data_stream();
        let source = transport.transport_type();
        let framed = transport.requires_framing();
        let inner = Arc::clone(&self.inner);

        *slot = Some(tokio::spawn(async move {
            run_pipeline(inner, rx, source, framed).await;
        }));
        info!(%source, "message processor started");
    }

    /// Unsubscribe from the stream without closing collaborators.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
            info!("message processor stopped");
        }
    }

    /// Stop and clear all session-scoped state. The processor must be
    /// re-initialized before the next start.
    pub fn dispose(&self) {
        self.stop();
        self.inner.pending.lock().unwrap().clear();
        self.inner.persisted.lock().unwrap().clear();
        self.inner.notified.lock().unwrap().clear();
        self.inner.dedupe.lock().unwrap().clear();
        self.initialized.store(false, Ordering::SeqCst);
    }

    /// Drain the frames the headless path could not resolve. Atomic
    /// read-and-clear, consumed exactly once by the foreground handoff.
    pub fn take_pending(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.inner.pending.lock().unwrap())
    }

    /// Drain the ids persisted this session, so the foreground does not
    /// re-announce messages that were already handled headlessly.
    pub fn take_persisted_ids(&self) -> HashSet<i64> {
        std::mem::take(&mut *self.inner.persisted.lock().unwrap())
    }

    /// Number of buffered pass-through frames.
    pub fn pending_len(&self) -> usize {
        self.inner.pending.lock().unwrap().len()
    }
}

async fn run_pipeline(
    inner: Arc<ProcessorInner>,
    mut rx: broadcast::Receiver<Vec<u8>>,
    source: TransportType,
    framed: bool,
) {
    // Transports without inherent message boundaries get the length-prefixed
    // decoder applied here, above the raw stream.
    let mut decoder = framed.then(FrameDecoder::new);

    loop {
        match rx.recv().await {
            Ok(chunk) => match decoder.as_mut() {
                Some(decoder) => {
                    for frame in decoder.push(&chunk) {
                        inner.handle_frame(frame, source);
                    }
                }
                None => inner.handle_frame(chunk, source),
            },
            Err(broadcast::error::RecvError::Closed) => {
                debug!("data stream closed");
                break;
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "data stream lagged, frames were dropped");
            }
        }
    }
}
