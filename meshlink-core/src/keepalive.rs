//! Platform keep-alive wrapper for environments that suspend background
//! work.
//!
//! While the UI is not visible, this service owns the reconnect manager and
//! the headless message processor, registers an OS-level long-running task
//! with a minimal status indicator, and mirrors the link state into that
//! indicator so the user can tell whether the radio is still reachable.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::processor::MessageProcessor;
use crate::reconnect::{
    DisconnectPredicate, ExhaustedHook, ReconnectFn, ReconnectHooks, ReconnectManager,
};
use crate::transport::{ConnectionState, Transport};

/// OS keep-alive registration: a long-running task with user-visible status
/// text, plus the power-throttling exemption query/request pair.
#[async_trait]
pub trait KeepaliveApi: Send + Sync {
    async fn start(&self, title: &str, text: &str) -> Result<()>;
    async fn update(&self, text: &str) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    async fn is_throttling_exempt(&self) -> Result<bool>;
    async fn request_throttling_exemption(&self) -> Result<bool>;
}

/// Persisted key/value flags surviving process restarts.
pub trait SettingsStore: Send + Sync {
    fn get_bool(&self, key: &str) -> Option<bool>;
    fn set_bool(&self, key: &str, value: bool);
}

/// Settings key recording that the one-time throttling-exemption request
/// was already issued on this installation.
pub const THROTTLING_EXEMPTION_REQUESTED_KEY: &str = "throttling_exemption_requested";

const SERVICE_TITLE: &str = "meshlink";
/// How long the failure status stays visible before the service stops
/// itself after reconnect exhaustion.
const EXHAUSTED_STOP_DELAY: Duration = Duration::from_secs(5);

struct ServiceInner {
    transport: Arc<dyn Transport>,
    processor: MessageProcessor,
    reconnect: Mutex<ReconnectManager>,
    keepalive: Arc<dyn KeepaliveApi>,
    settings: Arc<dyn SettingsStore>,
    reconnect_fn: ReconnectFn,
    user_disconnected: DisconnectPredicate,
    running: AtomicBool,
    device_name: Mutex<String>,
    status_task: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceInner {
    async fn stop_all(&self) {
        // Consumers first, keep-alive registration last.
        self.reconnect.lock().unwrap().dispose();
        self.processor.stop();
        if let Some(task) = self.status_task.lock().unwrap().take() {
            task.abort();
        }
        // The OS may have revoked the registration behind our back; failure
        // here is not actionable.
        if let Err(e) = self.keepalive.stop().await {
            warn!("keep-alive unregistration failed: {e:#}");
        }
        self.running.store(false, Ordering::SeqCst);
        info!("foreground service stopped");
    }

    fn on_exhausted(inner: &Arc<Self>) {
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            let device = inner.device_name.lock().unwrap().clone();
            let _ = inner
                .keepalive
                .update(&format!("Reconnect to {device} failed"))
                .await;
            // Leave the failure visible long enough to be noticed before the
            // registration goes away.
            tokio::time::sleep(EXHAUSTED_STOP_DELAY).await;
            inner.stop_all().await;
        });
    }
}

/// Keep-alive wrapper owning the headless processing pipeline while the
/// host application is backgrounded.
pub struct ForegroundService {
    inner: Arc<ServiceInner>,
}

impl ForegroundService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<dyn Transport>,
        processor: MessageProcessor,
        reconnect: ReconnectManager,
        keepalive: Arc<dyn KeepaliveApi>,
        settings: Arc<dyn SettingsStore>,
        reconnect_fn: ReconnectFn,
        user_disconnected: DisconnectPredicate,
    ) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                transport,
                processor,
                reconnect: Mutex::new(reconnect),
                keepalive,
                settings,
                reconnect_fn,
                user_disconnected,
                running: AtomicBool::new(false),
                device_name: Mutex::new(String::new()),
                status_task: Mutex::new(None),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Access to the owned processor, e.g. for the foreground handoff to
    /// drain pending frames and persisted ids.
    pub fn processor(&self) -> &MessageProcessor {
        &self.inner.processor
    }

    /// Start the keep-alive service. Idempotent: a second call while running
    /// only refreshes the status indicator.
    pub async fn start(&self, device_name: &str) -> Result<()> {
        let status = format!("Connected to {device_name}");
        *self.inner.device_name.lock().unwrap() = device_name.to_string();

        if self.inner.running.swap(true, Ordering::SeqCst) {
            debug!("already running, refreshing status");
            if let Err(e) = self.inner.keepalive.update(&status).await {
                warn!("status refresh failed: {e:#}");
            }
            return Ok(());
        }

        // Processing first, registration second: frames arriving before the
        // OS acknowledges the registration must not be lost.
        self.inner.processor.init();
        self.inner.processor.set_processing_enabled(true);
        self.inner.processor.set_notifications_enabled(true);
        self.inner.processor.start(self.inner.transport.as_ref());

        let on_exhausted: ExhaustedHook = {
            let weak = Arc::downgrade(&self.inner);
            Arc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    ServiceInner::on_exhausted(&inner);
                }
            })
        };
        self.inner.reconnect.lock().unwrap().start(
            Arc::clone(&self.inner.transport),
            ReconnectHooks {
                reconnect: Arc::clone(&self.inner.reconnect_fn),
                user_disconnected: Arc::clone(&self.inner.user_disconnected),
                on_exhausted,
            },
        );

        // A refused registration degrades the service, it never crashes it.
        if let Err(e) = self.inner.keepalive.start(SERVICE_TITLE, &status).await {
            warn!("keep-alive registration refused: {e:#}");
        }

        self.request_throttling_exemption_once().await;
        self.spawn_status_watcher();

        info!(device = device_name, "foreground service started");
        Ok(())
    }

    /// Stop everything. Always safe regardless of running state; internal
    /// state is cleared unconditionally even when the OS-side
    /// unregistration fails.
    pub async fn stop(&self) {
        self.inner.stop_all().await;
    }

    /// One-time, best-effort request to exempt the process from OS power
    /// throttling. Issued at most once per installation regardless of the
    /// outcome, tracked via a persisted flag.
    async fn request_throttling_exemption_once(&self) {
        if self
            .inner
            .settings
            .get_bool(THROTTLING_EXEMPTION_REQUESTED_KEY)
            .unwrap_or(false)
        {
            return;
        }
        self.inner
            .settings
            .set_bool(THROTTLING_EXEMPTION_REQUESTED_KEY, true);

        match self.inner.keepalive.is_throttling_exempt().await {
            Ok(true) => debug!("already exempt from throttling"),
            _ => {
                if let Err(e) = self.inner.keepalive.request_throttling_exemption().await {
                    warn!("throttling exemption request failed: {e:#}");
                }
            }
        }
    }

    /// Mirror connected/disconnected into the status indicator while the
    /// registration is active.
    fn spawn_status_watcher(&self) {
        let inner = Arc::clone(&self.inner);
        let mut states = inner.transport.state_stream();
        let task = tokio::spawn(async move {
            loop {
                let state = match states.recv().await {
                    Ok(state) => state,
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                };
                let device = inner.device_name.lock().unwrap().clone();
                let text = match state {
                    ConnectionState::Connected => format!("Connected to {device}"),
                    ConnectionState::Disconnected | ConnectionState::Error => {
                        format!("Disconnected from {device}")
                    }
                    _ => continue,
                };
                if let Err(e) = inner.keepalive.update(&text).await {
                    debug!("status update failed: {e:#}");
                }
            }
        });
        *self.inner.status_task.lock().unwrap() = Some(task);
    }
}
