//! Bounded, backoff-scheduled reconnection driven by a transport's state
//! stream.
//!
//! The manager never decides success on its own: a reconnect callback
//! returning `true` only means the attempt was submitted. The transport
//! emitting `Connected` is the single source of truth that resets the cycle.

use futures::future::BoxFuture;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use crate::transport::{ConnectionState, Transport};

/// Fixed increasing backoff table between attempts.
pub const DEFAULT_BACKOFF: [Duration; 3] = [
    Duration::from_secs(5),
    Duration::from_secs(15),
    Duration::from_secs(45),
];

pub type ReconnectFn = Arc<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;
pub type DisconnectPredicate = Arc<dyn Fn() -> bool + Send + Sync>;
pub type ExhaustedHook = Arc<dyn Fn() + Send + Sync>;

/// Injected collaborators for one manager.
#[derive(Clone)]
pub struct ReconnectHooks {
    /// Submits one reconnection attempt. A `true` return does not by itself
    /// confirm success.
    pub reconnect: ReconnectFn,
    /// Confirms whether a drop was user-initiated; such drops never start or
    /// continue a cycle.
    pub user_disconnected: DisconnectPredicate,
    /// Fired exactly once when every attempt is exhausted without recovery.
    pub on_exhausted: ExhaustedHook,
}

/// Where the manager currently is in a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum CycleState {
    Idle,
    #[strum(to_string = "Waiting(attempt {attempt})")]
    Waiting {
        attempt: usize,
    },
    #[strum(to_string = "Attempting(attempt {attempt})")]
    Attempting {
        attempt: usize,
    },
}

#[derive(Debug, PartialEq)]
enum CycleOutcome {
    Recovered,
    Aborted,
    Exhausted,
}

enum WaitOutcome {
    Elapsed,
    Connected,
    StreamClosed,
}

pub struct ReconnectManager {
    schedule: Vec<Duration>,
    cycle: Arc<Mutex<CycleState>>,
    task: Option<JoinHandle<()>>,
}

impl ReconnectManager {
    pub fn new() -> Self {
        Self::with_schedule(DEFAULT_BACKOFF.to_vec())
    }

    /// A custom backoff table. Must not be empty.
    pub fn with_schedule(schedule: Vec<Duration>) -> Self {
        assert!(!schedule.is_empty(), "backoff schedule must not be empty");
        Self {
            schedule,
            cycle: Arc::new(Mutex::new(CycleState::Idle)),
            task: None,
        }
    }

    /// Begin observing the transport's state stream. No-op if already
    /// started; only one observer per manager.
    pub fn start(&mut self, transport: Arc<dyn Transport>, hooks: ReconnectHooks) {
        if self.task.is_some() {
            warn!("reconnect manager already started");
            return;
        }
        // Subscribe before spawning so no transition can slip past between
        // this call and the first poll of the observer task.
        let states = transport.state_stream();
        let schedule = self.schedule.clone();
        let cycle = Arc::clone(&self.cycle);
        self.task = Some(tokio::spawn(run(states, schedule, hooks, cycle)));
    }

    pub fn current(&self) -> CycleState {
        *self.cycle.lock().unwrap()
    }

    pub fn is_active(&self) -> bool {
        self.current() != CycleState::Idle
    }

    /// Cancel any pending timer and stop observing. After this returns, no
    /// further signals of any kind fire — including from a reconnect
    /// callback that was in flight when the cancellation raced it.
    pub fn dispose(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        *self.cycle.lock().unwrap() = CycleState::Idle;
    }
}

impl Default for ReconnectManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ReconnectManager {
    fn drop(&mut self) {
        self.dispose();
    }
}

async fn run(
    mut states: broadcast::Receiver<ConnectionState>,
    schedule: Vec<Duration>,
    hooks: ReconnectHooks,
    cycle: Arc<Mutex<CycleState>>,
) {
    loop {
        let state = match states.recv().await {
            Ok(state) => state,
            Err(broadcast::error::RecvError::Closed) => break,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "state stream lagged");
                continue;
            }
        };

        if !matches!(
            state,
            ConnectionState::Disconnected | ConnectionState::Error
        ) {
            continue;
        }
        if (hooks.user_disconnected)() {
            debug!("drop was user-initiated, no cycle");
            continue;
        }
        if *cycle.lock().unwrap() != CycleState::Idle {
            continue;
        }

        info!("unexpected drop, starting reconnect cycle");
        let outcome = run_cycle(&schedule, &hooks, &cycle, &mut states).await;
        *cycle.lock().unwrap() = CycleState::Idle;

        match outcome {
            CycleOutcome::Recovered => {
                info!("connection recovered");
            }
            CycleOutcome::Aborted => {
                debug!("reconnect cycle aborted");
            }
            CycleOutcome::Exhausted => {
                warn!("reconnect attempts exhausted");
                (hooks.on_exhausted)();
                // Exhaustion is terminal: the host decides what happens next.
                break;
            }
        }
    }
}

async fn run_cycle(
    schedule: &[Duration],
    hooks: &ReconnectHooks,
    cycle: &Mutex<CycleState>,
    states: &mut broadcast::Receiver<ConnectionState>,
) -> CycleOutcome {
    for attempt in 0..schedule.len() {
        *cycle.lock().unwrap() = CycleState::Waiting { attempt };
        debug!(attempt, delay = ?schedule[attempt], "backoff wait");

        match wait_for(schedule[attempt], states).await {
            // Something else restored the link while we were waiting.
            WaitOutcome::Connected => return CycleOutcome::Recovered,
            WaitOutcome::StreamClosed => return CycleOutcome::Aborted,
            WaitOutcome::Elapsed => {}
        }
        if (hooks.user_disconnected)() {
            return CycleOutcome::Aborted;
        }

        *cycle.lock().unwrap() = CycleState::Attempting { attempt };
        info!(attempt = attempt + 1, total = schedule.len(), "reconnecting");
        let submitted = (hooks.reconnect)().await;
        if (hooks.user_disconnected)() {
            return CycleOutcome::Aborted;
        }

        if submitted {
            // Success is confirmed only by the transport's own stream. Give
            // it until the next schedule point; the final table entry is
            // reused as the grace period for the last attempt.
            let grace = schedule
                .get(attempt + 1)
                .or_else(|| schedule.last())
                .copied()
                .unwrap_or(Duration::ZERO);
            match wait_for(grace, states).await {
                WaitOutcome::Connected => return CycleOutcome::Recovered,
                WaitOutcome::StreamClosed => return CycleOutcome::Aborted,
                WaitOutcome::Elapsed => {
                    debug!(attempt, "no connected event before next schedule point");
                }
            }
            if (hooks.user_disconnected)() {
                return CycleOutcome::Aborted;
            }
        }
    }

    CycleOutcome::Exhausted
}

/// Sleep for `duration`, waking early only when the transport reports
/// `Connected`. Other transitions during the wait are part of the same
/// outage and do not restart the cycle.
async fn wait_for(
    duration: Duration,
    states: &mut broadcast::Receiver<ConnectionState>,
) -> WaitOutcome {
    let sleep = time::sleep(duration);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return WaitOutcome::Elapsed,
            event = states.recv() => match event {
                Ok(ConnectionState::Connected) => return WaitOutcome::Connected,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Closed) => return WaitOutcome::StreamClosed,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
            },
        }
    }
}
