//! Environment signals and the lifecycle monitor.
//!
//! The host reports visibility and connectivity changes through an
//! [`Environment`]. While a job is tracked, the session's
//! [`LifecycleMonitor`] listens and turns "became visible" and "back online"
//! into a fresh push subscription with a full retry budget, regardless of the
//! current connection mode. This is how a session demoted to polling gets
//! back to push.
//!
//! | Signal | Action |
//! |--------|--------|
//! | `Visible` | Resubscribe unless the channel is confirmed subscribed |
//! | `Online` | Resubscribe |
//! | `Hidden`, `Offline` | Logged only |

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::warn;

/// A level-triggered environment transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvironmentSignal {
    Visible,
    Hidden,
    Online,
    Offline,
}

/// Fan-out point for environment signals, owned by the host.
#[derive(Debug, Clone)]
pub struct Environment {
    tx: broadcast::Sender<EnvironmentSignal>,
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self { tx }
    }

    /// Publish a signal. Returns how many listeners received it.
    pub fn notify(&self, signal: EnvironmentSignal) -> usize {
        self.tx.send(signal).unwrap_or(0)
    }

    pub fn became_visible(&self) -> usize {
        self.notify(EnvironmentSignal::Visible)
    }

    pub fn became_hidden(&self) -> usize {
        self.notify(EnvironmentSignal::Hidden)
    }

    pub fn went_online(&self) -> usize {
        self.notify(EnvironmentSignal::Online)
    }

    pub fn went_offline(&self) -> usize {
        self.notify(EnvironmentSignal::Offline)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EnvironmentSignal> {
        self.tx.subscribe()
    }
}

/// What a signal asks the session to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    Resubscribe,
    Ignore,
}

/// Listener registration for one tracked job.
#[derive(Default)]
pub struct LifecycleMonitor {
    listener: Option<JoinHandle<()>>,
}

impl LifecycleMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_attached(&self) -> bool {
        self.listener.is_some()
    }

    /// Register for signals, replacing any earlier registration.
    ///
    /// `forward` returns `false` once the session is gone.
    pub fn attach<F>(&mut self, environment: &Environment, forward: F)
    where
        F: Fn(EnvironmentSignal) -> bool + Send + 'static,
    {
        self.detach();
        let mut rx = environment.subscribe();
        self.listener = Some(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(signal) => {
                        if !forward(signal) {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Signals are level-triggered; treat a gap as "check again".
                        warn!(skipped, "environment listener lagged");
                        if !forward(EnvironmentSignal::Visible) {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        }));
    }

    pub fn detach(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }

    /// Decide what a signal means for the current session.
    pub fn decide(
        signal: EnvironmentSignal,
        tracking: bool,
        channel_subscribed: bool,
    ) -> LifecycleAction {
        if !tracking {
            return LifecycleAction::Ignore;
        }
        match signal {
            EnvironmentSignal::Visible if channel_subscribed => LifecycleAction::Ignore,
            EnvironmentSignal::Visible | EnvironmentSignal::Online => LifecycleAction::Resubscribe,
            EnvironmentSignal::Hidden | EnvironmentSignal::Offline => LifecycleAction::Ignore,
        }
    }
}

impl Drop for LifecycleMonitor {
    fn drop(&mut self) {
        self.detach();
    }
}
