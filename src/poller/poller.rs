use super::context::PollerContext;
use super::cycle::Reconciler;
use super::error::PollerError;
use super::models::CycleSummary;
use crate::config::PollerSettings;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

enum RunState {
    Idle,
    Running {
        cancel: CancellationToken,
        handle: JoinHandle<()>,
    },
}

/// Periodically reconciles tracked subjects against their upstream.
pub struct Poller {
    reconciler: Arc<Reconciler>,
    state: Mutex<RunState>,
}

impl Poller {
    pub fn new(context: PollerContext, settings: PollerSettings) -> Self {
        Self {
            reconciler: Arc::new(Reconciler::new(context, settings)),
            state: Mutex::new(RunState::Idle),
        }
    }

    /// Begin running a cycle every `interval`, the first one immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, interval: Duration) -> Result<(), PollerError> {
        if interval.is_zero() {
            return Err(PollerError::InvalidInterval);
        }

        let mut state = self.state.lock().unwrap();
        if let RunState::Running { handle, .. } = &*state {
            if !handle.is_finished() {
                return Err(PollerError::AlreadyRunning);
            }
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_loop(
            self.reconciler.clone(),
            interval,
            cancel.clone(),
        ));
        *state = RunState::Running { cancel, handle };
        info!("Poller started with interval {:?}", interval);
        Ok(())
    }

    /// Cancel the periodic cycle and wait for the loop to exit.
    ///
    /// An in-flight cycle finishes the subjects it already started. Calling
    /// this on a poller that is not running does nothing.
    pub async fn stop(&self) {
        let previous = std::mem::replace(&mut *self.state.lock().unwrap(), RunState::Idle);
        let RunState::Running { cancel, handle } = previous else {
            return;
        };

        info!("Stopping poller...");
        cancel.cancel();
        if let Err(e) = handle.await {
            error!("Poller task ended abnormally: {}", e);
        }
        info!("Poller stopped");
    }

    /// Run exactly one cycle, independent of the periodic loop.
    pub async fn run_once(&self) -> Result<CycleSummary, PollerError> {
        self.reconciler.run_cycle(&CancellationToken::new()).await
    }

    pub fn is_running(&self) -> bool {
        match &*self.state.lock().unwrap() {
            RunState::Running { handle, .. } => !handle.is_finished(),
            RunState::Idle => false,
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        if let Ok(state) = self.state.get_mut() {
            if let RunState::Running { cancel, .. } = state {
                cancel.cancel();
            }
        }
    }
}

async fn run_loop(reconciler: Arc<Reconciler>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break;
            }
            _ = ticker.tick() => {
                if let Err(e) = reconciler.run_cycle(&cancel).await {
                    error!("Reconciliation cycle aborted: {}", e);
                }
            }
        }
    }
    info!("Poller loop exited");
}
