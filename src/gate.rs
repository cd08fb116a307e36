//! Admission gate for the tasks a server spawns.
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Notify;

/// Returned by [`Gate::enter`] once the gate is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct GateClosed;

#[derive(Debug, Default)]
struct State {
    count: usize,
    closed: bool,
}

/// Counts running tasks and lets shutdown wait for them.
///
/// Tasks enter the gate before they start and hold the returned [`GateGuard`] until
/// they finish. After [`Gate::close`] no task can enter, and `close` itself waits
/// until every admitted task has dropped its guard.
#[derive(Debug, Default)]
pub(crate) struct Gate {
    state: Mutex<State>,
    drained: Notify,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Admits one task, unless the gate is closed.
    pub fn enter(self: &Arc<Self>) -> Result<GateGuard, GateClosed> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return Err(GateClosed);
        }
        state.count += 1;

        Ok(GateGuard {
            gate: Arc::clone(self),
        })
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).closed
    }

    /// Number of admitted tasks still running.
    pub fn count(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).count
    }

    /// Refuses new tasks and waits for the admitted ones to finish.
    ///
    /// Closing an already closed gate waits again.
    pub async fn close(&self) {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).closed = true;

        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            // register before checking, so a guard dropped in between is not missed
            notified.as_mut().enable();

            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn leave(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.count -= 1;
        if state.count == 0 {
            self.drained.notify_waiters();
        }
    }
}

/// Keeps a task admitted in its [`Gate`] until dropped.
#[derive(Debug)]
pub(crate) struct GateGuard {
    gate: Arc<Gate>,
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        self.gate.leave();
    }
}
