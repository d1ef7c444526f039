//! Periodic timeout checks for every live connection.
//!
//! Connections register their [`TimeoutControl`] on accept and unregister
//! when they close. A tick reads the clock once and checks every registered
//! control; the I/O paths never wait on it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::clock::Clock;
use crate::http::abort::AbortReason;
use crate::http::connection::ConnectionId;
use crate::http::timeout::TimeoutControl;

pub struct Heartbeat {
    clock: Arc<dyn Clock>,
    connections: Mutex<HashMap<ConnectionId, Weak<TimeoutControl>>>,
}

impl Heartbeat {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            connections: Mutex::new(HashMap::new()),
        }
    }

    fn connections(&self) -> MutexGuard<'_, HashMap<ConnectionId, Weak<TimeoutControl>>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub(crate) fn register(
        self: &Arc<Self>,
        id: ConnectionId,
        control: &Arc<TimeoutControl>,
    ) -> Registration {
        self.connections().insert(id, Arc::downgrade(control));
        Registration {
            heartbeat: Arc::downgrade(self),
            id,
        }
    }

    /// Number of connections currently registered.
    pub fn connection_count(&self) -> usize {
        self.connections().len()
    }

    fn live(&self) -> Vec<Arc<TimeoutControl>> {
        let mut connections = self.connections();
        connections.retain(|_, control| control.strong_count() > 0);
        connections.values().filter_map(Weak::upgrade).collect()
    }

    /// Runs one round of timeout checks.
    pub fn tick(&self) {
        let now = self.clock.now();
        for control in self.live() {
            control.tick(now);
        }
    }

    /// Aborts every registered connection with `reason`.
    pub fn abort_all(&self, reason: AbortReason) {
        let live = self.live();
        debug!(connections = live.len(), %reason, "aborting all connections");
        for control in live {
            control.abort(reason);
        }
    }

    /// Ticks every `interval` on a background task until the returned handle
    /// is aborted.
    pub fn spawn(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let heartbeat = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                heartbeat.tick();
            }
        })
    }
}

impl std::fmt::Debug for Heartbeat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heartbeat")
            .field("connections", &self.connection_count())
            .finish()
    }
}

/// Keeps a connection registered until dropped.
#[derive(Debug)]
pub(crate) struct Registration {
    heartbeat: Weak<Heartbeat>,
    id: ConnectionId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(heartbeat) = self.heartbeat.upgrade() {
            heartbeat.connections().remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::http::abort::AbortSignal;
    use crate::http::timeout::TimeoutReason;

    #[test]
    fn ticks_registered_connections_until_dropped() {
        let clock = Arc::new(ManualClock::new());
        let heartbeat = Arc::new(Heartbeat::new(clock.clone()));

        let signal = AbortSignal::new();
        let id = ConnectionId::new();
        let control = Arc::new(TimeoutControl::new(id, clock.clone(), signal.clone(), None));
        let registration = heartbeat.register(id, &control);
        assert_eq!(heartbeat.connection_count(), 1);

        control.set_timeout(Duration::from_secs(5), TimeoutReason::KeepAlive);
        clock.advance(Duration::from_secs(6));
        heartbeat.tick();
        assert_eq!(
            signal.reason(),
            Some(AbortReason::Timeout(TimeoutReason::KeepAlive))
        );

        drop(registration);
        assert_eq!(heartbeat.connection_count(), 0);
    }

    #[test]
    fn abort_all_reaches_every_connection() {
        let clock = Arc::new(ManualClock::new());
        let heartbeat = Arc::new(Heartbeat::new(clock.clone()));
        let mut keep = Vec::new();
        let mut signals = Vec::new();
        for _ in 0..3 {
            let signal = AbortSignal::new();
            let id = ConnectionId::new();
            let control = Arc::new(TimeoutControl::new(id, clock.clone(), signal.clone(), None));
            keep.push((heartbeat.register(id, &control), control));
            signals.push(signal);
        }

        heartbeat.abort_all(AbortReason::Shutdown);
        assert!(signals.iter().all(|s| s.reason() == Some(AbortReason::Shutdown)));
    }
}
