//! Per-connection timeout and data-rate bookkeeping.
//!
//! A [`TimeoutControl`] holds three independent trackers:
//!
//! - a single phase deadline (keep-alive, request headers, body drain);
//!   arming a new one replaces the old one,
//! - request body read-rate timing, which only accumulates time while a body
//!   read is actually pending,
//! - response write-rate timing, a deadline that exists only while a write is
//!   in flight.
//!
//! Nothing here sleeps. The server heartbeat calls [`TimeoutControl::tick`]
//! periodically; the I/O paths only flip atomics, and a violation is reported
//! through the connection's [`AbortSignal`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use tracing::debug;

use crate::clock::{Clock, to_nanos};
use crate::config::MinDataRate;
use crate::http::abort::{AbortReason, AbortSignal};
use crate::http::connection::ConnectionId;

const DISARMED: u64 = u64::MAX;
const NANOS_PER_SEC: u128 = 1_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutReason {
    KeepAlive,
    RequestHeaders,
    ReadDataRate,
    WriteDataRate,
    RequestBodyDrain,
}

impl TimeoutReason {
    fn to_u8(self) -> u8 {
        match self {
            TimeoutReason::KeepAlive => 0,
            TimeoutReason::RequestHeaders => 1,
            TimeoutReason::ReadDataRate => 2,
            TimeoutReason::WriteDataRate => 3,
            TimeoutReason::RequestBodyDrain => 4,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => TimeoutReason::KeepAlive,
            1 => TimeoutReason::RequestHeaders,
            2 => TimeoutReason::ReadDataRate,
            3 => TimeoutReason::WriteDataRate,
            _ => TimeoutReason::RequestBodyDrain,
        }
    }
}

impl std::fmt::Display for TimeoutReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TimeoutReason::KeepAlive => "keep-alive",
            TimeoutReason::RequestHeaders => "request headers",
            TimeoutReason::ReadDataRate => "request body data rate",
            TimeoutReason::WriteDataRate => "response data rate",
            TimeoutReason::RequestBodyDrain => "request body drain",
        })
    }
}

pub struct TimeoutControl {
    id: ConnectionId,
    clock: Arc<dyn Clock>,
    signal: AbortSignal,
    disabled: AtomicBool,
    last_tick: AtomicU64,

    deadline: AtomicU64,
    reason: AtomicU8,

    read_timing: AtomicBool,
    read_pending: AtomicBool,
    read_elapsed: AtomicU64,
    read_bytes: AtomicU64,
    read_rate: AtomicU64,
    read_grace: AtomicU64,

    write_rate: Option<MinDataRate>,
    writes_pending: AtomicU32,
    write_deadline: AtomicU64,
}

impl TimeoutControl {
    pub fn new(
        id: ConnectionId,
        clock: Arc<dyn Clock>,
        signal: AbortSignal,
        min_response_data_rate: Option<MinDataRate>,
    ) -> Self {
        let now = to_nanos(clock.now());
        Self {
            id,
            clock,
            signal,
            disabled: AtomicBool::new(false),
            last_tick: AtomicU64::new(now),
            deadline: AtomicU64::new(DISARMED),
            reason: AtomicU8::new(0),
            read_timing: AtomicBool::new(false),
            read_pending: AtomicBool::new(false),
            read_elapsed: AtomicU64::new(0),
            read_bytes: AtomicU64::new(0),
            read_rate: AtomicU64::new(0),
            read_grace: AtomicU64::new(0),
            write_rate: min_response_data_rate,
            writes_pending: AtomicU32::new(0),
            write_deadline: AtomicU64::new(DISARMED),
        }
    }

    fn now(&self) -> u64 {
        to_nanos(self.clock.now())
    }

    /// Arms the phase deadline `timeout` from now, replacing any armed one.
    pub fn set_timeout(&self, timeout: Duration, reason: TimeoutReason) {
        if self.disabled.load(Ordering::SeqCst) {
            return;
        }
        self.reason.store(reason.to_u8(), Ordering::SeqCst);
        self.deadline.store(
            self.now().saturating_add(to_nanos(timeout)),
            Ordering::SeqCst,
        );
    }

    pub fn cancel_timeout(&self) {
        self.deadline.store(DISARMED, Ordering::SeqCst);
    }

    /// The currently armed phase deadline, if any.
    pub fn armed(&self) -> Option<TimeoutReason> {
        if self.deadline.load(Ordering::SeqCst) == DISARMED {
            return None;
        }
        Some(TimeoutReason::from_u8(self.reason.load(Ordering::SeqCst)))
    }

    /// Starts a fresh read-rate window for a request body. Time only counts
    /// while a read is pending.
    pub fn start_read_timing(&self, rate: Option<MinDataRate>) {
        self.read_elapsed.store(0, Ordering::SeqCst);
        self.read_bytes.store(0, Ordering::SeqCst);
        self.read_pending.store(false, Ordering::SeqCst);
        self.set_read_rate(rate);
        self.read_timing.store(true, Ordering::SeqCst);
    }

    /// Changes the enforced rate for the current body. `None` disables it.
    pub fn set_read_rate(&self, rate: Option<MinDataRate>) {
        let (bps, grace) = match rate {
            Some(r) => (r.bytes_per_second, to_nanos(r.grace_period)),
            None => (0, 0),
        };
        self.read_grace.store(grace, Ordering::SeqCst);
        self.read_rate.store(bps, Ordering::SeqCst);
    }

    pub fn stop_read_timing(&self) {
        self.read_timing.store(false, Ordering::SeqCst);
        self.read_pending.store(false, Ordering::SeqCst);
    }

    pub fn resume_read_timing(&self) {
        self.read_pending.store(true, Ordering::SeqCst);
    }

    pub fn pause_read_timing(&self) {
        self.read_pending.store(false, Ordering::SeqCst);
    }

    pub fn bytes_read(&self, n: usize) {
        self.read_bytes.fetch_add(n as u64, Ordering::SeqCst);
    }

    /// Marks the start of a response write of `len` bytes. The write must
    /// finish within the grace period or `len / rate` seconds, whichever is
    /// longer.
    pub fn start_write(&self, len: usize) {
        let Some(rate) = self.write_rate else {
            return;
        };
        if self.disabled.load(Ordering::SeqCst) {
            return;
        }

        let needed = (len as u128 * NANOS_PER_SEC) / rate.bytes_per_second as u128;
        let allowed = u64::try_from(needed)
            .unwrap_or(u64::MAX)
            .max(to_nanos(rate.grace_period));

        let base = if self.writes_pending.load(Ordering::SeqCst) == 0 {
            self.now()
        } else {
            self.write_deadline.load(Ordering::SeqCst)
        };
        self.write_deadline
            .store(base.saturating_add(allowed), Ordering::SeqCst);
        self.writes_pending.fetch_add(1, Ordering::SeqCst);
    }

    pub fn end_write(&self) {
        if self.write_rate.is_none() {
            return;
        }
        let _ = self
            .writes_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// Permanently switches every timer off. Used once a connection has
    /// been upgraded and is no longer HTTP.
    pub fn disable(&self) {
        self.disabled.store(true, Ordering::SeqCst);
        self.cancel_timeout();
        self.stop_read_timing();
        self.writes_pending.store(0, Ordering::SeqCst);
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    pub fn abort(&self, reason: AbortReason) -> bool {
        self.signal.abort(reason)
    }

    /// Checks every tracker against `now`. Called from the heartbeat.
    pub fn tick(&self, now: Duration) {
        let now = to_nanos(now);
        let last = self.last_tick.swap(now, Ordering::SeqCst);
        if self.disabled.load(Ordering::SeqCst) || self.signal.is_aborted() {
            return;
        }

        let deadline = self.deadline.load(Ordering::SeqCst);
        if deadline != DISARMED && now > deadline {
            self.cancel_timeout();
            let reason = TimeoutReason::from_u8(self.reason.load(Ordering::SeqCst));
            self.fire(reason);
            return;
        }

        if self.read_timing.load(Ordering::SeqCst) && self.read_pending.load(Ordering::SeqCst) {
            let elapsed = self
                .read_elapsed
                .fetch_add(now.saturating_sub(last), Ordering::SeqCst)
                + now.saturating_sub(last);
            let rate = self.read_rate.load(Ordering::SeqCst);
            if rate > 0 && elapsed > self.read_grace.load(Ordering::SeqCst) {
                let bytes = self.read_bytes.load(Ordering::SeqCst) as u128;
                if bytes * NANOS_PER_SEC < rate as u128 * elapsed as u128 {
                    debug!(
                        connection_id = %self.id,
                        bytes_read = bytes as u64,
                        elapsed_ms = elapsed / 1_000_000,
                        min_bytes_per_second = rate,
                        "request body minimum data rate not satisfied"
                    );
                    self.fire(TimeoutReason::ReadDataRate);
                    return;
                }
            }
        }

        if self.writes_pending.load(Ordering::SeqCst) > 0
            && now > self.write_deadline.load(Ordering::SeqCst)
        {
            debug!(
                connection_id = %self.id,
                "response minimum data rate not satisfied"
            );
            self.fire(TimeoutReason::WriteDataRate);
        }
    }

    fn fire(&self, reason: TimeoutReason) {
        if self.signal.abort(AbortReason::Timeout(reason)) {
            debug!(connection_id = %self.id, %reason, "connection timed out");
        }
    }
}

impl std::fmt::Debug for TimeoutControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutControl")
            .field("id", &self.id)
            .field("armed", &self.armed())
            .field("disabled", &self.is_disabled())
            .finish()
    }
}
