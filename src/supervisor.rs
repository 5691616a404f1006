// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Reconnect Supervisor
//!
//! Runs at most one reconnect loop per bus. The loop waits the configured
//! delay, asks the bus to reconnect and replay its consumers, and keeps going
//! until that works or the bus is disconnected.

use crate::bus::BusInner;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex, MutexGuard, Weak,
    },
    time::Duration,
};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub(crate) struct ReconnectSupervisor {
    reconnecting: AtomicBool,
    attempts: AtomicU64,
    shutdown: Mutex<CancellationToken>,
    runtime: Mutex<Option<Handle>>,
}

impl Default for ReconnectSupervisor {
    fn default() -> Self {
        ReconnectSupervisor {
            reconnecting: AtomicBool::new(false),
            attempts: AtomicU64::new(0),
            shutdown: Mutex::new(CancellationToken::new()),
            runtime: Mutex::new(None),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ReconnectSupervisor {
    /// Remembers the runtime reconnect loops are spawned on. Broker error
    /// listeners may fire on threads outside of it.
    pub(crate) fn bind_runtime(&self, handle: Handle) {
        *lock(&self.runtime) = Some(handle);
    }

    /// Re-arms the supervisor after a disconnect.
    pub(crate) fn reset(&self) {
        let mut token = lock(&self.shutdown);
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
    }

    /// Stops the running loop, if any, and refuses new ones until `reset`.
    pub(crate) fn shutdown(&self) {
        lock(&self.shutdown).cancel();
    }

    /// Fires once `shutdown` is called.
    pub(crate) fn cancellation(&self) -> CancellationToken {
        lock(&self.shutdown).clone()
    }

    pub(crate) fn is_reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::SeqCst)
    }

    /// Reconnect attempts made since the bus was created.
    pub(crate) fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Starts the reconnect loop unless one is already running.
    pub(crate) fn schedule(&self, bus: Weak<BusInner>, delay: Duration) {
        let token = lock(&self.shutdown).clone();
        if token.is_cancelled() {
            debug!("bus is shutting down, not reconnecting");
            return;
        }

        let Some(handle) = lock(&self.runtime)
            .clone()
            .or_else(|| Handle::try_current().ok())
        else {
            warn!("no runtime to reconnect on");
            return;
        };

        if self.reconnecting.swap(true, Ordering::SeqCst) {
            debug!("reconnect already in progress");
            return;
        }

        handle.spawn(run(bus, delay, token));
    }
}

async fn run(bus: Weak<BusInner>, delay: Duration, token: CancellationToken) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        let Some(inner) = bus.upgrade() else {
            return;
        };
        let supervisor = inner.supervisor();
        let attempt = supervisor.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        info!(attempt, "reconnecting to broker");

        match inner.reconnect().await {
            Ok(()) if token.is_cancelled() => {
                debug!("disconnected while reconnecting, dropping the new session");
                inner.close_session().await;
                break;
            }
            Ok(()) => {
                info!(attempt, "reconnected to broker");
                supervisor.reconnecting.store(false, Ordering::SeqCst);
                if inner.is_connected() {
                    return;
                }
                // Lost again before the flag was cleared. Retake it unless a
                // new loop already did.
                if supervisor
                    .reconnecting
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    return;
                }
            }
            Err(err) => warn!(
                error = err.to_string(),
                attempt,
                retry_in_ms = delay.as_millis() as u64,
                "reconnect failed"
            ),
        }
    }

    if let Some(inner) = bus.upgrade() {
        inner.supervisor().reconnecting.store(false, Ordering::SeqCst);
    }
}
