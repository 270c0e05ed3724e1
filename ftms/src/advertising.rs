//! Keeps the gateway discoverable.
//!
//! ```text
//!   Stopped ──start──▶ Starting ──ok──▶ Advertising ──radio stopped──▶ Stopped
//!                         │
//!                         ├──transient err──▶ Retrying ──(retry delay)──▶ Starting
//!                         └──unsupported────▶ Failed (terminal for this run)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::AdvertiseError;
use crate::transport::GattTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvertisingState {
    Stopped,
    Starting,
    Advertising,
    Retrying,
    Failed,
}

pub struct AdvertisingSupervisor {
    transport: Arc<dyn GattTransport>,
    device_name: String,
    retry_delay: Duration,
    state: Mutex<AdvertisingState>,
    /// Bumped by every attempt; a retry timer only fires for the attempt
    /// that scheduled it.
    attempt: AtomicU64,
    cancel: CancellationToken,
}

impl AdvertisingSupervisor {
    pub fn new(
        transport: Arc<dyn GattTransport>,
        device_name: String,
        retry_delay: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            device_name,
            retry_delay,
            state: Mutex::new(AdvertisingState::Stopped),
            attempt: AtomicU64::new(0),
            cancel,
        }
    }

    pub fn state(&self) -> AdvertisingState {
        *self.state.lock()
    }

    /// Ask the transport to advertise unless it already is (or is about to).
    pub fn start(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        {
            let mut state = self.state.lock();
            match *state {
                AdvertisingState::Stopped | AdvertisingState::Retrying => {
                    *state = AdvertisingState::Starting;
                    self.attempt.fetch_add(1, Ordering::SeqCst);
                }
                AdvertisingState::Starting
                | AdvertisingState::Advertising
                | AdvertisingState::Failed => return,
            }
        }
        info!("Starting advertising as '{}'", self.device_name);
        self.transport.start_advertising(&self.device_name);
    }

    /// Handle the transport's answer to `start_advertising`.
    pub fn on_result(self: &Arc<Self>, result: Result<(), AdvertiseError>) {
        match result {
            Ok(()) => {
                if self.cancel.is_cancelled() {
                    // Came back after stop(); undo it.
                    self.transport.stop_advertising();
                    return;
                }
                *self.state.lock() = AdvertisingState::Advertising;
                info!("Advertising as '{}'", self.device_name);
            }
            Err(e) if e.is_fatal() => {
                *self.state.lock() = AdvertisingState::Failed;
                error!(
                    "{}; gateway is no longer discoverable, known clients can still connect",
                    e
                );
            }
            Err(e) => {
                *self.state.lock() = AdvertisingState::Retrying;
                warn!("{}, retrying in {:?}", e, self.retry_delay);
                self.schedule_retry();
            }
        }
    }

    fn schedule_retry(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let attempt = self.attempt.load(Ordering::SeqCst);
        tokio::spawn(async move {
            tokio::select! {
                _ = this.cancel.cancelled() => {}
                _ = tokio::time::sleep(this.retry_delay) => {
                    // Superseded by an earlier restart
                    if this.attempt.load(Ordering::SeqCst) == attempt {
                        this.start();
                    }
                }
            }
        });
    }

    /// The radio stopped advertising on its own (e.g. after a connection).
    pub fn on_stopped(&self) {
        let mut state = self.state.lock();
        if *state == AdvertisingState::Advertising {
            *state = AdvertisingState::Stopped;
            info!("Advertising stopped by transport");
        }
    }

    /// Called after the last client left.
    pub fn restart_if_idle(&self) {
        if matches!(self.state(), AdvertisingState::Stopped | AdvertisingState::Retrying) {
            info!("No clients left, restarting advertising");
            self.start();
        }
    }

    /// Stop for good: cancels any pending retry.
    pub fn stop(&self) {
        self.cancel.cancel();
        let prev = std::mem::replace(&mut *self.state.lock(), AdvertisingState::Stopped);
        if matches!(prev, AdvertisingState::Advertising | AdvertisingState::Starting) {
            self.transport.stop_advertising();
        }
    }
}
