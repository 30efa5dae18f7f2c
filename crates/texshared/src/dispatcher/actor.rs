//! Dispatcher loop - the single consumer of the command channel.
//!
//! The loop takes one command at a time, executes it against the
//! [`DaemonState`] and writes the response before looking at the channel
//! again. When the bounded wait expires it sweeps dead processes and checks
//! the channel's advisory lock for an owner that died holding it.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Channel failures are logged and the loop keeps running

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use texshare_core::{ProcessId, ProcessProbe};

use super::state::DaemonState;
use crate::channel::{CommandChannel, Incoming};
use crate::gpu::GpuBackend;

/// Timing of the dispatcher loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchTiming {
    /// Bounded wait for the next command
    pub wait_interval: Duration,
    /// Maximum age of the last sweep before one is forced after a command
    pub sweep_interval: Duration,
}

impl Default for DispatchTiming {
    fn default() -> Self {
        Self {
            wait_interval: Duration::from_millis(100),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

/// Owns the channel and the daemon state and runs the command loop.
pub struct Dispatcher<C, B: GpuBackend, P> {
    channel: C,
    state: DaemonState<B, P>,
    timing: DispatchTiming,
    cancel_token: CancellationToken,
    last_sweep: Instant,
    /// Lock owner seen at the previous empty wait
    lock_suspect: Option<ProcessId>,
}

impl<C, B, P> Dispatcher<C, B, P>
where
    C: CommandChannel,
    B: GpuBackend,
    P: ProcessProbe,
{
    pub fn new(
        channel: C,
        state: DaemonState<B, P>,
        timing: DispatchTiming,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            channel,
            state,
            timing,
            cancel_token,
            last_sweep: Instant::now(),
            lock_suspect: None,
        }
    }

    /// Runs until the cancellation token fires, then releases every image.
    ///
    /// Returns the final state so callers can inspect it.
    pub async fn run(mut self) -> DaemonState<B, P> {
        info!(
            wait_ms = self.timing.wait_interval.as_millis() as u64,
            sweep_ms = self.timing.sweep_interval.as_millis() as u64,
            "Dispatcher starting"
        );

        // A client may have died holding the lock while no daemon was running.
        self.cleanup_locks(true);

        loop {
            tokio::select! {
                biased;

                _ = self.cancel_token.cancelled() => {
                    info!("Dispatcher shutdown requested");
                    break;
                }

                result = self.channel.try_dequeue(self.timing.wait_interval) => {
                    match result {
                        Ok(Some(incoming)) => {
                            self.lock_suspect = None;
                            self.dispatch(incoming).await;
                            if self.last_sweep.elapsed() >= self.timing.sweep_interval {
                                self.sweep();
                            }
                        }
                        Ok(None) => {
                            self.sweep();
                            self.cleanup_locks(false);
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to read command channel");
                            self.sweep();
                        }
                    }
                }
            }
        }

        let released = self.state.shutdown();
        info!(released, "Dispatcher stopped");
        self.state
    }

    async fn dispatch(&mut self, incoming: Incoming) {
        let seq = incoming.seq;
        let response = self.state.handle_request(&incoming);
        debug!(seq, status = %response.status, "Writing response");

        if let Err(e) = self.channel.write_response(seq, &response).await {
            error!(seq, error = %e, "Failed to write response");
        }
    }

    fn sweep(&mut self) {
        let destroyed = self.state.sweep();
        if destroyed > 0 {
            debug!(destroyed, "Sweep reclaimed images");
        }
        self.last_sweep = Instant::now();
    }

    /// Clears the channel lock when its owner is dead.
    ///
    /// Outside of startup, an owner is only considered stale once it held the
    /// lock across two consecutive empty waits.
    fn cleanup_locks(&mut self, startup: bool) {
        let Some(owner) = self.channel.lock_owner() else {
            self.lock_suspect = None;
            return;
        };

        let held_across_waits = self.lock_suspect == Some(owner);
        self.lock_suspect = Some(owner);
        if !(startup || held_across_waits) {
            return;
        }

        if self.state.is_process_gone(owner) && self.channel.clear_stale_lock(owner) {
            warn!(owner = %owner, "StaleHandleLock: cleared channel lock held by dead process");
            self.lock_suspect = None;
        }
    }
}
