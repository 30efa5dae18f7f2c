//! Command dispatcher.
//!
//! One dispatcher runs per daemon. It is spawned as a single task that owns
//! all daemon state; other tasks observe it only through events and stats.
//!
//! # Architecture
//!
//! ```text
//!  clients ──▶ CommandChannel ──▶ Dispatcher ──▶ DaemonState
//!                   ▲                 │            ├─ ImageRegistry
//!                   └──── response ───┘            ├─ LivenessTracker
//!                                                  └─ GpuBackend
//!                                     │
//!                   broadcast<ImageEvent>, watch<RegistryStats>
//!                                     ▼
//!                              DispatcherHandle
//! ```

mod actor;
mod state;

pub use actor::{DispatchTiming, Dispatcher};
pub use state::{DaemonState, Limits, RegistryStats};

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use texshare_core::ProcessProbe;

use crate::channel::CommandChannel;
use crate::config::DaemonConfig;
use crate::gpu::GpuBackend;
use crate::registry::ImageEvent;

/// Capacity of the event broadcast channel.
const EVENT_CAPACITY: usize = 256;

/// Handle to a running dispatcher task.
pub struct DispatcherHandle<B: GpuBackend, P> {
    task: JoinHandle<DaemonState<B, P>>,
    events: broadcast::Sender<ImageEvent>,
    stats: watch::Receiver<RegistryStats>,
    cancel_token: CancellationToken,
}

impl<B, P> DispatcherHandle<B, P>
where
    B: GpuBackend + 'static,
    P: ProcessProbe + 'static,
{
    /// Subscribes to image events.
    pub fn subscribe(&self) -> broadcast::Receiver<ImageEvent> {
        self.events.subscribe()
    }

    /// Watches the registry counters.
    pub fn stats(&self) -> watch::Receiver<RegistryStats> {
        self.stats.clone()
    }

    /// Stops the dispatcher and waits for it to release every image.
    pub async fn shutdown(self) -> Option<DaemonState<B, P>> {
        self.cancel_token.cancel();
        self.join().await
    }

    /// Waits for the dispatcher to stop on its own cancellation token.
    pub async fn join(self) -> Option<DaemonState<B, P>> {
        match self.task.await {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::error!(error = %e, "Dispatcher task failed");
                None
            }
        }
    }
}

/// Builds a dispatcher from `config` and spawns it on the current runtime.
pub fn spawn_dispatcher<C, B, P>(
    channel: C,
    backend: B,
    probe: P,
    config: &DaemonConfig,
    cancel_token: CancellationToken,
) -> DispatcherHandle<B, P>
where
    C: CommandChannel + 'static,
    B: GpuBackend + 'static,
    P: ProcessProbe + 'static,
{
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    let (stats_tx, stats) = watch::channel(RegistryStats::default());

    let limits = Limits {
        max_processes: config.max_processes,
        max_images: config.max_images,
    };
    let timing = DispatchTiming {
        wait_interval: config.wait_interval(),
        sweep_interval: config.sweep_interval(),
    };

    let state = DaemonState::new(backend, probe, limits, events.clone(), stats_tx);
    let dispatcher = Dispatcher::new(channel, state, timing, cancel_token.clone());
    let task = tokio::spawn(dispatcher.run());

    DispatcherHandle {
        task,
        events,
        stats,
        cancel_token,
    }
}
