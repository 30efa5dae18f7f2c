//! Daemon state and command execution.
//!
//! `DaemonState` owns the registry, the liveness set and the GPU backend.
//! Every mutation goes through `&mut self`, and the dispatcher holds the only
//! instance, so commands and sweeps can never interleave.

use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use texshare_core::{ImageDescriptor, ImageFormat, ImageId, ImageName, ProcessId, ProcessProbe};
use texshare_protocol::{
    Command, ImageHandlesReply, ProtocolError, ProtocolVersion, Request, Response, ResponsePayload,
    Status,
};

use crate::channel::Incoming;
use crate::gpu::GpuBackend;
use crate::liveness::LivenessTracker;
use crate::registry::{DestroyReason, ImageEvent, ImageRegistry, RegistryError};

/// Snapshot of the daemon's counters, published after every change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub images: usize,
    pub processes: usize,
    pub commands_handled: u64,
    pub commands_failed: u64,
    pub images_destroyed: u64,
}

/// Capacity limits of a [`DaemonState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_processes: usize,
    pub max_images: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_processes: crate::liveness::MAX_PROCESSES,
            max_images: crate::registry::MAX_IMAGES,
        }
    }
}

/// Registry, liveness set and backend of one daemon.
pub struct DaemonState<B: GpuBackend, P> {
    backend: B,
    registry: ImageRegistry<B::Allocation>,
    liveness: LivenessTracker<P>,
    events: broadcast::Sender<ImageEvent>,
    stats: watch::Sender<RegistryStats>,
    counters: RegistryStats,
}

impl<B: GpuBackend, P: ProcessProbe> DaemonState<B, P> {
    pub fn new(
        backend: B,
        probe: P,
        limits: Limits,
        events: broadcast::Sender<ImageEvent>,
        stats: watch::Sender<RegistryStats>,
    ) -> Self {
        Self {
            backend,
            registry: ImageRegistry::new(limits.max_images),
            liveness: LivenessTracker::new(probe, limits.max_processes),
            events,
            stats,
            counters: RegistryStats::default(),
        }
    }

    pub fn registry(&self) -> &ImageRegistry<B::Allocation> {
        &self.registry
    }

    pub fn liveness(&self) -> &LivenessTracker<P> {
        &self.liveness
    }

    pub fn stats(&self) -> RegistryStats {
        self.counters
    }

    // ========================================================================
    // Request Handling
    // ========================================================================

    /// Decodes and executes one raw command, producing the response to send.
    ///
    /// Never fails: every problem is reported through the response status.
    pub fn handle_request(&mut self, incoming: &Incoming) -> Response {
        let seq = incoming.seq;

        let request = match Request::decode(&incoming.bytes) {
            Ok(request) => request,
            Err(ProtocolError::Malformed { seq: claimed, reason }) => {
                warn!(seq, ?claimed, reason = %reason, "Malformed request");
                return self.finish(Response::failure(seq, Status::MalformedRequest));
            }
            Err(e) => {
                warn!(seq, error = %e, "Undecodable request");
                return self.finish(Response::failure(seq, Status::MalformedRequest));
            }
        };

        if request.seq != seq {
            debug!(seq, framed = request.seq, "Request body seq differs from slot seq");
        }

        if !request.protocol_version.is_compatible_with(&ProtocolVersion::CURRENT) {
            warn!(
                seq,
                client = %request.protocol_version,
                daemon = %ProtocolVersion::CURRENT,
                "Protocol version mismatch"
            );
            return self.finish(Response::failure(seq, Status::VersionMismatch));
        }

        let kind = request.command.kind();
        let pid = request.command.pid();
        let response = match self.handle_command(request.command) {
            Ok(payload) => Response::ok(seq, payload),
            Err(e) => {
                debug!(seq, kind, pid = %pid, error = %e, status = %e.status(), "Command failed");
                Response::failure(seq, e.status())
            }
        };
        self.finish(response)
    }

    /// Executes a decoded command.
    pub fn handle_command(&mut self, command: Command) -> Result<ResponsePayload, RegistryError> {
        debug!(kind = command.kind(), pid = %command.pid(), "Handling command");
        match command {
            Command::RegisterProc { pid } => {
                self.ensure_registered(pid)?;
                Ok(ResponsePayload::Registered { pid })
            }
            Command::ImageInit {
                name,
                pid,
                width,
                height,
                format,
            } => self.handle_image_init(name, pid, width, height, format),
            Command::Rename {
                old_name,
                new_name,
                pid,
            } => self.handle_rename(old_name, new_name, pid),
            Command::RequestImageHandles {
                name,
                pid,
                force_update,
            } => self.handle_request_handles(name, pid, force_update),
        }
    }

    fn handle_image_init(
        &mut self,
        name: ImageName,
        pid: ProcessId,
        width: u32,
        height: u32,
        format: ImageFormat,
    ) -> Result<ResponsePayload, RegistryError> {
        let descriptor = ImageDescriptor::new(width, height, format)
            .map_err(|e| RegistryError::Invalid(e.to_string()))?;

        // A stale registration under this pid may hold the only reference to
        // `name`; drop it before resolving the name.
        self.reap_if_reused(pid);

        if let Some(id) = self.registry.lookup(&name) {
            let existing = self
                .registry
                .get(id)
                .map(|image| image.descriptor())
                .ok_or_else(|| RegistryError::ImageNotFound(name.clone()))?;
            if existing != descriptor {
                return Err(RegistryError::DefinitionMismatch {
                    name,
                    existing,
                    requested: descriptor,
                });
            }
            self.ensure_registered(pid)?;
            self.join(id, &name, pid);
            return Ok(ResponsePayload::ImageCreated { id, joined: true });
        }

        // Claim the name before touching the backend so a full registry
        // never allocates.
        self.registry.vacant(&name)?;
        self.ensure_registered(pid)?;

        let (allocation, handles) = self
            .backend
            .allocate_shared_image(&descriptor)
            .map_err(|e| RegistryError::Allocation(e.to_string()))?;
        let id = match self.registry.vacant(&name) {
            Ok(vacant) => vacant.insert(descriptor, pid, allocation, handles),
            Err(e) => {
                self.backend.release_shared_image(allocation);
                return Err(e);
            }
        };
        self.liveness.note_image(pid, id);

        info!(id = %id, image = %name, pid = %pid, %descriptor, "Image created");
        self.emit(ImageEvent::Created { id, name, pid });
        Ok(ResponsePayload::ImageCreated { id, joined: false })
    }

    fn handle_rename(
        &mut self,
        old_name: ImageName,
        new_name: ImageName,
        pid: ProcessId,
    ) -> Result<ResponsePayload, RegistryError> {
        let id = self.registry.rename(&old_name, &new_name, pid)?;
        if old_name != new_name {
            info!(id = %id, from = %old_name, to = %new_name, pid = %pid, "Image renamed");
            self.emit(ImageEvent::Renamed {
                id,
                old_name,
                new_name,
            });
        }
        Ok(ResponsePayload::Renamed { id })
    }

    fn handle_request_handles(
        &mut self,
        name: ImageName,
        pid: ProcessId,
        force_update: bool,
    ) -> Result<ResponsePayload, RegistryError> {
        self.reap_if_reused(pid);
        let id = self
            .registry
            .lookup(&name)
            .ok_or_else(|| RegistryError::ImageNotFound(name.clone()))?;
        self.ensure_registered(pid)?;
        self.join(id, &name, pid);

        let image = self
            .registry
            .get(id)
            .ok_or_else(|| RegistryError::ImageNotFound(name.clone()))?;
        debug!(id = %id, image = %name, pid = %pid, force_update, "Handing out image handles");

        Ok(ResponsePayload::Handles(ImageHandlesReply {
            id,
            name,
            descriptor: image.descriptor(),
            handles: image.handles(),
        }))
    }

    /// Registers `pid`, replacing a registration left behind by a dead
    /// process that used the same pid.
    fn ensure_registered(&mut self, pid: ProcessId) -> Result<(), RegistryError> {
        self.reap_if_reused(pid);
        if self.liveness.register(pid)? {
            self.emit(ImageEvent::ProcessRegistered { pid });
        }
        Ok(())
    }

    /// Reaps the registration of a dead process whose pid is now in use
    /// again.
    fn reap_if_reused(&mut self, pid: ProcessId) {
        if self.liveness.contains(pid) && !self.liveness.is_alive(pid) {
            self.reap_process(pid);
        }
    }

    fn join(&mut self, id: ImageId, name: &ImageName, pid: ProcessId) {
        if self.registry.attach(id, pid) {
            self.liveness.note_image(pid, id);
            debug!(id = %id, image = %name, pid = %pid, "Process joined image");
            self.emit(ImageEvent::Joined {
                id,
                name: name.clone(),
                pid,
            });
        }
    }

    // ========================================================================
    // Reclamation
    // ========================================================================

    /// Removes every dead process and destroys images nobody holds anymore.
    ///
    /// Returns the number of images destroyed.
    pub fn sweep(&mut self) -> usize {
        let dead = self.liveness.collect_dead();
        if dead.is_empty() {
            return 0;
        }

        let destroyed: usize = dead.into_iter().map(|pid| self.reap_process(pid)).sum();
        self.publish_stats();
        destroyed
    }

    /// Whether `pid` no longer refers to a running process.
    ///
    /// Registered processes are checked against their recorded identity,
    /// others only for existence.
    pub fn is_process_gone(&self, pid: ProcessId) -> bool {
        if self.liveness.contains(pid) {
            !self.liveness.is_alive(pid)
        } else {
            self.liveness.probe().start_time(pid).is_none()
        }
    }

    fn reap_process(&mut self, pid: ProcessId) -> usize {
        let held = self
            .liveness
            .remove(pid)
            .map(|images| images.len())
            .unwrap_or(0);
        warn!(pid = %pid, held, "Client process died");

        let orphaned = self.registry.detach_process(pid);
        let destroyed = orphaned.len();
        for id in orphaned {
            self.destroy(id, DestroyReason::ProcessDied);
        }
        self.emit(ImageEvent::ProcessRemoved { pid });
        destroyed
    }

    fn destroy(&mut self, id: ImageId, reason: DestroyReason) {
        let Some(image) = self.registry.remove(id) else {
            return;
        };
        self.liveness.forget_image(id);
        let name = image.name().clone();
        warn!(id = %id, image = %name, reason = %reason, "Image destroyed");

        self.backend.release_shared_image(image.into_allocation());
        self.counters.images_destroyed += 1;
        self.emit(ImageEvent::Destroyed { id, name, reason });
    }

    /// Releases every remaining image. Returns how many were released.
    pub fn shutdown(&mut self) -> usize {
        let images = self.registry.drain();
        let count = images.len();
        for image in images {
            let id = image.id();
            let name = image.name().clone();
            self.liveness.forget_image(id);
            self.backend.release_shared_image(image.into_allocation());
            self.counters.images_destroyed += 1;
            self.emit(ImageEvent::Destroyed {
                id,
                name,
                reason: DestroyReason::Shutdown,
            });
        }
        info!(released = count, "Released all images");
        self.publish_stats();
        count
    }

    // ========================================================================
    // Publishing
    // ========================================================================

    fn finish(&mut self, response: Response) -> Response {
        self.counters.commands_handled += 1;
        if !response.status.is_ok() {
            self.counters.commands_failed += 1;
        }
        self.publish_stats();
        response
    }

    fn emit(&self, event: ImageEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn publish_stats(&mut self) {
        self.counters.images = self.registry.len();
        self.counters.processes = self.liveness.len();
        self.stats.send_replace(self.counters);
    }
}
