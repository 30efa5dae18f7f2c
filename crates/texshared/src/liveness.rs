//! Liveness tracking for client processes.
//!
//! Every process that registers, creates or joins an image is recorded
//! together with the start time observed at registration. A later probe
//! reporting a different start time means the pid was reused by an unrelated
//! process, and the original client is treated as dead.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use texshare_core::{ImageId, ProcessId, ProcessIdentity, ProcessProbe};

use crate::registry::RegistryError;

/// Default maximum number of tracked client processes.
pub const MAX_PROCESSES: usize = 256;

#[derive(Debug)]
struct TrackedProcess {
    identity: ProcessIdentity,
    /// Images this process created or joined
    owned_images: BTreeSet<ImageId>,
}

/// Set of registered client processes.
pub struct LivenessTracker<P> {
    probe: P,
    processes: BTreeMap<ProcessId, TrackedProcess>,
    max_processes: usize,
}

impl<P: ProcessProbe> LivenessTracker<P> {
    pub fn new(probe: P, max_processes: usize) -> Self {
        Self {
            probe,
            processes: BTreeMap::new(),
            max_processes,
        }
    }

    pub fn probe(&self) -> &P {
        &self.probe
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn contains(&self, pid: ProcessId) -> bool {
        self.processes.contains_key(&pid)
    }

    /// Adds `pid` to the liveness set.
    ///
    /// Returns `Ok(true)` when the process was newly added. Registering a
    /// pid again is a no-op and keeps the identity observed the first time.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::TooManyProcesses` if the set is full.
    pub fn register(&mut self, pid: ProcessId) -> Result<bool, RegistryError> {
        if self.processes.contains_key(&pid) {
            return Ok(false);
        }
        if self.processes.len() >= self.max_processes {
            return Err(RegistryError::TooManyProcesses {
                max: self.max_processes,
            });
        }

        let identity = ProcessIdentity::observe(pid, &self.probe);
        debug!(pid = %pid, start_time = ?identity.start_time, "Tracking process");
        self.processes.insert(
            pid,
            TrackedProcess {
                identity,
                owned_images: BTreeSet::new(),
            },
        );
        Ok(true)
    }

    /// Whether the registered instance of `pid` is still running.
    ///
    /// Unregistered pids are reported as not alive.
    pub fn is_alive(&self, pid: ProcessId) -> bool {
        self.processes
            .get(&pid)
            .map(|tracked| tracked.identity.is_alive(&self.probe))
            .unwrap_or(false)
    }

    /// Probes every tracked process and returns those that are gone.
    pub fn collect_dead(&self) -> Vec<ProcessId> {
        self.processes
            .iter()
            .filter(|(_, tracked)| !tracked.identity.is_alive(&self.probe))
            .map(|(pid, _)| *pid)
            .collect()
    }

    /// Drops `pid` from the set, returning the images it held.
    pub fn remove(&mut self, pid: ProcessId) -> Option<BTreeSet<ImageId>> {
        self.processes.remove(&pid).map(|tracked| tracked.owned_images)
    }

    /// Records that `pid` holds `image`.
    pub fn note_image(&mut self, pid: ProcessId, image: ImageId) {
        if let Some(tracked) = self.processes.get_mut(&pid) {
            tracked.owned_images.insert(image);
        }
    }

    /// Removes `image` from every process's holdings.
    pub fn forget_image(&mut self, image: ImageId) {
        for tracked in self.processes.values_mut() {
            tracked.owned_images.remove(&image);
        }
    }

    /// Images currently attributed to `pid`.
    pub fn images_of(&self, pid: ProcessId) -> Option<&BTreeSet<ImageId>> {
        self.processes.get(&pid).map(|tracked| &tracked.owned_images)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeProbe;

    fn pid(n: u32) -> ProcessId {
        ProcessId::new(n).unwrap()
    }

    #[test]
    fn test_register_is_idempotent() {
        let probe = FakeProbe::new();
        probe.spawn(pid(10));
        let mut tracker = LivenessTracker::new(probe, 4);

        assert_eq!(tracker.register(pid(10)), Ok(true));
        assert_eq!(tracker.register(pid(10)), Ok(false));
        assert_eq!(tracker.len(), 1);
        assert!(tracker.is_alive(pid(10)));
    }

    #[test]
    fn test_register_respects_capacity() {
        let probe = FakeProbe::new();
        let mut tracker = LivenessTracker::new(probe, 1);
        tracker.register(pid(1)).unwrap();

        assert_eq!(
            tracker.register(pid(2)),
            Err(RegistryError::TooManyProcesses { max: 1 })
        );
        // Already-registered pids are still accepted at capacity.
        assert_eq!(tracker.register(pid(1)), Ok(false));
    }

    #[test]
    fn test_collect_dead_sees_exit_and_reuse() {
        let probe = FakeProbe::new();
        probe.spawn(pid(1));
        probe.spawn(pid(2));
        probe.spawn(pid(3));
        let mut tracker = LivenessTracker::new(probe.clone(), 8);
        for n in 1..=3 {
            tracker.register(pid(n)).unwrap();
        }

        probe.kill(pid(1));
        probe.reuse(pid(3));

        assert_eq!(tracker.collect_dead(), vec![pid(1), pid(3)]);
        assert!(tracker.is_alive(pid(2)));
    }

    #[test]
    fn test_unregistered_pid_is_not_alive() {
        let probe = FakeProbe::new();
        probe.spawn(pid(5));
        let tracker = LivenessTracker::new(probe, 8);
        assert!(!tracker.is_alive(pid(5)));
    }

    #[test]
    fn test_image_bookkeeping() {
        let probe = FakeProbe::new();
        let mut tracker = LivenessTracker::new(probe, 8);
        tracker.register(pid(1)).unwrap();

        tracker.note_image(pid(1), ImageId::new(4));
        tracker.note_image(pid(1), ImageId::new(5));
        tracker.forget_image(ImageId::new(4));

        let held = tracker.remove(pid(1)).unwrap();
        assert_eq!(held.into_iter().collect::<Vec<_>>(), vec![ImageId::new(5)]);
        assert!(tracker.remove(pid(1)).is_none());
    }
}
