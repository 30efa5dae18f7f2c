//! Arena of shared images with a name index.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use tracing::debug;

use texshare_core::{ExternalHandles, ImageDescriptor, ImageId, ImageName, ProcessId};

use super::events::RegistryError;

// ============================================================================
// Shared Image
// ============================================================================

/// One registered image and the backend allocation it owns.
///
/// `A` is the backend's allocation type. It is moved in at creation and
/// only moved out again by [`ImageRegistry::remove`] or
/// [`ImageRegistry::drain`], which is what makes a double release
/// impossible to write.
#[derive(Debug)]
pub struct SharedImage<A> {
    id: ImageId,
    name: ImageName,
    descriptor: ImageDescriptor,
    handles: ExternalHandles,
    allocation: A,
    registered_processes: BTreeSet<ProcessId>,
    created_by: ProcessId,
    created_at: DateTime<Utc>,
}

impl<A> SharedImage<A> {
    pub fn id(&self) -> ImageId {
        self.id
    }

    pub fn name(&self) -> &ImageName {
        &self.name
    }

    pub fn descriptor(&self) -> ImageDescriptor {
        self.descriptor
    }

    /// Exported handle values handed to clients.
    pub fn handles(&self) -> ExternalHandles {
        self.handles
    }

    /// Processes currently holding a reference to this image.
    pub fn registered_processes(&self) -> &BTreeSet<ProcessId> {
        &self.registered_processes
    }

    pub fn is_held_by(&self, pid: ProcessId) -> bool {
        self.registered_processes.contains(&pid)
    }

    pub fn created_by(&self) -> ProcessId {
        self.created_by
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Gives up the record, returning the allocation for release.
    pub fn into_allocation(self) -> A {
        self.allocation
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Name → id → image registry.
#[derive(Debug)]
pub struct ImageRegistry<A> {
    images: HashMap<ImageId, SharedImage<A>>,
    by_name: HashMap<ImageName, ImageId>,
    next_id: ImageId,
    max_images: usize,
}

impl<A> ImageRegistry<A> {
    pub fn new(max_images: usize) -> Self {
        Self {
            images: HashMap::new(),
            by_name: HashMap::new(),
            next_id: ImageId::FIRST,
            max_images,
        }
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn max_images(&self) -> usize {
        self.max_images
    }

    pub fn get(&self, id: ImageId) -> Option<&SharedImage<A>> {
        self.images.get(&id)
    }

    pub fn get_by_name(&self, name: &ImageName) -> Option<&SharedImage<A>> {
        self.by_name.get(name).and_then(|id| self.images.get(id))
    }

    /// Resolves a name to its current id.
    pub fn lookup(&self, name: &ImageName) -> Option<ImageId> {
        self.by_name.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SharedImage<A>> {
        self.images.values()
    }

    /// Claims `name` for a new image.
    ///
    /// # Errors
    ///
    /// - `RegistryError::NameTaken` if the name is already published
    /// - `RegistryError::RegistryFull` if at maximum capacity
    pub fn vacant(&mut self, name: &ImageName) -> Result<VacantImage<'_, A>, RegistryError> {
        if self.by_name.contains_key(name) {
            return Err(RegistryError::NameTaken(name.clone()));
        }
        if self.images.len() >= self.max_images {
            return Err(RegistryError::RegistryFull {
                max: self.max_images,
            });
        }
        Ok(VacantImage {
            registry: self,
            name: name.clone(),
        })
    }

    /// Adds `pid` to an image's holders. Returns true if it was not there yet.
    pub fn attach(&mut self, id: ImageId, pid: ProcessId) -> bool {
        self.images
            .get_mut(&id)
            .map(|image| image.registered_processes.insert(pid))
            .unwrap_or(false)
    }

    /// Moves an image from `old_name` to `new_name` on behalf of `pid`.
    ///
    /// Both index updates happen inside this call, so no lookup ever sees
    /// both names or neither. On error nothing changes.
    ///
    /// # Errors
    ///
    /// - `RegistryError::ImageNotFound` if `old_name` is not published
    /// - `RegistryError::NotOwner` if `pid` does not hold the image
    /// - `RegistryError::NameTaken` if `new_name` belongs to another image
    pub fn rename(
        &mut self,
        old_name: &ImageName,
        new_name: &ImageName,
        pid: ProcessId,
    ) -> Result<ImageId, RegistryError> {
        let id = self
            .lookup(old_name)
            .ok_or_else(|| RegistryError::ImageNotFound(old_name.clone()))?;

        let image = self
            .images
            .get_mut(&id)
            .ok_or_else(|| RegistryError::ImageNotFound(old_name.clone()))?;
        if !image.registered_processes.contains(&pid) {
            return Err(RegistryError::NotOwner {
                name: old_name.clone(),
                pid,
            });
        }

        if old_name == new_name {
            return Ok(id);
        }
        if self.by_name.contains_key(new_name) {
            return Err(RegistryError::NameTaken(new_name.clone()));
        }

        image.name = new_name.clone();
        self.by_name.remove(old_name);
        self.by_name.insert(new_name.clone(), id);
        Ok(id)
    }

    /// Removes `pid` from every image it holds.
    ///
    /// Returns the ids of images left without any holder; the caller is
    /// expected to [`remove`](Self::remove) and release them.
    pub fn detach_process(&mut self, pid: ProcessId) -> Vec<ImageId> {
        let mut orphaned = Vec::new();
        for image in self.images.values_mut() {
            if image.registered_processes.remove(&pid) {
                debug!(id = %image.id, image = %image.name, pid = %pid, "Detached process from image");
                if image.registered_processes.is_empty() {
                    orphaned.push(image.id);
                }
            }
        }
        orphaned.sort_unstable();
        orphaned
    }

    /// Removes an image from both indexes, handing back ownership.
    pub fn remove(&mut self, id: ImageId) -> Option<SharedImage<A>> {
        let image = self.images.remove(&id)?;
        self.by_name.remove(&image.name);
        Some(image)
    }

    /// Removes every image, in id order.
    pub fn drain(&mut self) -> Vec<SharedImage<A>> {
        self.by_name.clear();
        let mut images: Vec<_> = self.images.drain().map(|(_, image)| image).collect();
        images.sort_unstable_by_key(|image| image.id);
        images
    }
}

/// A name claimed by [`ImageRegistry::vacant`], waiting for its allocation.
pub struct VacantImage<'a, A> {
    registry: &'a mut ImageRegistry<A>,
    name: ImageName,
}

impl<A> VacantImage<'_, A> {
    /// Publishes the image under the claimed name and returns its new id.
    pub fn insert(
        self,
        descriptor: ImageDescriptor,
        creator: ProcessId,
        allocation: A,
        handles: ExternalHandles,
    ) -> ImageId {
        let registry = self.registry;
        let id = registry.next_id;
        registry.next_id = id.next();

        let image = SharedImage {
            id,
            name: self.name.clone(),
            descriptor,
            handles,
            allocation,
            registered_processes: BTreeSet::from([creator]),
            created_by: creator,
            created_at: Utc::now(),
        };
        registry.by_name.insert(self.name, id);
        registry.images.insert(id, image);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use texshare_core::{ImageFormat, RawHandle};

    fn name(s: &str) -> ImageName {
        ImageName::new(s).unwrap()
    }

    fn pid(n: u32) -> ProcessId {
        ProcessId::new(n).unwrap()
    }

    fn descriptor() -> ImageDescriptor {
        ImageDescriptor::new(64, 64, ImageFormat::R8G8B8A8).unwrap()
    }

    fn handles() -> ExternalHandles {
        ExternalHandles {
            owner_pid: pid(1),
            memory: RawHandle::new(10),
            semaphore_read: RawHandle::new(11),
            semaphore_write: RawHandle::new(12),
            allocation_size: descriptor().byte_size(),
        }
    }

    fn insert(reg: &mut ImageRegistry<u32>, n: &str, creator: u32) -> ImageId {
        reg.vacant(&name(n))
            .unwrap()
            .insert(descriptor(), pid(creator), creator, handles())
    }

    #[test]
    fn test_insert_assigns_increasing_ids() {
        let mut reg = ImageRegistry::new(8);
        let a = insert(&mut reg, "a", 1);
        let b = insert(&mut reg, "b", 1);
        assert_eq!(a, ImageId::FIRST);
        assert!(b > a);
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.lookup(&name("b")), Some(b));
        assert!(reg.get(a).unwrap().is_held_by(pid(1)));
    }

    #[test]
    fn test_vacant_rejects_taken_name_and_full_registry() {
        let mut reg = ImageRegistry::new(1);
        insert(&mut reg, "a", 1);
        assert!(matches!(reg.vacant(&name("a")), Err(RegistryError::NameTaken(_))));
        assert!(matches!(
            reg.vacant(&name("b")),
            Err(RegistryError::RegistryFull { max: 1 })
        ));
    }

    #[test]
    fn test_ids_not_reused_after_removal() {
        let mut reg = ImageRegistry::new(8);
        let a = insert(&mut reg, "a", 1);
        reg.remove(a).unwrap();
        let again = insert(&mut reg, "a", 1);
        assert_ne!(a, again);
        assert!(again > a);
    }

    #[test]
    fn test_rename_swaps_index() {
        let mut reg = ImageRegistry::new(8);
        let id = insert(&mut reg, "a", 1);

        assert_eq!(reg.rename(&name("a"), &name("b"), pid(1)), Ok(id));
        assert_eq!(reg.lookup(&name("a")), None);
        assert_eq!(reg.lookup(&name("b")), Some(id));
        assert_eq!(reg.get(id).unwrap().name(), &name("b"));
        assert_eq!(reg.get(id).unwrap().descriptor(), descriptor());
    }

    #[test]
    fn test_rename_failures_leave_registry_unchanged() {
        let mut reg = ImageRegistry::new(8);
        let a = insert(&mut reg, "a", 1);
        let b = insert(&mut reg, "b", 2);

        assert!(matches!(
            reg.rename(&name("missing"), &name("c"), pid(1)),
            Err(RegistryError::ImageNotFound(_))
        ));
        assert!(matches!(
            reg.rename(&name("a"), &name("c"), pid(2)),
            Err(RegistryError::NotOwner { .. })
        ));
        assert!(matches!(
            reg.rename(&name("a"), &name("b"), pid(1)),
            Err(RegistryError::NameTaken(_))
        ));

        assert_eq!(reg.lookup(&name("a")), Some(a));
        assert_eq!(reg.lookup(&name("b")), Some(b));
        assert_eq!(reg.lookup(&name("c")), None);
    }

    #[test]
    fn test_rename_to_same_name_is_noop() {
        let mut reg = ImageRegistry::new(8);
        let a = insert(&mut reg, "a", 1);
        assert_eq!(reg.rename(&name("a"), &name("a"), pid(1)), Ok(a));
        assert_eq!(reg.lookup(&name("a")), Some(a));
    }

    #[test]
    fn test_detach_reports_orphans_only() {
        let mut reg = ImageRegistry::new(8);
        let shared = insert(&mut reg, "shared", 1);
        let solo = insert(&mut reg, "solo", 1);
        assert!(reg.attach(shared, pid(2)));
        assert!(!reg.attach(shared, pid(2)));

        assert_eq!(reg.detach_process(pid(1)), vec![solo]);
        assert!(!reg.get(shared).unwrap().is_held_by(pid(1)));
        assert!(reg.get(shared).unwrap().is_held_by(pid(2)));
    }

    #[test]
    fn test_remove_hands_back_allocation() {
        let mut reg = ImageRegistry::new(8);
        let id = insert(&mut reg, "a", 7);
        let image = reg.remove(id).unwrap();
        assert_eq!(image.into_allocation(), 7);
        assert!(reg.remove(id).is_none());
        assert!(reg.get_by_name(&name("a")).is_none());
    }

    #[test]
    fn test_drain_empties_both_indexes() {
        let mut reg = ImageRegistry::new(8);
        insert(&mut reg, "a", 1);
        insert(&mut reg, "b", 2);
        let drained = reg.drain();
        assert_eq!(drained.len(), 2);
        assert!(drained[0].id() < drained[1].id());
        assert!(reg.is_empty());
        assert_eq!(reg.lookup(&name("a")), None);
    }
}
