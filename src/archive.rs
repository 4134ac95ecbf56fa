//! Two-level archive container (§6 in the data model): one `GlobalArchive`
//! per trace, one `Archive` per process. Each owns a `Definitions` table
//! behind a mutex (the concurrency model's single serialisation point for
//! definition inserts) plus, for `Archive`, the process's Threads.
//!
//! `Archive` holds a non-owning [`Weak`] reference back to its
//! `GlobalArchive` rather than an `Arc`, breaking the cycle that an owning
//! back-pointer would create (Design Notes: "Cyclic references between
//! Archive and Thread... break the cycle with a non-owning reference").

use crate::definitions::{
    AttributeDef, AttributeType, CommDef, Definitions, GroupDef, LocationDef, LocationGroupDef,
    Ref, RegionDef, StringDef,
};
use crate::thread::{Thread, ThreadId};
use crate::{PallasError, Result};
use std::sync::{Arc, Mutex, Weak};

/// Dense id of a process-level Archive within its GlobalArchive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArchiveId(pub u32);

/// Per-trace root container: global definitions plus the set of
/// process-level Archives loaded so far.
pub struct GlobalArchive {
    /// The trace's OTF2-style group id, persisted in the global header.
    pub group_id: u32,
    definitions: Mutex<Definitions>,
    archives: Mutex<Vec<Arc<Archive>>>,
}

impl GlobalArchive {
    /// A fresh, empty GlobalArchive for a new trace.
    pub fn new(group_id: u32) -> Arc<Self> {
        Arc::new(Self {
            group_id,
            definitions: Mutex::new(Definitions::new()),
            archives: Mutex::new(Vec::new()),
        })
    }

    /// Interns a string under `reference`.
    pub fn add_string(&self, reference: Ref, bytes: String) -> Result<()> {
        self.definitions
            .lock()
            .unwrap()
            .strings
            .insert(reference, StringDef { bytes })
            .map_err(|e| PallasError::DuplicateDefinition(e.0))
    }

    /// Looks up a string definition.
    pub fn get_string(&self, reference: Ref) -> Option<StringDef> {
        self.definitions.lock().unwrap().strings.get(reference).cloned()
    }

    /// Defines a code region, naming the string that describes it.
    pub fn add_region(&self, reference: Ref, string_ref: Ref) -> Result<()> {
        self.definitions
            .lock()
            .unwrap()
            .regions
            .insert(reference, RegionDef { string_ref })
            .map_err(|e| PallasError::DuplicateDefinition(e.0))
    }

    /// Looks up a region definition.
    pub fn get_region(&self, reference: Ref) -> Option<RegionDef> {
        self.definitions.lock().unwrap().regions.get(reference).cloned()
    }

    /// Defines an attribute (name, description, value type).
    pub fn add_attribute(
        &self,
        reference: Ref,
        name: Ref,
        description: Ref,
        attr_type: AttributeType,
    ) -> Result<()> {
        self.definitions
            .lock()
            .unwrap()
            .attributes
            .insert(reference, AttributeDef { name, description, attr_type })
            .map_err(|e| PallasError::DuplicateDefinition(e.0))
    }

    /// Looks up an attribute definition.
    pub fn get_attribute(&self, reference: Ref) -> Option<AttributeDef> {
        self.definitions.lock().unwrap().attributes.get(reference).cloned()
    }

    /// Defines a named group of members (e.g. an MPI communicator's
    /// ranks).
    pub fn add_group(&self, reference: Ref, name: Ref, members: Vec<Ref>) -> Result<()> {
        self.definitions
            .lock()
            .unwrap()
            .groups
            .insert(reference, GroupDef { name, members })
            .map_err(|e| PallasError::DuplicateDefinition(e.0))
    }

    /// Looks up a group definition.
    pub fn get_group(&self, reference: Ref) -> Option<GroupDef> {
        self.definitions.lock().unwrap().groups.get(reference).cloned()
    }

    /// Defines a communicator.
    pub fn add_comm(&self, reference: Ref, name: Ref, group: Ref, parent: Option<Ref>) -> Result<()> {
        self.definitions
            .lock()
            .unwrap()
            .comms
            .insert(reference, CommDef { name, group, parent })
            .map_err(|e| PallasError::DuplicateDefinition(e.0))
    }

    /// Looks up a communicator definition.
    pub fn get_comm(&self, reference: Ref) -> Option<CommDef> {
        self.definitions.lock().unwrap().comms.get(reference).cloned()
    }

    /// Defines a location (a thread of execution).
    pub fn define_location(&self, id: Ref, name: Ref, parent_group: Ref) -> Result<()> {
        self.definitions
            .lock()
            .unwrap()
            .locations
            .insert(id, LocationDef { name, parent_group })
            .map_err(|e| PallasError::DuplicateDefinition(e.0))
    }

    /// Looks up a location definition.
    pub fn get_location(&self, id: Ref) -> Option<LocationDef> {
        self.definitions.lock().unwrap().locations.get(id).cloned()
    }

    /// Defines a location group (e.g. an MPI rank's threads).
    pub fn define_location_group(
        &self,
        id: Ref,
        name: Ref,
        parent: Option<Ref>,
        main_location: Option<Ref>,
    ) -> Result<()> {
        self.definitions
            .lock()
            .unwrap()
            .location_groups
            .insert(id, LocationGroupDef { name, parent, main_location })
            .map_err(|e| PallasError::DuplicateDefinition(e.0))
    }

    /// Looks up a location-group definition.
    pub fn get_location_group(&self, id: Ref) -> Option<LocationGroupDef> {
        self.definitions.lock().unwrap().location_groups.get(id).cloned()
    }

    /// Creates and registers a fresh per-process Archive under this
    /// GlobalArchive.
    pub fn open_archive(self: &Arc<Self>, id: ArchiveId) -> Arc<Archive> {
        let archive = Archive::new(id, Arc::downgrade(self));
        self.archives.lock().unwrap().push(archive.clone());
        archive
    }

    /// Looks up a previously opened process Archive by id.
    pub fn get_archive(&self, id: ArchiveId) -> Option<Arc<Archive>> {
        self.archives.lock().unwrap().iter().find(|a| a.id == id).cloned()
    }

    /// All process Archives opened so far.
    pub fn archives(&self) -> Vec<Arc<Archive>> {
        self.archives.lock().unwrap().clone()
    }

    /// Runs `f` against the locked Definitions table. Used by the storage
    /// engine to read every table for serialisation without exposing the
    /// mutex itself.
    pub(crate) fn with_definitions<R>(&self, f: impl FnOnce(&Definitions) -> R) -> R {
        f(&self.definitions.lock().unwrap())
    }
}

/// Per-process container: a local Definitions table (falling through to
/// the owning GlobalArchive on miss) and the Threads belonging to this
/// process.
pub struct Archive {
    /// This archive's id within its GlobalArchive.
    pub id: ArchiveId,
    global: Weak<GlobalArchive>,
    definitions: Mutex<Definitions>,
    threads: Mutex<Vec<Thread>>,
}

impl Archive {
    fn new(id: ArchiveId, global: Weak<GlobalArchive>) -> Arc<Self> {
        Arc::new(Self {
            id,
            global,
            definitions: Mutex::new(Definitions::new()),
            threads: Mutex::new(Vec::new()),
        })
    }

    fn global(&self) -> Arc<GlobalArchive> {
        self.global
            .upgrade()
            .expect("GlobalArchive dropped while an Archive still references it")
    }

    /// Interns a string under `reference`, local to this archive.
    pub fn add_string(&self, reference: Ref, bytes: String) -> Result<()> {
        self.definitions
            .lock()
            .unwrap()
            .strings
            .insert(reference, StringDef { bytes })
            .map_err(|e| PallasError::DuplicateDefinition(e.0))
    }

    /// Looks up a string definition, falling through to the global
    /// archive on miss.
    pub fn get_string(&self, reference: Ref) -> Option<StringDef> {
        if let Some(v) = self.definitions.lock().unwrap().strings.get(reference).cloned() {
            return Some(v);
        }
        self.global().get_string(reference)
    }

    /// Defines a region local to this archive.
    pub fn add_region(&self, reference: Ref, string_ref: Ref) -> Result<()> {
        self.definitions
            .lock()
            .unwrap()
            .regions
            .insert(reference, RegionDef { string_ref })
            .map_err(|e| PallasError::DuplicateDefinition(e.0))
    }

    /// Looks up a region definition, falling through to the global
    /// archive on miss.
    pub fn get_region(&self, reference: Ref) -> Option<RegionDef> {
        if let Some(v) = self.definitions.lock().unwrap().regions.get(reference).cloned() {
            return Some(v);
        }
        self.global().get_region(reference)
    }

    /// Defines an attribute (name, description, value type), local to this
    /// archive.
    pub fn add_attribute(
        &self,
        reference: Ref,
        name: Ref,
        description: Ref,
        attr_type: AttributeType,
    ) -> Result<()> {
        self.definitions
            .lock()
            .unwrap()
            .attributes
            .insert(reference, AttributeDef { name, description, attr_type })
            .map_err(|e| PallasError::DuplicateDefinition(e.0))
    }

    /// Looks up an attribute definition, falling through to the global
    /// archive on miss.
    pub fn get_attribute(&self, reference: Ref) -> Option<AttributeDef> {
        if let Some(v) = self.definitions.lock().unwrap().attributes.get(reference).cloned() {
            return Some(v);
        }
        self.global().get_attribute(reference)
    }

    /// Defines a named group of members, local to this archive.
    pub fn add_group(&self, reference: Ref, name: Ref, members: Vec<Ref>) -> Result<()> {
        self.definitions
            .lock()
            .unwrap()
            .groups
            .insert(reference, GroupDef { name, members })
            .map_err(|e| PallasError::DuplicateDefinition(e.0))
    }

    /// Looks up a group definition, falling through to the global archive
    /// on miss.
    pub fn get_group(&self, reference: Ref) -> Option<GroupDef> {
        if let Some(v) = self.definitions.lock().unwrap().groups.get(reference).cloned() {
            return Some(v);
        }
        self.global().get_group(reference)
    }

    /// Defines a communicator, local to this archive.
    pub fn add_comm(&self, reference: Ref, name: Ref, group: Ref, parent: Option<Ref>) -> Result<()> {
        self.definitions
            .lock()
            .unwrap()
            .comms
            .insert(reference, CommDef { name, group, parent })
            .map_err(|e| PallasError::DuplicateDefinition(e.0))
    }

    /// Looks up a communicator definition, falling through to the global
    /// archive on miss.
    pub fn get_comm(&self, reference: Ref) -> Option<CommDef> {
        if let Some(v) = self.definitions.lock().unwrap().comms.get(reference).cloned() {
            return Some(v);
        }
        self.global().get_comm(reference)
    }

    /// Defines a location, local to this archive.
    pub fn define_location(&self, id: Ref, name: Ref, parent_group: Ref) -> Result<()> {
        self.definitions
            .lock()
            .unwrap()
            .locations
            .insert(id, LocationDef { name, parent_group })
            .map_err(|e| PallasError::DuplicateDefinition(e.0))
    }

    /// Looks up a location definition, falling through to the global
    /// archive on miss.
    pub fn get_location(&self, id: Ref) -> Option<LocationDef> {
        if let Some(v) = self.definitions.lock().unwrap().locations.get(id).cloned() {
            return Some(v);
        }
        self.global().get_location(id)
    }

    /// Defines a location group, local to this archive.
    pub fn define_location_group(
        &self,
        id: Ref,
        name: Ref,
        parent: Option<Ref>,
        main_location: Option<Ref>,
    ) -> Result<()> {
        self.definitions
            .lock()
            .unwrap()
            .location_groups
            .insert(id, LocationGroupDef { name, parent, main_location })
            .map_err(|e| PallasError::DuplicateDefinition(e.0))
    }

    /// Looks up a location-group definition, falling through to the global
    /// archive on miss.
    pub fn get_location_group(&self, id: Ref) -> Option<LocationGroupDef> {
        if let Some(v) = self.definitions.lock().unwrap().location_groups.get(id).cloned() {
            return Some(v);
        }
        self.global().get_location_group(id)
    }

    /// Registers a Thread as belonging to this process.
    pub fn add_thread(&self, thread: Thread) {
        self.threads.lock().unwrap().push(thread);
    }

    /// Ids of all Threads registered to this archive.
    pub fn thread_ids(&self) -> Vec<ThreadId> {
        self.threads.lock().unwrap().iter().map(|t| t.id).collect()
    }

    /// Removes and returns the Thread with the given id, if present
    /// (storage uses this to take ownership for serialisation).
    pub fn take_thread(&self, id: ThreadId) -> Option<Thread> {
        let mut threads = self.threads.lock().unwrap();
        let pos = threads.iter().position(|t| t.id == id)?;
        Some(threads.remove(pos))
    }

    /// The Archive this thread id maps to, if it belongs to this archive.
    pub fn get_archive_from_location(&self, id: ThreadId) -> Option<ArchiveId> {
        self.threads.lock().unwrap().iter().any(|t| t.id == id).then_some(self.id)
    }

    /// Runs `f` against the locked Definitions table. Used by the storage
    /// engine to read every table for serialisation without exposing the
    /// mutex itself.
    pub(crate) fn with_definitions<R>(&self, f: impl FnOnce(&Definitions) -> R) -> R {
        f(&self.definitions.lock().unwrap())
    }

    /// Runs `f` against the locked Thread list. Used by the storage engine
    /// to serialise every thread without taking ownership of them.
    pub(crate) fn with_threads<R>(&self, f: impl FnOnce(&[Thread]) -> R) -> R {
        f(&self.threads.lock().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_archive_opens_and_finds_child_archives() {
        let global = GlobalArchive::new(0);
        let archive = global.open_archive(ArchiveId(1));
        assert_eq!(archive.id, ArchiveId(1));
        assert!(global.get_archive(ArchiveId(1)).is_some());
        assert!(global.get_archive(ArchiveId(2)).is_none());
    }

    #[test]
    fn archive_definitions_fall_through_to_global() {
        let global = GlobalArchive::new(0);
        global.add_string(1, "global-only".into()).unwrap();
        let archive = global.open_archive(ArchiveId(0));
        archive.add_string(2, "local".into()).unwrap();

        assert_eq!(archive.get_string(2).unwrap().bytes, "local");
        assert_eq!(archive.get_string(1).unwrap().bytes, "global-only");
    }

    #[test]
    fn duplicate_definition_with_different_payload_errors() {
        let global = GlobalArchive::new(0);
        global.add_string(1, "a".into()).unwrap();
        let err = global.add_string(1, "b".into());
        assert!(matches!(err, Err(PallasError::DuplicateDefinition(1))));
    }

    #[test]
    fn archive_owns_registered_threads() {
        let global = GlobalArchive::new(0);
        let archive = global.open_archive(ArchiveId(0));
        archive.add_thread(Thread::new(ThreadId(7)));
        assert_eq!(archive.thread_ids(), vec![ThreadId(7)]);
        let taken = archive.take_thread(ThreadId(7));
        assert!(taken.is_some());
        assert!(archive.thread_ids().is_empty());
    }
}
