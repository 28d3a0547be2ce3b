//! Undo log for vertex displacements
//!
//! Entries live in an arena keyed by [`UndoId`] and hold only weak references
//! to their meshes, so the log never keeps a destroyed mesh alive.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use embedding_config::DEFAULT_MAX_UNDO_ENTRIES;
use glam::Vec3;
use tracing::debug;

use crate::error::EmbedError;
use crate::mesh::{MeshHandle, MeshId, SurfaceMesh};
use crate::queue::RequestId;

/// Identifier of an undo entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UndoId(pub u64);

/// Vertex positions captured before a displacement
#[derive(Debug, Clone)]
pub struct UndoEntry {
    pub id: UndoId,
    pub mesh_id: MeshId,
    /// Request that displaced the vertices
    pub request: RequestId,
    mesh: Weak<RefCell<SurfaceMesh>>,
    /// Captured vertex index -> mesh-local position pairs
    saved: Vec<(u32, Vec3)>,
}

impl UndoEntry {
    pub fn vertex_count(&self) -> usize {
        self.saved.len()
    }
}

/// What a restore touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoreReport {
    pub mesh_id: MeshId,
    pub request: RequestId,
    /// Vertices written back
    pub restored: usize,
}

/// Arena of undo entries, most recent last.
///
/// Holds at most `max_entries`; capturing past that drops the oldest.
#[derive(Debug)]
pub struct UndoLog {
    entries: Vec<UndoEntry>,
    next_id: u64,
    max_entries: usize,
}

impl Default for UndoLog {
    fn default() -> Self {
        Self::with_max_entries(DEFAULT_MAX_UNDO_ENTRIES)
    }
}

impl UndoLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_entries(max_entries: usize) -> Self {
        Self {
            entries: Vec::new(),
            next_id: 0,
            max_entries: max_entries.max(1),
        }
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Save the current positions of `indices` in `handle`'s mesh.
    ///
    /// Indices that do not name a vertex are ignored.
    pub fn capture(&mut self, handle: &MeshHandle, indices: &[u32], request: RequestId) -> UndoId {
        let mesh = handle.borrow();
        let saved: Vec<(u32, Vec3)> = indices
            .iter()
            .filter_map(|&i| mesh.positions().get(i as usize).map(|&p| (i, p)))
            .collect();

        let id = UndoId(self.next_id);
        self.next_id += 1;
        debug!(
            "Undo: captured {} vertices of {:?} for {:?}",
            saved.len(),
            mesh.id(),
            request
        );
        self.entries.push(UndoEntry {
            id,
            mesh_id: mesh.id(),
            request,
            mesh: Rc::downgrade(handle),
            saved,
        });

        // Limit log size
        if self.entries.len() > self.max_entries {
            let excess = self.entries.len() - self.max_entries;
            self.entries.drain(..excess);
            debug!("Undo: dropped {} oldest entries", excess);
        }
        id
    }

    /// Check if undo is available
    pub fn can_undo(&self) -> bool {
        !self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[UndoEntry] {
        &self.entries
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Restore and remove a specific entry.
    ///
    /// Returns `Ok(None)` when no entry has this id. The entry is removed even
    /// when its mesh turns out to be gone.
    pub fn restore(&mut self, id: UndoId) -> Result<Option<RestoreReport>, EmbedError> {
        let Some(slot) = self.entries.iter().position(|e| e.id == id) else {
            return Ok(None);
        };
        let entry = self.entries.remove(slot);
        apply(entry).map(Some)
    }

    /// Restore and remove the most recent entry.
    pub fn restore_last(&mut self) -> Result<Option<RestoreReport>, EmbedError> {
        let Some(entry) = self.entries.pop() else {
            debug!("Undo: no entries available");
            return Ok(None);
        };
        apply(entry).map(Some)
    }
}

fn apply(entry: UndoEntry) -> Result<RestoreReport, EmbedError> {
    let handle = entry
        .mesh
        .upgrade()
        .ok_or(EmbedError::StaleMeshReference(entry.mesh_id))?;
    let mut mesh = handle.borrow_mut();

    let mut restored = 0;
    for (index, position) in entry.saved {
        if mesh.set_position(index, position) {
            restored += 1;
        }
    }
    if restored > 0 {
        mesh.recalculate_bounds();
    }

    debug!(
        "Undoing {:?} on {:?} ({} vertices)",
        entry.request, entry.mesh_id, restored
    );
    Ok(RestoreReport {
        mesh_id: entry.mesh_id,
        request: entry.request,
        restored,
    })
}
