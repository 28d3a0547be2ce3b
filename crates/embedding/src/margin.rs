//! Memoized clearance depth per mesh.
//!
//! Once a mesh has been pushed back by some depth, later requests asking for
//! the same or less depth can skip it without an intersection query. The
//! default tracker keeps one scalar per mesh, which is an approximation: a
//! deep dent in one spot also skips shallow requests elsewhere on the same
//! mesh. [`RegionMarginTracker`] keys records by a world grid cell instead.

use std::collections::HashMap;

use glam::{IVec3, Vec3};
use tracing::trace;

use crate::mesh::MeshId;

/// Memo of how deep each surface has already been displaced.
pub trait MarginTracker {
    /// Whether a recorded margin covers `required_depth`. No record means no.
    ///
    /// `site` is the world point the displacement pushes towards (the back
    /// plane point); trackers that do not track regions ignore it.
    fn has_sufficient_margin(&self, mesh: MeshId, site: Vec3, required_depth: f32) -> bool;

    /// Record the depth reached by the latest deformation, overwriting any
    /// previous record for the same key.
    fn update(&mut self, mesh: MeshId, site: Vec3, depth: f32);

    /// Drop every record for `mesh`.
    fn forget(&mut self, mesh: MeshId);

    /// Keep only the records of meshes for which `keep` returns true.
    fn retain(&mut self, keep: &dyn Fn(MeshId) -> bool);

    fn clear(&mut self);

    /// Number of stored records.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One depth per mesh.
#[derive(Debug, Clone, Default)]
pub struct MeshMarginTracker {
    margins: HashMap<MeshId, f32>,
}

impl MeshMarginTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded depth for a mesh, if any.
    pub fn margin(&self, mesh: MeshId) -> Option<f32> {
        self.margins.get(&mesh).copied()
    }
}

impl MarginTracker for MeshMarginTracker {
    fn has_sufficient_margin(&self, mesh: MeshId, _site: Vec3, required_depth: f32) -> bool {
        self.margins
            .get(&mesh)
            .is_some_and(|&depth| depth >= required_depth)
    }

    fn update(&mut self, mesh: MeshId, _site: Vec3, depth: f32) {
        trace!("margin: {:?} -> {}", mesh, depth);
        self.margins.insert(mesh, depth);
    }

    fn forget(&mut self, mesh: MeshId) {
        self.margins.remove(&mesh);
    }

    fn retain(&mut self, keep: &dyn Fn(MeshId) -> bool) {
        self.margins.retain(|&mesh, _| keep(mesh));
    }

    fn clear(&mut self) {
        self.margins.clear();
    }

    fn len(&self) -> usize {
        self.margins.len()
    }
}

/// One depth per mesh and world grid cell.
#[derive(Debug, Clone)]
pub struct RegionMarginTracker {
    cell_size: f32,
    margins: HashMap<(MeshId, IVec3), f32>,
}

impl RegionMarginTracker {
    /// Tracker with cubic cells of `cell_size` metres. Non-positive or
    /// non-finite sizes fall back to 1.0.
    pub fn new(cell_size: f32) -> Self {
        let cell_size = if cell_size.is_finite() && cell_size > 0.0 {
            cell_size
        } else {
            1.0
        };
        Self {
            cell_size,
            margins: HashMap::new(),
        }
    }

    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }

    /// Grid cell containing a world point.
    pub fn cell_of(&self, site: Vec3) -> IVec3 {
        (site / self.cell_size).floor().as_ivec3()
    }

    /// Recorded depth for a mesh at a site, if any.
    pub fn margin(&self, mesh: MeshId, site: Vec3) -> Option<f32> {
        self.margins.get(&(mesh, self.cell_of(site))).copied()
    }
}

impl MarginTracker for RegionMarginTracker {
    fn has_sufficient_margin(&self, mesh: MeshId, site: Vec3, required_depth: f32) -> bool {
        self.margin(mesh, site)
            .is_some_and(|depth| depth >= required_depth)
    }

    fn update(&mut self, mesh: MeshId, site: Vec3, depth: f32) {
        let cell = self.cell_of(site);
        trace!("margin: {:?} cell {} -> {}", mesh, cell, depth);
        self.margins.insert((mesh, cell), depth);
    }

    fn forget(&mut self, mesh: MeshId) {
        self.margins.retain(|&(id, _), _| id != mesh);
    }

    fn retain(&mut self, keep: &dyn Fn(MeshId) -> bool) {
        self.margins.retain(|&(mesh, _), _| keep(mesh));
    }

    fn clear(&mut self) {
        self.margins.clear();
    }

    fn len(&self) -> usize {
        self.margins.len()
    }
}
