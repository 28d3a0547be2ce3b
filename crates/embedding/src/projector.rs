//! Plane projection of a vertex subset.
//!
//! Affected vertices are flattened onto the back plane of the embedded
//! object, which carves a flat-bottomed recess into the surface. The plane
//! lives in world space while vertices are stored mesh-local, so every
//! vertex goes through the mesh transform, gets projected, and comes back
//! through the cached inverse.

use embedding_config::ProjectionMode;
use glam::Vec3;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{DegenerateKind, EmbedError};
use crate::mesh::SurfaceMesh;

/// Maximum distance of a projected vertex from its plane.
pub const PROJECTION_TOLERANCE: f32 = 1e-5;

/// Plane `N·P + d = 0` with unit normal `N`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Plane {
    pub normal: Vec3,
    pub d: f32,
}

impl Plane {
    /// Plane through `point` with the given normal (normalized here).
    pub fn from_point_normal(point: Vec3, normal: Vec3) -> Result<Self, EmbedError> {
        if !point.is_finite() || !normal.is_finite() {
            return Err(EmbedError::DegenerateGeometry(DegenerateKind::NonFinite));
        }
        let normal = normal
            .try_normalize()
            .ok_or(EmbedError::DegenerateGeometry(DegenerateKind::ZeroLengthNormal))?;
        Ok(Self {
            normal,
            d: -normal.dot(point),
        })
    }

    /// Back plane of a front/back point pair, plus the depth between them.
    ///
    /// The normal points from `front` to `back` and the plane passes through
    /// `back`.
    pub fn from_front_back(front: Vec3, back: Vec3) -> Result<(Self, f32), EmbedError> {
        let offset = back - front;
        let plane = Self::from_point_normal(back, offset)?;
        Ok((plane, offset.length()))
    }

    /// Positive beyond the plane (in the direction of the normal).
    pub fn signed_distance(&self, point: Vec3) -> f32 {
        self.normal.dot(point) + self.d
    }

    /// Closest point on the plane.
    pub fn project_point(&self, point: Vec3) -> Vec3 {
        point - self.normal * self.signed_distance(point)
    }
}

/// Counts from one projection pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionReport {
    /// Vertices written
    pub projected: usize,
    /// Vertices left alone (already recessed, or not a valid index)
    pub skipped: usize,
}

/// Project the given vertices of `mesh` onto `plane`.
///
/// Refreshes the cached bounds once at the end. With
/// [`ProjectionMode::RecessOnly`] vertices already on or beyond the plane are
/// not touched, so the surface is never pulled back towards the viewer.
pub fn project_vertices(
    mesh: &mut SurfaceMesh,
    plane: &Plane,
    indices: &[u32],
    mode: ProjectionMode,
) -> ProjectionReport {
    let to_world = *mesh.transform();
    let to_local = *mesh.world_to_mesh();
    let mut report = ProjectionReport::default();

    for &index in indices {
        let Some(&local) = mesh.positions().get(index as usize) else {
            report.skipped += 1;
            continue;
        };
        let world = to_world.transform_point3(local);
        let distance = plane.signed_distance(world);
        if mode == ProjectionMode::RecessOnly && distance >= 0.0 {
            report.skipped += 1;
            continue;
        }
        let projected = world - plane.normal * distance;
        mesh.set_position(index, to_local.transform_point3(projected));
        report.projected += 1;
    }

    if report.projected > 0 {
        mesh.recalculate_bounds();
    }
    trace!(
        "project: {} written, {} skipped on {:?}",
        report.projected,
        report.skipped,
        mesh.id()
    );
    report
}

/// Host hook to rebuild physics colliders after a mesh was deformed.
pub trait ColliderSync {
    fn rebuild(&mut self, mesh: &SurfaceMesh);
}

/// Collider hook that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoColliderSync;

impl ColliderSync for NoColliderSync {
    fn rebuild(&mut self, _mesh: &SurfaceMesh) {}
}
