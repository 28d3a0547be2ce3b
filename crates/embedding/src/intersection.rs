//! OBB vs. triangle mesh intersection.
//!
//! Triangles are tested with the separating axis theorem as laid out in
//! Akenine-Moller's "Fast 3D Triangle-Box Overlap Testing": vertices are moved
//! into box-local space, where the box is axis aligned and centered at the
//! origin, and 13 candidate axes are tried (3 box faces, the triangle normal,
//! and the 9 cross products of box axes with triangle edges). Projections that
//! merely touch count as overlapping.
//!
//! Whole-mesh queries can exceed a frame budget on large scans, so the query
//! is also available as [`IntersectionQuery`], a resumable state object that
//! the [`Scheduler`](crate::scheduler::Scheduler) advances in coarse steps.

use std::collections::HashSet;

use embedding_config::{DEFAULT_TRIANGLES_PER_STEP, DEFAULT_VERTICES_PER_STEP};
use glam::{Affine3A, Vec3};

use crate::mesh::{Aabb, SurfaceMesh};
use crate::obb::Obb;
use crate::scheduler::{run_to_completion, Resumable, Step};

/// What makes a triangle a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HitCriterion {
    /// Any overlap between the triangle and the box volume
    #[default]
    Overlap,
    /// At least one of the triangle's vertices lies inside the box
    VertexInside,
}

/// Test one triangle, given in box-local coordinates, against the box
/// `[-half_extents, half_extents]`.
pub fn triangle_box_overlap(half_extents: Vec3, v0: Vec3, v1: Vec3, v2: Vec3) -> bool {
    // Box face normals: equivalent to an AABB test of the triangle's bounds
    let tri_min = v0.min(v1).min(v2);
    let tri_max = v0.max(v1).max(v2);
    if tri_min.cmpgt(half_extents).any() || tri_max.cmplt(-half_extents).any() {
        return false;
    }

    // Edge cross products
    let edges = [v1 - v0, v2 - v1, v0 - v2];
    for edge in edges {
        for box_axis in [Vec3::X, Vec3::Y, Vec3::Z] {
            let axis = box_axis.cross(edge);
            if separated_on_axis(axis, half_extents, v0, v1, v2) {
                return false;
            }
        }
    }

    // Triangle plane
    let normal = edges[0].cross(edges[1]);
    let radius = half_extents.dot(normal.abs());
    normal.dot(v0).abs() <= radius
}

/// Projections of the triangle and the box onto `axis` are disjoint.
///
/// A zero axis (edge parallel to a box axis) never separates.
fn separated_on_axis(axis: Vec3, half_extents: Vec3, v0: Vec3, v1: Vec3, v2: Vec3) -> bool {
    let p0 = axis.dot(v0);
    let p1 = axis.dot(v1);
    let p2 = axis.dot(v2);
    let min = p0.min(p1).min(p2);
    let max = p0.max(p1).max(p2);
    let radius = half_extents.dot(axis.abs());
    min > radius || max < -radius
}

fn vertex_inside(half_extents: Vec3, v: Vec3) -> bool {
    v.abs().cmple(half_extents).all()
}

/// Find every triangle of `mesh` that intersects `obb`.
///
/// Returns index triples in mesh order. Runs the whole query at once; use
/// [`IntersectionQuery`] to spread it over several frames.
pub fn find_intersecting_triangles(obb: &Obb, mesh: &SurfaceMesh) -> Vec<[u32; 3]> {
    let mut query = IntersectionQuery::new(obb, mesh);
    run_to_completion(&mut query)
}

/// Vertex indices used by `triangles`, each once, in first-seen order.
pub fn unique_vertex_indices(triangles: &[[u32; 3]]) -> Vec<u32> {
    let mut seen = HashSet::with_capacity(triangles.len() * 3);
    let mut unique = Vec::with_capacity(triangles.len() * 3);
    for &index in triangles.iter().flatten() {
        if seen.insert(index) {
            unique.push(index);
        }
    }
    unique
}

/// Cheap whole-mesh rejection: the box's enclosing AABB against the mesh's
/// cached world bounds.
pub fn broad_phase_overlaps(obb: &Obb, mesh: &SurfaceMesh) -> bool {
    obb.world_aabb().intersects(&mesh.bounds())
}

/// Where a resumable query currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryPhase {
    /// Moving vertices into world and box-local space
    Transform { next_vertex: usize },
    /// Testing triangles against the box
    Test { next_triangle: usize },
    /// Results have been handed out
    Done,
}

/// Resumable OBB/mesh query.
///
/// Snapshots the mesh geometry at creation, so it holds no borrow of the mesh
/// between steps. The revision it was built from is kept so callers can detect
/// that the mesh changed underneath a suspended query.
#[derive(Debug, Clone)]
pub struct IntersectionQuery {
    half_extents: Vec3,
    box_bounds: Aabb,
    mesh_to_world: Affine3A,
    world_to_box: Affine3A,
    criterion: HitCriterion,
    indices: Vec<u32>,
    /// Mesh-local positions, overwritten with world positions during transform
    world: Vec<Vec3>,
    local: Vec<Vec3>,
    phase: QueryPhase,
    results: Vec<[u32; 3]>,
    source_revision: u64,
    vertices_per_step: usize,
    triangles_per_step: usize,
}

impl IntersectionQuery {
    /// Overlap query with default step sizes.
    pub fn new(obb: &Obb, mesh: &SurfaceMesh) -> Self {
        Self::with_criterion(obb, mesh, HitCriterion::Overlap)
    }

    /// Query with an explicit hit criterion.
    ///
    /// The broad phase runs here: when the box misses the mesh bounds no
    /// geometry is copied and the query finishes on its first step.
    pub fn with_criterion(obb: &Obb, mesh: &SurfaceMesh, criterion: HitCriterion) -> Self {
        let overlaps = broad_phase_overlaps(obb, mesh);
        let (indices, world) = if overlaps {
            (mesh.indices().to_vec(), mesh.positions().to_vec())
        } else {
            (Vec::new(), Vec::new())
        };
        // Assume roughly a tenth of the candidates will hit
        let expected = (indices.len() / 30).max(1);
        let phase = if overlaps {
            QueryPhase::Transform { next_vertex: 0 }
        } else {
            QueryPhase::Test { next_triangle: 0 }
        };

        Self {
            half_extents: obb.half_extents(),
            box_bounds: obb.world_aabb(),
            mesh_to_world: *mesh.transform(),
            world_to_box: obb.world_to_local(),
            criterion,
            local: Vec::with_capacity(world.len()),
            indices,
            world,
            phase,
            results: Vec::with_capacity(expected),
            source_revision: mesh.revision(),
            vertices_per_step: DEFAULT_VERTICES_PER_STEP,
            triangles_per_step: DEFAULT_TRIANGLES_PER_STEP,
        }
    }

    /// Override the coarse step sizes (each clamped to at least 1).
    pub fn with_step_sizes(mut self, vertices_per_step: usize, triangles_per_step: usize) -> Self {
        self.vertices_per_step = vertices_per_step.max(1);
        self.triangles_per_step = triangles_per_step.max(1);
        self
    }

    pub fn phase(&self) -> QueryPhase {
        self.phase
    }

    /// Hits found so far.
    pub fn partial_results(&self) -> &[[u32; 3]] {
        &self.results
    }

    /// Revision of the mesh this query was built from.
    pub fn source_revision(&self) -> u64 {
        self.source_revision
    }

    /// Triangles in the snapshot.
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    fn transform_chunk(&mut self, start: usize) -> QueryPhase {
        let end = (start + self.vertices_per_step).min(self.world.len());
        for position in &mut self.world[start..end] {
            *position = self.mesh_to_world.transform_point3(*position);
            self.local.push(self.world_to_box.transform_point3(*position));
        }
        if end >= self.world.len() {
            QueryPhase::Test { next_triangle: 0 }
        } else {
            QueryPhase::Transform { next_vertex: end }
        }
    }

    fn test_chunk(&mut self, start: usize) -> QueryPhase {
        let triangle_count = self.triangle_count();
        let end = (start + self.triangles_per_step).min(triangle_count);
        for tri in start..end {
            let base = tri * 3;
            let triangle = [
                self.indices[base],
                self.indices[base + 1],
                self.indices[base + 2],
            ];
            if self.triangle_hits(triangle) {
                self.results.push(triangle);
            }
        }
        if end >= triangle_count {
            QueryPhase::Done
        } else {
            QueryPhase::Test { next_triangle: end }
        }
    }

    fn triangle_hits(&self, [i0, i1, i2]: [u32; 3]) -> bool {
        let (i0, i1, i2) = (i0 as usize, i1 as usize, i2 as usize);

        let world_bounds = Aabb::from_points([self.world[i0], self.world[i1], self.world[i2]]);
        if !world_bounds.intersects(&self.box_bounds) {
            return false;
        }

        let (v0, v1, v2) = (self.local[i0], self.local[i1], self.local[i2]);
        match self.criterion {
            HitCriterion::Overlap => triangle_box_overlap(self.half_extents, v0, v1, v2),
            HitCriterion::VertexInside => {
                vertex_inside(self.half_extents, v0)
                    || vertex_inside(self.half_extents, v1)
                    || vertex_inside(self.half_extents, v2)
            }
        }
    }
}

impl Resumable for IntersectionQuery {
    type Output = Vec<[u32; 3]>;

    fn step(&mut self) -> Step<Self::Output> {
        self.phase = match self.phase {
            QueryPhase::Transform { next_vertex } => self.transform_chunk(next_vertex),
            QueryPhase::Test { next_triangle } => self.test_chunk(next_triangle),
            QueryPhase::Done => QueryPhase::Done,
        };
        match self.phase {
            QueryPhase::Done => Step::Ready(std::mem::take(&mut self.results)),
            _ => Step::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{Scheduler, SteppingClock, TickOutcome};
    use glam::Quat;
    use std::time::Duration;

    fn single_triangle(v0: Vec3, v1: Vec3, v2: Vec3) -> SurfaceMesh {
        SurfaceMesh::new(vec![v0, v1, v2], vec![0, 1, 2], Affine3A::IDENTITY).unwrap()
    }

    /// Flat grid in the XY plane at z = 0, two triangles per cell.
    fn grid_mesh(cells_x: u32, cells_y: u32, spacing: f32) -> SurfaceMesh {
        let mut positions = Vec::new();
        for y in 0..=cells_y {
            for x in 0..=cells_x {
                positions.push(Vec3::new(x as f32 * spacing, y as f32 * spacing, 0.0));
            }
        }
        let stride = cells_x + 1;
        let mut indices = Vec::new();
        for y in 0..cells_y {
            for x in 0..cells_x {
                let a = y * stride + x;
                let b = a + 1;
                let c = a + stride;
                let d = c + 1;
                indices.extend_from_slice(&[a, b, d, a, d, c]);
            }
        }
        SurfaceMesh::new(positions, indices, Affine3A::IDENTITY).unwrap()
    }

    #[test]
    fn test_triangle_outside_box_is_rejected() {
        let obb = Obb::axis_aligned(Vec3::ZERO, Vec3::ONE).unwrap();
        let mesh = single_triangle(
            Vec3::new(2.0, 2.0, 2.0),
            Vec3::new(3.0, 2.0, 2.0),
            Vec3::new(2.0, 3.0, 2.0),
        );
        assert!(find_intersecting_triangles(&obb, &mesh).is_empty());
    }

    #[test]
    fn test_triangle_inside_box_is_reported() {
        let obb = Obb::axis_aligned(Vec3::ZERO, Vec3::ONE).unwrap();
        let mesh = single_triangle(
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(0.5, 0.0, 0.0),
            Vec3::new(0.0, 0.5, 0.0),
        );
        assert_eq!(find_intersecting_triangles(&obb, &mesh), vec![[0, 1, 2]]);
    }

    #[test]
    fn test_large_triangle_spanning_box_is_reported() {
        // No vertex is inside, but the triangle slices straight through
        let obb = Obb::axis_aligned(Vec3::ZERO, Vec3::splat(0.5)).unwrap();
        let mesh = single_triangle(
            Vec3::new(-10.0, -10.0, 0.0),
            Vec3::new(10.0, -10.0, 0.0),
            Vec3::new(0.0, 10.0, 0.0),
        );
        assert_eq!(find_intersecting_triangles(&obb, &mesh).len(), 1);
    }

    #[test]
    fn test_touching_face_counts_as_intersecting() {
        let obb = Obb::axis_aligned(Vec3::ZERO, Vec3::ONE).unwrap();
        let mesh = single_triangle(
            Vec3::new(-0.5, -0.5, 1.0),
            Vec3::new(0.5, -0.5, 1.0),
            Vec3::new(0.0, 0.5, 1.0),
        );
        assert_eq!(find_intersecting_triangles(&obb, &mesh).len(), 1);
    }

    #[test]
    fn test_triangle_plane_separates_near_corner() {
        // Triangle hugging the box corner diagonally: every face axis overlaps,
        // but the plane x + y + z = 3.5 passes beyond the corner (1, 1, 1)
        let half = Vec3::ONE;
        let v0 = Vec3::new(3.5, 0.0, 0.0);
        let v1 = Vec3::new(0.0, 3.5, 0.0);
        let v2 = Vec3::new(0.0, 0.0, 3.5);
        assert!(!triangle_box_overlap(half, v0, v1, v2));

        // Pull the plane inward past the corner (x + y + z = 2.9 < 3)
        let s = 2.9;
        assert!(triangle_box_overlap(
            half,
            Vec3::new(s, 0.0, 0.0),
            Vec3::new(0.0, s, 0.0),
            Vec3::new(0.0, 0.0, s)
        ));
    }

    #[test]
    fn test_rotated_box() {
        // 45 degree box around Z reaches sqrt(2) along X
        let rotation = Quat::from_rotation_z(std::f32::consts::FRAC_PI_4);
        let obb = Obb::new(Vec3::ZERO, rotation, Vec3::ONE).unwrap();
        let near = single_triangle(
            Vec3::new(1.3, -0.05, 0.0),
            Vec3::new(1.3, 0.05, 0.0),
            Vec3::new(1.35, 0.0, 0.0),
        );
        let far = single_triangle(
            Vec3::new(1.5, -0.05, 0.0),
            Vec3::new(1.5, 0.05, 0.0),
            Vec3::new(1.55, 0.0, 0.0),
        );
        assert_eq!(find_intersecting_triangles(&obb, &near).len(), 1);
        assert!(find_intersecting_triangles(&obb, &far).is_empty());
    }

    #[test]
    fn test_mesh_transform_is_applied() {
        // Triangle is local-space inside the box but translated far away
        let mesh = SurfaceMesh::new(
            vec![Vec3::ZERO, Vec3::X * 0.5, Vec3::Y * 0.5],
            vec![0, 1, 2],
            Affine3A::from_translation(Vec3::new(100.0, 0.0, 0.0)),
        )
        .unwrap();
        let at_origin = Obb::axis_aligned(Vec3::ZERO, Vec3::ONE).unwrap();
        let at_mesh = Obb::axis_aligned(Vec3::new(100.0, 0.0, 0.0), Vec3::ONE).unwrap();
        assert!(find_intersecting_triangles(&at_origin, &mesh).is_empty());
        assert_eq!(find_intersecting_triangles(&at_mesh, &mesh).len(), 1);
    }

    #[test]
    fn test_broad_phase_miss_returns_empty_without_copy() {
        let mesh = grid_mesh(10, 10, 1.0);
        let obb = Obb::axis_aligned(Vec3::new(0.0, 0.0, 50.0), Vec3::ONE).unwrap();
        let mut query = IntersectionQuery::new(&obb, &mesh);
        assert_eq!(query.triangle_count(), 0);
        assert_eq!(query.step(), Step::Ready(Vec::new()));
    }

    #[test]
    fn test_results_are_subset_of_mesh_triangles() {
        let mesh = grid_mesh(20, 20, 0.5);
        let obb = Obb::new(
            Vec3::new(5.0, 5.0, 0.0),
            Quat::from_rotation_x(0.4),
            Vec3::new(1.5, 0.75, 0.2),
        )
        .unwrap();
        let all: Vec<[u32; 3]> = mesh.triangles().collect();
        let hits = find_intersecting_triangles(&obb, &mesh);
        assert!(!hits.is_empty());
        assert!(hits.len() < all.len());
        for hit in &hits {
            assert!(all.contains(hit));
        }
    }

    #[test]
    fn test_triangles_outside_box_aabb_never_reported() {
        let mesh = grid_mesh(30, 30, 0.25);
        let obb = Obb::new(
            Vec3::new(3.0, 4.0, 0.1),
            Quat::from_euler(glam::EulerRot::XYZ, 0.2, -0.3, 0.9),
            Vec3::new(1.0, 0.4, 0.3),
        )
        .unwrap();
        let box_bounds = obb.world_aabb();
        for [a, b, c] in find_intersecting_triangles(&obb, &mesh) {
            let tri_bounds = Aabb::from_points(
                [a, b, c].map(|i| mesh.world_position(i).unwrap()),
            );
            assert!(tri_bounds.intersects(&box_bounds));
        }
    }

    #[test]
    fn test_unique_vertex_indices_first_seen_order() {
        let unique = unique_vertex_indices(&[[4, 1, 2], [2, 1, 7], [7, 4, 0]]);
        assert_eq!(unique, vec![4, 1, 2, 7, 0]);
        assert!(unique_vertex_indices(&[]).is_empty());
    }

    #[test]
    fn test_vertex_inside_criterion() {
        let obb = Obb::axis_aligned(Vec3::ZERO, Vec3::splat(0.5)).unwrap();
        // Slices the box but has no vertex inside it
        let spanning = single_triangle(
            Vec3::new(-10.0, -10.0, 0.0),
            Vec3::new(10.0, -10.0, 0.0),
            Vec3::new(0.0, 10.0, 0.0),
        );
        let mut query = IntersectionQuery::with_criterion(&obb, &spanning, HitCriterion::VertexInside);
        assert!(run_to_completion(&mut query).is_empty());

        let poking = single_triangle(
            Vec3::new(0.2, 0.2, 0.0),
            Vec3::new(5.0, 0.0, 0.0),
            Vec3::new(0.0, 5.0, 0.0),
        );
        let mut query = IntersectionQuery::with_criterion(&obb, &poking, HitCriterion::VertexInside);
        assert_eq!(run_to_completion(&mut query), vec![[0, 1, 2]]);
    }

    #[test]
    fn test_query_phases_advance_in_chunks() {
        let mesh = grid_mesh(4, 4, 1.0); // 25 vertices, 32 triangles
        let obb = Obb::axis_aligned(Vec3::new(2.0, 2.0, 0.0), Vec3::ONE).unwrap();
        let mut query = IntersectionQuery::new(&obb, &mesh).with_step_sizes(10, 16);

        assert_eq!(query.step(), Step::Pending);
        assert_eq!(query.phase(), QueryPhase::Transform { next_vertex: 10 });
        assert_eq!(query.step(), Step::Pending);
        assert_eq!(query.step(), Step::Pending);
        assert_eq!(query.phase(), QueryPhase::Test { next_triangle: 0 });
        assert_eq!(query.step(), Step::Pending);
        assert_eq!(query.phase(), QueryPhase::Test { next_triangle: 16 });
        assert!(matches!(query.step(), Step::Ready(hits) if !hits.is_empty()));
        assert_eq!(query.phase(), QueryPhase::Done);
    }

    #[test]
    fn test_budgeted_run_matches_unbudgeted_on_large_mesh() {
        // 250 x 200 cells = 100,000 triangles
        let mesh = grid_mesh(250, 200, 0.1);
        assert_eq!(mesh.triangle_count(), 100_000);
        let obb = Obb::new(
            Vec3::new(12.0, 10.0, 0.0),
            Quat::from_rotation_z(0.5),
            Vec3::new(4.0, 2.0, 0.05),
        )
        .unwrap();

        let expected = find_intersecting_triangles(&obb, &mesh);
        assert!(!expected.is_empty());

        // Every clock reading costs 1ms against a 4ms budget
        let scheduler = Scheduler::with_clock(
            SteppingClock::new(Duration::from_millis(1)),
            Duration::from_millis(4),
        );
        let mut query = IntersectionQuery::new(&obb, &mesh);
        let mut resumptions = 0;
        let budgeted = loop {
            match scheduler.tick(&mut query) {
                TickOutcome::Complete { output, .. } => break output,
                TickOutcome::Yielded { .. } => resumptions += 1,
            }
        };

        assert!(resumptions > 1);
        assert_eq!(budgeted, expected);
    }

    #[test]
    fn test_wall_clock_budget_matches_unbudgeted() {
        let mesh = grid_mesh(250, 200, 0.1);
        let obb = Obb::axis_aligned(Vec3::new(5.0, 5.0, 0.0), Vec3::new(2.0, 2.0, 0.1)).unwrap();
        let expected = find_intersecting_triangles(&obb, &mesh);

        let scheduler = Scheduler::new(Duration::from_millis(4));
        let mut query = IntersectionQuery::new(&obb, &mesh);
        let budgeted = loop {
            if let TickOutcome::Complete { output, .. } = scheduler.tick(&mut query) {
                break output;
            }
        };
        assert_eq!(budgeted, expected);
    }
}
