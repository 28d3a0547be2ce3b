//! Surface meshes owned by the host and the collection the engine binds to.
//!
//! A [`SurfaceMesh`] is an indexed triangle list with a mesh-to-world
//! transform and cached world-space bounds. The host owns meshes through
//! [`MeshHandle`]s; the engine only keeps weak references in a
//! [`MeshCollection`] so a mesh dropped by its owner shows up as stale
//! instead of being kept alive.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use glam::{Affine3A, Vec3};
use serde::{Deserialize, Serialize};

use crate::error::MeshError;

static NEXT_MESH_ID: AtomicU64 = AtomicU64::new(1);

/// Stable identity of a surface mesh for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MeshId(pub u64);

impl MeshId {
    fn next() -> Self {
        MeshId(NEXT_MESH_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Shared, single-threaded ownership of a surface mesh.
pub type MeshHandle = Rc<RefCell<SurfaceMesh>>;

/// Axis-aligned bounding box for broad-phase queries.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    /// Create a new AABB from min/max corners.
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Create an AABB that contains nothing (for accumulation).
    pub fn empty() -> Self {
        Self {
            min: Vec3::splat(f32::MAX),
            max: Vec3::splat(f32::MIN),
        }
    }

    /// Smallest AABB containing every point.
    pub fn from_points(points: impl IntoIterator<Item = Vec3>) -> Self {
        let mut bounds = Self::empty();
        for point in points {
            bounds.include_point(point);
        }
        bounds
    }

    /// Whether no point has been accumulated yet.
    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z
    }

    /// Expand this AABB to include a point.
    pub fn include_point(&mut self, point: Vec3) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }

    /// Overlap test, inclusive of touching faces.
    pub fn intersects(&self, other: &Aabb) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
            && self.min.z <= other.max.z
            && self.max.z >= other.min.z
    }

    /// Check if this AABB contains a point.
    pub fn contains_point(&self, point: Vec3) -> bool {
        point.x >= self.min.x
            && point.x <= self.max.x
            && point.y >= self.min.y
            && point.y <= self.max.y
            && point.z >= self.min.z
            && point.z <= self.max.z
    }

    /// Get the center of this AABB.
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Get the size (extent) of this AABB.
    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }
}

/// A triangulated surface with a mutable vertex buffer.
///
/// Invariant: every index references a valid vertex slot. Vertices are never
/// removed, only moved, so removing triangles keeps the invariant.
#[derive(Debug, Clone)]
pub struct SurfaceMesh {
    id: MeshId,
    positions: Vec<Vec3>,
    normals: Option<Vec<Vec3>>,
    indices: Vec<u32>,
    transform: Affine3A,
    world_to_mesh: Affine3A,
    /// World-space bounds of all vertices
    bounds: Aabb,
    /// Bumped on every geometry or transform write
    revision: u64,
}

impl SurfaceMesh {
    /// Build a mesh from mesh-local positions, a triangle index list, and a
    /// mesh-to-world transform.
    pub fn new(
        positions: Vec<Vec3>,
        indices: Vec<u32>,
        transform: Affine3A,
    ) -> Result<Self, MeshError> {
        validate_indices(&indices, positions.len())?;
        let world_to_mesh = invert_transform(&transform)?;

        let mut mesh = Self {
            id: MeshId::next(),
            positions,
            normals: None,
            indices,
            transform,
            world_to_mesh,
            bounds: Aabb::empty(),
            revision: 0,
        };
        mesh.recalculate_bounds();
        Ok(mesh)
    }

    /// Attach per-vertex normals (one per position).
    pub fn with_normals(mut self, normals: Vec<Vec3>) -> Result<Self, MeshError> {
        if normals.len() != self.positions.len() {
            return Err(MeshError::NormalCountMismatch {
                normals: normals.len(),
                vertices: self.positions.len(),
            });
        }
        self.normals = Some(normals);
        Ok(self)
    }

    /// Wrap this mesh in a shared handle.
    pub fn into_handle(self) -> MeshHandle {
        Rc::new(RefCell::new(self))
    }

    pub fn id(&self) -> MeshId {
        self.id
    }

    /// Mesh-local vertex positions.
    pub fn positions(&self) -> &[Vec3] {
        &self.positions
    }

    pub fn normals(&self) -> Option<&[Vec3]> {
        self.normals.as_deref()
    }

    /// Flat triangle index list (3 per triangle).
    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    pub fn transform(&self) -> &Affine3A {
        &self.transform
    }

    /// Inverse of [`transform`](Self::transform), cached.
    pub fn world_to_mesh(&self) -> &Affine3A {
        &self.world_to_mesh
    }

    /// Cached world-space bounds.
    pub fn bounds(&self) -> Aabb {
        self.bounds
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Get the vertex indices for a triangle.
    pub fn triangle(&self, tri_index: usize) -> [u32; 3] {
        let base = tri_index * 3;
        [
            self.indices[base],
            self.indices[base + 1],
            self.indices[base + 2],
        ]
    }

    /// Iterate all triangles as index triples.
    pub fn triangles(&self) -> impl Iterator<Item = [u32; 3]> + '_ {
        self.indices.chunks_exact(3).map(|t| [t[0], t[1], t[2]])
    }

    /// World-space position of a vertex.
    pub fn world_position(&self, index: u32) -> Option<Vec3> {
        self.positions
            .get(index as usize)
            .map(|&p| self.transform.transform_point3(p))
    }

    /// Replace the mesh-to-world transform and refresh cached bounds.
    pub fn set_transform(&mut self, transform: Affine3A) -> Result<(), MeshError> {
        self.world_to_mesh = invert_transform(&transform)?;
        self.transform = transform;
        self.recalculate_bounds();
        self.revision += 1;
        Ok(())
    }

    /// Overwrite a single mesh-local vertex position.
    ///
    /// Bounds are not refreshed; call [`recalculate_bounds`](Self::recalculate_bounds)
    /// once after a batch of writes.
    pub fn set_position(&mut self, index: u32, position: Vec3) -> bool {
        match self.positions.get_mut(index as usize) {
            Some(slot) => {
                *slot = position;
                self.revision += 1;
                true
            }
            None => false,
        }
    }

    /// Recompute the cached world-space bounds from every vertex.
    pub fn recalculate_bounds(&mut self) {
        let transform = self.transform;
        self.bounds = Aabb::from_points(
            self.positions
                .iter()
                .map(|&p| transform.transform_point3(p)),
        );
    }

    /// Drop every triangle for which `keep` returns false.
    ///
    /// Returns the number of triangles removed.
    pub fn retain_triangles(&mut self, mut keep: impl FnMut([u32; 3]) -> bool) -> usize {
        let before = self.triangle_count();
        let kept: Vec<u32> = self
            .indices
            .chunks_exact(3)
            .filter(|t| keep([t[0], t[1], t[2]]))
            .flatten()
            .copied()
            .collect();
        self.indices = kept;
        let removed = before - self.triangle_count();
        if removed > 0 {
            self.revision += 1;
        }
        removed
    }

    /// Raw position bytes for uploading the vertex buffer to the host.
    pub fn position_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.positions)
    }

    /// Raw index bytes for uploading the index buffer to the host.
    pub fn index_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.indices)
    }
}

fn validate_indices(indices: &[u32], vertex_count: usize) -> Result<(), MeshError> {
    if indices.len() % 3 != 0 {
        return Err(MeshError::IndexCountNotTriangles(indices.len()));
    }
    if let Some((slot, &index)) = indices
        .iter()
        .enumerate()
        .find(|&(_, &i)| i as usize >= vertex_count)
    {
        return Err(MeshError::IndexOutOfRange {
            slot,
            index,
            vertex_count,
        });
    }
    Ok(())
}

fn invert_transform(transform: &Affine3A) -> Result<Affine3A, MeshError> {
    let det = transform.matrix3.determinant();
    if !det.is_finite() || det.abs() < 1e-12 || !transform.translation.is_finite() {
        return Err(MeshError::SingularTransform);
    }
    Ok(transform.inverse())
}

/// The set of candidate meshes a work queue deforms.
///
/// Order is fixed at binding time and defines the visiting order of every
/// request.
#[derive(Debug, Clone, Default)]
pub struct MeshCollection {
    meshes: Vec<Weak<RefCell<SurfaceMesh>>>,
}

impl MeshCollection {
    /// Create an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a collection to the given handles, in order.
    pub fn from_handles<'a>(handles: impl IntoIterator<Item = &'a MeshHandle>) -> Self {
        Self {
            meshes: handles.into_iter().map(Rc::downgrade).collect(),
        }
    }

    /// Append a mesh to the end of the visiting order.
    pub fn push(&mut self, handle: &MeshHandle) {
        self.meshes.push(Rc::downgrade(handle));
    }

    /// Number of bound slots, including stale ones.
    pub fn len(&self) -> usize {
        self.meshes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.meshes.is_empty()
    }

    /// Upgrade the mesh in a slot; `None` if its owner dropped it.
    pub fn get(&self, slot: usize) -> Option<MeshHandle> {
        self.meshes.get(slot).and_then(Weak::upgrade)
    }

    /// Identities of the meshes that are still alive.
    pub fn live_ids(&self) -> Vec<MeshId> {
        self.meshes
            .iter()
            .filter_map(Weak::upgrade)
            .map(|handle| handle.borrow().id())
            .collect()
    }

    /// Number of slots whose mesh was dropped.
    pub fn stale_count(&self) -> usize {
        self.meshes.iter().filter(|m| m.strong_count() == 0).count()
    }
}
