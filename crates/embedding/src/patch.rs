//! Snapshots of surface regions taken just before they are displaced.
//!
//! A patch is an independent copy: later edits to the source mesh never
//! reach it and it is never merged back.

use std::collections::HashMap;

use glam::{Affine3A, Vec3};

use crate::error::MeshError;
use crate::mesh::{Aabb, MeshId, SurfaceMesh};

/// Copy of a deformed region in its pre-deformation state.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchMesh {
    source: MeshId,
    transform: Affine3A,
    positions: Vec<Vec3>,
    normals: Option<Vec<Vec3>>,
    /// Triangles remapped to patch-local vertex indices
    indices: Vec<u32>,
}

impl PatchMesh {
    /// Capture `triangles` of `mesh` together with the vertices in
    /// `vertices` (the unique vertex set of those triangles).
    ///
    /// Triangles referencing a vertex outside the set are left out.
    pub fn capture(mesh: &SurfaceMesh, triangles: &[[u32; 3]], vertices: &[u32]) -> Self {
        let mut remap: HashMap<u32, u32> = HashMap::with_capacity(vertices.len());
        let mut positions = Vec::with_capacity(vertices.len());
        let mut normals = mesh.normals().map(|_| Vec::with_capacity(vertices.len()));

        for &index in vertices {
            let Some(&position) = mesh.positions().get(index as usize) else {
                continue;
            };
            if remap.contains_key(&index) {
                continue;
            }
            remap.insert(index, positions.len() as u32);
            positions.push(position);
            if let (Some(out), Some(source)) = (normals.as_mut(), mesh.normals()) {
                out.push(source[index as usize]);
            }
        }

        let mut indices = Vec::with_capacity(triangles.len() * 3);
        for triangle in triangles {
            let mapped = [
                remap.get(&triangle[0]),
                remap.get(&triangle[1]),
                remap.get(&triangle[2]),
            ];
            if let [Some(&a), Some(&b), Some(&c)] = mapped {
                indices.extend_from_slice(&[a, b, c]);
            }
        }

        Self {
            source: mesh.id(),
            transform: *mesh.transform(),
            positions,
            normals,
            indices,
        }
    }

    /// Mesh the patch was taken from.
    pub fn source(&self) -> MeshId {
        self.source
    }

    pub fn transform(&self) -> &Affine3A {
        &self.transform
    }

    pub fn positions(&self) -> &[Vec3] {
        &self.positions
    }

    pub fn normals(&self) -> Option<&[Vec3]> {
        self.normals.as_deref()
    }

    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// World-space bounds of the captured vertices.
    pub fn bounds(&self) -> Aabb {
        let transform = self.transform;
        Aabb::from_points(self.positions.iter().map(|&p| transform.transform_point3(p)))
    }

    /// Turn the patch into a standalone mesh with a fresh identity.
    pub fn into_surface_mesh(self) -> Result<SurfaceMesh, MeshError> {
        let mesh = SurfaceMesh::new(self.positions, self.indices, self.transform)?;
        match self.normals {
            Some(normals) => mesh.with_normals(normals),
            None => Ok(mesh),
        }
    }
}
