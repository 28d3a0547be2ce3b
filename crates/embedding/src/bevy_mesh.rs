//! Conversion between surface meshes and Bevy meshes.
//!
//! Positions cross the boundary as `[f32; 3]` arrays so the engine's math
//! types never need to match the host's glam version.

use bevy::asset::RenderAssetUsages;
use bevy::mesh::{Indices, Mesh, PrimitiveTopology};
use glam::{Affine3A, Vec3};

use crate::error::MeshError;
use crate::mesh::SurfaceMesh;

impl SurfaceMesh {
    /// Build a surface mesh from a Bevy triangle-list mesh placed by
    /// `transform`.
    ///
    /// The mesh must have position attributes and indices. Normals are copied
    /// when present.
    pub fn from_bevy_mesh(mesh: &Mesh, transform: Affine3A) -> Result<Self, MeshError> {
        let positions: Vec<Vec3> = mesh
            .attribute(Mesh::ATTRIBUTE_POSITION)
            .and_then(|attr| attr.as_float3())
            .ok_or(MeshError::NoPositions)?
            .iter()
            .map(|&p| Vec3::from_array(p))
            .collect();

        let normals: Option<Vec<Vec3>> = mesh
            .attribute(Mesh::ATTRIBUTE_NORMAL)
            .and_then(|attr| attr.as_float3())
            .map(|n| n.iter().map(|&v| Vec3::from_array(v)).collect());

        let indices: Vec<u32> = match mesh.indices() {
            Some(Indices::U16(idx)) => idx.iter().map(|&i| i as u32).collect(),
            Some(Indices::U32(idx)) => idx.to_vec(),
            None => return Err(MeshError::NoIndices),
        };

        let surface = SurfaceMesh::new(positions, indices, transform)?;
        match normals {
            Some(normals) => surface.with_normals(normals),
            None => Ok(surface),
        }
    }

    /// Build a Bevy mesh from this surface (mesh-local positions).
    pub fn to_bevy_mesh(&self) -> Mesh {
        let positions: Vec<[f32; 3]> = self.positions().iter().map(|p| p.to_array()).collect();
        let mut mesh = Mesh::new(
            PrimitiveTopology::TriangleList,
            RenderAssetUsages::default(),
        );
        mesh.insert_attribute(Mesh::ATTRIBUTE_POSITION, positions);
        if let Some(normals) = self.normals() {
            let normals: Vec<[f32; 3]> = normals.iter().map(|n| n.to_array()).collect();
            mesh.insert_attribute(Mesh::ATTRIBUTE_NORMAL, normals);
        }
        mesh.insert_indices(Indices::U32(self.indices().to_vec()));
        mesh
    }

    /// Push deformed positions (and the current triangle list) back into the
    /// Bevy mesh this surface was built from.
    pub fn write_positions_to_bevy_mesh(&self, mesh: &mut Mesh) {
        let positions: Vec<[f32; 3]> = self.positions().iter().map(|p| p.to_array()).collect();
        mesh.insert_attribute(Mesh::ATTRIBUTE_POSITION, positions);
        mesh.insert_indices(Indices::U32(self.indices().to_vec()));
    }
}
