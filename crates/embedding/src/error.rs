//! Error types for the embedding engine.
//!
//! Every error here is local: a problem with one mesh or one request never
//! aborts processing of other meshes or queued requests.

use crate::mesh::MeshId;

/// Which piece of geometry was unusable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DegenerateKind {
    /// Front and back plane points coincide, so there is no displacement normal
    #[error("zero-length plane normal")]
    ZeroLengthNormal,
    /// A box half-extent is zero, negative, or not finite
    #[error("zero, negative or non-finite box extents")]
    InvalidExtents,
    /// A position, rotation, or plane coefficient is NaN or infinite
    #[error("non-finite coordinates")]
    NonFinite,
    /// A mesh-to-world transform cannot be inverted
    #[error("non-invertible transform")]
    SingularTransform,
}

/// Errors surfaced by the deformation work queue and its collaborators.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EmbedError {
    #[error("Embedded object `{object}` lacks a usable bounding volume")]
    MissingBoundingVolume { object: String },
    #[error("Degenerate geometry: {0}")]
    DegenerateGeometry(DegenerateKind),
    #[error("Mesh {0:?} was destroyed by its owner")]
    StaleMeshReference(MeshId),
}

/// Errors raised while building or editing a [`SurfaceMesh`](crate::mesh::SurfaceMesh).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MeshError {
    #[error("Index count {0} is not divisible by 3")]
    IndexCountNotTriangles(usize),
    #[error("Index {index} at slot {slot} is out of range for {vertex_count} vertices")]
    IndexOutOfRange {
        slot: usize,
        index: u32,
        vertex_count: usize,
    },
    #[error("Normal count {normals} does not match vertex count {vertices}")]
    NormalCountMismatch { normals: usize, vertices: usize },
    #[error("Mesh transform is not invertible")]
    SingularTransform,
    #[error("Mesh has no position attribute")]
    NoPositions,
    #[error("Mesh has no indices")]
    NoIndices,
}
