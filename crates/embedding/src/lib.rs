//! Surface embedding engine.
//!
//! This crate seats objects into scanned environment meshes by pushing the
//! surface back wherever an object's box intersects it:
//! - Exact OBB vs. triangle mesh intersection (separating axis theorem)
//! - Plane projection of the affected vertices onto the object's back plane
//! - Per-mesh margin memoization so repeated requests become no-ops
//! - A FIFO work queue advanced cooperatively within a per-frame time budget
//!
//! # Architecture
//!
//! Nothing here blocks the host frame loop. Long work is expressed as
//! [`Resumable`](scheduler::Resumable) state objects that a
//! [`Scheduler`](scheduler::Scheduler) advances in coarse steps until the
//! frame budget is spent. Meshes are owned by the host and shared as
//! `Rc<RefCell<_>>` handles, so the engine runs on the host's main thread only.
//!
//! ## Key Components
//!
//! - **Obb / Mesh**: Geometry value types and host-owned surface meshes
//! - **Intersection**: Broad phase plus 13-axis triangle/box test, resumable
//! - **Scheduler**: Time-budgeted execution of resumable work
//! - **Margin**: Memo of depth already cleared per mesh (or per region)
//! - **Projector**: Vertex projection onto a plane
//! - **Queue**: Orchestrates request → query → project → margin update
//! - **Patch / Undo**: Optional snapshots of geometry before it is displaced
//! - **Volume**: Margin volumes derived from object boxes and surface planes

pub mod error;
pub mod intersection;
pub mod margin;
pub mod mesh;
pub mod obb;
pub mod patch;
pub mod projector;
pub mod queue;
pub mod scheduler;
pub mod undo;
pub mod volume;

#[cfg(feature = "bevy")]
mod bevy_mesh;

pub use embedding_config::{DeformationConfig, MarginMode, ProjectionMode};
pub use error::{DegenerateKind, EmbedError, MeshError};
pub use intersection::{find_intersecting_triangles, HitCriterion, IntersectionQuery};
pub use margin::{MarginTracker, MeshMarginTracker, RegionMarginTracker};
pub use mesh::{Aabb, MeshCollection, MeshHandle, MeshId, SurfaceMesh};
pub use obb::Obb;
pub use patch::PatchMesh;
pub use projector::{project_vertices, ColliderSync, NoColliderSync, Plane, ProjectionReport};
pub use queue::{
    DeformationContext, DeformationQueue, DeformationRequest, EmbedReport, RequestId, RequestKind,
};
pub use scheduler::{Clock, MonotonicClock, Resumable, Scheduler, Step, SteppingClock, TickOutcome};
pub use undo::{RestoreReport, UndoEntry, UndoId, UndoLog};
pub use volume::{EmbeddedObject, MarginVolume, ObjectVolume, SurfacePlane};
