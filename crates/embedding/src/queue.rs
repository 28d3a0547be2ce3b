//! Deformation work queue.
//!
//! Requests are processed first in, first out, one at a time. Each request
//! visits every bound mesh in order: skip it if its margin already covers the
//! request or its bounds miss the box, otherwise find the intersecting
//! triangles cooperatively and push their vertices onto the back plane.
//!
//! The queue is itself a [`Resumable`]: [`DeformationQueue::update`] advances
//! it within the scheduler's frame budget and returns to the host loop. Each
//! step either starts a request, prepares one mesh, advances one mesh query by
//! one coarse step, or completes a request, so mesh data is consistent at
//! every suspension point.

use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};
use std::time::Instant;

use embedding_config::{DeformationConfig, MarginMode};
use glam::Vec3;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::error::EmbedError;
use crate::intersection::{
    broad_phase_overlaps, unique_vertex_indices, HitCriterion, IntersectionQuery,
};
use crate::margin::{MarginTracker, MeshMarginTracker, RegionMarginTracker};
use crate::mesh::{MeshCollection, SurfaceMesh};
use crate::obb::Obb;
use crate::patch::PatchMesh;
use crate::projector::{project_vertices, ColliderSync, NoColliderSync, Plane};
use crate::scheduler::{Clock, Resumable, Scheduler, Step, TickOutcome};
use crate::undo::{RestoreReport, UndoLog};
use crate::volume::{EmbeddedObject, MarginVolume, SurfacePlane};

/// Times a mesh query is restarted because the host edited the mesh while
/// the query was suspended, before the mesh is given up on for the request.
pub const MAX_QUERY_RESTARTS: usize = 3;

/// Identifier assigned to a request when it is enqueued.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct RequestId(pub u64);

/// Called once when a request has visited every mesh.
pub type CompletionCallback = Box<dyn FnOnce(EmbedReport)>;

/// What a request does to the triangles it finds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// Project intersecting vertices onto the back plane
    #[default]
    Embed,
    /// Delete every triangle with a vertex inside the box
    RemoveTriangles,
}

/// Summary handed to a request's completion callback.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbedReport {
    pub request: RequestId,
    pub kind: RequestKind,
    /// Label of the embedded object
    pub object: String,
    pub meshes_visited: usize,
    pub meshes_deformed: usize,
    /// Skipped because an earlier request already cleared enough depth
    pub meshes_skipped_margin: usize,
    /// Skipped because the mesh bounds miss the box
    pub meshes_skipped_bounds: usize,
    /// Dropped by their owner before or during processing
    pub meshes_stale: usize,
    /// Left undeformed because the host kept editing them mid-query
    pub meshes_abandoned: usize,
    pub triangles_hit: usize,
    pub vertices_written: usize,
    pub triangles_removed: usize,
    pub query_restarts: usize,
}

/// An object to embed (or a region to clear) plus its completion callback.
pub struct DeformationRequest {
    kind: RequestKind,
    object: Box<dyn EmbeddedObject>,
    front: Vec3,
    back: Vec3,
    on_complete: Option<CompletionCallback>,
}

impl DeformationRequest {
    /// Push every surface intersecting `object` onto the plane through `back`
    /// whose normal points from `front` to `back`.
    pub fn new(object: impl EmbeddedObject + 'static, front: Vec3, back: Vec3) -> Self {
        Self {
            kind: RequestKind::Embed,
            object: Box::new(object),
            front,
            back,
            on_complete: None,
        }
    }

    /// Embed request taking its box and plane points from a margin volume.
    pub fn from_volume(volume: MarginVolume) -> Self {
        let (front, back) = (volume.front(), volume.back());
        Self::new(volume, front, back)
    }

    /// Delete every triangle that has a vertex inside `object`'s box.
    pub fn removal(object: impl EmbeddedObject + 'static) -> Self {
        Self {
            kind: RequestKind::RemoveTriangles,
            object: Box::new(object),
            front: Vec3::ZERO,
            back: Vec3::ZERO,
            on_complete: None,
        }
    }

    /// Run `callback` with the request's report once it has visited every
    /// mesh.
    ///
    /// Callbacks run after the queue's update step has released the queue. A
    /// host sharing the queue as `Rc<RefCell<_>>` should drive it with
    /// [`DeformationQueue::update_shared`] so a callback may enqueue
    /// follow-up requests.
    pub fn on_complete(mut self, callback: impl FnOnce(EmbedReport) + 'static) -> Self {
        self.on_complete = Some(Box::new(callback));
        self
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }
}

impl std::fmt::Debug for DeformationRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeformationRequest")
            .field("kind", &self.kind)
            .field("object", &self.object.label())
            .field("front", &self.front)
            .field("back", &self.back)
            .field("has_callback", &self.on_complete.is_some())
            .finish()
    }
}

/// Collaborators shared by every request the queue processes.
pub struct DeformationContext {
    pub config: DeformationConfig,
    pub margins: Box<dyn MarginTracker>,
    pub collider: Box<dyn ColliderSync>,
    pub undo: UndoLog,
    pub patches: Vec<PatchMesh>,
}

impl DeformationContext {
    /// Context with the margin tracker chosen by `config.margin_mode`.
    pub fn new(config: DeformationConfig) -> Self {
        let margins: Box<dyn MarginTracker> = match config.margin_mode {
            MarginMode::PerMesh => Box::new(MeshMarginTracker::new()),
            MarginMode::PerRegion { cell_size } => Box::new(RegionMarginTracker::new(cell_size)),
        };
        let undo = UndoLog::with_max_entries(config.max_undo_entries);
        Self {
            config,
            margins,
            collider: Box::new(NoColliderSync),
            undo,
            patches: Vec::new(),
        }
    }
}

/// A validated request waiting in the queue.
struct Job {
    id: RequestId,
    kind: RequestKind,
    label: String,
    obb: Obb,
    /// Back plane, required depth, and back point (embed requests only)
    target: Option<(Plane, f32, Vec3)>,
    on_complete: Option<CompletionCallback>,
}

/// A mesh whose intersection query is in flight.
struct MeshWork {
    slot: usize,
    query: IntersectionQuery,
    restarts: usize,
    started: Instant,
}

/// The request being processed.
struct ActiveJob {
    job: Job,
    /// Candidate meshes as bound when the request started
    meshes: MeshCollection,
    next_slot: usize,
    current: Option<MeshWork>,
    report: EmbedReport,
    started: Instant,
}

/// FIFO queue of deformation requests driven by a cooperative scheduler.
pub struct DeformationQueue {
    context: DeformationContext,
    meshes: MeshCollection,
    pending: VecDeque<Job>,
    active: Option<ActiveJob>,
    /// Completed requests whose callbacks have not run yet
    finished: Vec<(CompletionCallback, EmbedReport)>,
    next_request: u64,
}

impl DeformationQueue {
    pub fn new(config: DeformationConfig) -> Self {
        Self::with_context(DeformationContext::new(config))
    }

    pub fn with_context(context: DeformationContext) -> Self {
        Self {
            context,
            meshes: MeshCollection::new(),
            pending: VecDeque::new(),
            active: None,
            finished: Vec::new(),
            next_request: 1,
        }
    }

    /// Replace the margin tracker (drops all recorded margins).
    pub fn with_margin_tracker(mut self, margins: Box<dyn MarginTracker>) -> Self {
        self.context.margins = margins;
        self
    }

    /// Install the host's collider rebuild hook.
    pub fn with_collider_sync(mut self, collider: Box<dyn ColliderSync>) -> Self {
        self.context.collider = collider;
        self
    }

    pub fn config(&self) -> &DeformationConfig {
        &self.context.config
    }

    pub fn margins(&self) -> &dyn MarginTracker {
        self.context.margins.as_ref()
    }

    pub fn undo_log(&self) -> &UndoLog {
        &self.context.undo
    }

    pub fn meshes(&self) -> &MeshCollection {
        &self.meshes
    }

    /// Bind the candidate meshes for subsequent requests.
    ///
    /// Margins of meshes that stay bound are kept; the rest are dropped. A
    /// request already in progress finishes against the meshes it started
    /// with.
    pub fn set_meshes(&mut self, meshes: MeshCollection) {
        let live: HashSet<_> = meshes.live_ids().into_iter().collect();
        self.context.margins.retain(&|mesh| live.contains(&mesh));
        debug!(
            "Bound {} meshes ({} already dropped, {} margins kept)",
            meshes.len(),
            meshes.stale_count(),
            self.context.margins.len()
        );
        self.meshes = meshes;
    }

    /// Validate and enqueue a request.
    ///
    /// Requests without a bounding volume or with coincident plane points are
    /// rejected here and never queued.
    pub fn embed(&mut self, request: DeformationRequest) -> Result<RequestId, EmbedError> {
        let label = request.object.label().to_string();
        let Some(obb) = request.object.bounding_volume() else {
            warn!("Rejecting request: `{}` has no bounding volume", label);
            return Err(EmbedError::MissingBoundingVolume { object: label });
        };

        let target = match request.kind {
            RequestKind::Embed => match Plane::from_front_back(request.front, request.back) {
                Ok((plane, depth)) => Some((plane, depth, request.back)),
                Err(err) => {
                    warn!("Rejecting request for `{}`: {}", label, err);
                    return Err(err);
                }
            },
            RequestKind::RemoveTriangles => None,
        };

        let id = RequestId(self.next_request);
        self.next_request += 1;
        debug!(
            "Queued {:?} ({:?}) for `{}`, {} pending",
            id,
            request.kind,
            label,
            self.pending.len() + 1
        );
        self.pending.push_back(Job {
            id,
            kind: request.kind,
            label,
            obb,
            target,
            on_complete: request.on_complete,
        });
        Ok(id)
    }

    /// Enqueue an embed request for a margin volume.
    pub fn embed_volume(&mut self, volume: MarginVolume) -> Result<RequestId, EmbedError> {
        self.embed(DeformationRequest::from_volume(volume))
    }

    /// Clear the region directly behind `object`, one object thickness plus
    /// the configured extra displacement deep.
    pub fn embed_behind(
        &mut self,
        label: impl Into<String>,
        object: &Obb,
        pivot: Vec3,
    ) -> Result<RequestId, EmbedError> {
        let volume = MarginVolume::behind_object(
            label,
            object,
            pivot,
            self.context.config.extra_displacement,
        )?;
        self.embed_volume(volume)
    }

    /// Recess the whole of `plane` behind `object`, one object thickness
    /// plus the configured extra displacement deep.
    pub fn embed_on_plane(
        &mut self,
        label: impl Into<String>,
        object: &Obb,
        pivot: Vec3,
        plane: &SurfacePlane,
    ) -> Result<RequestId, EmbedError> {
        let volume = MarginVolume::for_surface_plane(
            label,
            object,
            pivot,
            plane,
            self.context.config.extra_displacement,
        )?;
        self.embed_volume(volume)
    }

    /// Enqueue removal of every triangle with a vertex inside `object`.
    pub fn remove_within(
        &mut self,
        object: impl EmbeddedObject + 'static,
    ) -> Result<RequestId, EmbedError> {
        self.embed(DeformationRequest::removal(object))
    }

    /// Advance queued work within the scheduler's budget, then run the
    /// callbacks of requests that completed.
    ///
    /// `Complete` means the queue drained during this call.
    pub fn update<C: Clock>(&mut self, scheduler: &Scheduler<C>) -> TickOutcome<()> {
        let outcome = scheduler.tick(self);
        for (callback, report) in self.take_finished() {
            callback(report);
        }
        outcome
    }

    /// Like [`update`](Self::update) for a queue shared as a `RefCell`.
    ///
    /// The borrow is released before callbacks run, so they may enqueue more
    /// work on the same queue. Such work turns a `Complete` outcome into
    /// `Yielded`.
    pub fn update_shared<C: Clock>(
        queue: &RefCell<Self>,
        scheduler: &Scheduler<C>,
    ) -> TickOutcome<()> {
        let (outcome, finished) = {
            let mut queue = queue.borrow_mut();
            let outcome = scheduler.tick(&mut *queue);
            (outcome, queue.take_finished())
        };
        for (callback, report) in finished {
            callback(report);
        }
        match outcome {
            TickOutcome::Complete { steps, .. } if !queue.borrow().is_idle() => {
                TickOutcome::Yielded { steps }
            }
            outcome => outcome,
        }
    }

    fn take_finished(&mut self) -> Vec<(CompletionCallback, EmbedReport)> {
        std::mem::take(&mut self.finished)
    }

    /// Drop a request that has not started. Its callback is not invoked.
    pub fn discard_pending(&mut self, id: RequestId) -> bool {
        let before = self.pending.len();
        self.pending.retain(|job| job.id != id);
        let discarded = self.pending.len() < before;
        if discarded {
            debug!("Discarded {:?}", id);
        }
        discarded
    }

    /// Drop every request that has not started. Returns how many.
    pub fn clear_pending(&mut self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        count
    }

    /// Restore the most recent undo entry and forget that mesh's margin.
    pub fn undo_last(&mut self) -> Result<Option<RestoreReport>, EmbedError> {
        match self.context.undo.restore_last() {
            Ok(Some(report)) => {
                self.context.margins.forget(report.mesh_id);
                Ok(Some(report))
            }
            Err(EmbedError::StaleMeshReference(mesh)) => {
                self.context.margins.forget(mesh);
                Err(EmbedError::StaleMeshReference(mesh))
            }
            other => other,
        }
    }

    /// No request queued or in progress.
    pub fn is_idle(&self) -> bool {
        self.active.is_none() && self.pending.is_empty()
    }

    /// Requests waiting to start.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn active_request(&self) -> Option<RequestId> {
        self.active.as_ref().map(|active| active.job.id)
    }

    pub fn patches(&self) -> &[PatchMesh] {
        &self.context.patches
    }

    pub fn take_patches(&mut self) -> Vec<PatchMesh> {
        std::mem::take(&mut self.context.patches)
    }

    fn start(&mut self, job: Job) {
        debug!(
            "Processing {:?} for `{}` against {} meshes",
            job.id,
            job.label,
            self.meshes.len()
        );
        let report = EmbedReport {
            request: job.id,
            kind: job.kind,
            object: job.label.clone(),
            ..Default::default()
        };
        self.active = Some(ActiveJob {
            job,
            meshes: self.meshes.clone(),
            next_slot: 0,
            current: None,
            report,
            started: Instant::now(),
        });
    }

    fn complete(&mut self, active: ActiveJob) {
        let ActiveJob {
            job,
            report,
            started,
            ..
        } = active;
        debug!(
            "Completed {:?}: {} of {} meshes deformed, {} vertices, {} triangles removed in {:?}",
            job.id,
            report.meshes_deformed,
            report.meshes_visited,
            report.vertices_written,
            report.triangles_removed,
            started.elapsed()
        );
        if let Some(callback) = job.on_complete {
            self.finished.push((callback, report));
        }
    }
}

/// Decide whether a mesh needs a query and start one if so.
fn begin_mesh(context: &DeformationContext, active: &mut ActiveJob, slot: usize) {
    active.report.meshes_visited += 1;
    let Some(handle) = active.meshes.get(slot) else {
        warn!("Mesh slot {} was destroyed, skipping", slot);
        active.report.meshes_stale += 1;
        return;
    };
    let mesh = handle.borrow();

    let criterion = match active.job.target {
        Some((_, depth, back)) => {
            if context.margins.has_sufficient_margin(mesh.id(), back, depth) {
                trace!("{:?}: margin covers depth {}", mesh.id(), depth);
                active.report.meshes_skipped_margin += 1;
                return;
            }
            HitCriterion::Overlap
        }
        None => HitCriterion::VertexInside,
    };

    if !broad_phase_overlaps(&active.job.obb, &mesh) {
        active.report.meshes_skipped_bounds += 1;
        return;
    }

    active.current = Some(MeshWork {
        slot,
        query: new_query(context, &active.job, &mesh, criterion),
        restarts: 0,
        started: Instant::now(),
    });
}

fn new_query(
    context: &DeformationContext,
    job: &Job,
    mesh: &SurfaceMesh,
    criterion: HitCriterion,
) -> IntersectionQuery {
    IntersectionQuery::with_criterion(&job.obb, mesh, criterion).with_step_sizes(
        context.config.vertices_per_step,
        context.config.triangles_per_step,
    )
}

/// Apply a finished query to its mesh.
fn finish_mesh(
    context: &mut DeformationContext,
    active: &mut ActiveJob,
    mut work: MeshWork,
    triangles: Vec<[u32; 3]>,
) {
    let Some(handle) = active.meshes.get(work.slot) else {
        warn!("Mesh slot {} was destroyed mid-query, skipping", work.slot);
        active.report.meshes_stale += 1;
        return;
    };

    // The host edited the mesh while the query was suspended
    let revision = handle.borrow().revision();
    if revision != work.query.source_revision() {
        if work.restarts >= MAX_QUERY_RESTARTS {
            warn!(
                "{:?} keeps changing, giving up on it for {:?}",
                handle.borrow().id(),
                active.job.id
            );
            active.report.meshes_abandoned += 1;
            return;
        }
        let criterion = match active.job.kind {
            RequestKind::Embed => HitCriterion::Overlap,
            RequestKind::RemoveTriangles => HitCriterion::VertexInside,
        };
        work.query = new_query(context, &active.job, &handle.borrow(), criterion);
        work.restarts += 1;
        active.report.query_restarts += 1;
        active.current = Some(work);
        return;
    }

    let mesh_id = handle.borrow().id();
    debug!(
        "{:?}: {} triangles in {:?}",
        mesh_id,
        triangles.len(),
        work.started.elapsed()
    );
    if triangles.is_empty() {
        return;
    }
    active.report.triangles_hit += triangles.len();
    active.report.meshes_deformed += 1;

    match active.job.target {
        Some((plane, depth, back)) => {
            let vertices = unique_vertex_indices(&triangles);
            if context.config.create_patches {
                context
                    .patches
                    .push(PatchMesh::capture(&handle.borrow(), &triangles, &vertices));
            }
            if context.config.record_undo {
                context.undo.capture(&handle, &vertices, active.job.id);
            }

            let mut mesh = handle.borrow_mut();
            let projection =
                project_vertices(&mut mesh, &plane, &vertices, context.config.projection_mode);
            active.report.vertices_written += projection.projected;
            if context.config.rebuild_collision {
                context.collider.rebuild(&mesh);
            }
            context.margins.update(mesh_id, back, depth);
        }
        None => {
            let doomed: HashSet<[u32; 3]> = triangles.into_iter().collect();
            let mut mesh = handle.borrow_mut();
            let removed = mesh.retain_triangles(|triangle| !doomed.contains(&triangle));
            mesh.recalculate_bounds();
            active.report.triangles_removed += removed;
            if context.config.rebuild_collision {
                context.collider.rebuild(&mesh);
            }
            context.margins.forget(mesh_id);
        }
    }
}

impl Resumable for DeformationQueue {
    type Output = ();

    fn step(&mut self) -> Step<()> {
        let Some(active) = self.active.as_mut() else {
            return match self.pending.pop_front() {
                Some(job) => {
                    self.start(job);
                    Step::Pending
                }
                None => Step::Ready(()),
            };
        };

        if let Some(work) = active.current.as_mut() {
            if let Step::Ready(triangles) = work.query.step() {
                if let Some(work) = active.current.take() {
                    finish_mesh(&mut self.context, active, work, triangles);
                }
            }
            return Step::Pending;
        }

        if active.next_slot < active.meshes.len() {
            let slot = active.next_slot;
            active.next_slot += 1;
            begin_mesh(&self.context, active, slot);
            return Step::Pending;
        }

        if let Some(active) = self.active.take() {
            self.complete(active);
        }
        Step::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::MeshHandle;
    use crate::scheduler::SteppingClock;
    use crate::volume::ObjectVolume;
    use embedding_config::ProjectionMode;
    use glam::Affine3A;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;
    use std::time::Duration;

    /// Flat grid in the XY plane at z = 0 with unit cells.
    fn grid(cells: u32) -> MeshHandle {
        let mut positions = Vec::new();
        for y in 0..=cells {
            for x in 0..=cells {
                positions.push(Vec3::new(x as f32, y as f32, 0.0));
            }
        }
        let stride = cells + 1;
        let mut indices = Vec::new();
        for y in 0..cells {
            for x in 0..cells {
                let a = y * stride + x;
                indices.extend_from_slice(&[a, a + 1, a + stride + 1, a, a + stride + 1, a + stride]);
            }
        }
        SurfaceMesh::new(positions, indices, Affine3A::IDENTITY)
            .unwrap()
            .into_handle()
    }

    /// Box straddling the grid surface around (x, y), pushing 0.1 into -Z.
    fn poster_request(x: f32, y: f32) -> DeformationRequest {
        let obb = Obb::axis_aligned(Vec3::new(x, y, 0.0), Vec3::new(1.0, 1.0, 0.1)).unwrap();
        DeformationRequest::new(obb, Vec3::new(x, y, 0.0), Vec3::new(x, y, -0.1))
    }

    fn drain(queue: &mut DeformationQueue) {
        let scheduler = Scheduler::new(Duration::from_secs(60));
        while !queue.update(&scheduler).is_complete() {}
    }

    fn queue_with(meshes: &[&MeshHandle], config: DeformationConfig) -> DeformationQueue {
        let mut queue = DeformationQueue::new(config);
        queue.set_meshes(MeshCollection::from_handles(meshes.iter().copied()));
        queue
    }

    #[test]
    fn test_embed_pushes_vertices_onto_back_plane() {
        let mesh = grid(10);
        let mut queue = queue_with(&[&mesh], DeformationConfig::default());
        let report = Rc::new(RefCell::new(None));
        let sink = report.clone();
        queue
            .embed(poster_request(5.0, 5.0).on_complete(move |r| *sink.borrow_mut() = Some(r)))
            .unwrap();
        drain(&mut queue);

        let report = report.borrow().clone().unwrap();
        assert_eq!(report.meshes_deformed, 1);
        assert!(report.vertices_written > 0);

        let mesh = mesh.borrow();
        let recessed = mesh.positions().iter().filter(|p| (p.z + 0.1).abs() < 1e-5).count();
        assert_eq!(recessed, report.vertices_written);
        // Vertex at the box center is recessed, a far corner is not
        assert!((mesh.positions()[5 * 11 + 5].z + 0.1).abs() < 1e-5);
        assert_eq!(mesh.positions()[0].z, 0.0);
        assert!((mesh.bounds().min.z + 0.1).abs() < 1e-5);
    }

    #[test]
    fn test_requests_complete_in_fifo_order() {
        let mesh = grid(10);
        let mut queue = queue_with(&[&mesh], DeformationConfig::default());
        let order = Rc::new(RefCell::new(Vec::new()));

        let mut ids = Vec::new();
        for (x, y) in [(2.0, 2.0), (8.0, 8.0), (2.0, 8.0)] {
            let sink = order.clone();
            let request = poster_request(x, y).on_complete(move |r| sink.borrow_mut().push(r.request));
            ids.push(queue.embed(request).unwrap());
        }
        assert_eq!(queue.pending_len(), 3);
        drain(&mut queue);

        assert_eq!(*order.borrow(), ids);
        assert!(queue.is_idle());
    }

    #[test]
    fn test_second_request_within_margin_writes_nothing() {
        let mesh = grid(10);
        let mut queue = queue_with(&[&mesh], DeformationConfig::default());
        queue.embed(poster_request(5.0, 5.0)).unwrap();
        drain(&mut queue);
        let revision = mesh.borrow().revision();

        let report = Rc::new(RefCell::new(None));
        let sink = report.clone();
        queue
            .embed(poster_request(5.0, 5.0).on_complete(move |r| *sink.borrow_mut() = Some(r)))
            .unwrap();
        drain(&mut queue);

        let report = report.borrow().clone().unwrap();
        assert_eq!(report.vertices_written, 0);
        assert_eq!(report.meshes_skipped_margin, 1);
        assert_eq!(mesh.borrow().revision(), revision);
    }

    #[test]
    fn test_deeper_request_is_not_skipped() {
        let mesh = grid(10);
        let mut queue = queue_with(&[&mesh], DeformationConfig::default());
        queue.embed(poster_request(5.0, 5.0)).unwrap();
        drain(&mut queue);

        let obb = Obb::axis_aligned(Vec3::new(5.0, 5.0, 0.0), Vec3::new(1.0, 1.0, 0.3)).unwrap();
        let written = Rc::new(Cell::new(0));
        let sink = written.clone();
        let deeper = DeformationRequest::new(obb, Vec3::new(5.0, 5.0, 0.0), Vec3::new(5.0, 5.0, -0.3))
            .on_complete(move |r| sink.set(r.vertices_written));
        queue.embed(deeper).unwrap();
        drain(&mut queue);

        assert!(written.get() > 0);
        assert_eq!(queue.margins().len(), 1);
    }

    #[test]
    fn test_callback_fires_exactly_once() {
        let mesh = grid(4);
        let mut queue = queue_with(&[&mesh], DeformationConfig::default());
        let calls = Rc::new(Cell::new(0));
        let sink = calls.clone();
        queue
            .embed(poster_request(2.0, 2.0).on_complete(move |_| sink.set(sink.get() + 1)))
            .unwrap();

        drain(&mut queue);
        drain(&mut queue);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_missing_bounding_volume_is_rejected() {
        let mut queue = DeformationQueue::new(DeformationConfig::default());
        let object = ObjectVolume::new("lamp", None);
        let result = queue.embed(DeformationRequest::new(object, Vec3::ZERO, Vec3::NEG_Z));
        assert_eq!(
            result.unwrap_err(),
            EmbedError::MissingBoundingVolume {
                object: "lamp".to_string()
            }
        );
        assert_eq!(queue.pending_len(), 0);
    }

    #[test]
    fn test_coincident_plane_points_are_rejected() {
        let mut queue = DeformationQueue::new(DeformationConfig::default());
        let obb = Obb::axis_aligned(Vec3::ZERO, Vec3::ONE).unwrap();
        let result = queue.embed(DeformationRequest::new(obb, Vec3::ONE, Vec3::ONE));
        assert!(matches!(result, Err(EmbedError::DegenerateGeometry(_))));
        assert!(queue.is_idle());
    }

    #[test]
    fn test_empty_collection_completes() {
        let mut queue = DeformationQueue::new(DeformationConfig::default());
        let report = Rc::new(RefCell::new(None));
        let sink = report.clone();
        queue
            .embed(poster_request(0.0, 0.0).on_complete(move |r| *sink.borrow_mut() = Some(r)))
            .unwrap();
        drain(&mut queue);

        let report = report.borrow().clone().unwrap();
        assert_eq!(report.meshes_visited, 0);
        assert_eq!(report.vertices_written, 0);
    }

    #[test]
    fn test_stale_mesh_is_skipped() {
        let kept = grid(10);
        let dropped = grid(10);
        let mut queue = queue_with(&[&dropped, &kept], DeformationConfig::default());
        drop(dropped);

        let report = Rc::new(RefCell::new(None));
        let sink = report.clone();
        queue
            .embed(poster_request(5.0, 5.0).on_complete(move |r| *sink.borrow_mut() = Some(r)))
            .unwrap();
        drain(&mut queue);

        let report = report.borrow().clone().unwrap();
        assert_eq!(report.meshes_stale, 1);
        assert_eq!(report.meshes_deformed, 1);
    }

    #[test]
    fn test_mesh_outside_box_is_skipped_by_bounds() {
        let mesh = grid(4);
        let mut queue = queue_with(&[&mesh], DeformationConfig::default());
        let skipped = Rc::new(Cell::new(0));
        let sink = skipped.clone();
        queue
            .embed(poster_request(50.0, 50.0).on_complete(move |r| sink.set(r.meshes_skipped_bounds)))
            .unwrap();
        drain(&mut queue);
        assert_eq!(skipped.get(), 1);
    }

    #[test]
    fn test_discarded_request_never_runs() {
        let mesh = grid(10);
        let mut queue = queue_with(&[&mesh], DeformationConfig::default());
        let calls = Rc::new(Cell::new(0));

        let first = calls.clone();
        queue
            .embed(poster_request(2.0, 2.0).on_complete(move |_| first.set(first.get() + 1)))
            .unwrap();
        let second = calls.clone();
        let id = queue
            .embed(poster_request(8.0, 8.0).on_complete(move |_| second.set(second.get() + 10)))
            .unwrap();

        assert!(queue.discard_pending(id));
        assert!(!queue.discard_pending(id));
        drain(&mut queue);
        assert_eq!(calls.get(), 1);
        assert_eq!(mesh.borrow().positions()[8 * 11 + 8].z, 0.0);
    }

    #[test]
    fn test_clear_pending() {
        let mut queue = DeformationQueue::new(DeformationConfig::default());
        queue.embed(poster_request(0.0, 0.0)).unwrap();
        queue.embed(poster_request(1.0, 0.0)).unwrap();
        assert_eq!(queue.clear_pending(), 2);
        assert!(queue.is_idle());
    }

    #[test]
    fn test_budgeted_updates_yield_and_resume() {
        let mesh = grid(10);
        let mut queue = queue_with(&[&mesh], DeformationConfig::default());
        queue.embed(poster_request(5.0, 5.0)).unwrap();

        // Zero budget: exactly one step per update
        let scheduler = Scheduler::with_clock(SteppingClock::default(), Duration::ZERO);
        assert_eq!(queue.update(&scheduler), TickOutcome::Yielded { steps: 1 });
        assert!(queue.active_request().is_some());

        let mut updates = 1;
        while !queue.update(&scheduler).is_complete() {
            updates += 1;
        }
        // start, prepare mesh, transform, test, complete
        assert_eq!(updates, 5);
        assert!(queue.is_idle());
    }

    #[test]
    fn test_query_restarts_when_mesh_changes_mid_query() {
        let mesh = grid(10);
        let mut queue = queue_with(&[&mesh], DeformationConfig::default());
        let restarts = Rc::new(Cell::new(0));
        let sink = restarts.clone();
        queue
            .embed(poster_request(5.0, 5.0).on_complete(move |r| sink.set(r.query_restarts)))
            .unwrap();

        let scheduler = Scheduler::with_clock(SteppingClock::default(), Duration::ZERO);
        // start, prepare mesh, transform
        for _ in 0..3 {
            queue.update(&scheduler);
        }
        mesh.borrow_mut().set_position(0, Vec3::new(0.0, 0.0, 0.5));

        while !queue.update(&scheduler).is_complete() {}
        assert_eq!(restarts.get(), 1);
        assert!((mesh.borrow().positions()[5 * 11 + 5].z + 0.1).abs() < 1e-5);
    }

    #[test]
    fn test_mesh_edited_every_tick_is_abandoned() {
        let mesh = grid(10);
        let mut queue = queue_with(&[&mesh], DeformationConfig::default());
        let report = Rc::new(RefCell::new(None));
        let sink = report.clone();
        queue
            .embed(poster_request(5.0, 5.0).on_complete(move |r| *sink.borrow_mut() = Some(r)))
            .unwrap();

        let scheduler = Scheduler::with_clock(SteppingClock::default(), Duration::ZERO);
        let mut edits = 0;
        while !queue.update(&scheduler).is_complete() {
            edits += 1;
            // Far corner, outside the box
            mesh.borrow_mut()
                .set_position(0, Vec3::new(0.0, 0.0, edits as f32 * 0.01));
        }

        let report = report.borrow().clone().unwrap();
        assert_eq!(report.meshes_abandoned, 1);
        assert_eq!(report.query_restarts, MAX_QUERY_RESTARTS);
        assert_eq!(report.meshes_deformed, 0);
        assert_eq!(report.vertices_written, 0);
        assert_eq!(mesh.borrow().positions()[5 * 11 + 5].z, 0.0);
        assert!(queue.margins().is_empty());
    }

    #[test]
    fn test_callback_can_enqueue_on_shared_queue() {
        let mesh = grid(10);
        let queue = Rc::new(RefCell::new(queue_with(&[&mesh], DeformationConfig::default())));
        let follow_up = Rc::new(Cell::new(None));

        let shared = queue.clone();
        let sink = follow_up.clone();
        queue
            .borrow_mut()
            .embed(poster_request(2.0, 2.0).on_complete(move |_| {
                let id = shared.borrow_mut().embed(poster_request(8.0, 8.0)).unwrap();
                sink.set(Some(id));
            }))
            .unwrap();

        let scheduler = Scheduler::new(Duration::from_secs(60));
        let first = DeformationQueue::update_shared(&queue, &scheduler);
        assert!(!first.is_complete());
        assert!(follow_up.get().is_some());

        while !DeformationQueue::update_shared(&queue, &scheduler).is_complete() {}
        assert!(queue.borrow().is_idle());
        assert!((mesh.borrow().positions()[8 * 11 + 8].z + 0.1).abs() < 1e-5);
    }

    #[test]
    fn test_set_meshes_keeps_margins_of_bound_meshes() {
        let a = grid(4);
        let b = grid(4);
        let mut queue = queue_with(&[&a, &b], DeformationConfig::default());
        queue.embed(poster_request(2.0, 2.0)).unwrap();
        drain(&mut queue);
        assert_eq!(queue.margins().len(), 2);

        queue.set_meshes(MeshCollection::from_handles([&a]));
        assert_eq!(queue.margins().len(), 1);
        let a_id = a.borrow().id();
        assert!(queue.margins().has_sufficient_margin(a_id, Vec3::ZERO, 0.05));
    }

    #[test]
    fn test_patches_capture_pre_deformation_geometry() {
        let mesh = grid(10);
        let config = DeformationConfig {
            create_patches: true,
            ..Default::default()
        };
        let mut queue = queue_with(&[&mesh], config);
        queue.embed(poster_request(5.0, 5.0)).unwrap();
        drain(&mut queue);

        assert_eq!(queue.patches().len(), 1);
        let patch = &queue.patches()[0];
        assert_eq!(patch.source(), mesh.borrow().id());
        assert!(patch.positions().iter().all(|p| p.z == 0.0));
        assert_eq!(queue.take_patches().len(), 1);
        assert!(queue.patches().is_empty());
    }

    #[test]
    fn test_undo_last_restores_mesh_and_forgets_margin() {
        let mesh = grid(10);
        let config = DeformationConfig {
            record_undo: true,
            ..Default::default()
        };
        let mut queue = queue_with(&[&mesh], config);
        queue.embed(poster_request(5.0, 5.0)).unwrap();
        drain(&mut queue);
        assert_eq!(queue.undo_log().len(), 1);

        let report = queue.undo_last().unwrap().unwrap();
        assert!(report.restored > 0);
        assert!(mesh.borrow().positions().iter().all(|p| p.z == 0.0));
        assert!(queue.margins().is_empty());
        assert!(queue.undo_last().unwrap().is_none());
    }

    #[test]
    fn test_undo_log_keeps_configured_entries() {
        let mesh = grid(10);
        let config = DeformationConfig {
            record_undo: true,
            max_undo_entries: 1,
            ..Default::default()
        };
        let mut queue = queue_with(&[&mesh], config);
        queue.embed(poster_request(2.0, 2.0)).unwrap();
        let second = queue.embed(poster_request(8.0, 8.0)).unwrap();
        drain(&mut queue);

        assert_eq!(queue.undo_log().len(), 1);
        assert_eq!(queue.undo_log().entries()[0].request, second);
    }

    #[test]
    fn test_collider_rebuilt_only_when_enabled() {
        struct Counting(Rc<Cell<usize>>);
        impl ColliderSync for Counting {
            fn rebuild(&mut self, _mesh: &SurfaceMesh) {
                self.0.set(self.0.get() + 1);
            }
        }

        for (enabled, expected) in [(false, 0), (true, 1)] {
            let mesh = grid(10);
            let rebuilds = Rc::new(Cell::new(0));
            let config = DeformationConfig {
                rebuild_collision: enabled,
                ..Default::default()
            };
            let mut queue = queue_with(&[&mesh], config)
                .with_collider_sync(Box::new(Counting(rebuilds.clone())));
            queue.embed(poster_request(5.0, 5.0)).unwrap();
            drain(&mut queue);
            assert_eq!(rebuilds.get(), expected);
        }
    }

    #[test]
    fn test_region_margins_do_not_skip_other_regions() {
        let mesh = grid(10);
        let config = DeformationConfig {
            margin_mode: MarginMode::PerRegion { cell_size: 1.0 },
            ..Default::default()
        };
        let mut queue = queue_with(&[&mesh], config);
        let written = Rc::new(RefCell::new(Vec::new()));
        for (x, y) in [(2.0, 2.0), (8.0, 8.0)] {
            let sink = written.clone();
            queue
                .embed(poster_request(x, y).on_complete(move |r| sink.borrow_mut().push(r.vertices_written)))
                .unwrap();
        }
        drain(&mut queue);
        assert!(written.borrow().iter().all(|&count| count > 0));
    }

    #[test]
    fn test_recess_only_leaves_deeper_vertices() {
        let mesh = grid(4);
        mesh.borrow_mut().set_position(12, Vec3::new(2.0, 2.0, -0.5));
        mesh.borrow_mut().recalculate_bounds();
        let config = DeformationConfig {
            projection_mode: ProjectionMode::RecessOnly,
            ..Default::default()
        };
        let mut queue = queue_with(&[&mesh], config);
        queue.embed(poster_request(2.0, 2.0)).unwrap();
        drain(&mut queue);

        assert_eq!(mesh.borrow().positions()[12].z, -0.5);
        assert!((mesh.borrow().positions()[11].z + 0.1).abs() < 1e-5);
    }

    #[test]
    fn test_remove_within_deletes_touching_triangles() {
        let mesh = grid(10);
        let mut queue = queue_with(&[&mesh], DeformationConfig::default());
        let before = mesh.borrow().triangle_count();

        let obb = Obb::axis_aligned(Vec3::new(5.0, 5.0, 0.0), Vec3::new(0.5, 0.5, 0.5)).unwrap();
        let removed = Rc::new(Cell::new(0));
        let sink = removed.clone();
        queue
            .embed(DeformationRequest::removal(obb).on_complete(move |r| sink.set(r.triangles_removed)))
            .unwrap();
        drain(&mut queue);

        // Only vertex (5, 5) is inside; it is shared by six triangles
        assert_eq!(removed.get(), 6);
        let mesh = mesh.borrow();
        assert_eq!(mesh.triangle_count(), before - 6);
        let center = 5 * 11 + 5;
        assert!(mesh.indices().iter().all(|&i| i != center));
        assert_eq!(mesh.vertex_count(), 121);
    }

    #[test]
    fn test_embed_volume() {
        let mesh = grid(10);
        let mut queue = queue_with(&[&mesh], DeformationConfig::default());
        let poster =
            Obb::axis_aligned(Vec3::new(5.0, 5.0, 0.05), Vec3::new(0.5, 0.5, 0.05)).unwrap();
        let volume = MarginVolume::behind_object("poster", &poster, Vec3::new(5.0, 5.0, 0.0), 0.02)
            .unwrap();
        queue.embed_volume(volume).unwrap();
        drain(&mut queue);

        assert!((mesh.borrow().positions()[5 * 11 + 5].z + 0.12).abs() < 1e-5);
    }

    #[test]
    fn test_embed_behind_uses_configured_extra_displacement() {
        let mesh = grid(10);
        let config = DeformationConfig {
            extra_displacement: 0.5,
            ..Default::default()
        };
        let mut queue = queue_with(&[&mesh], config);
        let poster =
            Obb::axis_aligned(Vec3::new(5.0, 5.0, 0.05), Vec3::new(0.5, 0.5, 0.05)).unwrap();
        queue
            .embed_behind("poster", &poster, Vec3::new(5.0, 5.0, 0.0))
            .unwrap();
        drain(&mut queue);

        assert!((mesh.borrow().positions()[5 * 11 + 5].z + 0.6).abs() < 1e-5);
    }

    #[test]
    fn test_embed_on_plane_recesses_plane_region() {
        let mesh = grid(10);
        let config = DeformationConfig {
            extra_displacement: 0.5,
            ..Default::default()
        };
        let mut queue = queue_with(&[&mesh], config);
        let poster =
            Obb::axis_aligned(Vec3::new(5.0, 5.0, 0.05), Vec3::new(0.5, 0.5, 0.05)).unwrap();
        let wall = SurfacePlane {
            center: Vec3::new(5.0, 5.0, 0.0),
            rotation: glam::Quat::IDENTITY,
            half_extents: glam::Vec2::new(2.0, 2.0),
        };
        queue
            .embed_on_plane("poster", &poster, Vec3::new(5.0, 5.0, 0.0), &wall)
            .unwrap();
        drain(&mut queue);

        let mesh = mesh.borrow();
        // Beyond the poster's own footprint but inside the plane
        assert!((mesh.positions()[4 * 11 + 4].z + 0.6).abs() < 1e-5);
        assert!((mesh.positions()[5 * 11 + 5].z + 0.6).abs() < 1e-5);
        assert_eq!(mesh.positions()[0].z, 0.0);
    }
}
