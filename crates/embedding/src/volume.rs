//! Bounding volumes of embedded objects and the margin volumes built from them.
//!
//! An embedded object's pivot sits flush with the surface it is seated into
//! and its local +Z axis faces out of that surface. The margin volume is the
//! region behind the pivot that must be cleared: it starts at the front plane
//! (the surface) and ends at the back plane, one object thickness plus some
//! extra displacement deeper.

use glam::{Quat, Vec2, Vec3};
use serde::{Deserialize, Serialize};

use crate::error::EmbedError;
use crate::obb::Obb;
use crate::projector::Plane;

/// Anything that can hand the engine a bounding box.
pub trait EmbeddedObject {
    /// Name used in logs and errors.
    fn label(&self) -> &str;

    /// World-space bounding box, if the object has one.
    fn bounding_volume(&self) -> Option<Obb>;
}

impl EmbeddedObject for Obb {
    fn label(&self) -> &str {
        "obb"
    }

    fn bounding_volume(&self) -> Option<Obb> {
        Some(*self)
    }
}

/// A named host object with an optional box.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectVolume {
    pub name: String,
    pub volume: Option<Obb>,
}

impl ObjectVolume {
    pub fn new(name: impl Into<String>, volume: Option<Obb>) -> Self {
        Self {
            name: name.into(),
            volume,
        }
    }
}

impl EmbeddedObject for ObjectVolume {
    fn label(&self) -> &str {
        &self.name
    }

    fn bounding_volume(&self) -> Option<Obb> {
        self.volume
    }
}

/// A detected planar region of the environment (wall, floor, table top).
///
/// The plane's local +Z is its normal; `half_extents` spans its local X/Y.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SurfacePlane {
    pub center: Vec3,
    pub rotation: Quat,
    pub half_extents: Vec2,
}

impl SurfacePlane {
    pub fn normal(&self) -> Vec3 {
        self.rotation * Vec3::Z
    }

    /// Project a point onto the plane's normal axis through its center.
    fn point_on_normal_axis(&self, point: Vec3) -> Vec3 {
        let normal = self.normal();
        self.center + normal * normal.dot(point - self.center)
    }
}

/// Box to clear plus the front/back plane points that define the push.
#[derive(Debug, Clone, PartialEq)]
pub struct MarginVolume {
    label: String,
    obb: Obb,
    front: Vec3,
    back: Vec3,
}

impl MarginVolume {
    /// Margin volume spanning a whole surface plane.
    ///
    /// Every triangle of the plane's region between the surface and the
    /// back plane is pushed back, so the recess covers the plane and not just
    /// the object's footprint.
    pub fn for_surface_plane(
        label: impl Into<String>,
        object: &Obb,
        pivot: Vec3,
        plane: &SurfacePlane,
        extra_displacement: f32,
    ) -> Result<Self, EmbedError> {
        let into_surface = -object.forward();
        let thickness = object.size().z + extra_displacement;
        let front = plane.point_on_normal_axis(pivot);
        let back = front + into_surface * thickness;

        let obb = Obb::new(
            (front + back) * 0.5,
            plane.rotation,
            Vec3::new(plane.half_extents.x, plane.half_extents.y, thickness * 0.5),
        )?;
        Ok(Self {
            label: label.into(),
            obb,
            front,
            back,
        })
    }

    /// Margin volume directly behind an object, using its own box.
    pub fn behind_object(
        label: impl Into<String>,
        object: &Obb,
        pivot: Vec3,
        extra_displacement: f32,
    ) -> Result<Self, EmbedError> {
        let into_surface = -object.forward();
        let thickness = object.size().z + extra_displacement;
        Ok(Self {
            label: label.into(),
            obb: *object,
            front: pivot,
            back: pivot + into_surface * thickness,
        })
    }

    pub fn obb(&self) -> &Obb {
        &self.obb
    }

    /// Center point on the front plane (the original surface).
    pub fn front(&self) -> Vec3 {
        self.front
    }

    /// Center point on the back plane vertices are projected onto.
    pub fn back(&self) -> Vec3 {
        self.back
    }

    pub fn depth(&self) -> f32 {
        (self.back - self.front).length()
    }

    /// The back plane and the required depth.
    pub fn back_plane(&self) -> Result<(Plane, f32), EmbedError> {
        Plane::from_front_back(self.front, self.back)
    }
}

impl EmbeddedObject for MarginVolume {
    fn label(&self) -> &str {
        &self.label
    }

    fn bounding_volume(&self) -> Option<Obb> {
        Some(self.obb)
    }
}
