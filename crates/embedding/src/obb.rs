//! Oriented bounding box value type.
//!
//! Hosts build an [`Obb`] once per request from whatever native bounding
//! geometry their embedded object exposes (a box collider, a decal volume, a
//! detected surface plane), which keeps the engine independent of any
//! particular collider type.

use glam::{Affine3A, Quat, Vec3};
use serde::{Deserialize, Serialize};

use crate::error::{DegenerateKind, EmbedError};
use crate::mesh::Aabb;

/// An immutable box of arbitrary rotation.
///
/// Deserialized boxes go through [`Obb::new`], so a stored box with bad
/// extents fails to load instead of reaching the queue.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ObbFields", into = "ObbFields")]
pub struct Obb {
    center: Vec3,
    rotation: Quat,
    half_extents: Vec3,
}

/// Unchecked serialized form of [`Obb`].
#[derive(Serialize, Deserialize)]
struct ObbFields {
    center: Vec3,
    rotation: Quat,
    half_extents: Vec3,
}

impl TryFrom<ObbFields> for Obb {
    type Error = EmbedError;

    fn try_from(fields: ObbFields) -> Result<Self, Self::Error> {
        Obb::new(fields.center, fields.rotation, fields.half_extents)
    }
}

impl From<Obb> for ObbFields {
    fn from(obb: Obb) -> Self {
        Self {
            center: obb.center,
            rotation: obb.rotation,
            half_extents: obb.half_extents,
        }
    }
}

impl Obb {
    /// Create a box from its world-space center, rotation, and half-extents.
    ///
    /// Rejects zero, negative or non-finite extents and non-finite or
    /// zero-length rotations.
    pub fn new(center: Vec3, rotation: Quat, half_extents: Vec3) -> Result<Self, EmbedError> {
        if !center.is_finite() || !rotation.is_finite() {
            return Err(EmbedError::DegenerateGeometry(DegenerateKind::NonFinite));
        }
        if !half_extents.is_finite() || half_extents.min_element() <= 0.0 {
            return Err(EmbedError::DegenerateGeometry(DegenerateKind::InvalidExtents));
        }
        let length = rotation.length();
        if length <= f32::EPSILON {
            return Err(EmbedError::DegenerateGeometry(DegenerateKind::NonFinite));
        }
        Ok(Self {
            center,
            rotation: rotation / length,
            half_extents,
        })
    }

    /// Axis-aligned box centered at `center`.
    pub fn axis_aligned(center: Vec3, half_extents: Vec3) -> Result<Self, EmbedError> {
        Self::new(center, Quat::IDENTITY, half_extents)
    }

    /// Box collider style construction: a box of `size` centered at
    /// `local_center` in an object's space, placed by the object's transform.
    ///
    /// Scale is folded into the extents; rotation and translation carry over.
    pub fn from_transformed_box(
        local_center: Vec3,
        size: Vec3,
        transform: &Affine3A,
    ) -> Result<Self, EmbedError> {
        let (scale, rotation, _) = transform.to_scale_rotation_translation();
        let center = transform.transform_point3(local_center);
        Self::new(center, rotation, size.abs() * scale.abs() * 0.5)
    }

    pub fn center(&self) -> Vec3 {
        self.center
    }

    pub fn rotation(&self) -> Quat {
        self.rotation
    }

    pub fn half_extents(&self) -> Vec3 {
        self.half_extents
    }

    /// Full edge lengths.
    pub fn size(&self) -> Vec3 {
        self.half_extents * 2.0
    }

    /// Local X, Y, Z axes in world space.
    pub fn axes(&self) -> [Vec3; 3] {
        [
            self.rotation * Vec3::X,
            self.rotation * Vec3::Y,
            self.rotation * Vec3::Z,
        ]
    }

    /// Local +Z axis in world space.
    pub fn forward(&self) -> Vec3 {
        self.rotation * Vec3::Z
    }

    /// Box-local to world transform (no scale).
    pub fn local_to_world(&self) -> Affine3A {
        Affine3A::from_rotation_translation(self.rotation, self.center)
    }

    /// World to box-local transform. In box-local space the box is the
    /// axis-aligned box `[-half_extents, half_extents]`.
    pub fn world_to_local(&self) -> Affine3A {
        self.local_to_world().inverse()
    }

    /// Express a world point in box-local coordinates.
    pub fn to_local(&self, point: Vec3) -> Vec3 {
        self.rotation.inverse() * (point - self.center)
    }

    /// Express a box-local point in world coordinates.
    pub fn to_world(&self, point: Vec3) -> Vec3 {
        self.rotation * point + self.center
    }

    /// Inclusive containment test for a world point.
    pub fn contains_point(&self, point: Vec3) -> bool {
        let local = self.to_local(point).abs();
        local.x <= self.half_extents.x
            && local.y <= self.half_extents.y
            && local.z <= self.half_extents.z
    }

    /// Tightest world AABB enclosing the box.
    pub fn world_aabb(&self) -> Aabb {
        let [x, y, z] = self.axes();
        let extent = x.abs() * self.half_extents.x
            + y.abs() * self.half_extents.y
            + z.abs() * self.half_extents.z;
        Aabb::new(self.center - extent, self.center + extent)
    }

    /// The eight corners in world space.
    pub fn corners(&self) -> [Vec3; 8] {
        let h = self.half_extents;
        let mut corners = [Vec3::ZERO; 8];
        for (i, corner) in corners.iter_mut().enumerate() {
            let local = Vec3::new(
                if i & 1 != 0 { h.x } else { -h.x },
                if i & 2 != 0 { h.y } else { -h.y },
                if i & 4 != 0 { h.z } else { -h.z },
            );
            *corner = self.to_world(local);
        }
        corners
    }
}
