//! Math types.
//!
//! This module intentionally stays small and deterministic.
//! It avoids SIMD/unsafe and focuses on stable semantics. Octree
//! coordinates are integer; entity positions are float and quantized
//! only at the wire/index boundaries.

use serde::{Deserialize, Serialize};

/// 3D vector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Self = Self {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }

    pub fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }

    pub fn scale(self, s: f32) -> Self {
        Self::new(self.x * s, self.y * s, self.z * s)
    }

    pub fn dot(self, rhs: Self) -> f32 {
        self.x * rhs.x + self.y * rhs.y + self.z * rhs.z
    }

    pub fn len_sq(self) -> f32 {
        self.dot(self)
    }

    pub fn len(self) -> f32 {
        self.len_sq().sqrt()
    }

    pub fn dist(self, rhs: Self) -> f32 {
        self.sub(rhs).len()
    }

    pub fn lerp(self, to: Self, t: f32) -> Self {
        let t = t.clamp(0.0, 1.0);
        Self::new(
            self.x + (to.x - self.x) * t,
            self.y + (to.y - self.y) * t,
            self.z + (to.z - self.z) * t,
        )
    }

    /// Rotates around the Z axis by `yaw` degrees.
    pub fn rotate_yaw(self, yaw: f32) -> Self {
        let r = yaw.to_radians();
        let (s, c) = r.sin_cos();
        Self::new(self.x * c - self.y * s, self.x * s + self.y * c, self.z)
    }
}

/// Integer 3D coordinate used for octree origins and index boxes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct IVec3 {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl IVec3 {
    pub const ZERO: Self = Self { x: 0, y: 0, z: 0 };

    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    pub fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }

    pub fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }

    pub fn min(self, rhs: Self) -> Self {
        Self::new(self.x.min(rhs.x), self.y.min(rhs.y), self.z.min(rhs.z))
    }

    pub fn max(self, rhs: Self) -> Self {
        Self::new(self.x.max(rhs.x), self.y.max(rhs.y), self.z.max(rhs.z))
    }

    /// Child origin for octant `i` of a node at `self` with child size `size`.
    pub fn octant(self, i: usize, size: i32) -> Self {
        Self::new(
            self.x + if i & 1 != 0 { size } else { 0 },
            self.y + if i & 2 != 0 { size } else { 0 },
            self.z + if i & 4 != 0 { size } else { 0 },
        )
    }

    pub fn to_vec3(self) -> Vec3 {
        Vec3::new(self.x as f32, self.y as f32, self.z as f32)
    }
}

/// Axis-aligned integer bounding box, half-open on no axis: `min..=max`
/// both inclusive-exclusive by convention `min <= p < max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aabb {
    pub min: IVec3,
    pub max: IVec3,
}

impl Aabb {
    pub const fn new(min: IVec3, max: IVec3) -> Self {
        Self { min, max }
    }

    /// Box around a float center with a float radius, rounded outward.
    pub fn around(center: Vec3, radius: f32) -> Self {
        Self {
            min: IVec3::new(
                (center.x - radius).floor() as i32,
                (center.y - radius).floor() as i32,
                (center.z - radius).floor() as i32,
            ),
            max: IVec3::new(
                (center.x + radius).ceil() as i32,
                (center.y + radius).ceil() as i32,
                (center.z + radius).ceil() as i32,
            ),
        }
    }

    /// Box from float corners, rounded outward.
    pub fn from_corners(lo: Vec3, hi: Vec3) -> Self {
        Self {
            min: IVec3::new(lo.x.floor() as i32, lo.y.floor() as i32, lo.z.floor() as i32),
            max: IVec3::new(hi.x.ceil() as i32, hi.y.ceil() as i32, hi.z.ceil() as i32),
        }
    }

    /// Cube of `size` at `origin`.
    pub fn cube(origin: IVec3, size: i32) -> Self {
        Self {
            min: origin,
            max: IVec3::new(origin.x + size, origin.y + size, origin.z + size),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.min.x >= self.max.x || self.min.y >= self.max.y || self.min.z >= self.max.z
    }

    pub fn intersects(&self, other: &Aabb) -> bool {
        self.min.x < other.max.x
            && self.max.x > other.min.x
            && self.min.y < other.max.y
            && self.max.y > other.min.y
            && self.min.z < other.max.z
            && self.max.z > other.min.z
    }

    pub fn union(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    pub fn clip(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: self.min.max(other.min),
            max: self.max.min(other.max),
        }
    }

    /// Largest edge length.
    pub fn longest_extent(&self) -> i32 {
        let d = self.max.sub(self.min);
        d.x.max(d.y).max(d.z)
    }

    pub fn translate(&self, by: IVec3) -> Aabb {
        Aabb {
            min: self.min.add(by),
            max: self.max.add(by),
        }
    }

    pub fn contains_point(&self, p: IVec3) -> bool {
        p.x >= self.min.x
            && p.x < self.max.x
            && p.y >= self.min.y
            && p.y < self.max.y
            && p.z >= self.min.z
            && p.z < self.max.z
    }
}

/// Rounds up to the next power of two, minimum 1.
pub fn next_pow2(v: i32) -> i32 {
    let mut s = 1;
    while s < v {
        s <<= 1;
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vec3_lerp_midpoint() {
        let a = Vec3::new(0.0, 0.0, 0.0);
        let b = Vec3::new(2.0, 4.0, 6.0);
        let mid = a.lerp(b, 0.5);
        assert_eq!(mid, Vec3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn octant_origins_follow_bit_pattern() {
        let o = IVec3::new(0, 0, 0);
        assert_eq!(o.octant(0, 8), IVec3::new(0, 0, 0));
        assert_eq!(o.octant(1, 8), IVec3::new(8, 0, 0));
        assert_eq!(o.octant(2, 8), IVec3::new(0, 8, 0));
        assert_eq!(o.octant(7, 8), IVec3::new(8, 8, 8));
    }

    #[test]
    fn aabb_clip_and_union() {
        let a = Aabb::new(IVec3::new(0, 0, 0), IVec3::new(10, 10, 10));
        let b = Aabb::new(IVec3::new(5, 5, 5), IVec3::new(20, 20, 20));
        assert!(a.intersects(&b));
        assert_eq!(a.clip(&b), Aabb::new(IVec3::new(5, 5, 5), IVec3::new(10, 10, 10)));
        assert_eq!(a.union(&b), Aabb::new(IVec3::new(0, 0, 0), IVec3::new(20, 20, 20)));
    }

    #[test]
    fn disjoint_boxes_do_not_intersect() {
        let a = Aabb::new(IVec3::new(0, 0, 0), IVec3::new(4, 4, 4));
        let b = Aabb::new(IVec3::new(4, 0, 0), IVec3::new(8, 4, 4));
        assert!(!a.intersects(&b));
    }

    #[test]
    fn next_pow2_rounds_up() {
        assert_eq!(next_pow2(1), 1);
        assert_eq!(next_pow2(3), 4);
        assert_eq!(next_pow2(16), 16);
        assert_eq!(next_pow2(17), 32);
    }
}
