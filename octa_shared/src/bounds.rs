//! Entity bounding-box oracle.
//!
//! Pure function of entity kind/attributes plus any referenced model's
//! precomputed bounds. Zero-size entities get a configurable minimum
//! radius so they stay selectable and indexable. `Empty` entities have no
//! spatial footprint at all and are never indexed.

use std::collections::HashMap;

use crate::entity::{Entity, EntityKind};
use crate::math::{Aabb, Vec3};

/// Supplies model-space bounds for mapmodel entities by model name.
pub trait ModelBoundsProvider {
    fn bounds(&self, name: &str) -> Option<(Vec3, Vec3)>;
}

/// Static model bounds table, filled at asset-registration time.
#[derive(Debug, Default)]
pub struct StaticModelBounds {
    table: HashMap<String, (Vec3, Vec3)>,
}

impl StaticModelBounds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, min: Vec3, max: Vec3) {
        self.table.insert(name.to_string(), (min, max));
    }
}

impl ModelBoundsProvider for StaticModelBounds {
    fn bounds(&self, name: &str) -> Option<(Vec3, Vec3)> {
        self.table.get(name).copied()
    }
}

/// Computes the index bounding box for an entity, or `None` when the
/// entity has no spatial footprint.
pub fn entity_bounds(
    ent: &Entity,
    models: &dyn ModelBoundsProvider,
    min_radius: f32,
) -> Option<Aabb> {
    match ent.kind {
        EntityKind::Empty => None,
        EntityKind::Light | EntityKind::Spotlight => {
            let radius = (ent.attrs[0] as f32).max(min_radius);
            Some(Aabb::around(ent.pos, radius))
        }
        EntityKind::Mapmodel => Some(mapmodel_bounds(ent, models, min_radius)),
        EntityKind::Obstacle => Some(obstacle_bounds(ent, min_radius)),
        EntityKind::Decal => Some(decal_bounds(ent, min_radius)),
        _ => {
            let radius = (ent.attrs[0] as f32).max(min_radius);
            Some(Aabb::around(ent.pos, radius))
        }
    }
}

/// Mapmodel: model-space box scaled by attr2 (percent, 0 = 100) and
/// conservatively expanded for yaw (attr1) by taking the bounding sphere
/// of the rotated footprint in XY.
fn mapmodel_bounds(ent: &Entity, models: &dyn ModelBoundsProvider, min_radius: f32) -> Aabb {
    let name = ent
        .state_data
        .get("model")
        .map(String::as_str)
        .unwrap_or("");
    let Some((mmin, mmax)) = models.bounds(name) else {
        return Aabb::around(ent.pos, min_radius);
    };
    let scale = match ent.attrs[2] {
        0 => 1.0,
        s => (s as f32) / 100.0,
    };
    let mmin = mmin.scale(scale);
    let mmax = mmax.scale(scale);
    let yaw = ent.attrs[1] as f32;
    // Rotating an AABB about Z stays inside the circle through its XY corners.
    let rx = mmin.x.abs().max(mmax.x.abs());
    let ry = mmin.y.abs().max(mmax.y.abs());
    let r = if yaw.rem_euclid(360.0) == 0.0 {
        None
    } else {
        Some((rx * rx + ry * ry).sqrt())
    };
    let (lo, hi) = match r {
        Some(r) => (Vec3::new(-r, -r, mmin.z), Vec3::new(r, r, mmax.z)),
        None => (mmin, mmax),
    };
    Aabb::from_corners(ent.pos.add(lo), ent.pos.add(hi))
}

/// Obstacle: explicit half-extents in attrs 1..=3, yaw in attr0, same
/// conservative rotation expansion as mapmodels.
fn obstacle_bounds(ent: &Entity, min_radius: f32) -> Aabb {
    let hx = (ent.attrs[1] as f32).max(min_radius);
    let hy = (ent.attrs[2] as f32).max(min_radius);
    let hz = (ent.attrs[3] as f32).max(min_radius);
    let yaw = ent.attrs[0] as f32;
    let (hx, hy) = if yaw.rem_euclid(360.0) == 0.0 {
        (hx, hy)
    } else {
        let r = (hx * hx + hy * hy).sqrt();
        (r, r)
    };
    Aabb::from_corners(
        ent.pos.sub(Vec3::new(hx, hy, hz)),
        ent.pos.add(Vec3::new(hx, hy, hz)),
    )
}

/// Decal: square footprint of declared radius (attr2) extruded along the
/// projection depth (attr3) both ways.
fn decal_bounds(ent: &Entity, min_radius: f32) -> Aabb {
    let radius = (ent.attrs[2] as f32).max(min_radius);
    let depth = (ent.attrs[3] as f32).max(min_radius);
    let half = Vec3::new(radius, radius, depth);
    Aabb::from_corners(ent.pos.sub(half), ent.pos.add(half))
}
