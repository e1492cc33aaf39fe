//! Dynamic (transient) light queue.
//!
//! Gameplay code may request lights at any point in a frame; requests are
//! staged and merged into the live list once per tick. The live list stays
//! sorted ascending by expiry so pruning stops at the first survivor. The
//! renderer culls from a separate working list sorted by distance.

use serde::{Deserialize, Serialize};

use crate::entity::EntityUid;
use crate::math::Vec3;

/// RGB color, 0..=1 per channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

impl Color {
    pub const WHITE: Self = Self {
        r: 1.0,
        g: 1.0,
        b: 1.0,
    };

    pub const fn new(r: f32, g: f32, b: f32) -> Self {
        Self { r, g, b }
    }

    fn lerp(self, to: Self, t: f32) -> Self {
        let t = t.clamp(0.0, 1.0);
        Self::new(
            self.r + (to.r - self.r) * t,
            self.g + (to.g - self.g) * t,
            self.b + (to.b - self.b) * t,
        )
    }
}

/// Parameters for requesting a dynamic light.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DynLightParams {
    pub origin: Vec3,
    /// Target radius at full intensity.
    pub radius: f32,
    /// Starting radius faded from during the fade-in window.
    pub init_radius: f32,
    pub color: Color,
    pub init_color: Color,
    /// Fade-in/out window in ms. `fade == peak == 0` means full intensity
    /// until explicit removal.
    pub fade: u64,
    /// Hold-at-peak window in ms.
    pub peak: u64,
    /// Owning entity; the light dies with its owner.
    pub owner: Option<EntityUid>,
    /// Spot direction and full cone angle in degrees, when cone > 0.
    pub dir: Vec3,
    pub cone: f32,
}

impl Default for DynLightParams {
    fn default() -> Self {
        Self {
            origin: Vec3::ZERO,
            radius: 32.0,
            init_radius: 0.0,
            color: Color::WHITE,
            init_color: Color::WHITE,
            fade: 0,
            peak: 0,
            owner: None,
            dir: Vec3::ZERO,
            cone: 0.0,
        }
    }
}

/// A live dynamic light.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DynLight {
    pub params: DynLightParams,
    /// Absolute expiry in ms; `u64::MAX` for permanent lights.
    pub expire: u64,
    /// Enqueue time, the zero point of the fade/peak windows.
    pub start: u64,
    /// Windowed values recomputed each tick.
    pub cur_radius: f32,
    pub cur_color: Color,
}

impl DynLight {
    fn update(&mut self, now: u64) {
        let p = &self.params;
        if p.fade == 0 && p.peak == 0 {
            self.cur_radius = p.radius;
            self.cur_color = p.color;
            return;
        }
        let age = now.saturating_sub(self.start);
        if age < p.fade {
            // Fading in.
            let t = age as f32 / p.fade as f32;
            self.cur_radius = p.init_radius + (p.radius - p.init_radius) * t;
            self.cur_color = p.init_color.lerp(p.color, t);
        } else if age < p.fade + p.peak {
            self.cur_radius = p.radius;
            self.cur_color = p.color;
        } else {
            // Fading out toward expiry.
            let out = (age - p.fade - p.peak) as f32;
            let span = self.expire.saturating_sub(self.start + p.fade + p.peak) as f32;
            let t = if span > 0.0 { 1.0 - out / span } else { 0.0 };
            self.cur_radius = p.radius * t.max(0.0);
            self.cur_color = p.color;
        }
    }
}

/// Staging queue plus the expiry-sorted live list.
#[derive(Debug, Default)]
pub struct DynLightQueue {
    staged: Vec<(DynLightParams, u64, u64)>,
    live: Vec<DynLight>,
}

impl DynLightQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages a light lasting `duration_ms` (0 = until explicit removal).
    /// Activation happens on the next `tick`.
    pub fn enqueue(&mut self, params: DynLightParams, now: u64, duration_ms: u64) {
        let expire = if duration_ms == 0 {
            u64::MAX
        } else {
            now + duration_ms
        };
        self.staged.push((params, now, expire));
    }

    /// Merges staged lights, prunes the expired prefix, recomputes windowed
    /// radius/color.
    pub fn tick(&mut self, now: u64) {
        for (params, start, expire) in self.staged.drain(..) {
            let light = DynLight {
                params,
                expire,
                start,
                cur_radius: params.init_radius,
                cur_color: params.init_color,
            };
            // New lights usually expire after everything already queued, so
            // scan for the slot from the tail.
            let mut at = self.live.len();
            while at > 0 && self.live[at - 1].expire > light.expire {
                at -= 1;
            }
            self.live.insert(at, light);
        }
        // Expired entries form a prefix of the sorted list.
        let survivors = self.live.iter().position(|l| l.expire > now);
        match survivors {
            Some(0) => {}
            Some(n) => {
                self.live.drain(..n);
            }
            None => self.live.clear(),
        }
        for light in &mut self.live {
            light.update(now);
        }
    }

    /// Drops all lights owned by `uid` (owner destroyed).
    pub fn remove_owned(&mut self, uid: EntityUid) {
        self.live.retain(|l| l.params.owner != Some(uid));
        self.staged.retain(|(p, _, _)| p.owner != Some(uid));
    }

    /// Unexpired lights within `max_dist` of `viewpoint`, nearest first,
    /// capped at `limit`. Works on a copy; the master list stays
    /// expiry-sorted.
    pub fn cull(&self, viewpoint: Vec3, max_dist: f32, limit: usize, now: u64) -> Vec<DynLight> {
        let mut near: Vec<(f32, DynLight)> = self
            .live
            .iter()
            .filter(|l| l.expire > now)
            .map(|l| (l.params.origin.dist(viewpoint), *l))
            .filter(|(d, l)| *d <= max_dist + l.cur_radius)
            .collect();
        near.sort_by(|a, b| a.0.total_cmp(&b.0));
        near.truncate(limit);
        near.into_iter().map(|(_, l)| l).collect()
    }

    pub fn live(&self) -> &[DynLight] {
        &self.live
    }

    pub fn clear(&mut self) {
        self.staged.clear();
        self.live.clear();
    }
}
