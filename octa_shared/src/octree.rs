//! Octree node store.
//!
//! A cubical world volume recursively partitioned into 8 children per node.
//! Strict branching: a node has all 8 children or none. Leaves optionally
//! carry a `LeafEnts` extension record indexing the entities whose bounds
//! intersect the leaf. Nodes never move; entities move by re-indexing.
//!
//! World growth/shrink are root-replacement operations that refuse (return
//! `false`) when their shape precondition does not hold; callers must check.

use crate::entity::{EntCategory, EntityUid};
use crate::math::{next_pow2, Aabb, IVec3};

/// Smallest node size at which entities are indexed.
pub const MIN_LEAF_SIZE: i32 = 8;

/// Entity index record attached to one octree node.
#[derive(Debug, Clone, PartialEq)]
pub struct LeafEnts {
    pub origin: IVec3,
    pub size: i32,
    pub decals: Vec<EntityUid>,
    pub mapmodels: Vec<EntityUid>,
    pub others: Vec<EntityUid>,
    /// Union of member boxes clipped to the leaf volume.
    pub bounds: Aabb,
    /// Set on every membership or bounds change; drained by the renderer.
    pub bounds_dirty: bool,
    /// Bumped on every re-index; invalidates any cached query result.
    pub cache_stamp: u64,
}

impl LeafEnts {
    fn new(origin: IVec3, size: i32) -> Self {
        Self {
            origin,
            size,
            decals: Vec::new(),
            mapmodels: Vec::new(),
            others: Vec::new(),
            bounds: Aabb::cube(origin, 0),
            bounds_dirty: false,
            cache_stamp: 0,
        }
    }

    pub fn volume(&self) -> Aabb {
        Aabb::cube(self.origin, self.size)
    }

    fn list_mut(&mut self, cat: EntCategory) -> &mut Vec<EntityUid> {
        match cat {
            EntCategory::Decal => &mut self.decals,
            EntCategory::Mapmodel => &mut self.mapmodels,
            EntCategory::Other => &mut self.others,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.decals.is_empty() && self.mapmodels.is_empty() && self.others.is_empty()
    }

    pub fn contains(&self, uid: EntityUid) -> bool {
        self.decals.contains(&uid) || self.mapmodels.contains(&uid) || self.others.contains(&uid)
    }

    /// All member uids across the three category lists.
    pub fn members(&self) -> impl Iterator<Item = EntityUid> + '_ {
        self.decals
            .iter()
            .chain(self.mapmodels.iter())
            .chain(self.others.iter())
            .copied()
    }
}

/// One octree node. Either childless (empty or solid) or 8 half-size
/// children whose origins follow the octant bit pattern.
#[derive(Debug, Default)]
pub struct Node {
    solid: bool,
    children: Option<Box<[Node; 8]>>,
    ents: Option<Box<LeafEnts>>,
}

impl Node {
    fn solid_leaf() -> Self {
        Node {
            solid: true,
            children: None,
            ents: None,
        }
    }

    /// Trivial nodes carry no subtree and no index record.
    fn is_trivial(&self) -> bool {
        self.children.is_none() && self.ents.is_none()
    }

    pub fn is_solid(&self) -> bool {
        self.solid
    }

    pub fn has_children(&self) -> bool {
        self.children.is_some()
    }

    pub fn ents(&self) -> Option<&LeafEnts> {
        self.ents.as_deref()
    }
}

/// The spatial world model.
#[derive(Debug)]
pub struct Octree {
    root: Node,
    world_size: i32,
    size_ceiling: i32,
    stamp: u64,
    /// Leaves marked bounds-dirty since the last drain, one entry each.
    dirty_log: Vec<(IVec3, i32)>,
}

impl Octree {
    /// Creates an empty world of the given power-of-two size.
    pub fn new(world_size: i32, size_ceiling: i32) -> Self {
        assert!(
            world_size > 0 && world_size & (world_size - 1) == 0,
            "world size must be a power of two"
        );
        Self {
            root: Node::default(),
            world_size,
            size_ceiling,
            stamp: 0,
            dirty_log: Vec::new(),
        }
    }

    pub fn world_size(&self) -> i32 {
        self.world_size
    }

    pub fn volume(&self) -> Aabb {
        Aabb::cube(IVec3::ZERO, self.world_size)
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    // ─── Structure ───

    /// Splits the childless node containing `point` into 8 children that
    /// inherit its solidity. Returns false if the point is outside the
    /// world or the containing node is already subdivided to minimum size.
    pub fn subdivide_at(&mut self, point: IVec3) -> bool {
        if !self.volume().contains_point(point) {
            return false;
        }
        let mut node = &mut self.root;
        let mut origin = IVec3::ZERO;
        let mut size = self.world_size;
        while node.children.is_some() {
            let half = size / 2;
            let idx = Self::octant_index(origin, half, point);
            origin = origin.octant(idx, half);
            size = half;
            let Some(children) = node.children.as_mut() else {
                unreachable!("checked in loop condition");
            };
            node = &mut children[idx];
        }
        if size <= 1 {
            return false;
        }
        debug_assert!(Aabb::cube(origin, size).contains_point(point));
        let solid = node.solid;
        node.children = Some(Box::new(std::array::from_fn(|_| Node {
            solid,
            children: None,
            ents: None,
        })));
        true
    }

    /// Merges the children of the node containing `point` one level above
    /// its leaf. Legal only when all 8 children are trivial and agree on
    /// solidity; otherwise refuses.
    pub fn collapse_at(&mut self, point: IVec3) -> bool {
        if !self.volume().contains_point(point) {
            return false;
        }
        Self::collapse_node(&mut self.root, IVec3::ZERO, self.world_size, point)
    }

    fn collapse_node(node: &mut Node, origin: IVec3, size: i32, point: IVec3) -> bool {
        let Some(children) = node.children.as_mut() else {
            return false;
        };
        let half = size / 2;
        let idx = Self::octant_index(origin, half, point);
        // Recurse first so the deepest collapsible level wins.
        if children[idx].children.is_some()
            && Self::collapse_node(&mut children[idx], origin.octant(idx, half), half, point)
        {
            return true;
        }
        let solid = children[0].solid;
        if children.iter().all(|c| c.is_trivial() && c.solid == solid) {
            node.children = None;
            node.solid = solid;
            true
        } else {
            false
        }
    }

    /// Root-to-leaf path of (origin, size) for the node containing `point`.
    pub fn locate(&self, point: IVec3) -> Vec<(IVec3, i32)> {
        let mut path = Vec::new();
        if !self.volume().contains_point(point) {
            return path;
        }
        let mut node = &self.root;
        let mut origin = IVec3::ZERO;
        let mut size = self.world_size;
        loop {
            path.push((origin, size));
            match node.children.as_ref() {
                Some(children) => {
                    let half = size / 2;
                    let idx = Self::octant_index(origin, half, point);
                    origin = origin.octant(idx, half);
                    size = half;
                    node = &children[idx];
                }
                None => return path,
            }
        }
    }

    pub fn is_solid_at(&self, point: IVec3) -> bool {
        if !self.volume().contains_point(point) {
            return true;
        }
        let mut node = &self.root;
        let mut origin = IVec3::ZERO;
        let mut size = self.world_size;
        while let Some(children) = node.children.as_ref() {
            let half = size / 2;
            let idx = Self::octant_index(origin, half, point);
            origin = origin.octant(idx, half);
            size = half;
            node = &children[idx];
        }
        node.solid
    }

    /// Doubles the world size. The old root becomes octant 0 of a new root
    /// whose remaining octants are solid, so all existing coordinates keep
    /// their absolute value. Refuses at the size ceiling.
    pub fn enlarge(&mut self) -> bool {
        if self.world_size * 2 > self.size_ceiling {
            return false;
        }
        let old_root = std::mem::take(&mut self.root);
        let mut children: [Node; 8] = std::array::from_fn(|_| Node::solid_leaf());
        children[0] = old_root;
        self.root = Node {
            solid: false,
            children: Some(Box::new(children)),
            ents: None,
        };
        self.world_size *= 2;
        true
    }

    /// Halves the world size by promoting the single non-trivial root
    /// octant. Refuses unless exactly one octant carries content. Returns
    /// the promoted octant's origin offset so the caller can translate
    /// entity positions; index records must be rebuilt by the caller.
    pub fn shrink(&mut self) -> Option<IVec3> {
        let children = self.root.children.as_mut()?;
        let mut keep: Option<usize> = None;
        for (i, c) in children.iter().enumerate() {
            // Solid trivial octants are the filler enlarge() produces and
            // the only thing shrink may discard.
            if !(c.is_trivial() && c.solid) {
                if keep.is_some() {
                    return None;
                }
                keep = Some(i);
            }
        }
        let keep = keep?;
        let half = self.world_size / 2;
        let offset = IVec3::ZERO.octant(keep, half);
        self.root = std::mem::take(&mut children[keep]);
        self.world_size = half;
        Some(offset)
    }

    // ─── Entity indexing ───

    /// Index granularity for a bounding box: the smallest power of two
    /// covering its longest extent, clamped to the node size range. Large
    /// entities land in a few large leaves; small ones never fan out.
    pub fn leaf_size_for(&self, bbox: &Aabb) -> i32 {
        next_pow2(bbox.longest_extent()).clamp(MIN_LEAF_SIZE, self.world_size)
    }

    /// Inserts `uid` into every qualifying leaf intersecting `bbox`.
    pub fn link(&mut self, uid: EntityUid, cat: EntCategory, bbox: &Aabb) {
        let leaf_size = self.leaf_size_for(bbox);
        self.stamp += 1;
        let stamp = self.stamp;
        Self::link_node(
            &mut self.root,
            IVec3::ZERO,
            self.world_size,
            uid,
            cat,
            bbox,
            leaf_size,
            stamp,
            &mut self.dirty_log,
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn link_node(
        node: &mut Node,
        origin: IVec3,
        size: i32,
        uid: EntityUid,
        cat: EntCategory,
        bbox: &Aabb,
        leaf_size: i32,
        stamp: u64,
        dirty: &mut Vec<(IVec3, i32)>,
    ) {
        let volume = Aabb::cube(origin, size);
        if !bbox.intersects(&volume) {
            return;
        }
        if size > leaf_size {
            if let Some(children) = node.children.as_mut() {
                let half = size / 2;
                for (i, child) in children.iter_mut().enumerate() {
                    Self::link_node(
                        child,
                        origin.octant(i, half),
                        half,
                        uid,
                        cat,
                        bbox,
                        leaf_size,
                        stamp,
                        dirty,
                    );
                }
                return;
            }
        }
        let ents = node
            .ents
            .get_or_insert_with(|| Box::new(LeafEnts::new(origin, size)));
        debug_assert!(!ents.contains(uid), "uid already linked in this leaf");
        let first = ents.is_empty();
        ents.list_mut(cat).push(uid);
        let clipped = bbox.clip(&volume);
        ents.bounds = if first {
            clipped
        } else {
            ents.bounds.union(&clipped)
        };
        ents.cache_stamp = stamp;
        if !ents.bounds_dirty {
            ents.bounds_dirty = true;
            dirty.push((origin, size));
        }
    }

    /// Removes `uid` from every leaf it was linked into for `bbox`.
    /// `bbox_of` resolves surviving members' boxes so the aggregate can be
    /// recomputed from scratch (removal may shrink the union).
    pub fn unlink(
        &mut self,
        uid: EntityUid,
        cat: EntCategory,
        bbox: &Aabb,
        bbox_of: &dyn Fn(EntityUid) -> Option<Aabb>,
    ) {
        let leaf_size = self.leaf_size_for(bbox);
        self.stamp += 1;
        let stamp = self.stamp;
        Self::unlink_node(
            &mut self.root,
            IVec3::ZERO,
            self.world_size,
            uid,
            cat,
            bbox,
            leaf_size,
            stamp,
            bbox_of,
            &mut self.dirty_log,
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn unlink_node(
        node: &mut Node,
        origin: IVec3,
        size: i32,
        uid: EntityUid,
        cat: EntCategory,
        bbox: &Aabb,
        leaf_size: i32,
        stamp: u64,
        bbox_of: &dyn Fn(EntityUid) -> Option<Aabb>,
        dirty: &mut Vec<(IVec3, i32)>,
    ) {
        let volume = Aabb::cube(origin, size);
        if !bbox.intersects(&volume) {
            return;
        }
        let descend = size > leaf_size && node.children.is_some();
        // A subdivide since link time can leave the record above the
        // current attach depth; always check the node's own record.
        if let Some(ents) = node.ents.as_mut() {
            let list = ents.list_mut(cat);
            if let Some(at) = list.iter().position(|u| *u == uid) {
                list.remove(at);
                if ents.is_empty() {
                    node.ents = None;
                } else {
                    let mut agg: Option<Aabb> = None;
                    for member in ents.members() {
                        if let Some(mb) = bbox_of(member) {
                            let clipped = mb.clip(&volume);
                            agg = Some(match agg {
                                Some(a) => a.union(&clipped),
                                None => clipped,
                            });
                        }
                    }
                    if let Some(agg) = agg {
                        ents.bounds = agg;
                    }
                    ents.cache_stamp = stamp;
                    if !ents.bounds_dirty {
                        ents.bounds_dirty = true;
                        dirty.push((origin, size));
                    }
                }
            }
        }
        if descend {
            if let Some(children) = node.children.as_mut() {
                let half = size / 2;
                for (i, child) in children.iter_mut().enumerate() {
                    Self::unlink_node(
                        child,
                        origin.octant(i, half),
                        half,
                        uid,
                        cat,
                        bbox,
                        leaf_size,
                        stamp,
                        bbox_of,
                        dirty,
                    );
                }
            }
        }
    }

    /// All populated leaf records, in depth-first node order.
    pub fn leaves(&self) -> Vec<&LeafEnts> {
        let mut out = Vec::new();
        Self::collect_leaves(&self.root, None, &mut out);
        out
    }

    /// Populated leaf records whose volume intersects `bbox`.
    pub fn leaves_intersecting(&self, bbox: &Aabb) -> Vec<&LeafEnts> {
        let mut out = Vec::new();
        Self::collect_leaves(&self.root, Some(bbox), &mut out);
        out
    }

    fn collect_leaves<'a>(node: &'a Node, filter: Option<&Aabb>, out: &mut Vec<&'a LeafEnts>) {
        if let Some(ents) = node.ents.as_deref() {
            if filter.map_or(true, |bb| bb.intersects(&ents.volume())) {
                out.push(ents);
            }
        }
        if let Some(children) = node.children.as_ref() {
            for child in children.iter() {
                Self::collect_leaves(child, filter, out);
            }
        }
    }

    /// Drains the bounds-dirty set, clearing each leaf's flag. The renderer
    /// calls this once per frame to know which culling data to recompute.
    pub fn take_dirty_leaves(&mut self) -> Vec<(IVec3, i32)> {
        let log = std::mem::take(&mut self.dirty_log);
        for (origin, size) in &log {
            if let Some(ents) = Self::find_ents_mut(&mut self.root, IVec3::ZERO, self.world_size, *origin, *size)
            {
                ents.bounds_dirty = false;
            }
        }
        log
    }

    fn find_ents_mut(
        node: &mut Node,
        origin: IVec3,
        size: i32,
        target: IVec3,
        target_size: i32,
    ) -> Option<&mut LeafEnts> {
        if origin == target && size == target_size {
            return node.ents.as_deref_mut();
        }
        if size <= target_size {
            return None;
        }
        let children = node.children.as_mut()?;
        let half = size / 2;
        let idx = Self::octant_index(origin, half, target);
        Self::find_ents_mut(&mut children[idx], origin.octant(idx, half), half, target, target_size)
    }

    fn octant_index(origin: IVec3, half: i32, point: IVec3) -> usize {
        let mut idx = 0;
        if point.x >= origin.x + half {
            idx |= 1;
        }
        if point.y >= origin.y + half {
            idx |= 2;
        }
        if point.z >= origin.z + half {
            idx |= 4;
        }
        idx
    }
}
