//! Per-LOD primitive collection.
//!
//! Primitives are keyed by their stable node id. A full rebuild enumerates
//! the native list from scratch; a partial rebuild patches the collection by
//! id-set difference so small edits never pay for a full teardown-rebuild.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::bounds::Aabb;
use crate::bridge::{NodeId, PrimitiveDesc, SharedBridge};
use crate::error::{AvatarError, AvatarResult};
use crate::handle::ResourceHandle;

/// Closed set of render-mesh variants sharing one build/destroy contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMeshKind {
    /// Plain mesh with no native primitive binding.
    Plain,
    /// Mesh bound to one native primitive (the unmerged path).
    PrimitiveBound,
    /// Shared merged mesh; the primitive no longer draws itself.
    Merged,
}

/// Per-primitive dirty flags consumed by the frame update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirtyFlags {
    pub transform: bool,
    pub material: bool,
}

/// Render-resource state of one sub-renderer.
#[derive(Debug)]
pub struct RenderMeshState {
    pub kind: RenderMeshKind,
    pub built: bool,
    pub local_bounds: Option<Aabb>,
    /// "Skip when offscreen" culling optimization; temporarily disabled
    /// during bounds accumulation.
    pub skip_offscreen_culling: bool,
    pub root_bone: Option<NodeId>,
}

impl Default for RenderMeshState {
    fn default() -> Self {
        Self {
            kind: RenderMeshKind::PrimitiveBound,
            built: false,
            local_bounds: None,
            skip_offscreen_culling: true,
            root_bone: None,
        }
    }
}

/// One native sub-mesh bound to a LOD.
#[derive(Debug)]
pub struct PrimitiveInstance {
    pub node_id: NodeId,
    pub handle: ResourceHandle,
    /// Set once the merge engine decided this primitive batches into the
    /// LOD's merged mesh.
    pub merged_to_lod: bool,
    pub dirty: DirtyFlags,
    pub render: RenderMeshState,
}

/// Outcome of a partial rebuild, for logging and tests.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RebuildDelta {
    pub added: Vec<NodeId>,
    pub removed: Vec<NodeId>,
}

/// Per-LOD collection of primitives keyed by stable node id.
#[derive(Default)]
pub struct PrimitiveRegistry {
    primitives: FxHashMap<NodeId, PrimitiveInstance>,
    /// Side lists consumed by the frame update; pruned on removal.
    needs_simulation: FxHashSet<NodeId>,
    needs_update: FxHashSet<NodeId>,
}

impl PrimitiveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full rebuild from the native enumeration. Enumeration failure is
    /// fatal to the LOD build.
    pub fn build_all(
        &mut self,
        bridge: &SharedBridge,
        lod_handle: &ResourceHandle,
        lod_level: u8,
        cap: usize,
    ) -> AvatarResult<usize> {
        self.clear();

        let mut descs = Vec::new();
        let code = bridge.get_primitives(lod_handle.raw(), &mut descs, cap);
        if !code.is_success() {
            log::error!(
                "[PrimitiveRegistry] enumeration failed for LOD {}: {:?}",
                lod_level,
                code
            );
            return Err(AvatarError::PrimitiveEnumeration { lod_level, code });
        }

        for desc in descs {
            self.insert_from_desc(bridge, desc)?;
        }
        log::debug!(
            "[PrimitiveRegistry] built {} primitives for LOD {}",
            self.primitives.len(),
            lod_level
        );
        Ok(self.primitives.len())
    }

    /// Diff/patch against a fresh native enumeration.
    ///
    /// New ids are constructed and built immediately; removed ids are
    /// unbuilt, pruned from the side lists and released. Surviving ids are
    /// untouched, and the handle the engine re-delivered for them is released
    /// unused since we already hold a reference.
    pub fn partial_rebuild(
        &mut self,
        bridge: &SharedBridge,
        lod_handle: &ResourceHandle,
        lod_level: u8,
        cap: usize,
    ) -> AvatarResult<RebuildDelta> {
        let mut descs = Vec::new();
        let code = bridge.get_primitives(lod_handle.raw(), &mut descs, cap);
        if !code.is_success() {
            log::error!(
                "[PrimitiveRegistry] partial rebuild enumeration failed for LOD {}: {:?}",
                lod_level,
                code
            );
            return Err(AvatarError::PrimitiveEnumeration { lod_level, code });
        }

        let new_ids: FxHashSet<NodeId> = descs.iter().map(|d| d.node_id).collect();
        let mut delta = RebuildDelta::default();

        let stale: Vec<NodeId> = self
            .primitives
            .keys()
            .filter(|id| !new_ids.contains(id))
            .copied()
            .collect();
        for node_id in stale {
            self.remove(node_id);
            delta.removed.push(node_id);
        }

        for desc in descs {
            if self.primitives.contains_key(&desc.node_id) {
                // Already referenced; drop the re-delivered reference.
                bridge.release(desc.handle);
                continue;
            }
            self.insert_from_desc(bridge, desc)?;
            build_primitive_render(bridge, self.get_mut(desc.node_id).ok_or_else(|| {
                AvatarError::Internal {
                    message: format!("primitive {:?} vanished during rebuild", desc.node_id),
                }
            })?);
            delta.added.push(desc.node_id);
        }

        delta.added.sort();
        delta.removed.sort();
        if !delta.added.is_empty() || !delta.removed.is_empty() {
            log::debug!(
                "[PrimitiveRegistry] partial rebuild LOD {}: +{} -{}",
                lod_level,
                delta.added.len(),
                delta.removed.len()
            );
        }
        Ok(delta)
    }

    fn insert_from_desc(&mut self, bridge: &SharedBridge, desc: PrimitiveDesc) -> AvatarResult<()> {
        let handle = ResourceHandle::adopt_released_by(desc.handle, "primitive", bridge)?;
        self.primitives.insert(
            desc.node_id,
            PrimitiveInstance {
                node_id: desc.node_id,
                handle,
                merged_to_lod: false,
                dirty: DirtyFlags::default(),
                render: RenderMeshState::default(),
            },
        );
        self.needs_update.insert(desc.node_id);
        Ok(())
    }

    /// Unbuild one primitive, prune the side lists, release its handle.
    pub fn remove(&mut self, node_id: NodeId) -> bool {
        self.needs_simulation.remove(&node_id);
        self.needs_update.remove(&node_id);
        match self.primitives.remove(&node_id) {
            Some(primitive) => {
                drop(primitive); // releases the native handle
                true
            }
            None => false,
        }
    }

    /// Release every primitive. Drop order within the map is irrelevant;
    /// each handle is released exactly once.
    pub fn clear(&mut self) {
        self.needs_simulation.clear();
        self.needs_update.clear();
        self.primitives.clear();
    }

    pub fn len(&self) -> usize {
        self.primitives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primitives.is_empty()
    }

    pub fn get(&self, node_id: NodeId) -> Option<&PrimitiveInstance> {
        self.primitives.get(&node_id)
    }

    pub fn get_mut(&mut self, node_id: NodeId) -> Option<&mut PrimitiveInstance> {
        self.primitives.get_mut(&node_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &PrimitiveInstance)> {
        self.primitives.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&NodeId, &mut PrimitiveInstance)> {
        self.primitives.iter_mut()
    }

    /// Node ids in stable order; the bounded build loop cursors over this.
    pub fn sorted_node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.primitives.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn merge_eligible_count(&self) -> usize {
        self.primitives.values().filter(|p| p.merged_to_lod).count()
    }

    pub fn mark_needs_simulation(&mut self, node_id: NodeId) {
        if self.primitives.contains_key(&node_id) {
            self.needs_simulation.insert(node_id);
        }
    }

    pub fn needs_simulation(&self, node_id: NodeId) -> bool {
        self.needs_simulation.contains(&node_id)
    }

    pub fn needs_update(&self, node_id: NodeId) -> bool {
        self.needs_update.contains(&node_id)
    }
}

/// Build the render resources of one unmerged primitive.
pub fn build_primitive_render(bridge: &SharedBridge, primitive: &mut PrimitiveInstance) {
    primitive.render.kind = RenderMeshKind::PrimitiveBound;
    primitive.render.local_bounds = bridge.primitive_local_bounds(primitive.handle.raw());
    primitive.render.built = true;
    if primitive.render.local_bounds.is_none() {
        log::debug!(
            "[PrimitiveRegistry] primitive {:?} has no local bounds",
            primitive.node_id
        );
    }
}
