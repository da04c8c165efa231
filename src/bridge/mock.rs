//! Deterministic in-process bridge used by tests.
//!
//! Scripts primitive lists, merge eligibility, mesh payloads and bake
//! completion behavior, and counts native calls so tests can assert that the
//! cache really short-circuits extraction, that reference counts balance,
//! and that bake gating holds.

use std::collections::{BTreeMap, VecDeque};

use crossbeam_channel::Sender;
use glam::Vec3;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::bounds::Aabb;
use crate::bridge::{
    BakeCompletion, BakeRegion, BakeSubmission, BridgeError, MergedMeshInfo, MeshScratch,
    NativeEngineBridge, NativeHandle, NativeResult, NodeId, PrimitiveDesc, PropertyId,
};

/// Per-call counters, for cache and lifecycle assertions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounters {
    pub enumerations: u64,
    pub hash_queries: u64,
    pub native_merges: u64,
    pub data_extractions: u64,
    pub bake_submissions: u64,
    pub retains: u64,
    pub releases: u64,
}

struct LodScript {
    primitives: Vec<(NativeHandle, NodeId)>,
    eligible: FxHashSet<NodeId>,
    skeleton: NativeHandle,
    merged_material: NativeHandle,
    merged_hash: u64,
    fail_skeleton: bool,
    fail_mesh_data: bool,
    fail_merged_material: bool,
}

#[derive(Clone, Copy)]
struct PrimitiveScript {
    node_id: NodeId,
    baked: bool,
    has_base_texture: bool,
}

struct MaterialScript {
    base_texture: Option<NativeHandle>,
    overlay_texture: Option<NativeHandle>,
    baked_flag: bool,
    dirty: bool,
}

#[derive(Default)]
struct MockState {
    next_handle: u64,
    refcounts: FxHashMap<u64, i64>,
    valid: FxHashSet<u64>,
    lods: FxHashMap<u64, LodScript>,
    primitives: FxHashMap<u64, PrimitiveScript>,
    prim_overrides: FxHashMap<NodeId, PrimitiveScript>,
    materials: FxHashMap<u64, MaterialScript>,
    textures: FxHashMap<u64, Vec<u8>>,
    property_ids: FxHashMap<String, u32>,
    blend_shader: NativeHandle,
    fail_next_enum: bool,
    defer_bakes: bool,
    pending_bakes: VecDeque<(BakeSubmission, NativeHandle, Sender<BakeCompletion>)>,
    counters: CallCounters,
}

pub struct MockBridge {
    state: Mutex<MockState>,
}

impl Default for MockBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBridge {
    pub fn new() -> Self {
        let mut state = MockState::default();
        state.next_handle = 1;
        state.blend_shader = alloc_handle(&mut state);
        Self {
            state: Mutex::new(state),
        }
    }

    // --- scripting -------------------------------------------------------

    /// Script one LOD: primitives with the given node ids, the subset that is
    /// merge-eligible, a skeleton, a merged material and a default merged
    /// mesh payload. Returns the LOD handle with one reference owned by the
    /// caller.
    pub fn script_lod(&self, node_ids: &[u64], eligible: &[u64]) -> NativeHandle {
        let mut state = self.state.lock();
        let lod = alloc_handle(&mut state);
        *state.refcounts.entry(lod.0).or_default() += 1;

        let skeleton = alloc_handle(&mut state);
        let merged_material = alloc_handle(&mut state);
        state.materials.insert(
            merged_material.0,
            MaterialScript {
                base_texture: None,
                overlay_texture: None,
                baked_flag: false,
                dirty: false,
            },
        );

        let mut primitives = Vec::new();
        for &id in node_ids {
            let handle = alloc_handle(&mut state);
            state.primitives.insert(
                handle.0,
                PrimitiveScript {
                    node_id: NodeId(id),
                    baked: false,
                    has_base_texture: true,
                },
            );
            primitives.push((handle, NodeId(id)));
        }

        state.lods.insert(
            lod.0,
            LodScript {
                primitives,
                eligible: eligible.iter().map(|&id| NodeId(id)).collect(),
                skeleton,
                merged_material,
                // Unique by default; identical content is scripted explicitly.
                merged_hash: 0x1000_0000 ^ lod.0,
                fail_skeleton: false,
                fail_mesh_data: false,
                fail_merged_material: false,
            },
        );
        lod
    }

    /// Replace the primitive list of a scripted LOD (content edit).
    pub fn rescript_primitives(&self, lod: NativeHandle, node_ids: &[u64]) {
        let mut state = self.state.lock();
        let mut primitives = Vec::new();
        for &id in node_ids {
            // Reuse the existing native object for surviving ids.
            let existing = state
                .lods
                .get(&lod.0)
                .and_then(|s| s.primitives.iter().find(|(_, n)| *n == NodeId(id)))
                .map(|(h, _)| *h);
            let handle = match existing {
                Some(handle) => handle,
                None => {
                    let handle = alloc_handle(&mut state);
                    state.primitives.insert(
                        handle.0,
                        PrimitiveScript {
                            node_id: NodeId(id),
                            baked: false,
                            has_base_texture: true,
                        },
                    );
                    handle
                }
            };
            primitives.push((handle, NodeId(id)));
        }
        if let Some(script) = state.lods.get_mut(&lod.0) {
            script.primitives = primitives;
        }
    }

    pub fn script_merged_hash(&self, lod: NativeHandle, hash: u64) {
        if let Some(script) = self.state.lock().lods.get_mut(&lod.0) {
            script.merged_hash = hash;
        }
    }

    pub fn script_no_base_texture(&self, node_id: NodeId) {
        let mut state = self.state.lock();
        let entry = state.prim_overrides.entry(node_id).or_insert(PrimitiveScript {
            node_id,
            baked: false,
            has_base_texture: true,
        });
        entry.has_base_texture = false;
    }

    pub fn script_primitive_baked(&self, node_id: NodeId) {
        let mut state = self.state.lock();
        let entry = state.prim_overrides.entry(node_id).or_insert(PrimitiveScript {
            node_id,
            baked: false,
            has_base_texture: true,
        });
        entry.baked = true;
    }

    pub fn fail_next_enumeration(&self) {
        self.state.lock().fail_next_enum = true;
    }

    pub fn fail_skeleton(&self, lod: NativeHandle) {
        if let Some(script) = self.state.lock().lods.get_mut(&lod.0) {
            script.fail_skeleton = true;
        }
    }

    pub fn fail_merged_material(&self, lod: NativeHandle) {
        if let Some(script) = self.state.lock().lods.get_mut(&lod.0) {
            script.fail_merged_material = true;
        }
    }

    pub fn fail_merged_mesh_data(&self, lod: NativeHandle) {
        if let Some(script) = self.state.lock().lods.get_mut(&lod.0) {
            script.fail_mesh_data = true;
        }
    }

    pub fn mark_material_dirty(&self, material: NativeHandle) {
        if let Some(script) = self.state.lock().materials.get_mut(&material.0) {
            script.dirty = true;
        }
    }

    pub fn invalidate_handle(&self, handle: NativeHandle) {
        self.state.lock().valid.remove(&handle.0);
    }

    // --- bake control ----------------------------------------------------

    /// Hold every submitted bake until [`Self::complete_one_bake`].
    pub fn defer_bake_completions(&self) {
        self.state.lock().defer_bakes = true;
    }

    /// Complete the oldest pending bake with the given outcome.
    pub fn complete_one_bake(&self, success: bool) {
        let mut state = self.state.lock();
        let Some((submission, baked_texture, done)) = state.pending_bakes.pop_front() else {
            panic!("no pending bake to complete");
        };
        drop(state);
        let _ = done.send(BakeCompletion {
            task_id: submission.task_id,
            success,
            material: submission.material,
            baked_texture,
        });
    }

    pub fn drop_pending_bakes(&self) {
        self.state.lock().pending_bakes.clear();
    }

    pub fn pending_bake_count(&self) -> usize {
        self.state.lock().pending_bakes.len()
    }

    // --- inspection ------------------------------------------------------

    pub fn counters(&self) -> CallCounters {
        self.state.lock().counters
    }

    pub fn reference_count(&self, handle: NativeHandle) -> i64 {
        self.state
            .lock()
            .refcounts
            .get(&handle.0)
            .copied()
            .unwrap_or(0)
    }

    /// Reference counts of every handle with a live reference, in stable
    /// order for direct comparison.
    pub fn live_reference_counts(&self) -> BTreeMap<u64, i64> {
        self.state
            .lock()
            .refcounts
            .iter()
            .filter(|(_, &count)| count > 0)
            .map(|(&handle, &count)| (handle, count))
            .collect()
    }

    fn prim_script(state: &MockState, primitive: NativeHandle) -> Option<PrimitiveScript> {
        let base = state.primitives.get(&primitive.0)?;
        Some(
            state
                .prim_overrides
                .get(&base.node_id)
                .copied()
                .unwrap_or(*base),
        )
    }

    fn lod_mesh_info(script: &LodScript) -> MergedMeshInfo {
        let eligible = script.eligible.len().max(1) as u32;
        MergedMeshInfo {
            vertex_count: eligible * 4,
            index_count: eligible * 6,
            bone_count: 2,
            uv_channel_count: 1,
            has_tangents: true,
            has_colors: false,
            needs_eight_weights: false,
        }
    }
}

fn alloc_handle(state: &mut MockState) -> NativeHandle {
    let handle = NativeHandle(state.next_handle);
    state.next_handle += 1;
    state.refcounts.insert(handle.0, 0);
    state.valid.insert(handle.0);
    handle
}

fn retain_for_caller(state: &mut MockState, handle: NativeHandle) {
    *state.refcounts.entry(handle.0).or_default() += 1;
}

impl NativeEngineBridge for MockBridge {
    fn retain(&self, handle: NativeHandle) {
        let mut state = self.state.lock();
        state.counters.retains += 1;
        retain_for_caller(&mut state, handle);
    }

    fn release(&self, handle: NativeHandle) {
        let mut state = self.state.lock();
        state.counters.releases += 1;
        let count = state.refcounts.entry(handle.0).or_default();
        *count -= 1;
        debug_assert!(*count >= 0, "release without retain on {:?}", handle);
        if *count <= 0 {
            state.valid.remove(&handle.0);
        }
    }

    fn is_handle_valid(&self, handle: NativeHandle) -> bool {
        self.state.lock().valid.contains(&handle.0)
    }

    fn get_primitives(
        &self,
        lod: NativeHandle,
        out: &mut Vec<PrimitiveDesc>,
        cap: usize,
    ) -> NativeResult {
        let mut state = self.state.lock();
        state.counters.enumerations += 1;
        if state.fail_next_enum {
            state.fail_next_enum = false;
            return NativeResult::Failure;
        }
        let Some(primitives) = state.lods.get(&lod.0).map(|s| s.primitives.clone()) else {
            return NativeResult::ObjectNotExist;
        };
        out.clear();
        for (handle, node_id) in primitives.into_iter().take(cap) {
            retain_for_caller(&mut state, handle);
            out.push(PrimitiveDesc { handle, node_id });
        }
        NativeResult::Success
    }

    fn try_merge_primitives(
        &self,
        lod: NativeHandle,
        out: &mut Vec<(NodeId, bool)>,
    ) -> NativeResult {
        let state = self.state.lock();
        let Some(script) = state.lods.get(&lod.0) else {
            return NativeResult::ObjectNotExist;
        };
        out.clear();
        for (_, node_id) in &script.primitives {
            out.push((*node_id, script.eligible.contains(node_id)));
        }
        NativeResult::Success
    }

    fn primitive_local_bounds(&self, primitive: NativeHandle) -> Option<Aabb> {
        let state = self.state.lock();
        let script = MockBridge::prim_script(&state, primitive)?;
        let offset = (script.node_id.0 % 8) as f32 * 0.5;
        Some(Aabb::new(
            Vec3::new(-1.0 - offset, 0.0, -1.0),
            Vec3::new(1.0 + offset, 2.0, 1.0),
        ))
    }

    fn is_primitive_baked(&self, primitive: NativeHandle) -> bool {
        let state = self.state.lock();
        MockBridge::prim_script(&state, primitive)
            .map(|s| s.baked)
            .unwrap_or(false)
    }

    fn get_skeleton(&self, lod: NativeHandle) -> Result<NativeHandle, BridgeError> {
        let mut state = self.state.lock();
        let Some(script) = state.lods.get(&lod.0) else {
            return Err(BridgeError::ObjectGone);
        };
        if script.fail_skeleton {
            return Err(BridgeError::Call {
                call: "getSkeleton",
                code: NativeResult::Failure,
            });
        }
        let skeleton = script.skeleton;
        retain_for_caller(&mut state, skeleton);
        Ok(skeleton)
    }

    fn precompute_skeleton_poses(&self, _skeleton: NativeHandle) -> NativeResult {
        NativeResult::Success
    }

    fn get_merged_hash_code(&self, lod: NativeHandle) -> Result<u64, BridgeError> {
        let mut state = self.state.lock();
        state.counters.hash_queries += 1;
        state
            .lods
            .get(&lod.0)
            .map(|s| s.merged_hash)
            .ok_or(BridgeError::ObjectGone)
    }

    fn merge_primitives(&self, lod: NativeHandle) -> NativeResult {
        let mut state = self.state.lock();
        state.counters.native_merges += 1;
        if state.lods.contains_key(&lod.0) {
            NativeResult::Success
        } else {
            NativeResult::ObjectNotExist
        }
    }

    fn get_merged_mesh_info(&self, lod: NativeHandle) -> Result<MergedMeshInfo, BridgeError> {
        let state = self.state.lock();
        state
            .lods
            .get(&lod.0)
            .map(MockBridge::lod_mesh_info)
            .ok_or(BridgeError::ObjectGone)
    }

    fn get_merged_mesh_data(&self, lod: NativeHandle, scratch: &mut MeshScratch) -> NativeResult {
        let mut state = self.state.lock();
        let Some(script) = state.lods.get(&lod.0) else {
            return NativeResult::ObjectNotExist;
        };
        if script.fail_mesh_data {
            return NativeResult::InvalidData;
        }
        state.counters.data_extractions += 1;

        // Deterministic payload keyed by element index.
        for (i, v) in scratch.positions.iter_mut().enumerate() {
            *v = i as f32 * 0.25;
        }
        for v in scratch.normals.iter_mut() {
            *v = 1.0;
        }
        for v in scratch.tangents.iter_mut() {
            *v = 0.5;
        }
        for uv in scratch.uvs.iter_mut() {
            for (i, v) in uv.iter_mut().enumerate() {
                *v = (i % 2) as f32;
            }
        }
        for (i, v) in scratch.material_indices.iter_mut().enumerate() {
            *v = (i % 4) as f32;
        }
        for v in scratch.bone_weights.iter_mut() {
            *v = 0.25;
        }
        for (i, v) in scratch.bind_poses.iter_mut().enumerate() {
            *v = if i % 5 == 0 { 1.0 } else { 0.0 };
        }
        for (i, v) in scratch.indices.iter_mut().enumerate() {
            *v = i as u32;
        }
        NativeResult::Success
    }

    fn get_merged_render_material(&self, lod: NativeHandle) -> Result<NativeHandle, BridgeError> {
        let mut state = self.state.lock();
        let Some(script) = state.lods.get(&lod.0) else {
            return Err(BridgeError::ObjectGone);
        };
        if script.fail_merged_material {
            return Err(BridgeError::Call {
                call: "getMergedRenderMaterial",
                code: NativeResult::Failure,
            });
        }
        let material = script.merged_material;
        retain_for_caller(&mut state, material);
        Ok(material)
    }

    fn build_official_material(
        &self,
        primitive: NativeHandle,
    ) -> Result<NativeHandle, BridgeError> {
        let mut state = self.state.lock();
        let Some(script) = MockBridge::prim_script(&state, primitive) else {
            return Err(BridgeError::ObjectGone);
        };
        let material = alloc_handle(&mut state);
        retain_for_caller(&mut state, material);
        let base_texture = if script.has_base_texture {
            let texture = alloc_handle(&mut state);
            state.textures.insert(texture.0, vec![0x42; 16]);
            Some(texture)
        } else {
            None
        };
        let overlay = alloc_handle(&mut state);
        state.textures.insert(overlay.0, vec![0x24; 16]);
        state.materials.insert(
            material.0,
            MaterialScript {
                base_texture,
                overlay_texture: Some(overlay),
                baked_flag: false,
                dirty: false,
            },
        );
        Ok(material)
    }

    fn material_base_color_texture(&self, material: NativeHandle) -> Option<NativeHandle> {
        self.state
            .lock()
            .materials
            .get(&material.0)
            .and_then(|m| m.base_texture)
    }

    fn material_overlay_texture(&self, material: NativeHandle) -> Option<NativeHandle> {
        self.state
            .lock()
            .materials
            .get(&material.0)
            .and_then(|m| m.overlay_texture)
    }

    fn material_bake_region(&self, _material: NativeHandle) -> BakeRegion {
        BakeRegion::default()
    }

    fn material_baked_flag(&self, material: NativeHandle) -> bool {
        self.state
            .lock()
            .materials
            .get(&material.0)
            .map(|m| m.baked_flag)
            .unwrap_or(false)
    }

    fn material_is_dirty(&self, material: NativeHandle) -> bool {
        self.state
            .lock()
            .materials
            .get(&material.0)
            .map(|m| m.dirty)
            .unwrap_or(false)
    }

    fn resolve_property_id(&self, name: &str) -> Option<PropertyId> {
        let mut state = self.state.lock();
        let next = state.property_ids.len() as u32;
        let id = *state
            .property_ids
            .entry(name.to_string())
            .or_insert(next);
        Some(PropertyId(id))
    }

    fn read_material_bytes(&self, material: NativeHandle, out: &mut Vec<u8>) -> NativeResult {
        let mut state = self.state.lock();
        let Some(script) = state.materials.get_mut(&material.0) else {
            return NativeResult::ObjectNotExist;
        };
        out.clear();
        out.extend_from_slice(&[0xA5; 64]);
        script.dirty = false;
        NativeResult::Success
    }

    fn read_texture_bytes(&self, texture: NativeHandle, out: &mut Vec<u8>) -> NativeResult {
        let state = self.state.lock();
        let Some(bytes) = state.textures.get(&texture.0) else {
            return NativeResult::ObjectNotExist;
        };
        out.clear();
        out.extend_from_slice(bytes);
        NativeResult::Success
    }

    fn write_material_pixels(
        &self,
        material: NativeHandle,
        _texture: NativeHandle,
        pixels: &[u8],
    ) -> NativeResult {
        let state = self.state.lock();
        if !state.valid.contains(&material.0) {
            return NativeResult::ObjectNotExist;
        }
        if pixels.is_empty() {
            return NativeResult::InvalidData;
        }
        NativeResult::Success
    }

    fn bake_blend_shader(&self) -> NativeHandle {
        self.state.lock().blend_shader
    }

    fn submit_bake(
        &self,
        submission: BakeSubmission,
        done: Sender<BakeCompletion>,
    ) -> NativeResult {
        let mut state = self.state.lock();
        state.counters.bake_submissions += 1;
        let baked_texture = alloc_handle(&mut state);
        state.textures.insert(baked_texture.0, vec![0x99; 32]);
        if state.defer_bakes {
            state
                .pending_bakes
                .push_back((submission, baked_texture, done));
        } else {
            let completion = BakeCompletion {
                task_id: submission.task_id,
                success: true,
                material: submission.material,
                baked_texture,
            };
            drop(state);
            let _ = done.send(completion);
        }
        NativeResult::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_lod_enumerates() {
        let mock = MockBridge::new();
        let lod = mock.script_lod(&[1, 2, 3], &[1]);
        let mut out = Vec::new();
        assert!(mock.get_primitives(lod, &mut out, 16).is_success());
        assert_eq!(out.len(), 3);
        // Each returned handle carries one reference for the caller.
        for desc in &out {
            assert_eq!(mock.reference_count(desc.handle), 1);
        }
    }

    #[test]
    fn test_release_drops_validity() {
        let mock = MockBridge::new();
        let lod = mock.script_lod(&[], &[]);
        assert!(mock.is_handle_valid(lod));
        mock.release(lod);
        assert!(!mock.is_handle_valid(lod));
    }

    #[test]
    fn test_property_ids_are_stable() {
        let mock = MockBridge::new();
        let first = mock.resolve_property_id("_BaseColorMap").expect("id");
        let second = mock.resolve_property_id("_OverlayMap").expect("id");
        assert_ne!(first, second);
        assert_eq!(mock.resolve_property_id("_BaseColorMap"), Some(first));
    }
}
