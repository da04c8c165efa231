//! GPU bake task scheduler.
//!
//! Primitives destined for merging may each carry a decorative color-region
//! overlay that must be composited into the shared merged-material texture
//! before the merged draw call is visually correct. Each composite is one
//! asynchronous GPU task; the LOD build may not advance to `Working` until
//! every dispatched task has called back.

use crossbeam_channel::{unbounded, Receiver, Sender};
use rustc_hash::FxHashSet;

use crate::bridge::{
    BakeCompletion, BakeRegion, BakeSubmission, NativeHandle, NodeId, SharedBridge,
};
use crate::handle::ResourceHandle;
use crate::registry::PrimitiveRegistry;

/// One queued bake. Holds the primitive's official material alive for the
/// duration of the merge cycle; dropping the task releases it.
pub struct BakeTask {
    pub task_id: u64,
    pub node_id: NodeId,
    pub official_material: ResourceHandle,
    pub base_texture: NativeHandle,
    /// Null when the primitive has no overlay; the bake then only tints.
    pub overlay_texture: NativeHandle,
    pub region: BakeRegion,
    pub blend_shader: NativeHandle,
}

/// Builds, submits and tracks the bake tasks of one merged material.
pub struct GpuBakeScheduler {
    tasks: Vec<BakeTask>,
    /// Task ids still awaiting their completion callback. Guards against a
    /// stale callback from a previous cycle counting twice.
    pending: FxHashSet<u64>,
    total: usize,
    finished: usize,
    written_back: usize,
    next_task_id: u64,
    completion_tx: Sender<BakeCompletion>,
    completion_rx: Receiver<BakeCompletion>,
}

impl Default for GpuBakeScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuBakeScheduler {
    pub fn new() -> Self {
        let (completion_tx, completion_rx) = unbounded();
        Self {
            tasks: Vec::new(),
            pending: FxHashSet::default(),
            total: 0,
            finished: 0,
            written_back: 0,
            next_task_id: 1,
            completion_tx,
            completion_rx,
        }
    }

    /// Enumerate and submit the bake tasks for a merge cycle.
    ///
    /// Idempotent re-entry: any previously queued tasks are cleared first.
    /// A task is created for every merge-eligible primitive whose decoration
    /// the native engine has not already baked, whose official material
    /// exposes a 2D base-color texture and is not flagged baked. Submission
    /// is immediate; completion is asynchronous. Returns the task count.
    pub fn dispatch(
        &mut self,
        bridge: &SharedBridge,
        registry: &PrimitiveRegistry,
        merged_material: &ResourceHandle,
    ) -> usize {
        self.clear_tasks();
        self.written_back = 0;

        for (node_id, primitive) in registry.iter() {
            if !primitive.merged_to_lod {
                continue;
            }
            if bridge.is_primitive_baked(primitive.handle.raw()) {
                continue;
            }
            let official = match bridge.build_official_material(primitive.handle.raw()) {
                Ok(raw) => match ResourceHandle::adopt_released_by(raw, "official material", bridge)
                {
                    Ok(handle) => handle,
                    Err(_) => continue,
                },
                Err(err) => {
                    log::warn!(
                        "[GpuBake] official material build failed for {:?}: {}",
                        node_id,
                        err
                    );
                    continue;
                }
            };
            let Some(base_texture) = bridge.material_base_color_texture(official.raw()) else {
                // No 2D base color; nothing to composite onto.
                continue;
            };
            if bridge.material_baked_flag(official.raw()) {
                continue;
            }
            let overlay_texture = bridge
                .material_overlay_texture(official.raw())
                .unwrap_or(NativeHandle::NULL);
            let region = bridge.material_bake_region(official.raw());

            let task_id = self.next_task_id;
            self.next_task_id += 1;
            self.tasks.push(BakeTask {
                task_id,
                node_id: *node_id,
                official_material: official,
                base_texture,
                overlay_texture,
                region,
                blend_shader: bridge.bake_blend_shader(),
            });
        }

        self.total = self.tasks.len();
        for task in &self.tasks {
            let submission = BakeSubmission {
                task_id: task.task_id,
                material: merged_material.raw(),
                base_texture: task.base_texture,
                overlay_texture: task.overlay_texture,
                region: task.region,
                blend_shader: task.blend_shader,
            };
            let code = bridge.submit_bake(submission, self.completion_tx.clone());
            if code.is_success() {
                self.pending.insert(task.task_id);
            } else {
                // Submission refused; the task can never call back.
                log::warn!(
                    "[GpuBake] submit failed for {:?}: {:?}",
                    task.node_id,
                    code
                );
                self.finished += 1;
            }
        }
        log::debug!("[GpuBake] dispatched {} tasks", self.total);
        self.total
    }

    /// Drain completion callbacks delivered since the last frame.
    pub fn pump_completions(&mut self, bridge: &SharedBridge) {
        while let Ok(completion) = self.completion_rx.try_recv() {
            self.on_task_complete(bridge, completion);
        }
    }

    /// One completion callback. Increments the finished count regardless of
    /// success; write-back happens only for successful tasks whose target
    /// material still exists (it may have been destroyed mid-flight).
    fn on_task_complete(&mut self, bridge: &SharedBridge, completion: BakeCompletion) {
        if !self.pending.remove(&completion.task_id) {
            log::debug!("[GpuBake] stale completion for task {}", completion.task_id);
            return;
        }

        if completion.success {
            if bridge.is_handle_valid(completion.material) {
                let mut pixels = Vec::new();
                let read = bridge.read_texture_bytes(completion.baked_texture, &mut pixels);
                let wrote = read.is_success()
                    && bridge
                        .write_material_pixels(completion.material, completion.baked_texture, &pixels)
                        .is_success();
                if wrote {
                    self.written_back += 1;
                } else {
                    // Left unbaked; the merged material renders without this
                    // overlay rather than blocking the avatar.
                    log::warn!(
                        "[GpuBake] write-back failed for task {}",
                        completion.task_id
                    );
                }
            } else {
                log::debug!(
                    "[GpuBake] target material gone for task {}",
                    completion.task_id
                );
            }
        } else {
            log::warn!("[GpuBake] task {} failed on GPU", completion.task_id);
        }
        self.finished += 1;
    }

    /// True once every dispatched task called back exactly once.
    pub fn check_all_tasks_finished(&self) -> bool {
        self.finished == self.total
    }

    /// Once everything finished, release the per-task resources and report
    /// readiness; otherwise no side effects. Safe to call every frame.
    pub fn conditional_continue(&mut self) -> bool {
        if !self.check_all_tasks_finished() {
            return false;
        }
        if self.total > 0 {
            log::debug!(
                "[GpuBake] merge cycle complete: {}/{} written back",
                self.written_back,
                self.total
            );
        }
        self.clear_tasks();
        true
    }

    /// Abandon the current cycle outright (LOD destruction). In-flight
    /// completions become stale and are ignored on arrival.
    pub fn abort(&mut self) {
        self.clear_tasks();
    }

    fn clear_tasks(&mut self) {
        // Dropping tasks releases each official material handle.
        self.tasks.clear();
        self.pending.clear();
        self.total = 0;
        self.finished = 0;
        // Discard completions addressed to cleared tasks.
        while self.completion_rx.try_recv().is_ok() {}
    }

    pub fn task_count(&self) -> usize {
        self.total
    }

    pub fn written_back(&self) -> usize {
        self.written_back
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::mock::MockBridge;
    use std::sync::Arc;

    fn merged_material(bridge: &SharedBridge, lod: NativeHandle) -> ResourceHandle {
        let raw = bridge.get_merged_render_material(lod).expect("material");
        ResourceHandle::adopt_released_by(raw, "merged material", bridge).expect("handle")
    }

    fn eligible_registry(
        bridge: &SharedBridge,
        lod: NativeHandle,
        ids: &[u64],
    ) -> (ResourceHandle, PrimitiveRegistry) {
        let handle = ResourceHandle::adopt_released_by(lod, "lod", bridge).expect("lod");
        let mut registry = PrimitiveRegistry::new();
        registry
            .build_all(bridge, &handle, 0, ids.len())
            .expect("enumeration");
        for (_, primitive) in registry.iter_mut() {
            primitive.merged_to_lod = true;
        }
        (handle, registry)
    }

    #[test]
    fn test_dispatch_skips_primitive_without_base_texture() {
        let mock = Arc::new(MockBridge::new());
        let lod = mock.script_lod(&[1, 2, 3, 4], &[1, 2, 3, 4]);
        mock.script_no_base_texture(NodeId(4));
        mock.defer_bake_completions();
        let bridge: SharedBridge = mock.clone();

        let (_lod_handle, registry) = eligible_registry(&bridge, lod, &[1, 2, 3, 4]);
        let material = merged_material(&bridge, lod);

        let mut scheduler = GpuBakeScheduler::new();
        let count = scheduler.dispatch(&bridge, &registry, &material);
        assert_eq!(count, 3);
        assert!(!scheduler.check_all_tasks_finished());
        assert!(!scheduler.conditional_continue());
    }

    #[test]
    fn test_completion_gating_and_partial_failure() {
        let mock = Arc::new(MockBridge::new());
        let lod = mock.script_lod(&[1, 2, 3, 4], &[1, 2, 3, 4]);
        mock.script_no_base_texture(NodeId(4));
        mock.defer_bake_completions();
        let bridge: SharedBridge = mock.clone();

        let (_lod_handle, registry) = eligible_registry(&bridge, lod, &[1, 2, 3, 4]);
        let material = merged_material(&bridge, lod);

        let mut scheduler = GpuBakeScheduler::new();
        assert_eq!(scheduler.dispatch(&bridge, &registry, &material), 3);

        // Two succeed, one fails, in arbitrary order.
        mock.complete_one_bake(true);
        mock.complete_one_bake(false);
        scheduler.pump_completions(&bridge);
        assert!(!scheduler.check_all_tasks_finished());
        assert!(!scheduler.conditional_continue());

        mock.complete_one_bake(true);
        scheduler.pump_completions(&bridge);
        assert!(scheduler.check_all_tasks_finished());
        assert_eq!(scheduler.written_back(), 2);
        assert!(scheduler.conditional_continue());
        // After the cycle is cleared, the gate stays open.
        assert!(scheduler.check_all_tasks_finished());
    }

    #[test]
    fn test_no_eligible_tasks_is_immediately_finished() {
        let mock = Arc::new(MockBridge::new());
        let lod = mock.script_lod(&[1], &[1]);
        mock.script_primitive_baked(NodeId(1));
        let bridge: SharedBridge = mock.clone();

        let (_lod_handle, registry) = eligible_registry(&bridge, lod, &[1]);
        let material = merged_material(&bridge, lod);

        let mut scheduler = GpuBakeScheduler::new();
        assert_eq!(scheduler.dispatch(&bridge, &registry, &material), 0);
        assert!(scheduler.check_all_tasks_finished());
        assert!(scheduler.conditional_continue());
    }

    #[test]
    fn test_completion_to_destroyed_material_is_tolerated() {
        let mock = Arc::new(MockBridge::new());
        let lod = mock.script_lod(&[1], &[1]);
        mock.defer_bake_completions();
        let bridge: SharedBridge = mock.clone();

        let (_lod_handle, registry) = eligible_registry(&bridge, lod, &[1]);
        let material = merged_material(&bridge, lod);
        let material_raw = material.raw();

        let mut scheduler = GpuBakeScheduler::new();
        assert_eq!(scheduler.dispatch(&bridge, &registry, &material), 1);

        // Material torn down while the bake is in flight.
        drop(material);
        mock.invalidate_handle(material_raw);

        mock.complete_one_bake(true);
        scheduler.pump_completions(&bridge);
        assert!(scheduler.check_all_tasks_finished());
        assert_eq!(scheduler.written_back(), 0);
    }

    #[test]
    fn test_redispatch_clears_previous_cycle() {
        let mock = Arc::new(MockBridge::new());
        let lod = mock.script_lod(&[1, 2], &[1, 2]);
        mock.defer_bake_completions();
        let bridge: SharedBridge = mock.clone();

        let (_lod_handle, registry) = eligible_registry(&bridge, lod, &[1, 2]);
        let material = merged_material(&bridge, lod);

        let mut scheduler = GpuBakeScheduler::new();
        assert_eq!(scheduler.dispatch(&bridge, &registry, &material), 2);

        // Re-entry before any completion: the old cycle is dropped.
        mock.drop_pending_bakes();
        assert_eq!(scheduler.dispatch(&bridge, &registry, &material), 2);
        mock.complete_one_bake(true);
        mock.complete_one_bake(true);
        scheduler.pump_completions(&bridge);
        assert!(scheduler.check_all_tasks_finished());
    }
}
