//! Operations driving a [`LodInstance`] through its build lifecycle.

use std::thread;
use std::time::Duration;

use glam::Vec3;

use crate::bounds::BoundsAccumulator;
use crate::bridge::SharedBridge;
use crate::config::EngineConfig;
use crate::error::{AvatarError, AvatarResult};
use crate::handle::ResourceHandle;
use crate::lod::lod_data::{BuildPhase, BuildStage, LodInstance, StepStatus};
use crate::material::MergedMaterialState;
use crate::merge::MeshMergeEngine;
use crate::registry::{build_primitive_render, PrimitiveRegistry, RenderMeshKind};

/// Everything a build step needs besides the LOD itself.
pub struct BuildContext<'a> {
    pub bridge: &'a SharedBridge,
    pub merge: &'a MeshMergeEngine,
    pub config: &'a EngineConfig,
}

/// Attach the native LOD data. Legal only from `None`; the caller has
/// already retained the handle it passes in.
pub fn attach_native(
    lod: &mut LodInstance,
    native: ResourceHandle,
    lod_level: u8,
) -> AvatarResult<()> {
    if lod.stage != BuildStage::None {
        debug_assert!(false, "attach on stage {}", lod.stage.name());
        return Err(AvatarError::InvalidState {
            expected: BuildStage::None.name(),
            actual: lod.stage.name(),
        });
    }
    lod.native = Some(native);
    lod.lod_level = lod_level;
    lod.stage = BuildStage::Attached;
    log::debug!("[LodBuild] LOD {} attached", lod_level);
    Ok(())
}

/// Start (or re-enter) the asynchronous primitive build.
///
/// Legal from `Attached`. A re-entrant call once `Working` is a no-op that
/// still notifies the owner, so late listeners hear about an already-ready
/// LOD.
pub fn begin_build(lod: &mut LodInstance) -> AvatarResult<()> {
    match lod.stage {
        BuildStage::Attached => {
            lod.stage = BuildStage::Building;
            lod.phase = BuildPhase::ResolveSkeleton;
            Ok(())
        }
        BuildStage::Building => Ok(()),
        BuildStage::Working => {
            notify_ready(lod);
            Ok(())
        }
        other => {
            debug_assert!(false, "begin_build on stage {}", other.name());
            Err(AvatarError::InvalidState {
                expected: BuildStage::Attached.name(),
                actual: other.name(),
            })
        }
    }
}

/// One invocation of the resumable build task. The frame driver calls this
/// in a loop while it returns [`StepStatus::Continue`], once per tick.
pub fn step_build(lod: &mut LodInstance, ctx: &BuildContext) -> StepStatus {
    match lod.stage {
        BuildStage::Building => {}
        BuildStage::Working => return StepStatus::Done,
        // Externally destroyed since the last yield: abort into teardown.
        BuildStage::Destroyed => return StepStatus::Aborted,
        _ => return StepStatus::Suspend,
    }
    let Some(native) = lod.native.clone() else {
        log::error!("[LodBuild] LOD {} building without native data", lod.lod_level);
        destroy(lod, ctx.config);
        return StepStatus::Aborted;
    };

    match lod.phase {
        BuildPhase::ResolveSkeleton => {
            let skeleton = match ctx.bridge.get_skeleton(native.raw()) {
                Ok(raw) => match ResourceHandle::adopt_released_by(raw, "skeleton", ctx.bridge) {
                    Ok(handle) => handle,
                    Err(err) => return fail_build(lod, ctx, "skeleton adopt", err),
                },
                Err(err) => return fail_build(lod, ctx, "skeleton resolve", err.into()),
            };
            spawn_pose_worker(lod, ctx, skeleton.raw());
            lod.skeleton = Some(skeleton);

            if lod.bunch_mode {
                // A coarser bunch representation renders this avatar; skip
                // local geometry and mark ready immediately.
                lod.phase = BuildPhase::Finish;
                return StepStatus::Continue;
            }

            match lod.registry.build_all(
                ctx.bridge,
                &native,
                lod.lod_level,
                ctx.config.primitive_cap,
            ) {
                Ok(_) => {
                    lod.phase = BuildPhase::BuildPrimitives { cursor: 0 };
                    StepStatus::Continue
                }
                Err(err) => fail_build(lod, ctx, "primitive enumeration", err),
            }
        }

        BuildPhase::BuildPrimitives { cursor } => {
            let ids = lod.registry.sorted_node_ids();
            let budget = if lod.allow_frame_blocking {
                ctx.config.build_budget_blocking
            } else {
                ctx.config.build_budget_per_frame
            } as usize;

            let mut index = cursor;
            let mut built = 0usize;
            while index < ids.len() && built < budget {
                if let Some(primitive) = lod.registry.get_mut(ids[index]) {
                    build_primitive_render(ctx.bridge, primitive);
                    built += 1;
                }
                index += 1;
            }

            if index < ids.len() {
                // Budget spent; yield until the next frame tick.
                lod.phase = BuildPhase::BuildPrimitives { cursor: index };
                StepStatus::Suspend
            } else {
                lod.phase = BuildPhase::Merge;
                StepStatus::Continue
            }
        }

        BuildPhase::Merge => {
            // Any previous merge cycle's state is stale at this point.
            lod.merged = None;
            lod.merged_material = None;
            if ctx.config.batching_enabled && lod.batching_enabled && !lod.allow_editing {
                let merged = ctx.merge.build_merged_mesh(
                    ctx.bridge,
                    &native,
                    lod.skeleton.as_ref(),
                    &mut lod.registry,
                    lod.format_flags,
                );
                if let Some(buffer) = merged {
                    lod.merged = Some(buffer);
                    match ctx.bridge.get_merged_render_material(native.raw()) {
                        Ok(raw) => {
                            match ResourceHandle::adopt_released_by(
                                raw,
                                "merged material",
                                ctx.bridge,
                            ) {
                                Ok(handle) => {
                                    let state = MergedMaterialState::new(handle);
                                    lod.bake.dispatch(ctx.bridge, &lod.registry, &state.material);
                                    lod.merged_material = Some(state);
                                    lod.phase = BuildPhase::BakePoll;
                                    return StepStatus::Continue;
                                }
                                Err(err) => {
                                    log::warn!(
                                        "[LodBuild] merged material unusable, unmerging: {}",
                                        err
                                    );
                                    unmerge(lod);
                                }
                            }
                        }
                        Err(err) => {
                            log::warn!(
                                "[LodBuild] merged material query failed, unmerging: {}",
                                err
                            );
                            unmerge(lod);
                        }
                    }
                }
            }
            lod.phase = BuildPhase::Bounds;
            StepStatus::Continue
        }

        BuildPhase::BakePoll => {
            lod.bake.pump_completions(ctx.bridge);
            if lod.bake.conditional_continue() {
                // The merged material's dynamic buffer may only be touched
                // after every bake task finished.
                if let Some(material) = &mut lod.merged_material {
                    if let Err(err) = material.refresh_dynamic_buffer(ctx.bridge) {
                        log::warn!("[LodBuild] material buffer refresh failed: {}", err);
                    }
                }
                lod.phase = BuildPhase::Bounds;
                StepStatus::Continue
            } else {
                // Poll again next frame; no busy spin.
                StepStatus::Suspend
            }
        }

        BuildPhase::Bounds => {
            // A zero owner scale would collapse the world-space box; the
            // pass runs with unit scale instead.
            let scale = if lod.owner_transform.scale == Vec3::ZERO {
                Vec3::ONE
            } else {
                lod.owner_transform.scale
            };
            let translation = lod.owner_transform.translation;
            if let Some(accumulated) = BoundsAccumulator::accumulate(&mut lod.registry, true) {
                lod.raw_bounds = Some(accumulated.raw.transformed(scale, translation));
                lod.bounds = Some(accumulated.adjusted.transformed(scale, translation));
            }
            lod.phase = BuildPhase::Finish;
            StepStatus::Continue
        }

        BuildPhase::Finish => {
            lod.stage = BuildStage::Working;
            lod.is_primitives_ready = true;
            log::info!(
                "[LodBuild] LOD {} ready ({} primitives, merged: {})",
                lod.lod_level,
                lod.registry.len(),
                lod.merged.is_some()
            );
            notify_ready(lod);
            StepStatus::Done
        }
    }
}

/// Idempotent teardown, reachable from any stage.
///
/// Waits (bounded) for the skeleton pose worker, then releases owned
/// resources: primitives, merged mesh, merged material, skeleton, native
/// handle — geometry strictly before skeleton, since geometry may reference
/// skeleton bones.
pub fn destroy(lod: &mut LodInstance, config: &EngineConfig) {
    if lod.stage == BuildStage::Destroyed {
        return;
    }
    let prior = lod.stage;
    lod.stage = BuildStage::Destroyed;

    let mut polls = 0;
    while lod.worker_gate.busy() > 0 && polls < config.destroy_poll_max {
        thread::sleep(Duration::from_millis(config.destroy_poll_interval_ms));
        polls += 1;
    }
    if lod.worker_gate.busy() > 0 {
        log::warn!(
            "[LodBuild] LOD {} destroying with pose worker still busy after {} polls",
            lod.lod_level,
            polls
        );
    }

    // In-flight bake completions tolerate the torn-down material; no wait.
    lod.bake.abort();
    lod.registry.clear();
    lod.merged = None;
    lod.merged_material = None;
    lod.skeleton = None;
    lod.native = None;
    lod.is_primitives_ready = false;
    log::debug!(
        "[LodBuild] LOD {} destroyed (was {})",
        lod.lod_level,
        prior.name()
    );
}

fn fail_build(lod: &mut LodInstance, ctx: &BuildContext, what: &str, err: AvatarError) -> StepStatus {
    log::error!(
        "[LodBuild] LOD {} build failed at {}: {}",
        lod.lod_level,
        what,
        err
    );
    destroy(lod, ctx.config);
    StepStatus::Aborted
}

/// Drop the merged-path state and return the eligible primitives to their
/// per-primitive render path.
fn unmerge(lod: &mut LodInstance) {
    lod.merged = None;
    lod.merged_material = None;
    revert_merge_tags(&mut lod.registry);
}

fn revert_merge_tags(registry: &mut PrimitiveRegistry) {
    for (_, primitive) in registry.iter_mut() {
        if primitive.render.kind == RenderMeshKind::Merged {
            primitive.render.kind = RenderMeshKind::PrimitiveBound;
        }
    }
}

/// Kick off skeleton pose pre-computation on a worker thread. The gate token
/// is dropped when the worker exits, releasing the destroy path.
fn spawn_pose_worker(lod: &LodInstance, ctx: &BuildContext, skeleton: crate::bridge::NativeHandle) {
    let token = lod.worker_gate.begin();
    let bridge = ctx.bridge.clone();
    let lod_level = lod.lod_level;
    thread::spawn(move || {
        let _token = token;
        let code = bridge.precompute_skeleton_poses(skeleton);
        if !code.is_success() {
            // Missing bone transforms degrade poses, not the build.
            log::warn!(
                "[LodBuild] LOD {} pose precompute failed: {:?}",
                lod_level,
                code
            );
        }
    });
}

fn notify_ready(lod: &LodInstance) {
    if let Some(callback) = &lod.on_ready {
        callback(lod.lod_level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::mock::MockBridge;
    use crate::bridge::NodeId;
    use crate::cache::ContentAddressedCache;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct Fixture {
        mock: Arc<MockBridge>,
        bridge: SharedBridge,
        merge: MeshMergeEngine,
        config: EngineConfig,
    }

    impl Fixture {
        fn new() -> Self {
            let mock = Arc::new(MockBridge::new());
            let bridge: SharedBridge = mock.clone();
            Self {
                mock,
                bridge,
                merge: MeshMergeEngine::new(Arc::new(ContentAddressedCache::new())),
                config: EngineConfig::default(),
            }
        }

        fn ctx(&self) -> BuildContext<'_> {
            BuildContext {
                bridge: &self.bridge,
                merge: &self.merge,
                config: &self.config,
            }
        }

        fn attached_lod(&self, ids: &[u64], eligible: &[u64]) -> LodInstance {
            let raw = self.mock.script_lod(ids, eligible);
            let handle =
                ResourceHandle::adopt_released_by(raw, "lod", &self.bridge).expect("lod handle");
            let mut lod = LodInstance::new();
            attach_native(&mut lod, handle, 0).expect("attach");
            lod
        }
    }

    /// Step until the task neither continues nor suspends; returns ticks.
    fn run_to_completion(lod: &mut LodInstance, fixture: &Fixture) -> (StepStatus, u32) {
        let ctx = fixture.ctx();
        let mut ticks = 0;
        loop {
            ticks += 1;
            assert!(ticks < 1000, "build never settled");
            loop {
                match step_build(lod, &ctx) {
                    StepStatus::Continue => continue,
                    StepStatus::Suspend => break,
                    terminal => return (terminal, ticks),
                }
            }
        }
    }

    #[test]
    fn test_full_build_reaches_working() {
        let fixture = Fixture::new();
        let mut lod = fixture.attached_lod(&[1, 2, 3, 4, 5], &[1, 2, 3]);
        begin_build(&mut lod).expect("begin");
        let (status, _) = run_to_completion(&mut lod, &fixture);
        assert_eq!(status, StepStatus::Done);
        assert_eq!(lod.stage, BuildStage::Working);
        assert!(lod.is_primitives_ready);
        assert!(lod.merged.is_some());
        assert!(lod.bounds.is_some());
    }

    #[test]
    fn test_budget_bounds_per_frame_work() {
        let mut fixture = Fixture::new();
        fixture.config.build_budget_per_frame = 2;
        let mut lod = fixture.attached_lod(&[1, 2, 3, 4, 5], &[]);
        begin_build(&mut lod).expect("begin");
        let (status, ticks) = run_to_completion(&mut lod, &fixture);
        assert_eq!(status, StepStatus::Done);
        // 5 primitives at 2 per frame: suspended twice mid-list.
        assert!(ticks >= 3, "expected at least 3 ticks, got {}", ticks);
    }

    #[test]
    fn test_double_attach_fails() {
        let fixture = Fixture::new();
        let mut lod = fixture.attached_lod(&[1], &[]);
        let raw = fixture.mock.script_lod(&[2], &[]);
        let other =
            ResourceHandle::adopt_released_by(raw, "lod", &fixture.bridge).expect("handle");
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            attach_native(&mut lod, other, 1)
        }));
        // Debug builds assert; release builds return InvalidState.
        match result {
            Ok(outcome) => assert!(outcome.is_err()),
            Err(_) => {}
        }
    }

    #[test]
    fn test_destroy_is_idempotent_from_any_stage() {
        let fixture = Fixture::new();
        let mut lod = fixture.attached_lod(&[1, 2], &[]);
        begin_build(&mut lod).expect("begin");
        destroy(&mut lod, &fixture.config);
        assert_eq!(lod.stage, BuildStage::Destroyed);
        assert!(lod.native.is_none());

        destroy(&mut lod, &fixture.config);
        destroy(&mut lod, &fixture.config);
        assert_eq!(lod.stage, BuildStage::Destroyed);
    }

    #[test]
    fn test_destroy_mid_build_aborts_at_next_step() {
        let mut fixture = Fixture::new();
        fixture.config.build_budget_per_frame = 1;
        let mut lod = fixture.attached_lod(&[1, 2, 3, 4], &[]);
        begin_build(&mut lod).expect("begin");
        let ctx = fixture.ctx();

        // First frame builds one primitive then suspends.
        loop {
            match step_build(&mut lod, &ctx) {
                StepStatus::Continue => continue,
                StepStatus::Suspend => break,
                other => panic!("unexpected status {:?}", other),
            }
        }
        destroy(&mut lod, &fixture.config);
        assert_eq!(step_build(&mut lod, &ctx), StepStatus::Aborted);
        assert_eq!(lod.stage, BuildStage::Destroyed);
    }

    #[test]
    fn test_bunch_mode_skips_geometry() {
        let fixture = Fixture::new();
        let mut lod = fixture.attached_lod(&[1, 2, 3], &[1, 2, 3]);
        lod.bunch_mode = true;
        begin_build(&mut lod).expect("begin");
        let (status, _) = run_to_completion(&mut lod, &fixture);
        assert_eq!(status, StepStatus::Done);
        assert_eq!(lod.stage, BuildStage::Working);
        assert!(lod.registry.is_empty());
        assert!(lod.merged.is_none());
    }

    #[test]
    fn test_editing_avatar_never_merges() {
        let fixture = Fixture::new();
        let mut lod = fixture.attached_lod(&[1, 2], &[1, 2]);
        lod.allow_editing = true;
        begin_build(&mut lod).expect("begin");
        let (status, _) = run_to_completion(&mut lod, &fixture);
        assert_eq!(status, StepStatus::Done);
        assert!(lod.merged.is_none());
        assert_eq!(fixture.mock.counters().hash_queries, 0);
    }

    #[test]
    fn test_bake_gating_blocks_working() {
        let fixture = Fixture::new();
        fixture.mock.defer_bake_completions();
        let mut lod = fixture.attached_lod(&[1, 2, 3], &[1, 2, 3]);
        begin_build(&mut lod).expect("begin");
        let ctx = fixture.ctx();

        // Build runs until the bake poll, then suspends every frame.
        for _ in 0..5 {
            loop {
                match step_build(&mut lod, &ctx) {
                    StepStatus::Continue => continue,
                    StepStatus::Suspend => break,
                    other => panic!("finished early: {:?}", other),
                }
            }
        }
        assert_eq!(lod.stage, BuildStage::Building);

        for _ in 0..3 {
            fixture.mock.complete_one_bake(true);
        }
        let (status, _) = run_to_completion(&mut lod, &fixture);
        assert_eq!(status, StepStatus::Done);
        assert_eq!(lod.stage, BuildStage::Working);
    }

    #[test]
    fn test_zero_scale_guard_keeps_bounds_non_degenerate() {
        let fixture = Fixture::new();
        let mut lod = fixture.attached_lod(&[1, 2], &[]);
        lod.owner_transform.scale = Vec3::ZERO;
        begin_build(&mut lod).expect("begin");
        let (status, _) = run_to_completion(&mut lod, &fixture);
        assert_eq!(status, StepStatus::Done);
        assert_eq!(lod.owner_transform.scale, Vec3::ZERO);
        // The pass ran with unit scale; the box did not collapse to a point.
        let raw = lod.raw_bounds.expect("raw bounds");
        assert!(raw.extents().cmpgt(Vec3::ZERO).all());
    }

    #[test]
    fn test_owner_transform_applied_to_bounds() {
        let fixture = Fixture::new();
        let mut lod = fixture.attached_lod(&[1], &[]);
        lod.owner_transform.scale = Vec3::splat(2.0);
        lod.owner_transform.translation = Vec3::new(0.0, 10.0, 0.0);
        begin_build(&mut lod).expect("begin");
        let (status, _) = run_to_completion(&mut lod, &fixture);
        assert_eq!(status, StepStatus::Done);

        // Local box for the scripted primitive, scaled then translated.
        let local = fixture
            .bridge
            .primitive_local_bounds(
                lod.registry.get(NodeId(1)).expect("primitive").handle.raw(),
            )
            .expect("local bounds");
        assert_eq!(
            lod.raw_bounds.expect("raw bounds"),
            local.transformed(Vec3::splat(2.0), Vec3::new(0.0, 10.0, 0.0))
        );
    }

    #[test]
    fn test_material_failure_falls_back_to_unmerged() {
        let fixture = Fixture::new();
        let mut lod = fixture.attached_lod(&[1, 2, 3], &[1, 2, 3]);
        fixture
            .mock
            .fail_merged_material(lod.native.as_ref().expect("native").raw());
        begin_build(&mut lod).expect("begin");
        let (status, _) = run_to_completion(&mut lod, &fixture);
        assert_eq!(status, StepStatus::Done);
        assert_eq!(lod.stage, BuildStage::Working);
        assert!(lod.merged.is_none());
        assert!(lod.merged_material.is_none());
        // Every primitive is back on its per-primitive render path.
        for (_, primitive) in lod.registry.iter() {
            assert_eq!(primitive.render.kind, RenderMeshKind::PrimitiveBound);
        }
    }

    #[test]
    fn test_ready_notification_fires_once_per_begin() {
        let fixture = Fixture::new();
        let mut lod = fixture.attached_lod(&[1], &[]);
        let notified = Arc::new(AtomicU32::new(0));
        let sink = notified.clone();
        lod.on_ready = Some(Box::new(move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        }));
        begin_build(&mut lod).expect("begin");
        run_to_completion(&mut lod, &fixture);
        assert_eq!(notified.load(Ordering::SeqCst), 1);

        // Re-entrant call once Working still notifies downstream.
        begin_build(&mut lod).expect("re-enter");
        assert_eq!(notified.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_skeleton_failure_is_fatal() {
        let fixture = Fixture::new();
        let mut lod = fixture.attached_lod(&[1], &[]);
        fixture.mock.fail_skeleton(lod.native.as_ref().expect("native").raw());
        begin_build(&mut lod).expect("begin");
        let ctx = fixture.ctx();
        assert_eq!(step_build(&mut lod, &ctx), StepStatus::Aborted);
        assert_eq!(lod.stage, BuildStage::Destroyed);
    }
}
