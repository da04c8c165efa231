//! LOD instance data.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use glam::Vec3;

use crate::bake::GpuBakeScheduler;
use crate::bounds::Aabb;
use crate::handle::ResourceHandle;
use crate::material::MergedMaterialState;
use crate::merge::MergedMeshBuffer;
use crate::registry::PrimitiveRegistry;

/// Build stage of one LOD. Only ever advances forward, except that
/// `Destroyed` is reachable from any stage and terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BuildStage {
    None,
    Attached,
    Building,
    Working,
    Destroyed,
}

impl BuildStage {
    pub const fn name(self) -> &'static str {
        match self {
            BuildStage::None => "None",
            BuildStage::Attached => "Attached",
            BuildStage::Building => "Building",
            BuildStage::Working => "Working",
            BuildStage::Destroyed => "Destroyed",
        }
    }
}

/// Outcome of one invocation of the resumable build step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    /// More work remains; step again this frame.
    Continue,
    /// Yielded; resume on the next frame tick.
    Suspend,
    /// The LOD reached `Working`.
    Done,
    /// The build was abandoned (destroyed or fatally failed).
    Aborted,
}

/// Progress cursor of the build task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildPhase {
    ResolveSkeleton,
    BuildPrimitives { cursor: usize },
    Merge,
    BakePoll,
    Bounds,
    Finish,
}

/// Scale and translation of the owning transform, consulted by the bounds
/// pass.
#[derive(Debug, Clone, Copy)]
pub struct OwnerTransform {
    pub translation: Vec3,
    pub scale: Vec3,
}

impl Default for OwnerTransform {
    fn default() -> Self {
        Self {
            translation: Vec3::ZERO,
            scale: Vec3::ONE,
        }
    }
}

/// Non-zero-while-busy gate on the skeleton pose worker thread. Destruction
/// polls this to zero before releasing skeleton data; the worker holds a
/// token for the duration of its run.
#[derive(Debug, Clone, Default)]
pub struct WorkerGate {
    busy: Arc<AtomicU32>,
}

pub struct WorkerToken {
    busy: Arc<AtomicU32>,
}

impl WorkerGate {
    pub fn begin(&self) -> WorkerToken {
        self.busy.fetch_add(1, Ordering::SeqCst);
        WorkerToken {
            busy: self.busy.clone(),
        }
    }

    pub fn busy(&self) -> u32 {
        self.busy.load(Ordering::SeqCst)
    }
}

impl Drop for WorkerToken {
    fn drop(&mut self) {
        self.busy.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Ready-notification callback toward the owning entity/manager.
pub type ReadyCallback = Box<dyn Fn(u8) + Send + Sync>;

/// One detail level of one avatar entity.
pub struct LodInstance {
    pub stage: BuildStage,
    pub lod_level: u8,
    pub native: Option<ResourceHandle>,
    pub skeleton: Option<ResourceHandle>,
    pub registry: PrimitiveRegistry,
    pub merged: Option<Arc<MergedMeshBuffer>>,
    pub merged_material: Option<MergedMaterialState>,
    pub bake: GpuBakeScheduler,
    pub bounds: Option<Aabb>,
    pub raw_bounds: Option<Aabb>,
    pub owner_transform: OwnerTransform,
    pub is_primitives_ready: bool,

    /// Bunch-level rendering delegates to a coarser representation; local
    /// geometry is skipped entirely.
    pub bunch_mode: bool,
    /// Live-editing avatars never merge; every edit would invalidate the
    /// batch.
    pub allow_editing: bool,
    pub batching_enabled: bool,
    /// Owner explicitly accepts a larger per-frame build budget.
    pub allow_frame_blocking: bool,
    /// Format flags folded into the merge cache key.
    pub format_flags: u32,

    pub(crate) phase: BuildPhase,
    pub(crate) worker_gate: WorkerGate,
    pub on_ready: Option<ReadyCallback>,
}

impl Default for LodInstance {
    fn default() -> Self {
        Self::new()
    }
}

impl LodInstance {
    pub fn new() -> Self {
        Self {
            stage: BuildStage::None,
            lod_level: 0,
            native: None,
            skeleton: None,
            registry: PrimitiveRegistry::new(),
            merged: None,
            merged_material: None,
            bake: GpuBakeScheduler::new(),
            bounds: None,
            raw_bounds: None,
            owner_transform: OwnerTransform::default(),
            is_primitives_ready: false,
            bunch_mode: false,
            allow_editing: false,
            batching_enabled: true,
            allow_frame_blocking: false,
            format_flags: 0,
            phase: BuildPhase::ResolveSkeleton,
            worker_gate: WorkerGate::default(),
            on_ready: None,
        }
    }

    pub fn stage(&self) -> BuildStage {
        self.stage
    }

    pub fn phase(&self) -> BuildPhase {
        self.phase
    }

    pub fn worker_gate(&self) -> &WorkerGate {
        &self.worker_gate
    }
}
