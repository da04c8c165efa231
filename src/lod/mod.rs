//! LOD build state machine.
//!
//! One [`LodInstance`] is one detail level of one avatar entity, driven
//! through `None → Attached → Building → Working` by a resumable build task
//! stepped once per frame. `Destroyed` is terminal and reachable from any
//! state.

// Data structures
pub mod lod_data;
// Pure functions over the data
pub mod lod_operations;

pub use lod_data::{
    BuildPhase, BuildStage, LodInstance, OwnerTransform, StepStatus, WorkerGate, WorkerToken,
};
pub use lod_operations::{attach_native, begin_build, destroy, step_build, BuildContext};
