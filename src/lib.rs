// Avatar Mesh Engine
//
// Cooperative avatar LOD pipeline layered on an opaque-handle native engine
// bridge: resumable per-frame build tasks, a content-addressed merged-mesh
// cache, and an asynchronous GPU decoration bake scheduler.
//
// Data and operations are kept in separate modules where the split pays off:
// - lod::lod_data holds the build state, lod::lod_operations drives it
// - bridge::native is the call surface, bridge::mock the test double

// Constants module
pub mod constants;

// Core modules
pub mod config;
pub mod error;

// Native engine boundary
pub mod bridge;
pub mod handle;

// Mesh pipeline
pub mod bake;
pub mod bounds;
pub mod cache;
pub mod material;
pub mod merge;
pub mod registry;

// Build lifecycle and frame loop
pub mod frame;
pub mod lod;

// Commonly used types
pub use bridge::{
    native_log_sink, BakeCompletion, BakeSubmission, BridgeError, NativeEngineBridge,
    NativeHandle, NativeResult, NodeId, SharedBridge,
};
pub use cache::{ContentAddressedCache, MergeKey};
pub use config::EngineConfig;
pub use error::{AvatarError, AvatarResult};
pub use frame::FrameDriver;
pub use handle::ResourceHandle;
pub use lod::{
    attach_native, begin_build, destroy, step_build, BuildContext, BuildStage, LodInstance,
    StepStatus,
};
pub use merge::{MergedMeshBuffer, MeshMergeEngine, PackedVertex};
pub use registry::{PrimitiveInstance, PrimitiveRegistry, RenderMeshKind};
