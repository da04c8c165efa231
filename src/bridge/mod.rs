//! Native engine boundary.
//!
//! The native geometry/material engine owns authoritative avatar data and is
//! reached exclusively through the opaque-handle [`NativeEngineBridge`] trait.
//! Every call is synchronous and returns a closed result code; failures are
//! converted to local errors at the call site and never cross the boundary as
//! panics.

pub mod mock;
mod native;

pub use native::{
    native_log_sink, BakeCompletion, BakeRegion, BakeSubmission, BridgeError, MergedMeshInfo,
    MeshScratch, NativeEngineBridge, NativeHandle, NativeLogLevel, NativeResult, NodeId,
    PrimitiveDesc, PropertyId, SharedBridge,
};
