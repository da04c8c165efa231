//! Opaque-handle call surface of the native engine.

use crossbeam_channel::Sender;

use crate::bounds::Aabb;
use crate::constants::mesh::{MAX_UV_CHANNELS, SKIN_WEIGHTS_COMPACT, SKIN_WEIGHTS_WIDE};

/// Opaque handle to a native-owned object. Zero is the null handle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NativeHandle(pub u64);

impl NativeHandle {
    pub const NULL: NativeHandle = NativeHandle(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Stable node id of a sub-mesh inside an avatar LOD.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

/// Native material property id, resolved once through the process-wide
/// name table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PropertyId(pub u32);

/// Closed result-code enumeration of the native call surface.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeResult {
    Success = 0,
    Failure = 1,
    NotInitialized = 2,
    InvalidData = 3,
    ObjectNotExist = 4,
    BufferTooSmall = 5,
}

impl NativeResult {
    pub fn is_success(self) -> bool {
        self == NativeResult::Success
    }

    /// Convert a fill-style call into a `Result`, tagging the call name.
    pub fn check(self, call: &'static str) -> Result<(), BridgeError> {
        if self.is_success() {
            Ok(())
        } else {
            Err(BridgeError::Call { call, code: self })
        }
    }
}

/// Bridge-level failure, carried inside [`crate::error::AvatarError`].
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("native call '{call}' failed: {code:?}")]
    Call {
        call: &'static str,
        code: NativeResult,
    },

    #[error("native object no longer exists")]
    ObjectGone,
}

/// One entry of the native primitive enumeration.
#[derive(Debug, Clone, Copy)]
pub struct PrimitiveDesc {
    /// Pre-retained handle; the caller owns one reference and must release
    /// it if the entry is not consumed.
    pub handle: NativeHandle,
    pub node_id: NodeId,
}

/// Metadata of a native-side merged mesh, used to size scratch buffers.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergedMeshInfo {
    pub vertex_count: u32,
    pub index_count: u32,
    pub bone_count: u32,
    pub uv_channel_count: u32,
    pub has_tangents: bool,
    pub has_colors: bool,
    /// Whether the merged skin needs the wide 8-influence layout.
    pub needs_eight_weights: bool,
}

/// Scratch buffers filled by `get_merged_mesh_data`. Allocated sized exactly
/// to a [`MergedMeshInfo`]; dropping them releases the scratch memory on
/// every path, success or failure.
#[derive(Debug, Default)]
pub struct MeshScratch {
    pub positions: Vec<f32>,
    pub normals: Vec<f32>,
    pub tangents: Vec<f32>,
    pub colors: Vec<f32>,
    pub uvs: [Vec<f32>; MAX_UV_CHANNELS],
    /// Extra UV channel repurposed as a per-vertex material index.
    pub material_indices: Vec<f32>,
    pub bone_indices: Vec<u16>,
    pub bone_weights: Vec<f32>,
    pub bind_poses: Vec<f32>,
    pub indices: Vec<u32>,
}

impl MeshScratch {
    /// Allocate every buffer sized exactly to the native metadata.
    pub fn sized_for(info: &MergedMeshInfo) -> Self {
        let n = info.vertex_count as usize;
        let weights = if info.needs_eight_weights {
            SKIN_WEIGHTS_WIDE
        } else {
            SKIN_WEIGHTS_COMPACT
        };
        let mut uvs: [Vec<f32>; MAX_UV_CHANNELS] = Default::default();
        for (channel, uv) in uvs.iter_mut().enumerate() {
            if channel < info.uv_channel_count as usize {
                *uv = vec![0.0; n * 2];
            }
        }
        Self {
            positions: vec![0.0; n * 3],
            normals: vec![0.0; n * 3],
            tangents: if info.has_tangents {
                vec![0.0; n * 4]
            } else {
                Vec::new()
            },
            colors: if info.has_colors {
                vec![0.0; n * 4]
            } else {
                Vec::new()
            },
            uvs,
            material_indices: vec![0.0; n],
            bone_indices: vec![0; n * weights],
            bone_weights: vec![0.0; n * weights],
            bind_poses: vec![0.0; info.bone_count as usize * 16],
            indices: vec![0; info.index_count as usize],
        }
    }
}

/// Normalized target region and tint of one bake task.
#[derive(Debug, Clone, Copy)]
pub struct BakeRegion {
    pub offset: [f32; 2],
    pub extent: [f32; 2],
    pub tint: [f32; 4],
}

impl Default for BakeRegion {
    fn default() -> Self {
        Self {
            offset: [0.0, 0.0],
            extent: [1.0, 1.0],
            tint: [1.0, 1.0, 1.0, 1.0],
        }
    }
}

/// GPU bake work handed to the native engine.
#[derive(Debug, Clone)]
pub struct BakeSubmission {
    pub task_id: u64,
    pub material: NativeHandle,
    pub base_texture: NativeHandle,
    /// Null when the primitive carries no overlay; the task then only tints.
    pub overlay_texture: NativeHandle,
    pub region: BakeRegion,
    pub blend_shader: NativeHandle,
}

/// Asynchronous completion of one bake submission. Delivered through the
/// channel captured at submit time; any completion order is valid.
#[derive(Debug, Clone, Copy)]
pub struct BakeCompletion {
    pub task_id: u64,
    pub success: bool,
    pub material: NativeHandle,
    pub baked_texture: NativeHandle,
}

/// Severity of a native-side log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeLogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

/// Log-callback sink exposed to the native side; forwards onto the `log`
/// facade so native lines interleave with engine logs.
pub fn native_log_sink(level: NativeLogLevel, message: &str) {
    let level = match level {
        NativeLogLevel::Error => log::Level::Error,
        NativeLogLevel::Warn => log::Level::Warn,
        NativeLogLevel::Info => log::Level::Info,
        NativeLogLevel::Debug => log::Level::Debug,
    };
    log::log!(target: "native", level, "[Native] {}", message);
}

/// Shared handle to a bridge implementation.
pub type SharedBridge = std::sync::Arc<dyn NativeEngineBridge>;

/// Synchronous, opaque-handle call surface of the native engine.
///
/// Implementations may service calls from worker threads, so the trait is
/// `Send + Sync`; the cooperative engine core itself only calls in from the
/// main frame loop (plus the skeleton pose worker).
pub trait NativeEngineBridge: Send + Sync {
    // --- handle lifetime -------------------------------------------------

    fn retain(&self, handle: NativeHandle);
    fn release(&self, handle: NativeHandle);
    fn is_handle_valid(&self, handle: NativeHandle) -> bool;

    // --- primitives ------------------------------------------------------

    /// Enumerate the primitives of a LOD into `out`, bounded by `cap`.
    /// Every returned handle is pre-retained for the caller.
    fn get_primitives(
        &self,
        lod: NativeHandle,
        out: &mut Vec<PrimitiveDesc>,
        cap: usize,
    ) -> NativeResult;

    /// Per-primitive merge-eligibility decision for the current LOD content.
    fn try_merge_primitives(
        &self,
        lod: NativeHandle,
        out: &mut Vec<(NodeId, bool)>,
    ) -> NativeResult;

    fn primitive_local_bounds(&self, primitive: NativeHandle) -> Option<Aabb>;

    /// Whether the native engine already baked this primitive's decoration.
    fn is_primitive_baked(&self, primitive: NativeHandle) -> bool;

    // --- skeleton --------------------------------------------------------

    fn get_skeleton(&self, lod: NativeHandle) -> Result<NativeHandle, BridgeError>;

    /// Pose pre-computation; safe to run off the main thread.
    fn precompute_skeleton_poses(&self, skeleton: NativeHandle) -> NativeResult;

    // --- merged mesh -----------------------------------------------------

    fn get_merged_hash_code(&self, lod: NativeHandle) -> Result<u64, BridgeError>;
    fn merge_primitives(&self, lod: NativeHandle) -> NativeResult;
    fn get_merged_mesh_info(&self, lod: NativeHandle) -> Result<MergedMeshInfo, BridgeError>;
    fn get_merged_mesh_data(&self, lod: NativeHandle, scratch: &mut MeshScratch) -> NativeResult;

    // --- materials -------------------------------------------------------

    fn get_merged_render_material(&self, lod: NativeHandle) -> Result<NativeHandle, BridgeError>;

    /// Build the official (non-custom) render material of a primitive.
    /// The returned handle is pre-retained for the caller.
    fn build_official_material(
        &self,
        primitive: NativeHandle,
    ) -> Result<NativeHandle, BridgeError>;

    /// The material's 2D base-color texture, or `None` when the material has
    /// no such texture (non-2D or absent).
    fn material_base_color_texture(&self, material: NativeHandle) -> Option<NativeHandle>;

    fn material_overlay_texture(&self, material: NativeHandle) -> Option<NativeHandle>;
    fn material_bake_region(&self, material: NativeHandle) -> BakeRegion;

    /// Whether this material was already flagged as baked.
    fn material_baked_flag(&self, material: NativeHandle) -> bool;

    /// Whether new merged-material parameter data is available for upload.
    fn material_is_dirty(&self, material: NativeHandle) -> bool;

    /// Resolve a property name through the process-wide name→id table.
    fn resolve_property_id(&self, name: &str) -> Option<PropertyId>;

    fn read_material_bytes(&self, material: NativeHandle, out: &mut Vec<u8>) -> NativeResult;

    /// Raw byte read-back of a baked texture.
    fn read_texture_bytes(&self, texture: NativeHandle, out: &mut Vec<u8>) -> NativeResult;

    /// Write baked pixels back into the native material.
    fn write_material_pixels(
        &self,
        material: NativeHandle,
        texture: NativeHandle,
        pixels: &[u8],
    ) -> NativeResult;

    // --- GPU bake --------------------------------------------------------

    /// Shared blend shader used by every bake task.
    fn bake_blend_shader(&self) -> NativeHandle;

    /// Submit one bake task. The GPU dispatch happens immediately; completion
    /// is delivered asynchronously through `done`, exactly once per accepted
    /// submission.
    fn submit_bake(&self, submission: BakeSubmission, done: Sender<BakeCompletion>)
        -> NativeResult;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scratch_sized_exactly() {
        let info = MergedMeshInfo {
            vertex_count: 10,
            index_count: 36,
            bone_count: 4,
            uv_channel_count: 2,
            has_tangents: true,
            has_colors: false,
            needs_eight_weights: false,
        };
        let scratch = MeshScratch::sized_for(&info);
        assert_eq!(scratch.positions.len(), 30);
        assert_eq!(scratch.tangents.len(), 40);
        assert!(scratch.colors.is_empty());
        assert_eq!(scratch.uvs[0].len(), 20);
        assert_eq!(scratch.uvs[1].len(), 20);
        assert!(scratch.uvs[2].is_empty());
        assert_eq!(scratch.bone_indices.len(), 40);
        assert_eq!(scratch.bind_poses.len(), 64);
        assert_eq!(scratch.indices.len(), 36);
    }

    #[test]
    fn test_scratch_wide_skinning() {
        let info = MergedMeshInfo {
            vertex_count: 3,
            needs_eight_weights: true,
            ..Default::default()
        };
        let scratch = MeshScratch::sized_for(&info);
        assert_eq!(scratch.bone_weights.len(), 24);
    }

    #[test]
    fn test_result_check_tags_call() {
        let err = NativeResult::InvalidData.check("getMergedMeshData").unwrap_err();
        assert!(err.to_string().contains("getMergedMeshData"));
        assert!(NativeResult::Success.check("x").is_ok());
    }
}
