//! Primitive-merge engine.
//!
//! Asks the native engine to combine the merge-eligible primitives of a LOD
//! into one geometry blob, short-circuiting through the content-addressed
//! cache whenever an identical batch was built before. Any native failure
//! along the way aborts the merge and leaves the LOD on the per-primitive
//! path; merging is an optimization, never a correctness requirement.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};
use static_assertions::const_assert_eq;

use crate::bridge::{MergedMeshInfo, MeshScratch, SharedBridge};
use crate::cache::{ContentAddressedCache, MergeKey};
use crate::constants::mesh::MAX_UV_CHANNELS;
use crate::error::{AvatarError, AvatarResult};
use crate::handle::ResourceHandle;
use crate::registry::{PrimitiveRegistry, RenderMeshKind};

/// Per-vertex skinning data; the wide layout is used only when the native
/// engine reports that 8 influences are required.
#[derive(Debug, Clone, PartialEq)]
pub enum SkinWeights {
    Compact {
        indices: Vec<[u16; 4]>,
        weights: Vec<[f32; 4]>,
    },
    Wide {
        indices: Vec<[u16; 8]>,
        weights: Vec<[f32; 8]>,
    },
}

impl SkinWeights {
    pub fn influences_per_vertex(&self) -> usize {
        match self {
            SkinWeights::Compact { .. } => 4,
            SkinWeights::Wide { .. } => 8,
        }
    }
}

/// GPU-facing interleaved vertex of the merged mesh. The material index
/// rides in what is otherwise a UV channel.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct PackedVertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
    pub material_index: f32,
}

const_assert_eq!(std::mem::size_of::<PackedVertex>(), 36);

/// Content-addressed, shared merged geometry blob.
#[derive(Debug)]
pub struct MergedMeshBuffer {
    pub key: MergeKey,
    pub positions: Vec<Vec3>,
    pub normals: Vec<Vec3>,
    /// Empty when the merged format carries no tangents.
    pub tangents: Vec<Vec4>,
    /// Empty when the merged format carries no vertex colors.
    pub colors: Vec<[f32; 4]>,
    pub uvs: [Vec<[f32; 2]>; MAX_UV_CHANNELS],
    /// Per-vertex material index (the repurposed extra UV channel).
    pub material_indices: Vec<f32>,
    pub skin: SkinWeights,
    pub bind_poses: Vec<Mat4>,
    pub indices: Vec<u32>,
}

impl MergedMeshBuffer {
    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    pub fn index_count(&self) -> usize {
        self.indices.len()
    }

    /// Interleave into the GPU upload layout.
    pub fn pack_vertices(&self) -> Vec<PackedVertex> {
        let uv0 = &self.uvs[0];
        (0..self.vertex_count())
            .map(|i| PackedVertex {
                position: self.positions[i].to_array(),
                normal: self.normals[i].to_array(),
                uv: uv0.get(i).copied().unwrap_or([0.0, 0.0]),
                material_index: self.material_indices.get(i).copied().unwrap_or(0.0),
            })
            .collect()
    }

    pub fn packed_bytes(&self) -> Vec<u8> {
        bytemuck::cast_slice(&self.pack_vertices()).to_vec()
    }

    #[cfg(test)]
    pub(crate) fn empty_for_tests(key: MergeKey) -> Self {
        Self {
            key,
            positions: Vec::new(),
            normals: Vec::new(),
            tangents: Vec::new(),
            colors: Vec::new(),
            uvs: Default::default(),
            material_indices: Vec::new(),
            skin: SkinWeights::Compact {
                indices: Vec::new(),
                weights: Vec::new(),
            },
            bind_poses: Vec::new(),
            indices: Vec::new(),
        }
    }
}

/// Drives native merge requests for one engine instance, sharing results
/// through the injected cache.
pub struct MeshMergeEngine {
    cache: Arc<ContentAddressedCache>,
}

impl MeshMergeEngine {
    pub fn new(cache: Arc<ContentAddressedCache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Arc<ContentAddressedCache> {
        &self.cache
    }

    /// Build (or reuse) the merged mesh for a LOD.
    ///
    /// Returns `None` when there is nothing to merge or when any native call
    /// failed; the caller then stays on per-primitive rendering. On success
    /// the eligible primitives are retagged [`RenderMeshKind::Merged`].
    pub fn build_merged_mesh(
        &self,
        bridge: &SharedBridge,
        lod_handle: &ResourceHandle,
        skeleton: Option<&ResourceHandle>,
        registry: &mut PrimitiveRegistry,
        format_flags: u32,
    ) -> Option<Arc<MergedMeshBuffer>> {
        if skeleton.is_none() {
            return None;
        }
        if !apply_merge_eligibility(bridge, lod_handle, registry) {
            return None;
        }
        if registry.merge_eligible_count() == 0 {
            return None;
        }

        let hash = match bridge.get_merged_hash_code(lod_handle.raw()) {
            Ok(hash) => hash,
            Err(err) => {
                log::warn!("[MeshMerge] hash query failed: {}", err);
                return None;
            }
        };
        let key = MergeKey {
            content_hash: hash,
            format_flags,
        };

        if let Some(buffer) = self.cache.lookup(key) {
            retag_merged(registry);
            return Some(buffer);
        }

        match extract_merged_mesh(bridge, lod_handle, key) {
            Ok(buffer) => {
                let buffer = Arc::new(buffer);
                self.cache.insert(key, &buffer);
                retag_merged(registry);
                Some(buffer)
            }
            Err(err) => {
                // Scratch buffers were dropped on the failure path already.
                log::warn!("[MeshMerge] aborted, falling back to unmerged: {}", err);
                None
            }
        }
    }
}

/// Ask the native engine which primitives may batch, and tag the registry.
/// Returns false when the eligibility query itself failed.
fn apply_merge_eligibility(
    bridge: &SharedBridge,
    lod_handle: &ResourceHandle,
    registry: &mut PrimitiveRegistry,
) -> bool {
    let mut flags = Vec::new();
    let code = bridge.try_merge_primitives(lod_handle.raw(), &mut flags);
    if !code.is_success() {
        log::warn!("[MeshMerge] eligibility query failed: {:?}", code);
        return false;
    }
    for (node_id, eligible) in flags {
        if let Some(primitive) = registry.get_mut(node_id) {
            primitive.merged_to_lod = eligible;
        }
    }
    true
}

fn retag_merged(registry: &mut PrimitiveRegistry) {
    for (_, primitive) in registry.iter_mut() {
        if primitive.merged_to_lod {
            primitive.render.kind = RenderMeshKind::Merged;
        }
    }
}

/// Full native extraction: merge, size scratch exactly, fill, construct.
fn extract_merged_mesh(
    bridge: &SharedBridge,
    lod_handle: &ResourceHandle,
    key: MergeKey,
) -> AvatarResult<MergedMeshBuffer> {
    bridge
        .merge_primitives(lod_handle.raw())
        .check("mergePrimitives")?;
    let info = bridge.get_merged_mesh_info(lod_handle.raw())?;
    let mut scratch = MeshScratch::sized_for(&info);
    bridge
        .get_merged_mesh_data(lod_handle.raw(), &mut scratch)
        .check("getMergedMeshData")?;
    construct_buffer(key, &info, scratch)
}

fn construct_buffer(
    key: MergeKey,
    info: &MergedMeshInfo,
    scratch: MeshScratch,
) -> AvatarResult<MergedMeshBuffer> {
    let n = info.vertex_count as usize;
    if scratch.positions.len() != n * 3 || scratch.material_indices.len() != n {
        return Err(AvatarError::MergeAborted {
            reason: format!(
                "native mesh data size mismatch: {} position floats for {} vertices",
                scratch.positions.len(),
                n
            ),
        });
    }

    let positions = chunk_vec3(&scratch.positions);
    let normals = chunk_vec3(&scratch.normals);
    let tangents = scratch
        .tangents
        .chunks_exact(4)
        .map(|c| Vec4::new(c[0], c[1], c[2], c[3]))
        .collect();
    let colors = scratch
        .colors
        .chunks_exact(4)
        .map(|c| [c[0], c[1], c[2], c[3]])
        .collect();

    let mut uvs: [Vec<[f32; 2]>; MAX_UV_CHANNELS] = Default::default();
    for (channel, source) in scratch.uvs.iter().enumerate() {
        uvs[channel] = source.chunks_exact(2).map(|c| [c[0], c[1]]).collect();
    }

    let skin = if info.needs_eight_weights {
        SkinWeights::Wide {
            indices: chunk_array::<u16, 8>(&scratch.bone_indices),
            weights: chunk_array::<f32, 8>(&scratch.bone_weights),
        }
    } else {
        SkinWeights::Compact {
            indices: chunk_array::<u16, 4>(&scratch.bone_indices),
            weights: chunk_array::<f32, 4>(&scratch.bone_weights),
        }
    };

    let bind_poses = scratch
        .bind_poses
        .chunks_exact(16)
        .map(|c| {
            let mut cols = [0.0f32; 16];
            cols.copy_from_slice(c);
            Mat4::from_cols_array(&cols)
        })
        .collect();

    Ok(MergedMeshBuffer {
        key,
        positions,
        normals,
        tangents,
        colors,
        uvs,
        material_indices: scratch.material_indices,
        skin,
        bind_poses,
        indices: scratch.indices,
    })
}

fn chunk_vec3(source: &[f32]) -> Vec<Vec3> {
    source
        .chunks_exact(3)
        .map(|c| Vec3::new(c[0], c[1], c[2]))
        .collect()
}

fn chunk_array<T: Copy + Default, const N: usize>(source: &[T]) -> Vec<[T; N]> {
    source
        .chunks_exact(N)
        .map(|c| {
            let mut out = [T::default(); N];
            out.copy_from_slice(c);
            out
        })
        .collect()
}
