//! Merged-material state and the process-wide property table.
//!
//! The native engine keys material property access by a process-wide name→id
//! table. That table is explicit and injectable here: built once at engine
//! start from a closed, compile-time property set, cleared at shutdown. No
//! runtime name reflection.

use rustc_hash::FxHashMap;

use crate::bridge::{PropertyId, SharedBridge};
use crate::error::{AvatarError, AvatarResult};
use crate::handle::ResourceHandle;

/// Closed set of material properties the merge pipeline touches. The name
/// mapping is compile-time; adding a property means adding a variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MaterialProperty {
    BaseColorMap,
    OverlayMap,
    RegionRect,
    RegionTint,
    MaterialIndexScale,
    BakedFlag,
}

impl MaterialProperty {
    pub const ALL: [MaterialProperty; 6] = [
        MaterialProperty::BaseColorMap,
        MaterialProperty::OverlayMap,
        MaterialProperty::RegionRect,
        MaterialProperty::RegionTint,
        MaterialProperty::MaterialIndexScale,
        MaterialProperty::BakedFlag,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            MaterialProperty::BaseColorMap => "_BaseColorMap",
            MaterialProperty::OverlayMap => "_OverlayMap",
            MaterialProperty::RegionRect => "_RegionRect",
            MaterialProperty::RegionTint => "_RegionTint",
            MaterialProperty::MaterialIndexScale => "_MaterialIndexScale",
            MaterialProperty::BakedFlag => "_BakedFlag",
        }
    }
}

/// Resolved name→id table. Construct at engine start, clear at shutdown.
#[derive(Default)]
pub struct PropertyTable {
    ids: FxHashMap<MaterialProperty, PropertyId>,
}

impl PropertyTable {
    /// Resolve every property of the closed set through the native table.
    pub fn initialize(bridge: &SharedBridge) -> AvatarResult<Self> {
        let mut ids = FxHashMap::default();
        for property in MaterialProperty::ALL {
            let id = bridge
                .resolve_property_id(property.name())
                .ok_or(AvatarError::PropertyUnresolved {
                    name: property.name(),
                })?;
            ids.insert(property, id);
        }
        log::debug!("[Material] property table resolved ({} entries)", ids.len());
        Ok(Self { ids })
    }

    pub fn id(&self, property: MaterialProperty) -> AvatarResult<PropertyId> {
        self.ids
            .get(&property)
            .copied()
            .ok_or(AvatarError::PropertyUnresolved {
                name: property.name(),
            })
    }

    pub fn is_initialized(&self) -> bool {
        !self.ids.is_empty()
    }

    /// Engine shutdown.
    pub fn clear(&mut self) {
        self.ids.clear();
    }
}

/// Aggregated per-LOD material parameters plus the dynamic GPU buffer reused
/// across frames while dirty.
pub struct MergedMaterialState {
    pub material: ResourceHandle,
    dynamic_buffer: Vec<u8>,
    uploads: u64,
}

impl MergedMaterialState {
    pub fn new(material: ResourceHandle) -> Self {
        Self {
            material,
            dynamic_buffer: Vec::new(),
            uploads: 0,
        }
    }

    /// Refresh the dynamic buffer, but only when the native side reports new
    /// data; redundant uploads are skipped entirely.
    pub fn refresh_dynamic_buffer(&mut self, bridge: &SharedBridge) -> AvatarResult<bool> {
        if !bridge.material_is_dirty(self.material.raw()) {
            return Ok(false);
        }
        bridge
            .read_material_bytes(self.material.raw(), &mut self.dynamic_buffer)
            .check("readMaterialBytes")?;
        self.uploads += 1;
        Ok(true)
    }

    pub fn dynamic_buffer(&self) -> &[u8] {
        &self.dynamic_buffer
    }

    pub fn upload_count(&self) -> u64 {
        self.uploads
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::mock::MockBridge;
    use std::sync::Arc;

    #[test]
    fn test_property_table_resolves_closed_set() {
        let bridge: SharedBridge = Arc::new(MockBridge::new());
        let table = PropertyTable::initialize(&bridge).expect("resolve");
        assert!(table.is_initialized());
        let rect = table.id(MaterialProperty::RegionRect).expect("id");
        let tint = table.id(MaterialProperty::RegionTint).expect("id");
        assert_ne!(rect, tint);
    }

    #[test]
    fn test_cleared_table_rejects_lookups() {
        let bridge: SharedBridge = Arc::new(MockBridge::new());
        let mut table = PropertyTable::initialize(&bridge).expect("resolve");
        table.clear();
        assert!(table.id(MaterialProperty::BakedFlag).is_err());
    }

    #[test]
    fn test_dynamic_buffer_gated_on_dirty() {
        let mock = Arc::new(MockBridge::new());
        let lod = mock.script_lod(&[1], &[1]);
        let bridge: SharedBridge = mock.clone();
        let raw = bridge.get_merged_render_material(lod).expect("material");
        let handle =
            ResourceHandle::adopt_released_by(raw, "material", &bridge).expect("handle");
        let mut state = MergedMaterialState::new(handle);

        // Not dirty: no upload.
        assert!(!state.refresh_dynamic_buffer(&bridge).expect("refresh"));
        assert_eq!(state.upload_count(), 0);

        mock.mark_material_dirty(raw);
        assert!(state.refresh_dynamic_buffer(&bridge).expect("refresh"));
        assert_eq!(state.upload_count(), 1);
        assert!(!state.dynamic_buffer().is_empty());

        // Dirty flag consumed by the read-back.
        assert!(!state.refresh_dynamic_buffer(&bridge).expect("refresh"));
        assert_eq!(state.upload_count(), 1);
    }
}
