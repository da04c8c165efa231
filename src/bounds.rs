//! Bounding-volume accumulation across the sub-renderers of a LOD.

use glam::Vec3;

use crate::constants::bounds::HORIZONTAL_EXTENT_PULL;
use crate::registry::PrimitiveRegistry;

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    pub fn union(self, other: Aabb) -> Aabb {
        Aabb {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    pub fn contains(self, other: Aabb) -> bool {
        self.min.cmple(other.min).all() && self.max.cmpge(other.max).all()
    }

    pub fn center(self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn extents(self) -> Vec3 {
        (self.max - self.min) * 0.5
    }

    pub fn is_valid(self) -> bool {
        self.min.cmple(self.max).all()
    }

    /// Apply an owner scale and translation; the corners are re-sorted so a
    /// negative scale still yields a valid box.
    pub fn transformed(self, scale: Vec3, translation: Vec3) -> Aabb {
        let a = self.min * scale + translation;
        let b = self.max * scale + translation;
        Aabb {
            min: a.min(b),
            max: a.max(b),
        }
    }
}

/// Result of one bounds pass: the raw union and the display-adjusted box.
#[derive(Debug, Clone, Copy)]
pub struct AccumulatedBounds {
    pub raw: Aabb,
    pub adjusted: Aabb,
}

/// Unions the local boxes of every built sub-renderer, then widens the
/// smaller horizontal extent toward the larger one to reduce popping at LOD
/// and culling boundaries.
pub struct BoundsAccumulator;

impl BoundsAccumulator {
    /// Accumulate over every sub-renderer with a valid local box.
    ///
    /// Offscreen-culling skips and explicit root-bone associations bias the
    /// local bounds a renderer reports, so both are cleared for the duration
    /// of the pass and restored afterwards. When `write_back` is set, every
    /// visited sub-renderer receives the adjusted box.
    pub fn accumulate(
        registry: &mut PrimitiveRegistry,
        write_back: bool,
    ) -> Option<AccumulatedBounds> {
        let mut union: Option<Aabb> = None;
        let mut visited = Vec::new();

        for (node_id, primitive) in registry.iter_mut() {
            let render = &mut primitive.render;
            if !render.built {
                continue;
            }
            let Some(local) = render.local_bounds else {
                continue;
            };
            if !local.is_valid() {
                log::warn!(
                    "[Bounds] skipping invalid local box on primitive {:?}",
                    node_id
                );
                continue;
            }

            let saved = (render.skip_offscreen_culling, render.root_bone);
            render.skip_offscreen_culling = false;
            render.root_bone = None;

            // First box seeds the union so a singleton set is well-defined.
            union = Some(match union {
                Some(acc) => acc.union(local),
                None => local,
            });

            render.skip_offscreen_culling = saved.0;
            render.root_bone = saved.1;
            visited.push(*node_id);
        }

        let raw = union?;
        let adjusted = adjust_horizontal_extents(raw);

        if write_back {
            for node_id in visited {
                if let Some(primitive) = registry.get_mut(node_id) {
                    primitive.render.local_bounds = Some(adjusted);
                }
            }
        }

        Some(AccumulatedBounds { raw, adjusted })
    }
}

/// Pull both horizontal half-extents 80% toward the larger of the two.
/// Elongated, asymmetric boxes otherwise pop visibly at LOD boundaries.
fn adjust_horizontal_extents(aabb: Aabb) -> Aabb {
    let center = aabb.center();
    let extents = aabb.extents();
    let larger = extents.x.max(extents.z);
    let x = extents.x + (larger - extents.x) * HORIZONTAL_EXTENT_PULL;
    let z = extents.z + (larger - extents.z) * HORIZONTAL_EXTENT_PULL;
    Aabb {
        min: Vec3::new(center.x - x, aabb.min.y, center.z - z),
        max: Vec3::new(center.x + x, aabb.max.y, center.z + z),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed(min: [f32; 3], max: [f32; 3]) -> Aabb {
        Aabb::new(Vec3::from(min), Vec3::from(max))
    }

    #[test]
    fn test_union_contains_inputs() {
        let a = boxed([-1.0, 0.0, -1.0], [1.0, 2.0, 1.0]);
        let b = boxed([0.5, -0.5, 0.0], [3.0, 1.0, 0.5]);
        let u = a.union(b);
        assert!(u.contains(a));
        assert!(u.contains(b));
    }

    #[test]
    fn test_adjust_pulls_smaller_extent() {
        // x half-extent 1, z half-extent 5: x pulled 80% toward 5.
        let adjusted = adjust_horizontal_extents(boxed([-1.0, 0.0, -5.0], [1.0, 2.0, 5.0]));
        let extents = adjusted.extents();
        assert!((extents.x - 4.2).abs() < 1e-5);
        assert!((extents.z - 5.0).abs() < 1e-5);
        // Vertical extent untouched.
        assert_eq!(adjusted.min.y, 0.0);
        assert_eq!(adjusted.max.y, 2.0);
    }

    #[test]
    fn test_adjust_symmetric_box_unchanged() {
        let symmetric = boxed([-2.0, -1.0, -2.0], [2.0, 1.0, 2.0]);
        assert_eq!(adjust_horizontal_extents(symmetric), symmetric);
    }

    #[test]
    fn test_adjusted_contains_raw_horizontally() {
        let raw = boxed([-0.25, 0.0, -3.0], [0.25, 1.8, 3.0]);
        let adjusted = adjust_horizontal_extents(raw);
        assert!(adjusted.contains(raw));
    }

    #[test]
    fn test_transformed_handles_negative_scale() {
        let transformed = boxed([-1.0, 0.0, -1.0], [1.0, 2.0, 1.0])
            .transformed(Vec3::new(-2.0, 1.0, 1.0), Vec3::new(0.0, 5.0, 0.0));
        assert_eq!(transformed, boxed([-2.0, 5.0, -1.0], [2.0, 7.0, 1.0]));
        assert!(transformed.is_valid());
    }
}

#[cfg(test)]
mod accumulate_tests {
    use super::*;
    use crate::bridge::mock::MockBridge;
    use crate::bridge::{NodeId, SharedBridge};
    use crate::handle::ResourceHandle;
    use crate::registry::{build_primitive_render, PrimitiveRegistry};
    use std::sync::Arc;

    fn built_registry(ids: &[u64]) -> PrimitiveRegistry {
        let mock = Arc::new(MockBridge::new());
        let lod = mock.script_lod(ids, &[]);
        let bridge: SharedBridge = mock.clone();
        let handle = ResourceHandle::adopt_released_by(lod, "lod", &bridge).expect("lod");
        let mut registry = PrimitiveRegistry::new();
        registry
            .build_all(&bridge, &handle, 0, ids.len())
            .expect("enumeration");
        for node_id in registry.sorted_node_ids() {
            build_primitive_render(&bridge, registry.get_mut(node_id).expect("primitive"));
        }
        registry
    }

    #[test]
    fn test_singleton_returns_its_box() {
        let mut registry = built_registry(&[1]);
        let local = registry
            .get(NodeId(1))
            .expect("primitive")
            .render
            .local_bounds
            .expect("box");

        let accumulated =
            BoundsAccumulator::accumulate(&mut registry, false).expect("bounds");
        assert_eq!(accumulated.raw, local);
        assert_eq!(accumulated.adjusted, adjust_horizontal_extents(local));
    }

    #[test]
    fn test_union_contains_every_local_box() {
        let mut registry = built_registry(&[1, 2, 3]);
        let locals: Vec<Aabb> = registry
            .iter()
            .map(|(_, p)| p.render.local_bounds.expect("box"))
            .collect();

        let accumulated =
            BoundsAccumulator::accumulate(&mut registry, false).expect("bounds");
        for local in locals {
            assert!(accumulated.raw.contains(local));
            assert!(accumulated.adjusted.contains(local));
        }
    }

    #[test]
    fn test_flags_restored_and_write_back_applied() {
        let mut registry = built_registry(&[1, 2]);
        {
            let render = &mut registry.get_mut(NodeId(1)).expect("primitive").render;
            render.root_bone = Some(NodeId(42));
            assert!(render.skip_offscreen_culling);
        }

        let accumulated =
            BoundsAccumulator::accumulate(&mut registry, true).expect("bounds");

        let first = &registry.get(NodeId(1)).expect("primitive").render;
        assert_eq!(first.root_bone, Some(NodeId(42)));
        assert!(first.skip_offscreen_culling);
        // Every visited renderer received the adjusted box.
        for (_, primitive) in registry.iter() {
            assert_eq!(
                primitive.render.local_bounds,
                Some(accumulated.adjusted)
            );
        }
    }

    #[test]
    fn test_unbuilt_renderers_are_skipped() {
        let mut registry = built_registry(&[1, 2]);
        registry.get_mut(NodeId(2)).expect("primitive").render.built = false;
        let local = registry
            .get(NodeId(1))
            .expect("primitive")
            .render
            .local_bounds
            .expect("box");

        let accumulated =
            BoundsAccumulator::accumulate(&mut registry, false).expect("bounds");
        assert_eq!(accumulated.raw, local);
    }
}
