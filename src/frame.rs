//! Cooperative frame driver.
//!
//! Owns the live LOD instances and the process-wide shared state (merge
//! cache, property table), steps every building LOD once per tick, and hosts
//! the end-of-frame cleanup hook the native side calls into.

use std::sync::Arc;
use std::time::Instant;

use crate::bridge::SharedBridge;
use crate::cache::ContentAddressedCache;
use crate::config::EngineConfig;
use crate::error::AvatarResult;
use crate::lod::{destroy, step_build, BuildContext, BuildStage, LodInstance, StepStatus};
use crate::material::PropertyTable;
use crate::merge::MeshMergeEngine;

/// A profiling span the native side opened and has not yet closed.
struct ProfilingMarker {
    name: String,
    opened_at: Instant,
}

/// Drives every registered LOD through its build task, once per frame tick.
pub struct FrameDriver {
    bridge: SharedBridge,
    cache: Arc<ContentAddressedCache>,
    merge: MeshMergeEngine,
    config: EngineConfig,
    properties: PropertyTable,
    lods: Vec<LodInstance>,
    open_markers: Vec<ProfilingMarker>,
    frame: u64,
}

impl FrameDriver {
    /// Engine start: resolves the property table and creates the shared
    /// merge cache.
    pub fn new(bridge: SharedBridge, config: EngineConfig) -> AvatarResult<Self> {
        let properties = PropertyTable::initialize(&bridge)?;
        let cache = Arc::new(ContentAddressedCache::new());
        let merge = MeshMergeEngine::new(cache.clone());
        Ok(Self {
            bridge,
            cache,
            merge,
            config,
            properties,
            lods: Vec::new(),
            open_markers: Vec::new(),
            frame: 0,
        })
    }

    pub fn bridge(&self) -> &SharedBridge {
        &self.bridge
    }

    pub fn cache(&self) -> &Arc<ContentAddressedCache> {
        &self.cache
    }

    pub fn properties(&self) -> &PropertyTable {
        &self.properties
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn add_lod(&mut self, lod: LodInstance) -> usize {
        self.lods.push(lod);
        self.lods.len() - 1
    }

    pub fn lod(&self, index: usize) -> Option<&LodInstance> {
        self.lods.get(index)
    }

    pub fn lod_mut(&mut self, index: usize) -> Option<&mut LodInstance> {
        self.lods.get_mut(index)
    }

    /// One frame tick: every building LOD steps until it suspends or
    /// settles. Suspended tasks resume on the next tick.
    pub fn tick(&mut self) {
        self.frame += 1;
        let ctx = BuildContext {
            bridge: &self.bridge,
            merge: &self.merge,
            config: &self.config,
        };
        for lod in self.lods.iter_mut() {
            if lod.stage != BuildStage::Building {
                continue;
            }
            loop {
                match step_build(lod, &ctx) {
                    StepStatus::Continue => continue,
                    StepStatus::Suspend | StepStatus::Done | StepStatus::Aborted => break,
                }
            }
        }
    }

    pub fn destroy_lod(&mut self, index: usize) {
        if let Some(lod) = self.lods.get_mut(index) {
            destroy(lod, &self.config);
        }
    }

    // --- native-facing frame hooks --------------------------------------

    pub fn begin_marker(&mut self, name: &str) {
        self.open_markers.push(ProfilingMarker {
            name: name.to_string(),
            opened_at: Instant::now(),
        });
    }

    pub fn end_marker(&mut self, name: &str) -> bool {
        match self.open_markers.iter().rposition(|m| m.name == name) {
            Some(index) => {
                self.open_markers.remove(index);
                true
            }
            None => false,
        }
    }

    /// End-of-frame cleanup hook exposed to the native side: drains any
    /// profiling markers left open and purges dead cache entries.
    pub fn end_of_frame(&mut self) {
        for marker in self.open_markers.drain(..) {
            log::warn!(
                "[Frame] marker '{}' left open for {:?}",
                marker.name,
                marker.opened_at.elapsed()
            );
        }
        let purged = self.cache.purge_dead();
        if purged > 0 {
            log::debug!("[Frame] purged {} dead cache entries", purged);
        }
    }

    /// Engine shutdown: destroy every LOD, then tear down the process-wide
    /// state constructed at engine start.
    pub fn shutdown(&mut self) {
        for lod in self.lods.iter_mut() {
            destroy(lod, &self.config);
        }
        self.lods.clear();
        self.end_of_frame();
        self.cache.clear();
        self.properties.clear();
        log::info!("[Frame] engine shut down after {} frames", self.frame);
    }
}
