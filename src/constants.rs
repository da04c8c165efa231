//! Central constants for the avatar mesh engine.

/// Build loop defaults.
pub mod build {
    /// Primitives built per frame before the build task yields.
    pub const DEFAULT_BUDGET_PER_FRAME: u32 = 4;

    /// Budget when the owner explicitly allows frame blocking.
    pub const DEFAULT_BUDGET_BLOCKING: u32 = 64;

    /// Engine-provided cap on the primitive enumeration output buffer.
    pub const DEFAULT_PRIMITIVE_CAP: usize = 128;
}

/// Destroy-path worker polling defaults.
pub mod destroy {
    /// Sleep between polls of the skeleton worker gate, in milliseconds.
    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1;

    /// Maximum polls before giving up on the worker gate.
    pub const DEFAULT_POLL_MAX: u32 = 200;
}

/// Merged mesh layout.
pub mod mesh {
    /// UV channels carried by a merged mesh, excluding the material-index channel.
    pub const MAX_UV_CHANNELS: usize = 4;

    /// Bone influences per vertex in the compact skinning layout.
    pub const SKIN_WEIGHTS_COMPACT: usize = 4;

    /// Bone influences per vertex when the native engine requires wide skinning.
    pub const SKIN_WEIGHTS_WIDE: usize = 8;
}

/// Bounds post-processing.
pub mod bounds {
    /// Fraction by which the smaller horizontal extent is pulled toward the larger.
    pub const HORIZONTAL_EXTENT_PULL: f32 = 0.8;
}
