//! Reference-counted wrappers around native-owned objects.
//!
//! Ownership of a native handle is shared among every component that holds
//! it; the last dropped clone runs the designated teardown exactly once and
//! releases the underlying native object. Cloning retains, dropping releases.

use std::fmt;
use std::sync::Arc;

use crate::bridge::{NativeHandle, SharedBridge};
use crate::error::{AvatarError, AvatarResult};

type TeardownFn = Box<dyn Fn(NativeHandle) + Send + Sync>;

struct HandleInner {
    raw: NativeHandle,
    teardown: TeardownFn,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        // Last owner gone; exactly one teardown.
        (self.teardown)(self.raw);
    }
}

/// Shared ownership of one native object.
pub struct ResourceHandle {
    inner: Arc<HandleInner>,
}

impl ResourceHandle {
    /// Adopt a handle whose reference the native side already transferred to
    /// us (e.g. an entry of the primitive enumeration). The teardown runs
    /// when the last clone drops.
    pub fn adopt(
        raw: NativeHandle,
        context: &'static str,
        teardown: TeardownFn,
    ) -> AvatarResult<Self> {
        if raw.is_null() {
            debug_assert!(false, "adopting null handle in {}", context);
            return Err(AvatarError::NullHandle { context });
        }
        Ok(Self {
            inner: Arc::new(HandleInner { raw, teardown }),
        })
    }

    /// Adopt a pre-retained handle whose teardown is a plain bridge release.
    pub fn adopt_released_by(
        raw: NativeHandle,
        context: &'static str,
        bridge: &SharedBridge,
    ) -> AvatarResult<Self> {
        let bridge = bridge.clone();
        Self::adopt(raw, context, Box::new(move |h| bridge.release(h)))
    }

    /// Take shared ownership of a handle we do not yet hold a reference to:
    /// retains through the bridge now, releases on last drop.
    pub fn retained(
        raw: NativeHandle,
        context: &'static str,
        bridge: &SharedBridge,
    ) -> AvatarResult<Self> {
        if raw.is_null() {
            debug_assert!(false, "retaining null handle in {}", context);
            return Err(AvatarError::NullHandle { context });
        }
        bridge.retain(raw);
        Self::adopt_released_by(raw, context, bridge)
    }

    pub fn raw(&self) -> NativeHandle {
        self.inner.raw
    }

    /// Number of live owners; the teardown runs when this reaches zero.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl Clone for ResourceHandle {
    fn clone(&self) -> Self {
        // Retain.
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("raw", &self.inner.raw)
            .field("refs", &self.ref_count())
            .finish()
    }
}
