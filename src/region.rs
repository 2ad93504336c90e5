//! Per-thread region control
//!
//! Whether an intercepted allocation is virtualized is decided by the calling
//! thread alone. Each thread carries a [`RegionConfig`]: the region flag, the
//! tag new allocations are filed under and their backup policy. Nothing here
//! is shared between threads, so there is no synchronization.
//!
//! The free functions mirror the C control surface one to one. The guards
//! are the scoped form host code should prefer.

use std::cell::RefCell;
use std::marker::PhantomData;

use crate::error::{SaverError, SaverResult};

/// Tag used when the caller never set one
pub const DEFAULT_TAG: &str = "default";

/// Region settings for one thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionConfig {
    /// Virtualize this thread's allocations and frees
    pub active: bool,
    /// Tag for new allocations
    pub tag: String,
    /// Keep a host copy of new allocations across pauses
    pub backup_enabled: bool,
}

impl Default for RegionConfig {
    fn default() -> Self {
        RegionConfig {
            active: false,
            tag: DEFAULT_TAG.to_string(),
            backup_enabled: false,
        }
    }
}

thread_local! {
    static REGION: RefCell<RegionConfig> = RefCell::new(RegionConfig::default());
}

pub fn set_region_active(active: bool) {
    REGION.with(|region| region.borrow_mut().active = active);
}

pub fn region_active() -> bool {
    REGION.with(|region| region.borrow().active)
}

pub fn set_tag(tag: &str) {
    REGION.with(|region| {
        let mut region = region.borrow_mut();
        region.tag.clear();
        region.tag.push_str(tag);
    });
}

pub fn current_tag() -> String {
    REGION.with(|region| region.borrow().tag.clone())
}

pub fn set_backup_policy(backup_enabled: bool) {
    REGION.with(|region| region.borrow_mut().backup_enabled = backup_enabled);
}

pub fn backup_policy() -> bool {
    REGION.with(|region| region.borrow().backup_enabled)
}

/// Snapshot of this thread's settings
pub fn current() -> RegionConfig {
    REGION.with(|region| region.borrow().clone())
}

fn replace(config: RegionConfig) -> RegionConfig {
    REGION.with(|region| std::mem::replace(&mut *region.borrow_mut(), config))
}

/// Back to the thread-start defaults
pub fn reset() {
    replace(RegionConfig::default());
}

/// Scope in which this thread's allocations are virtualized.
///
/// Regions do not nest: entering one while another is active fails. On drop
/// the settings that were in place before `enter` come back. The guard is
/// tied to the thread that created it.
#[derive(Debug)]
#[must_use = "the region ends when the guard is dropped"]
pub struct RegionGuard {
    previous: Option<RegionConfig>,
    _not_send: PhantomData<*const ()>,
}

impl RegionGuard {
    pub fn enter(tag: &str, backup_enabled: bool) -> SaverResult<Self> {
        let now = current();
        if now.active {
            return Err(SaverError::RegionAlreadyActive(now.tag));
        }
        let previous = replace(RegionConfig {
            active: true,
            tag: tag.to_string(),
            backup_enabled,
        });
        Ok(RegionGuard {
            previous: Some(previous),
            _not_send: PhantomData,
        })
    }
}

impl Drop for RegionGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            replace(previous);
        }
    }
}

/// Scope in which virtualization is switched off, e.g. for scratch buffers
/// allocated inside a region that must not be paused.
#[derive(Debug)]
#[must_use = "virtualization comes back when the guard is dropped"]
pub struct DisableGuard {
    was_active: bool,
    _not_send: PhantomData<*const ()>,
}

impl DisableGuard {
    pub fn new() -> Self {
        let was_active = region_active();
        set_region_active(false);
        DisableGuard {
            was_active,
            _not_send: PhantomData,
        }
    }
}

impl Default for DisableGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DisableGuard {
    fn drop(&mut self) {
        set_region_active(self.was_active);
    }
}
