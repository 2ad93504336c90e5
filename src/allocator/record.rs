//! Allocation metadata

use crate::backend::{DevicePtr, HostPtr, PhysicalHandle};

/// Physical backing of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Backing {
    /// Active: `handle` is mapped at the record's address
    Mapped(PhysicalHandle),
    /// Paused: the range is reserved, nothing is mapped
    Unmapped,
    /// A pause or resume owns the record and is talking to the driver
    InTransition,
}

/// One live virtualized allocation
#[derive(Debug)]
pub(crate) struct AllocationRecord {
    pub size: usize,
    pub device: i32,
    pub backing: Backing,
    pub tag: String,
    pub backup_enabled: bool,
    /// Allocated on first pause, kept until the record is freed
    pub host_backup: Option<HostPtr>,
}

impl AllocationRecord {
    pub fn new(
        size: usize,
        device: i32,
        handle: PhysicalHandle,
        tag: &str,
        backup_enabled: bool,
    ) -> Self {
        AllocationRecord {
            size,
            device,
            backing: Backing::Mapped(handle),
            tag: tag.to_string(),
            backup_enabled,
            host_backup: None,
        }
    }

    pub fn info(&self, ptr: DevicePtr) -> AllocationInfo {
        AllocationInfo {
            ptr,
            size: self.size,
            device: self.device,
            tag: self.tag.clone(),
            backup_enabled: self.backup_enabled,
            state: match self.backing {
                Backing::Mapped(handle) => AllocationState::Active(handle),
                Backing::Unmapped => AllocationState::Paused,
                Backing::InTransition => AllocationState::InTransition,
            },
            has_host_backup: self.host_backup.is_some(),
            host_backup: self.host_backup,
        }
    }
}

/// Public state of an allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationState {
    /// Backed by the given physical handle
    Active(PhysicalHandle),
    /// Reserved, unbacked
    Paused,
    /// Pause or resume in progress
    InTransition,
}

impl AllocationState {
    pub fn is_active(&self) -> bool {
        matches!(self, AllocationState::Active(_))
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, AllocationState::Paused)
    }

    pub fn handle(&self) -> Option<PhysicalHandle> {
        match self {
            AllocationState::Active(handle) => Some(*handle),
            _ => None,
        }
    }
}

/// Snapshot of one registry entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationInfo {
    pub ptr: DevicePtr,
    pub size: usize,
    pub device: i32,
    pub tag: String,
    pub backup_enabled: bool,
    pub state: AllocationState,
    pub has_host_backup: bool,
    /// Pinned host buffer holding the last paused snapshot
    pub host_backup: Option<HostPtr>,
}

/// Which records a pause or resume applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TagFilter<'a> {
    /// Every record
    #[default]
    All,
    /// Records whose tag equals the given one
    Tag(&'a str),
}

impl<'a> TagFilter<'a> {
    /// `None` and the empty string both select every record, matching the
    /// C entry points where a null or empty tag means "all".
    pub fn from_option(tag: Option<&'a str>) -> Self {
        match tag {
            None | Some("") => TagFilter::All,
            Some(tag) => TagFilter::Tag(tag),
        }
    }

    pub fn matches(&self, tag: &str) -> bool {
        match self {
            TagFilter::All => true,
            TagFilter::Tag(filter) => *filter == tag,
        }
    }
}

impl<'a> From<Option<&'a str>> for TagFilter<'a> {
    fn from(tag: Option<&'a str>) -> Self {
        TagFilter::from_option(tag)
    }
}

impl<'a> From<&'a str> for TagFilter<'a> {
    fn from(tag: &'a str) -> Self {
        TagFilter::from_option(Some(tag))
    }
}
