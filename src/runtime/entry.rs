use crate::device::{DeviceAddress, HostAddress, HostAllocation, QueueHandle};
use crate::error::{OffloadError, OffloadResult};
use crate::runtime::types::CounterKind;

/// The pair of reference counters of a mapping, as one of its four reachable states.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EntryState {
    #[default]
    Unmapped,
    Structured(u32),
    Dynamic(u32),
    Both { structured: u32, dynamic: u32 },
}

/// Outcome of lowering a counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// At least one counter is still positive.
    Retained,
    /// Both counters are now zero.
    ZeroCrossing,
}

impl EntryState {
    #[must_use]
    pub const fn from_counts(structured: u32, dynamic: u32) -> Self {
        match (structured, dynamic) {
            (0, 0) => Self::Unmapped,
            (s, 0) => Self::Structured(s),
            (0, d) => Self::Dynamic(d),
            (s, d) => Self::Both {
                structured: s,
                dynamic: d,
            },
        }
    }

    /// `(structured, dynamic)`
    #[must_use]
    pub const fn counts(self) -> (u32, u32) {
        match self {
            Self::Unmapped => (0, 0),
            Self::Structured(s) => (s, 0),
            Self::Dynamic(d) => (0, d),
            Self::Both {
                structured,
                dynamic,
            } => (structured, dynamic),
        }
    }

    #[must_use]
    pub const fn count(self, kind: CounterKind) -> u32 {
        let (s, d) = self.counts();
        match kind {
            CounterKind::Structured => s,
            CounterKind::Dynamic => d,
        }
    }

    #[must_use]
    pub const fn is_unmapped(self) -> bool {
        matches!(self, Self::Unmapped)
    }

    #[must_use]
    pub const fn retain(self, kind: CounterKind) -> Self {
        let (s, d) = self.counts();
        match kind {
            CounterKind::Structured => Self::from_counts(s.saturating_add(1), d),
            CounterKind::Dynamic => Self::from_counts(s, d.saturating_add(1)),
        }
    }

    /// Decrements `kind`, or `None` if that counter is already zero.
    #[must_use]
    pub const fn release(self, kind: CounterKind) -> Option<Self> {
        let (s, d) = self.counts();
        match kind {
            CounterKind::Structured if s > 0 => Some(Self::from_counts(s - 1, d)),
            CounterKind::Dynamic if d > 0 => Some(Self::from_counts(s, d - 1)),
            _ => None,
        }
    }

    /// Drops `kind` to zero in one step, or `None` if it is already zero.
    #[must_use]
    pub const fn finalize(self, kind: CounterKind) -> Option<Self> {
        let (s, d) = self.counts();
        match kind {
            CounterKind::Structured if s > 0 => Some(Self::from_counts(0, d)),
            CounterKind::Dynamic if d > 0 => Some(Self::from_counts(s, 0)),
            _ => None,
        }
    }
}

/// One host region and its device shadow.
///
/// Only the region manager mutates entries; everything else sees them read-only.
#[derive(Debug, Clone)]
pub struct MappingEntry {
    host_address: HostAddress,
    size_bytes: usize,
    device_address: DeviceAddress,
    state: EntryState,
    never_deallocate: bool,
    copyout_on_release: bool,
    queue: QueueHandle,
    host_allocation: Option<HostAllocation>,
}

impl MappingEntry {
    pub(crate) fn new(
        host_address: HostAddress,
        size_bytes: usize,
        device_address: DeviceAddress,
        counter: CounterKind,
        queue: QueueHandle,
    ) -> Self {
        Self {
            host_address,
            size_bytes,
            device_address,
            state: EntryState::Unmapped.retain(counter),
            never_deallocate: false,
            copyout_on_release: false,
            queue,
            host_allocation: None,
        }
    }

    #[must_use]
    pub const fn host_address(&self) -> HostAddress {
        self.host_address
    }

    #[must_use]
    pub const fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    #[must_use]
    pub const fn device_address(&self) -> DeviceAddress {
        self.device_address
    }

    #[must_use]
    pub const fn state(&self) -> EntryState {
        self.state
    }

    #[must_use]
    pub const fn structured_count(&self) -> u32 {
        self.state.count(CounterKind::Structured)
    }

    #[must_use]
    pub const fn dynamic_count(&self) -> u32 {
        self.state.count(CounterKind::Dynamic)
    }

    #[must_use]
    pub const fn never_deallocate(&self) -> bool {
        self.never_deallocate
    }

    #[must_use]
    pub const fn copyout_on_release(&self) -> bool {
        self.copyout_on_release
    }

    /// Whether the runtime allocated the host buffer, and pinned it.
    #[must_use]
    pub fn pinned(&self) -> bool {
        self.host_allocation.is_some_and(|a| a.pinned)
    }

    #[must_use]
    pub const fn host_allocation(&self) -> Option<HostAllocation> {
        self.host_allocation
    }

    #[must_use]
    pub const fn queue(&self) -> QueueHandle {
        self.queue
    }

    /// One past the last host byte of the region, saturating at the top of the address space.
    #[must_use]
    pub const fn host_end(&self) -> HostAddress {
        match self.host_address.checked_add(self.size_bytes as u64) {
            Some(end) => end,
            None => HostAddress::MAX,
        }
    }

    /// `host_address <= addr < host_address + size_bytes`
    #[must_use]
    pub const fn contains(&self, addr: HostAddress) -> bool {
        addr >= self.host_address && addr < self.host_end()
    }

    /// Device counterpart of a host address inside (or at the start of) this region.
    #[must_use]
    pub const fn translate(&self, addr: HostAddress) -> DeviceAddress {
        self.device_address + (addr - self.host_address)
    }

    pub(crate) fn set_never_deallocate(&mut self, flag: bool) {
        self.never_deallocate = flag;
    }

    pub(crate) fn set_copyout_on_release(&mut self, flag: bool) {
        self.copyout_on_release = flag;
    }

    pub(crate) fn set_queue(&mut self, queue: QueueHandle) {
        self.queue = queue;
    }

    pub(crate) fn set_host_allocation(&mut self, alloc: HostAllocation) {
        self.host_allocation = Some(alloc);
    }

    pub(crate) fn retain(&mut self, kind: CounterKind) {
        self.state = self.state.retain(kind);
    }

    /// # Errors
    /// Returns `OffloadError::DoubleFree` if the `kind` counter is already zero.
    pub(crate) fn release(&mut self, kind: CounterKind) -> OffloadResult<Transition> {
        let next = self
            .state
            .release(kind)
            .ok_or(OffloadError::DoubleFree(self.host_address))?;
        Ok(self.settle(next))
    }

    /// # Errors
    /// Returns `OffloadError::DoubleFree` if the `kind` counter is already zero.
    pub(crate) fn finalize(&mut self, kind: CounterKind) -> OffloadResult<Transition> {
        let next = self
            .state
            .finalize(kind)
            .ok_or(OffloadError::DoubleFree(self.host_address))?;
        Ok(self.settle(next))
    }

    /// Used by forced deletion, which ignores the counters.
    pub(crate) fn clear(&mut self) {
        self.state = EntryState::Unmapped;
    }

    fn settle(&mut self, next: EntryState) -> Transition {
        self.state = next;
        if next.is_unmapped() {
            Transition::ZeroCrossing
        } else {
            Transition::Retained
        }
    }
}
