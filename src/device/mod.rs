pub mod aperture;
pub mod emulated;

use crate::error::OffloadResult;
use std::fmt;

/// Opaque address inside host memory. Only ever dereferenced by a copy.
pub type HostAddress = u64;
/// Opaque address inside device memory. Never dereferenced by the host.
pub type DeviceAddress = u64;

/// Handle of an ordered device command stream.
///
/// `QueueHandle::DEFAULT` is the implicit synchronous stream: work issued on
/// it is complete when the issuing call returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueHandle(pub u64);

impl QueueHandle {
    pub const DEFAULT: Self = Self(0);

    #[must_use]
    pub const fn is_default(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for QueueHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_default() {
            write!(f, "default")
        } else {
            write!(f, "q{}", self.0)
        }
    }
}

/// A host buffer owned by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostAllocation {
    pub address: HostAddress,
    pub size: usize,
    /// Whether the pages are locked. Pinning may be refused by the OS, in
    /// which case the buffer is still usable but pageable.
    pub pinned: bool,
}

/// Abstraction over the vendor device runtime used by the transfer engine.
pub trait DeviceRuntime {
    /// Allocate `size` bytes of device memory.
    fn allocate_device(&mut self, size: usize) -> OffloadResult<DeviceAddress>;

    /// Release device memory once all work previously issued on `queue` has run.
    fn free_device(&mut self, addr: DeviceAddress, queue: QueueHandle) -> OffloadResult<()>;

    /// Allocate a host buffer, page-locked if `pinned` is requested.
    fn allocate_host(&mut self, size: usize, pinned: bool) -> OffloadResult<HostAllocation>;

    /// Release a host buffer returned by [`DeviceRuntime::allocate_host`].
    fn free_host(&mut self, alloc: &HostAllocation) -> OffloadResult<()>;

    /// Issue a host to device copy on `queue`.
    ///
    /// # Safety
    /// `src` must be valid for reads of `size` bytes until the copy has run,
    /// i.e. until `queue` is synchronized.
    unsafe fn copy_host_to_device(
        &mut self,
        dst: DeviceAddress,
        src: HostAddress,
        size: usize,
        queue: QueueHandle,
    ) -> OffloadResult<()>;

    /// Issue a device to host copy on `queue`.
    ///
    /// # Safety
    /// `dst` must be valid for writes of `size` bytes until the copy has run.
    unsafe fn copy_device_to_host(
        &mut self,
        dst: HostAddress,
        src: DeviceAddress,
        size: usize,
        queue: QueueHandle,
    ) -> OffloadResult<()>;

    fn create_queue(&mut self) -> OffloadResult<QueueHandle>;

    /// Drain and destroy `queue`. The default queue cannot be destroyed.
    fn destroy_queue(&mut self, queue: QueueHandle) -> OffloadResult<()>;

    /// Block until all work issued on `queue` has completed.
    ///
    /// Errors raised by deferred work are reported here.
    fn synchronize(&mut self, queue: QueueHandle) -> OffloadResult<()>;

    fn synchronize_all(&mut self) -> OffloadResult<()>;

    /// Bytes of device memory currently allocated.
    fn device_bytes_in_use(&self) -> u64;
}
