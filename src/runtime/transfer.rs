use crate::device::{DeviceAddress, DeviceRuntime, HostAllocation, QueueHandle};
use crate::error::OffloadResult;
use crate::runtime::entry::MappingEntry;
use tracing::debug;

/// Issues allocations and copies against the device runtime.
///
/// Copies are asynchronous on the entry's queue. Reading host memory after
/// [`TransferEngine::copy_to_host`] is only valid once that queue has been
/// synchronized.
pub struct TransferEngine {
    device: Box<dyn DeviceRuntime>,
}

impl std::fmt::Debug for TransferEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferEngine")
            .field("device_bytes_in_use", &self.device.device_bytes_in_use())
            .finish_non_exhaustive()
    }
}

impl TransferEngine {
    #[must_use]
    pub fn new(device: Box<dyn DeviceRuntime>) -> Self {
        Self { device }
    }

    pub fn copy_to_device(&mut self, entry: &MappingEntry) -> OffloadResult<()> {
        self.copy_to_device_on(entry, entry.queue())
    }

    pub fn copy_to_host(&mut self, entry: &MappingEntry) -> OffloadResult<()> {
        self.copy_to_host_on(entry, entry.queue())
    }

    pub fn copy_to_device_on(
        &mut self,
        entry: &MappingEntry,
        queue: QueueHandle,
    ) -> OffloadResult<()> {
        debug!(
            "transfer: H2D {} bytes 0x{:x} -> 0x{:x} on {queue}",
            entry.size_bytes(),
            entry.host_address(),
            entry.device_address()
        );
        // SAFETY: an entry only exists for host regions whose validity the
        // caller guaranteed when mapping them.
        unsafe {
            self.device.copy_host_to_device(
                entry.device_address(),
                entry.host_address(),
                entry.size_bytes(),
                queue,
            )
        }
    }

    pub fn copy_to_host_on(&mut self, entry: &MappingEntry, queue: QueueHandle) -> OffloadResult<()> {
        debug!(
            "transfer: D2H {} bytes 0x{:x} -> 0x{:x} on {queue}",
            entry.size_bytes(),
            entry.device_address(),
            entry.host_address()
        );
        // SAFETY: see `copy_to_device_on`.
        unsafe {
            self.device.copy_device_to_host(
                entry.host_address(),
                entry.device_address(),
                entry.size_bytes(),
                queue,
            )
        }
    }

    /// Drains the entry's own queue when work for it is about to go to a
    /// different one, so that FIFO order per mapping holds across queues.
    pub fn order_after(&mut self, entry: &MappingEntry, queue: QueueHandle) -> OffloadResult<()> {
        let own = entry.queue();
        if own == queue || own.is_default() {
            return Ok(());
        }
        debug!(
            "transfer: draining {own} before issuing 0x{:x} on {queue}",
            entry.host_address()
        );
        self.device.synchronize(own)
    }

    pub fn allocate_device(&mut self, size: usize) -> OffloadResult<DeviceAddress> {
        self.device.allocate_device(size)
    }

    pub fn free_device(&mut self, addr: DeviceAddress, queue: QueueHandle) -> OffloadResult<()> {
        self.device.free_device(addr, queue)
    }

    pub fn allocate_host(&mut self, size: usize) -> OffloadResult<HostAllocation> {
        self.device.allocate_host(size, false)
    }

    pub fn allocate_pinned_host(&mut self, size: usize) -> OffloadResult<HostAllocation> {
        self.device.allocate_host(size, true)
    }

    /// Frees a runtime-owned host buffer after `queue` has drained, since
    /// pending copies may still target it.
    pub fn release_host(&mut self, alloc: &HostAllocation, queue: QueueHandle) -> OffloadResult<()> {
        let drained = self.device.synchronize(queue);
        let freed = self.device.free_host(alloc);
        drained.and(freed)
    }

    pub fn create_queue(&mut self) -> OffloadResult<QueueHandle> {
        self.device.create_queue()
    }

    pub fn destroy_queue(&mut self, queue: QueueHandle) -> OffloadResult<()> {
        self.device.destroy_queue(queue)
    }

    pub fn synchronize(&mut self, queue: QueueHandle) -> OffloadResult<()> {
        self.device.synchronize(queue)
    }

    pub fn synchronize_all(&mut self) -> OffloadResult<()> {
        self.device.synchronize_all()
    }

    #[must_use]
    pub fn device_bytes_in_use(&self) -> u64 {
        self.device.device_bytes_in_use()
    }
}
