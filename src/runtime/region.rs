use crate::device::{DeviceAddress, HostAddress, HostAllocation, QueueHandle};
use crate::error::{OffloadError, OffloadResult};
use crate::runtime::entry::{MappingEntry, Transition};
use crate::runtime::present::PresentTable;
use crate::runtime::transfer::TransferEngine;
use crate::runtime::types::{CounterKind, MapKind, Mapped};
use tracing::{debug, warn};

/// Per-call options of a region enter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnterOptions {
    /// Keep the device allocation when both counters reach zero.
    pub never_deallocate: bool,
    /// Queue for the copies issued by this call; becomes the entry's queue
    /// if the entry is created.
    pub queue: QueueHandle,
}

impl EnterOptions {
    #[must_use]
    pub const fn on(queue: QueueHandle) -> Self {
        Self {
            never_deallocate: false,
            queue,
        }
    }

    #[must_use]
    pub const fn never_deallocate(mut self) -> Self {
        self.never_deallocate = true;
        self
    }
}

/// A structured mapping opened inside a region frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameRecord {
    host: HostAddress,
    kind: MapKind,
    queue: QueueHandle,
}

/// Drives the counter transitions of every mapping and decides when device
/// memory is allocated, copied and released.
#[derive(Debug)]
pub struct RegionManager {
    table: PresentTable,
    engine: TransferEngine,
    frames: Vec<Vec<FrameRecord>>,
    pin_host_buffers: bool,
}

impl RegionManager {
    #[must_use]
    pub fn new(engine: TransferEngine, pin_host_buffers: bool) -> Self {
        Self {
            table: PresentTable::new(),
            engine,
            frames: Vec::new(),
            pin_host_buffers,
        }
    }

    #[must_use]
    pub const fn table(&self) -> &PresentTable {
        &self.table
    }

    #[must_use]
    pub const fn engine(&self) -> &TransferEngine {
        &self.engine
    }

    pub const fn engine_mut(&mut self) -> &mut TransferEngine {
        &mut self.engine
    }

    /// Number of region frames currently open.
    #[must_use]
    pub fn region_depth(&self) -> usize {
        self.frames.len()
    }

    // ===========================================================================================
    // Enter
    // ===========================================================================================

    /// Enters a structured or dynamic data region for `[host, host + size)`.
    ///
    /// A `host` of 0 asks the runtime to allocate (and own) the host buffer.
    ///
    /// # Errors
    /// - `NotFound` for a `present` miss.
    /// - `SizeMismatch` if the region conflicts with an existing mapping.
    /// - `AllocationFailure` if device memory cannot be allocated.
    /// - `InvalidArgument` for `delete`, which cannot open a region.
    ///
    /// # Safety
    /// Unless `host` is 0, it must be valid for reads and writes of `size`
    /// bytes until the mapping is released and every queue that copied it has
    /// been synchronized.
    pub unsafe fn enter(
        &mut self,
        host: HostAddress,
        size: usize,
        kind: MapKind,
        counter: CounterKind,
        opts: EnterOptions,
    ) -> OffloadResult<Mapped> {
        if kind == MapKind::Delete {
            return Err(OffloadError::InvalidArgument(format!(
                "'{kind}' cannot open a {counter} region"
            )));
        }

        let mapped = if host == 0 {
            self.enter_runtime_owned(size, kind, counter, opts)?
        } else if let Some(device_address) = self.retain_present(host, size, counter, opts)? {
            Mapped {
                host_address: host,
                device_address,
            }
        } else {
            self.enter_absent(host, size, kind, counter, opts, None)?
        };

        if counter == CounterKind::Structured
            && !mapped.is_null()
            && let Some(frame) = self.frames.last_mut()
        {
            frame.push(FrameRecord {
                host: mapped.host_address,
                kind,
                queue: opts.queue,
            });
        }

        Ok(mapped)
    }

    /// Enters with `present` semantics if the address is mapped, otherwise
    /// with the allocating `fallback` kind.
    ///
    /// # Errors
    /// Same as [`RegionManager::enter`]; `InvalidArgument` if `fallback` does not allocate.
    ///
    /// # Safety
    /// Same as [`RegionManager::enter`].
    pub unsafe fn present_or(
        &mut self,
        host: HostAddress,
        size: usize,
        fallback: MapKind,
        counter: CounterKind,
        opts: EnterOptions,
    ) -> OffloadResult<Mapped> {
        if !fallback.allocates() {
            return Err(OffloadError::InvalidArgument(format!(
                "'{fallback}' is not an allocating fallback for present"
            )));
        }

        let kind = if host != 0 && self.table.find_containing(host).is_some() {
            MapKind::Present
        } else {
            fallback
        };
        unsafe { self.enter(host, size, kind, counter, opts) }
    }

    /// Bumps the counter of an existing mapping. `Ok(None)` if nothing is mapped there.
    fn retain_present(
        &mut self,
        host: HostAddress,
        size: usize,
        counter: CounterKind,
        opts: EnterOptions,
    ) -> OffloadResult<Option<DeviceAddress>> {
        if self.table.find_containing(host).is_none() {
            if let Some(other) = self.table.find_overlapping(host, size) {
                return Err(OffloadError::SizeMismatch {
                    host: other.host_address(),
                    mapped: other.size_bytes(),
                    requested: size,
                });
            }
            return Ok(None);
        }

        let entry = self
            .table
            .find_containing_mut(host)
            .ok_or(OffloadError::NotFound(host))?;

        let fits = if entry.host_address() == host {
            entry.size_bytes() == size
        } else {
            host.checked_add(size as u64)
                .is_some_and(|end| end <= entry.host_end())
        };
        if !fits {
            return Err(OffloadError::SizeMismatch {
                host: entry.host_address(),
                mapped: entry.size_bytes(),
                requested: size,
            });
        }

        entry.retain(counter);
        if opts.never_deallocate {
            entry.set_never_deallocate(true);
        }

        let (s, d) = entry.state().counts();
        debug!("region: 0x{host:x} already present, {counter} +1 -> ({s}, {d})");
        Ok(Some(entry.translate(host)))
    }

    fn enter_absent(
        &mut self,
        host: HostAddress,
        size: usize,
        kind: MapKind,
        counter: CounterKind,
        opts: EnterOptions,
        host_allocation: Option<HostAllocation>,
    ) -> OffloadResult<Mapped> {
        match kind {
            MapKind::Present => return Err(OffloadError::NotFound(host)),
            MapKind::NoCreate => {
                debug!("region: no_create miss for 0x{host:x}");
                return Ok(Mapped {
                    host_address: host,
                    device_address: 0,
                });
            }
            _ => {}
        }

        let device = self.engine.allocate_device(size)?;

        let mut entry = MappingEntry::new(host, size, device, counter, opts.queue);
        entry.set_never_deallocate(opts.never_deallocate);
        entry.set_copyout_on_release(kind.copies_out());
        if let Some(alloc) = host_allocation {
            entry.set_host_allocation(alloc);
        }

        let issued = if kind.copies_in() {
            self.engine.copy_to_device(&entry)
        } else {
            Ok(())
        };

        if let Err(e) = issued.and_then(|()| self.table.insert(entry)) {
            if let Err(free_err) = self.engine.free_device(device, opts.queue) {
                warn!("region: could not free 0x{device:x} after failed enter: {free_err}");
            }
            return Err(e);
        }

        debug!("region: {kind} mapped 0x{host:x} ({size} bytes) -> 0x{device:x} [{counter}]");
        Ok(Mapped {
            host_address: host,
            device_address: device,
        })
    }

    fn enter_runtime_owned(
        &mut self,
        size: usize,
        kind: MapKind,
        counter: CounterKind,
        opts: EnterOptions,
    ) -> OffloadResult<Mapped> {
        match kind {
            MapKind::Present => return Err(OffloadError::NotFound(0)),
            MapKind::NoCreate => {
                return Ok(Mapped {
                    host_address: 0,
                    device_address: 0,
                });
            }
            _ => {}
        }

        let alloc = if self.pin_host_buffers {
            self.engine.allocate_pinned_host(size)?
        } else {
            self.engine.allocate_host(size)?
        };

        self.enter_absent(alloc.address, size, kind, counter, opts, Some(alloc))
            .inspect_err(|_| {
                if let Err(e) = self.engine.release_host(&alloc, opts.queue) {
                    warn!("region: could not release host buffer 0x{:x}: {e}", alloc.address);
                }
            })
    }

    // ===========================================================================================
    // Exit
    // ===========================================================================================

    /// Lowers the `counter` of the mapping containing `host` by one.
    ///
    /// When both counters reach zero the device memory is released on
    /// `queue`, after a device to host copy if `kind` is `copyout`/`copy` or
    /// the mapping was created by one. `never_deallocate` mappings stay.
    /// `delete` forces removal, see [`RegionManager::delete`].
    ///
    /// # Errors
    /// `NotFound` for an unmapped address, `DoubleFree` if the counter is already zero.
    pub fn exit(
        &mut self,
        host: HostAddress,
        kind: MapKind,
        counter: CounterKind,
        queue: QueueHandle,
    ) -> OffloadResult<()> {
        if kind == MapKind::Delete {
            return self.delete(host, false, queue);
        }

        let entry = self
            .table
            .find_containing_mut(host)
            .ok_or(OffloadError::NotFound(host))?;
        let transition = entry.release(counter)?;
        let key = entry.host_address();

        self.settle(key, transition, kind, queue)
    }

    /// Drops the dynamic counter to zero in one step (`exit data ... finalize`).
    ///
    /// # Errors
    /// `NotFound` for an unmapped address, `DoubleFree` if the dynamic counter is already zero.
    pub fn finalize(&mut self, host: HostAddress, kind: MapKind, queue: QueueHandle) -> OffloadResult<()> {
        if kind == MapKind::Delete {
            return self.delete(host, false, queue);
        }

        let entry = self
            .table
            .find_containing_mut(host)
            .ok_or(OffloadError::NotFound(host))?;
        let transition = entry.finalize(CounterKind::Dynamic)?;
        let key = entry.host_address();

        self.settle(key, transition, kind, queue)
    }

    /// Removes the mapping containing `host` regardless of its counters,
    /// enclosing structured regions or `never_deallocate`.
    ///
    /// # Errors
    /// `NotFound` for an unmapped address; transfer errors from the copy or free.
    pub fn delete(&mut self, host: HostAddress, copy_out: bool, queue: QueueHandle) -> OffloadResult<()> {
        let key = self
            .table
            .find_containing(host)
            .ok_or(OffloadError::NotFound(host))?
            .host_address();
        let mut entry = self.table.erase(key).ok_or(OffloadError::NotFound(key))?;

        if entry.structured_count() > 0 {
            warn!(
                "region: deleting 0x{key:x} inside {} open structured region(s)",
                entry.structured_count()
            );
        }
        entry.clear();

        // Enclosing frames must not exit the mapping a second time
        for frame in &mut self.frames {
            frame.retain(|rec| !entry.contains(rec.host) && rec.host != key);
        }

        self.evict(&entry, copy_out, queue)
    }

    fn settle(
        &mut self,
        key: HostAddress,
        transition: Transition,
        kind: MapKind,
        queue: QueueHandle,
    ) -> OffloadResult<()> {
        let entry = self.table.find(key).ok_or(OffloadError::NotFound(key))?;

        if transition == Transition::Retained {
            let (s, d) = entry.state().counts();
            debug!("region: 0x{key:x} retained at ({s}, {d})");
            return Ok(());
        }
        if entry.never_deallocate() {
            debug!("region: 0x{key:x} unreferenced, kept (never_deallocate)");
            return Ok(());
        }

        let entry = self.table.erase(key).ok_or(OffloadError::NotFound(key))?;
        let copy_out = kind.copies_out() || entry.copyout_on_release();
        self.evict(&entry, copy_out, queue)
    }

    /// Copies out if requested, then frees device memory and any runtime-owned host buffer.
    fn evict(&mut self, entry: &MappingEntry, copy_out: bool, queue: QueueHandle) -> OffloadResult<()> {
        let ordered = self.engine.order_after(entry, queue);
        let copied = if copy_out {
            self.engine.copy_to_host_on(entry, queue)
        } else {
            Ok(())
        };
        let freed = self.engine.free_device(entry.device_address(), queue);
        let released = entry
            .host_allocation()
            .map_or(Ok(()), |alloc| self.engine.release_host(&alloc, queue));

        debug!(
            "region: released 0x{:x} ({} bytes, copy_out: {copy_out}) on {queue}",
            entry.host_address(),
            entry.size_bytes()
        );
        ordered.and(copied).and(freed).and(released)
    }

    // ===========================================================================================
    // Region Frames
    // ===========================================================================================

    /// Opens a frame that records every subsequent structured enter.
    pub fn enter_region(&mut self) {
        self.frames.push(Vec::new());
        debug!("region: entered frame {}", self.frames.len());
    }

    /// Closes the innermost frame, exiting its structured mappings in reverse order.
    ///
    /// All recorded mappings are exited even if one of them fails; the first
    /// error is returned.
    ///
    /// # Errors
    /// `InvalidArgument` if no frame is open.
    pub fn exit_region(&mut self) -> OffloadResult<()> {
        let frame = self.frames.pop().ok_or_else(|| {
            OffloadError::InvalidArgument("exit_region without a matching enter_region".to_string())
        })?;
        debug!("region: leaving frame {} ({} mappings)", self.frames.len() + 1, frame.len());

        let mut first_err = None;
        for rec in frame.into_iter().rev() {
            if let Err(e) = self.exit(rec.host, rec.kind, CounterKind::Structured, rec.queue) {
                warn!("region: structured exit of 0x{:x} failed: {e}", rec.host);
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    // ===========================================================================================
    // Queries & One-Shot Copies
    // ===========================================================================================

    /// Device address for `host` or an address inside a mapped region.
    ///
    /// # Errors
    /// `NotFound` if no mapping contains `host`.
    pub fn use_device(&self, host: HostAddress) -> OffloadResult<DeviceAddress> {
        self.table
            .find_containing(host)
            .map(|e| e.translate(host))
            .ok_or(OffloadError::NotFound(host))
    }

    #[must_use]
    pub fn is_present(&self, host: HostAddress) -> bool {
        self.table.find_containing(host).is_some()
    }

    /// Copies the whole mapping containing `host` back to the host. Counters are untouched.
    ///
    /// # Errors
    /// `NotFound` if no mapping contains `host`.
    pub fn update_host(&mut self, host: HostAddress, queue: QueueHandle) -> OffloadResult<()> {
        let entry = self
            .table
            .find_containing(host)
            .ok_or(OffloadError::NotFound(host))?;
        let ordered = self.engine.order_after(entry, queue);
        ordered.and_then(|()| self.engine.copy_to_host_on(entry, queue))
    }

    /// Copies the host side of the mapping containing `host` to the device. Counters are untouched.
    ///
    /// # Errors
    /// `NotFound` if no mapping contains `host`.
    pub fn update_device(&mut self, host: HostAddress, queue: QueueHandle) -> OffloadResult<()> {
        let entry = self
            .table
            .find_containing(host)
            .ok_or(OffloadError::NotFound(host))?;
        let ordered = self.engine.order_after(entry, queue);
        ordered.and_then(|()| self.engine.copy_to_device_on(entry, queue))
    }

    /// Points mappings and frame records that use `from` at `to`.
    pub fn retarget_queue(&mut self, from: QueueHandle, to: QueueHandle) {
        for entry in self.table.iter_mut() {
            if entry.queue() == from {
                entry.set_queue(to);
            }
        }
        for rec in self.frames.iter_mut().flatten() {
            if rec.queue == from {
                rec.queue = to;
            }
        }
    }

    /// Closes all frames and releases every mapping, copying out the ones
    /// still referenced that were created by `copyout`/`copy`.
    ///
    /// # Errors
    /// The first transfer error encountered; every mapping is released regardless.
    pub fn release_all(&mut self) -> OffloadResult<()> {
        let mut first_err = self.engine.synchronize_all().err();
        self.frames.clear();

        let entries: Vec<MappingEntry> = self.table.drain().collect();
        if !entries.is_empty() {
            debug!("region: releasing {} remaining mappings", entries.len());
        }
        for entry in entries {
            let copy_out = entry.copyout_on_release() && !entry.state().is_unmapped();
            if let Err(e) = self.evict(&entry, copy_out, entry.queue()) {
                warn!("region: releasing 0x{:x} failed: {e}", entry.host_address());
                first_err.get_or_insert(e);
            }
        }

        if let Err(e) = self.engine.synchronize_all() {
            first_err.get_or_insert(e);
        }
        first_err.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceRuntime;
    use crate::device::emulated::EmulatedDevice;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    struct Calls {
        alloc: usize,
        free: usize,
        h2d: usize,
        d2h: usize,
    }

    /// Counts the calls reaching an emulated device.
    struct Recorder {
        inner: EmulatedDevice,
        calls: Rc<RefCell<Calls>>,
    }

    impl DeviceRuntime for Recorder {
        fn allocate_device(&mut self, size: usize) -> OffloadResult<DeviceAddress> {
            self.calls.borrow_mut().alloc += 1;
            self.inner.allocate_device(size)
        }
        fn free_device(&mut self, addr: DeviceAddress, queue: QueueHandle) -> OffloadResult<()> {
            self.calls.borrow_mut().free += 1;
            self.inner.free_device(addr, queue)
        }
        fn allocate_host(&mut self, size: usize, pinned: bool) -> OffloadResult<HostAllocation> {
            self.inner.allocate_host(size, pinned)
        }
        fn free_host(&mut self, alloc: &HostAllocation) -> OffloadResult<()> {
            self.inner.free_host(alloc)
        }
        unsafe fn copy_host_to_device(
            &mut self,
            dst: DeviceAddress,
            src: HostAddress,
            size: usize,
            queue: QueueHandle,
        ) -> OffloadResult<()> {
            self.calls.borrow_mut().h2d += 1;
            unsafe { self.inner.copy_host_to_device(dst, src, size, queue) }
        }
        unsafe fn copy_device_to_host(
            &mut self,
            dst: HostAddress,
            src: DeviceAddress,
            size: usize,
            queue: QueueHandle,
        ) -> OffloadResult<()> {
            self.calls.borrow_mut().d2h += 1;
            unsafe { self.inner.copy_device_to_host(dst, src, size, queue) }
        }
        fn create_queue(&mut self) -> OffloadResult<QueueHandle> {
            self.inner.create_queue()
        }
        fn destroy_queue(&mut self, queue: QueueHandle) -> OffloadResult<()> {
            self.inner.destroy_queue(queue)
        }
        fn synchronize(&mut self, queue: QueueHandle) -> OffloadResult<()> {
            self.inner.synchronize(queue)
        }
        fn synchronize_all(&mut self) -> OffloadResult<()> {
            self.inner.synchronize_all()
        }
        fn device_bytes_in_use(&self) -> u64 {
            self.inner.device_bytes_in_use()
        }
    }

    fn manager() -> (RegionManager, Rc<RefCell<Calls>>) {
        let calls = Rc::new(RefCell::new(Calls::default()));
        let device = Recorder {
            inner: EmulatedDevice::new(1 << 20, 256),
            calls: Rc::clone(&calls),
        };
        (
            RegionManager::new(TransferEngine::new(Box::new(device)), false),
            calls,
        )
    }

    fn addr(buf: &mut [f32]) -> HostAddress {
        buf.as_mut_ptr().expose_provenance() as HostAddress
    }

    const S: CounterKind = CounterKind::Structured;
    const D: CounterKind = CounterKind::Dynamic;
    const Q: QueueHandle = QueueHandle::DEFAULT;

    #[test]
    fn create_then_exit_leaves_table_empty() {
        let (mut rm, calls) = manager();
        let mut buf = vec![0f32; 32];
        let h = addr(&mut buf);

        let m = unsafe { rm.enter(h, 128, MapKind::Create, S, EnterOptions::default()) }.unwrap();
        assert_ne!(m.device_address, 0);
        assert_eq!(calls.borrow().h2d, 0);

        rm.exit(h, MapKind::Create, S, Q).unwrap();
        assert!(rm.table().is_empty());
        assert_eq!(calls.borrow().free, 1);
        assert_eq!(rm.engine().device_bytes_in_use(), 0);
    }

    #[test]
    fn reentrant_copyin_copies_once() {
        let (mut rm, calls) = manager();
        let mut buf = vec![1.5f32; 100];
        let h = addr(&mut buf);

        unsafe {
            rm.enter(h, 400, MapKind::Copyin, S, EnterOptions::default()).unwrap();
            rm.enter(h, 400, MapKind::Copyin, S, EnterOptions::default()).unwrap();
        }
        assert_eq!(rm.table().find(h).unwrap().structured_count(), 2);
        assert_eq!(calls.borrow().h2d, 1);
        assert_eq!(calls.borrow().alloc, 1);

        rm.exit(h, MapKind::Copyout, S, Q).unwrap();
        assert_eq!(rm.table().find(h).unwrap().structured_count(), 1);
        assert_eq!(calls.borrow().d2h, 0);
        assert_eq!(calls.borrow().free, 0);
    }

    #[test]
    fn present_miss_is_not_found() {
        let (mut rm, _) = manager();
        let err = unsafe { rm.enter(0x5000, 8, MapKind::Present, S, EnterOptions::default()) }.unwrap_err();
        assert!(matches!(err, OffloadError::NotFound(0x5000)));
        assert!(rm.table().is_empty());
    }

    #[test]
    fn no_create_miss_returns_null_without_entry() {
        let (mut rm, calls) = manager();
        let m = unsafe { rm.enter(0x5000, 8, MapKind::NoCreate, D, EnterOptions::default()) }.unwrap();
        assert!(m.is_null());
        assert!(rm.table().is_empty());
        assert_eq!(calls.borrow().alloc, 0);
    }

    #[test]
    fn copyin_present_present_copyout_scenario() {
        let (mut rm, calls) = manager();
        let mut buf: Vec<f32> = (0..100).map(|i| i as f32).collect();
        let h = addr(&mut buf);

        unsafe {
            rm.enter(h, 400, MapKind::Copyin, S, EnterOptions::default()).unwrap();
            rm.enter(h, 400, MapKind::Present, S, EnterOptions::default()).unwrap();
        }
        assert_eq!(rm.table().find(h).unwrap().structured_count(), 2);

        buf.fill(-1.0);
        rm.exit(h, MapKind::Present, S, Q).unwrap();
        assert_eq!(rm.table().find(h).unwrap().structured_count(), 1);
        assert_eq!(calls.borrow().d2h, 0);

        rm.exit(h, MapKind::Copyout, S, Q).unwrap();
        assert!(rm.table().find(h).is_none());
        assert_eq!(calls.borrow().d2h, 1);
        assert_eq!(buf[10], 10.0);
    }

    #[test]
    fn mixed_regions_and_forced_delete() {
        let (mut rm, calls) = manager();
        let mut buf = vec![0f32; 16];
        let h = addr(&mut buf);

        unsafe {
            rm.enter(h, 64, MapKind::Create, D, EnterOptions::default()).unwrap();
            rm.enter(h, 64, MapKind::Copy, S, EnterOptions::default()).unwrap();
        }
        rm.exit(h, MapKind::Copyout, S, Q).unwrap();
        let entry = rm.table().find(h).unwrap();
        assert_eq!((entry.structured_count(), entry.dynamic_count()), (0, 1));
        assert_eq!(calls.borrow().free, 0);

        rm.exit(h, MapKind::Delete, D, Q).unwrap();
        assert!(rm.table().is_empty());
        assert_eq!(calls.borrow().free, 1);
    }

    #[test]
    fn size_mismatch_on_reregistration() {
        let (mut rm, _) = manager();
        let mut buf = vec![0f32; 200];
        let h = addr(&mut buf);

        unsafe { rm.enter(h, 400, MapKind::Copyin, S, EnterOptions::default()) }.unwrap();
        let err = unsafe { rm.enter(h, 800, MapKind::Copyin, S, EnterOptions::default()) }.unwrap_err();
        assert!(matches!(
            err,
            OffloadError::SizeMismatch {
                mapped: 400,
                requested: 800,
                ..
            }
        ));
        assert_eq!(rm.table().find(h).unwrap().structured_count(), 1);
    }

    #[test]
    fn interior_subarray_is_present() {
        let (mut rm, calls) = manager();
        let mut buf = vec![0f32; 100];
        let h = addr(&mut buf);

        let outer = unsafe { rm.enter(h, 400, MapKind::Copyin, D, EnterOptions::default()) }.unwrap();
        let inner = unsafe { rm.enter(h + 40, 40, MapKind::Copyin, S, EnterOptions::default()) }.unwrap();
        assert_eq!(inner.device_address, outer.device_address + 40);
        assert_eq!(calls.borrow().h2d, 1);

        // Sticks out of the mapped region
        let err = unsafe { rm.enter(h + 380, 40, MapKind::Copyin, S, EnterOptions::default()) }.unwrap_err();
        assert!(matches!(err, OffloadError::SizeMismatch { .. }));

        rm.exit(h + 40, MapKind::Copyin, S, Q).unwrap();
        assert_eq!(rm.table().find(h).unwrap().dynamic_count(), 1);
    }

    #[test]
    fn double_exit_is_double_free() {
        let (mut rm, _) = manager();
        let mut buf = vec![0f32; 4];
        let h = addr(&mut buf);

        unsafe { rm.enter(h, 16, MapKind::Create, D, EnterOptions::default()) }.unwrap();
        assert!(matches!(
            rm.exit(h, MapKind::Create, S, Q),
            Err(OffloadError::DoubleFree(_))
        ));
        rm.exit(h, MapKind::Create, D, Q).unwrap();
        assert!(matches!(
            rm.exit(h, MapKind::Create, D, Q),
            Err(OffloadError::NotFound(_))
        ));
    }

    #[test]
    fn never_deallocate_survives_zero() {
        let (mut rm, calls) = manager();
        let mut buf = vec![2f32; 8];
        let h = addr(&mut buf);

        let opts = EnterOptions::default().never_deallocate();
        let m = unsafe { rm.enter(h, 32, MapKind::Copy, S, opts) }.unwrap();
        rm.exit(h, MapKind::Copy, S, Q).unwrap();

        let entry = rm.table().find(h).unwrap();
        assert!(entry.state().is_unmapped());
        assert_eq!(entry.device_address(), m.device_address);
        assert_eq!(calls.borrow().d2h, 0);
        assert_eq!(calls.borrow().free, 0);

        rm.update_host(h, Q).unwrap();
        assert_eq!(calls.borrow().d2h, 1);

        rm.delete(h, false, Q).unwrap();
        assert!(rm.table().is_empty());
    }

    #[test]
    fn delete_kind_is_not_an_enter() {
        let (mut rm, _) = manager();
        let err = unsafe { rm.enter(0x1000, 8, MapKind::Delete, D, EnterOptions::default()) }.unwrap_err();
        assert!(matches!(err, OffloadError::InvalidArgument(_)));
    }

    #[test]
    fn finalize_drops_all_dynamic_references() {
        let (mut rm, calls) = manager();
        let mut buf = vec![0f32; 8];
        let h = addr(&mut buf);

        unsafe {
            rm.enter(h, 32, MapKind::Copyin, D, EnterOptions::default()).unwrap();
            rm.enter(h, 32, MapKind::Copyin, D, EnterOptions::default()).unwrap();
            rm.enter(h, 32, MapKind::Copyin, D, EnterOptions::default()).unwrap();
        }
        rm.finalize(h, MapKind::Copyout, Q).unwrap();
        assert!(rm.table().is_empty());
        assert_eq!(calls.borrow().d2h, 1);
    }

    #[test]
    fn frames_unwind_in_reverse() {
        let (mut rm, calls) = manager();
        let mut a: Vec<f32> = vec![1.0; 4];
        let mut b: Vec<f32> = vec![2.0; 4];
        let (ha, hb) = (addr(&mut a), addr(&mut b));

        rm.enter_region();
        unsafe {
            rm.enter(ha, 16, MapKind::Copyin, S, EnterOptions::default()).unwrap();
        }
        rm.enter_region();
        unsafe {
            rm.enter(ha, 16, MapKind::Present, S, EnterOptions::default()).unwrap();
            rm.enter(hb, 16, MapKind::Copyout, S, EnterOptions::default()).unwrap();
        }
        assert_eq!(rm.region_depth(), 2);

        rm.exit_region().unwrap();
        assert_eq!(rm.table().find(ha).unwrap().structured_count(), 1);
        assert!(rm.table().find(hb).is_none());
        assert_eq!(calls.borrow().d2h, 1);

        rm.exit_region().unwrap();
        assert!(rm.table().is_empty());
        assert_eq!(calls.borrow().d2h, 1);

        assert!(matches!(rm.exit_region(), Err(OffloadError::InvalidArgument(_))));
    }

    #[test]
    fn delete_inside_frame_is_forgotten_by_the_frame() {
        let (mut rm, _) = manager();
        let mut buf = vec![0f32; 4];
        let h = addr(&mut buf);

        rm.enter_region();
        unsafe { rm.enter(h, 16, MapKind::Create, S, EnterOptions::default()) }.unwrap();
        rm.delete(h, false, Q).unwrap();
        rm.exit_region().unwrap();
        assert!(rm.table().is_empty());
    }

    #[test]
    fn present_or_falls_back() {
        let (mut rm, calls) = manager();
        let mut buf = vec![3f32; 4];
        let h = addr(&mut buf);

        unsafe {
            rm.present_or(h, 16, MapKind::Copy, S, EnterOptions::default()).unwrap();
            rm.present_or(h, 16, MapKind::Copy, S, EnterOptions::default()).unwrap();
        }
        assert_eq!(rm.table().find(h).unwrap().structured_count(), 2);
        assert_eq!(calls.borrow().h2d, 1);

        let err = unsafe { rm.present_or(h, 16, MapKind::Present, S, EnterOptions::default()) }.unwrap_err();
        assert!(matches!(err, OffloadError::InvalidArgument(_)));
    }

    #[test]
    fn runtime_owned_host_buffer() {
        let (mut rm, _) = manager();
        let m = unsafe { rm.enter(0, 64, MapKind::Create, D, EnterOptions::default()) }.unwrap();
        assert_ne!(m.host_address, 0);

        let entry = rm.table().find(m.host_address).unwrap();
        assert!(entry.host_allocation().is_some());
        assert!(!entry.pinned());

        rm.exit(m.host_address, MapKind::Create, D, Q).unwrap();
        assert!(rm.table().is_empty());
    }

    #[test]
    fn allocation_failure_leaves_no_entry() {
        let mut rm = RegionManager::new(
            TransferEngine::new(Box::new(EmulatedDevice::new(64, 256))),
            false,
        );
        let mut buf = vec![0f32; 64];
        let h = addr(&mut buf);

        let err = unsafe { rm.enter(h, 256, MapKind::Copyin, S, EnterOptions::default()) }.unwrap_err();
        assert!(matches!(err, OffloadError::AllocationFailure(_)));
        assert!(rm.table().is_empty());
    }

    #[test]
    fn use_device_translates_interior() {
        let (mut rm, _) = manager();
        let mut buf = vec![0f32; 10];
        let h = addr(&mut buf);

        let m = unsafe { rm.enter(h, 40, MapKind::Create, D, EnterOptions::default()) }.unwrap();
        assert_eq!(rm.use_device(h + 12).unwrap(), m.device_address + 12);
        assert!(matches!(rm.use_device(h + 40), Err(OffloadError::NotFound(_))));
    }
}
