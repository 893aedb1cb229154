#![allow(clippy::cast_possible_truncation)]

use super::aperture::Aperture;
use super::{DeviceAddress, DeviceRuntime, HostAddress, HostAllocation, QueueHandle};
use crate::error::{OffloadError, OffloadResult};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::ptr::{self, NonNull};
use tracing::{debug, error, warn};

// Device VAs live above the canonical user-space range so they can never be
// mistaken for a host address.
const DEVICE_VA_BASE: u64 = 0x8000_0000_0000;
const DEVICE_VA_LIMIT: u64 = 0xffff_ffff_ffff;
const DEVICE_GUARD_PAGES: u64 = 1;
const PAGE_SIZE: usize = 4096;

const fn page_round(size: usize) -> Option<usize> {
    match size.checked_add(PAGE_SIZE - 1) {
        Some(padded) => Some(padded & !(PAGE_SIZE - 1)),
        None => None,
    }
}

/// An anonymous private mapping, unmapped on drop.
#[derive(Debug)]
struct Pages {
    ptr: NonNull<u8>,
    len: usize,
}

impl Pages {
    fn anonymous(size: usize) -> OffloadResult<Self> {
        let len = page_round(size.max(1)).ok_or_else(|| {
            OffloadError::AllocationFailure(format!("{size} bytes cannot be page-aligned"))
        })?;

        let ret = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ret == libc::MAP_FAILED {
            return Err(OffloadError::AllocationFailure(format!(
                "mmap of {len} bytes failed: {}",
                io::Error::last_os_error()
            )));
        }

        let ptr = NonNull::new(ret.cast::<u8>()).ok_or_else(|| {
            OffloadError::AllocationFailure("mmap returned a null mapping".to_string())
        })?;
        Ok(Self { ptr, len })
    }

    fn lock(&self) -> io::Result<()> {
        let ret = unsafe { libc::mlock(self.ptr.as_ptr().cast(), self.len) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for Pages {
    fn drop(&mut self) {
        // munmap also drops any mlock on the range
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

#[derive(Debug)]
struct DeviceBlock {
    pages: Pages,
    size: usize,
}

#[derive(Debug)]
struct HostBlock {
    _pages: Pages,
}

#[derive(Debug, Clone, Copy)]
enum Command {
    HostToDevice {
        dst: DeviceAddress,
        src: HostAddress,
        size: usize,
    },
    DeviceToHost {
        dst: HostAddress,
        src: DeviceAddress,
        size: usize,
    },
    Free {
        addr: DeviceAddress,
    },
}

/// A device emulated in host memory.
///
/// Device memory is carved out of a private aperture and backed by anonymous
/// mappings. Every non-default queue is a FIFO of deferred commands that only
/// runs when the queue is synchronized. The default queue behaves like a
/// legacy null stream: it first drains every other queue, then executes
/// immediately.
#[derive(Debug)]
pub struct EmulatedDevice {
    aperture: Aperture,
    alignment: usize,
    capacity: u64,
    in_use: u64,

    blocks: BTreeMap<DeviceAddress, DeviceBlock>,
    host_blocks: HashMap<HostAddress, HostBlock>,

    queues: BTreeMap<u64, VecDeque<Command>>,
    next_queue: u64,
}

// The backing pages are exclusively owned by the device and only touched
// through `&mut self`.
unsafe impl Send for EmulatedDevice {}

impl EmulatedDevice {
    #[must_use]
    pub fn new(capacity: u64, alignment: usize) -> Self {
        Self {
            aperture: Aperture::new(
                DEVICE_VA_BASE,
                DEVICE_VA_LIMIT,
                alignment as u64,
                DEVICE_GUARD_PAGES,
            ),
            alignment,
            capacity,
            in_use: 0,
            blocks: BTreeMap::new(),
            host_blocks: HashMap::new(),
            queues: BTreeMap::new(),
            next_queue: 1,
        }
    }

    /// Number of live device allocations.
    #[must_use]
    pub fn live_allocations(&self) -> usize {
        self.blocks.len()
    }

    /// Number of commands waiting on `queue`.
    #[must_use]
    pub fn pending(&self, queue: QueueHandle) -> usize {
        self.queues.get(&queue.0).map_or(0, VecDeque::len)
    }

    /// Translates a device range into a pointer to its backing pages.
    fn resolve(&self, addr: DeviceAddress, size: usize) -> OffloadResult<*mut u8> {
        if !self.aperture.contains(addr) {
            return Err(OffloadError::Device(format!(
                "0x{addr:x} lies outside the device aperture"
            )));
        }

        let Some((&base, block)) = self.blocks.range(..=addr).next_back() else {
            return Err(OffloadError::Device(format!(
                "0x{addr:x} is not a device allocation"
            )));
        };

        let offset = (addr - base) as usize;
        if offset.saturating_add(size) > block.size {
            return Err(OffloadError::Device(format!(
                "{size} bytes at 0x{addr:x} exceed the allocation at 0x{base:x} ({} bytes)",
                block.size
            )));
        }

        Ok(unsafe { block.pages.ptr.as_ptr().add(offset) })
    }

    fn validate(&self, cmd: &Command) -> OffloadResult<()> {
        match *cmd {
            Command::HostToDevice { dst, size, .. } => self.resolve(dst, size).map(|_| ()),
            Command::DeviceToHost { src, size, .. } => self.resolve(src, size).map(|_| ()),
            Command::Free { addr } => {
                if self.blocks.contains_key(&addr) {
                    Ok(())
                } else {
                    Err(OffloadError::InvalidArgument(format!(
                        "0x{addr:x} is not the start of a device allocation"
                    )))
                }
            }
        }
    }

    fn execute(&mut self, cmd: Command) -> OffloadResult<()> {
        match cmd {
            Command::HostToDevice { dst, src, size } => {
                if size == 0 {
                    return Ok(());
                }
                let dst = self.resolve(dst, size)?;
                let src = ptr::with_exposed_provenance::<u8>(src as usize);
                unsafe { ptr::copy_nonoverlapping(src, dst, size) };
                Ok(())
            }
            Command::DeviceToHost { dst, src, size } => {
                if size == 0 {
                    return Ok(());
                }
                let src = self.resolve(src, size)?;
                let dst = ptr::with_exposed_provenance_mut::<u8>(dst as usize);
                unsafe { ptr::copy_nonoverlapping(src, dst, size) };
                Ok(())
            }
            Command::Free { addr } => self.release_block(addr),
        }
    }

    fn submit(&mut self, queue: QueueHandle, cmd: Command) -> OffloadResult<()> {
        self.validate(&cmd)?;

        if queue.is_default() {
            self.synchronize_all()?;
            return self.execute(cmd);
        }

        self.queues
            .get_mut(&queue.0)
            .ok_or(OffloadError::InvalidQueue(queue.0))?
            .push_back(cmd);
        Ok(())
    }

    fn release_block(&mut self, addr: DeviceAddress) -> OffloadResult<()> {
        let block = self.blocks.remove(&addr).ok_or_else(|| {
            OffloadError::Device(format!("device address 0x{addr:x} freed twice"))
        })?;

        self.aperture.free_va(addr);
        self.in_use -= block.size as u64;
        debug!("device: freed {} bytes at 0x{addr:x}", block.size);
        Ok(())
    }
}

impl DeviceRuntime for EmulatedDevice {
    fn allocate_device(&mut self, size: usize) -> OffloadResult<DeviceAddress> {
        let within_capacity = self
            .in_use
            .checked_add(size as u64)
            .is_some_and(|total| total <= self.capacity);
        if !within_capacity {
            return Err(OffloadError::AllocationFailure(format!(
                "out of device memory: requested {size} bytes, {} of {} in use",
                self.in_use, self.capacity
            )));
        }

        let va = self
            .aperture
            .allocate_va(size.max(1), self.alignment)
            .ok_or_else(|| {
                OffloadError::AllocationFailure("device address space exhausted".to_string())
            })?;

        let pages = match Pages::anonymous(size) {
            Ok(p) => p,
            Err(e) => {
                self.aperture.free_va(va);
                return Err(e);
            }
        };

        self.blocks.insert(va, DeviceBlock { pages, size });
        self.in_use += size as u64;
        debug!("device: allocated {size} bytes at 0x{va:x}");
        Ok(va)
    }

    fn free_device(&mut self, addr: DeviceAddress, queue: QueueHandle) -> OffloadResult<()> {
        self.submit(queue, Command::Free { addr })
    }

    fn allocate_host(&mut self, size: usize, pinned: bool) -> OffloadResult<HostAllocation> {
        let pages = Pages::anonymous(size)?;

        let mut locked = false;
        if pinned {
            match pages.lock() {
                Ok(()) => locked = true,
                Err(e) => warn!(
                    "device: page-locking {} host bytes failed ({e}), buffer stays pageable",
                    pages.len
                ),
            }
        }

        let address = pages.ptr.as_ptr().expose_provenance() as HostAddress;
        self.host_blocks.insert(address, HostBlock { _pages: pages });
        debug!("device: allocated {size} host bytes at 0x{address:x} (pinned: {locked})");

        Ok(HostAllocation {
            address,
            size,
            pinned: locked,
        })
    }

    fn free_host(&mut self, alloc: &HostAllocation) -> OffloadResult<()> {
        self.host_blocks
            .remove(&alloc.address)
            .map(drop)
            .ok_or_else(|| {
                OffloadError::InvalidArgument(format!(
                    "0x{:x} is not a runtime-owned host buffer",
                    alloc.address
                ))
            })
    }

    unsafe fn copy_host_to_device(
        &mut self,
        dst: DeviceAddress,
        src: HostAddress,
        size: usize,
        queue: QueueHandle,
    ) -> OffloadResult<()> {
        self.submit(queue, Command::HostToDevice { dst, src, size })
    }

    unsafe fn copy_device_to_host(
        &mut self,
        dst: HostAddress,
        src: DeviceAddress,
        size: usize,
        queue: QueueHandle,
    ) -> OffloadResult<()> {
        self.submit(queue, Command::DeviceToHost { dst, src, size })
    }

    fn create_queue(&mut self) -> OffloadResult<QueueHandle> {
        let id = self.next_queue;
        self.next_queue += 1;
        self.queues.insert(id, VecDeque::new());
        debug!("device: created queue q{id}");
        Ok(QueueHandle(id))
    }

    fn destroy_queue(&mut self, queue: QueueHandle) -> OffloadResult<()> {
        if queue.is_default() {
            return Err(OffloadError::InvalidArgument(
                "the default queue cannot be destroyed".to_string(),
            ));
        }

        let res = self.synchronize(queue);
        self.queues
            .remove(&queue.0)
            .ok_or(OffloadError::InvalidQueue(queue.0))?;
        debug!("device: destroyed queue {queue}");
        res
    }

    fn synchronize(&mut self, queue: QueueHandle) -> OffloadResult<()> {
        if queue.is_default() {
            return self.synchronize_all();
        }
        if !self.queues.contains_key(&queue.0) {
            return Err(OffloadError::InvalidQueue(queue.0));
        }

        let mut first_err = None;
        while let Some(cmd) = self.queues.get_mut(&queue.0).and_then(VecDeque::pop_front) {
            if let Err(e) = self.execute(cmd) {
                error!("device: deferred command on {queue} failed: {e}");
                first_err.get_or_insert(e);
            }
        }

        first_err.map_or(Ok(()), Err)
    }

    fn synchronize_all(&mut self) -> OffloadResult<()> {
        let ids: Vec<u64> = self.queues.keys().copied().collect();

        let mut first_err = None;
        for id in ids {
            if let Err(e) = self.synchronize(QueueHandle(id)) {
                first_err.get_or_insert(e);
            }
        }

        first_err.map_or(Ok(()), Err)
    }

    fn device_bytes_in_use(&self) -> u64 {
        self.in_use
    }
}

impl Drop for EmulatedDevice {
    fn drop(&mut self) {
        // Pending commands may reference host buffers that are already gone.
        let discarded: usize = self.queues.values().map(VecDeque::len).sum();
        if discarded > 0 {
            warn!("device: discarding {discarded} unsynchronized commands");
        }
        self.queues.clear();
    }
}
