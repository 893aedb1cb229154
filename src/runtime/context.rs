use crate::config::RuntimeConfig;
use crate::device::emulated::EmulatedDevice;
use crate::device::{DeviceAddress, DeviceRuntime, HostAddress, QueueHandle};
use crate::error::{OffloadError, OffloadResult};
use crate::runtime::entry::MappingEntry;
use crate::runtime::region::{EnterOptions, RegionManager};
use crate::runtime::transfer::TransferEngine;
use crate::runtime::types::{CounterKind, MapKind, Mapped, MappingRecord};
use std::collections::BTreeSet;
use std::ptr;
use tracing::{debug, info, warn};

// ===============================================================================================
// Context
// ===============================================================================================

/// One offload runtime instance: the present table, the device behind it and
/// the queues created on it.
///
/// Not thread-safe. Every operation takes `&mut self`; callers sharing a
/// context across threads must synchronize externally.
#[derive(Debug)]
pub struct Context {
    config: RuntimeConfig,
    regions: RegionManager,
    queues: BTreeSet<QueueHandle>,
    shut_down: bool,
}

fn host_address<T>(ptr: *mut T) -> HostAddress {
    ptr.expose_provenance() as HostAddress
}

/// Installs the fmt subscriber unless the application already installed one.
fn install_subscriber(filter: &str) {
    let filter = tracing_subscriber::EnvFilter::try_new(filter)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    if let Err(e) = tracing_subscriber::fmt().with_env_filter(filter).try_init() {
        debug!("offload: keeping the already installed subscriber ({e})");
    }
}

impl Context {
    /// Creates a context on the emulated device described by `config`.
    ///
    /// # Errors
    /// Returns `OffloadError::Config` if the configuration is invalid.
    pub fn create(config: RuntimeConfig) -> OffloadResult<Self> {
        config.validate()?;
        install_subscriber(&config.log_filter);

        let device = EmulatedDevice::new(config.device_memory_bytes, config.device_alignment);
        info!(
            "offload: context created ({} bytes device memory, alignment {}, pinning {})",
            config.device_memory_bytes, config.device_alignment, config.pin_host_buffers
        );
        Ok(Self::with_device(config, Box::new(device)))
    }

    /// # Errors
    /// Returns `OffloadError::Config` if an `OFFLOADRT_*` variable cannot be parsed.
    pub fn from_env() -> OffloadResult<Self> {
        Self::create(RuntimeConfig::from_env()?)
    }

    /// Creates a context on a caller-supplied device runtime.
    #[must_use]
    pub fn with_device(config: RuntimeConfig, device: Box<dyn DeviceRuntime>) -> Self {
        let pin = config.pin_host_buffers;
        Self {
            config,
            regions: RegionManager::new(TransferEngine::new(device), pin),
            queues: BTreeSet::new(),
            shut_down: false,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    fn check_queue(&self, queue: QueueHandle) -> OffloadResult<()> {
        if queue.is_default() || self.queues.contains(&queue) {
            Ok(())
        } else {
            Err(OffloadError::InvalidQueue(queue.0))
        }
    }

    // ===========================================================================================
    // Data Regions
    // ===========================================================================================

    /// Structured enter. Recorded in the innermost open region, if any.
    ///
    /// A null `host` makes the runtime allocate the host buffer; its address
    /// is returned in [`Mapped::host_address`].
    ///
    /// # Errors
    /// See [`RegionManager::enter`]; `InvalidQueue` for an unknown queue.
    ///
    /// # Safety
    /// Unless null, `host` must be valid for reads and writes of `size` bytes
    /// until the mapping is released and its queues are synchronized.
    pub unsafe fn init<T>(
        &mut self,
        host: *mut T,
        size: usize,
        kind: MapKind,
        never_deallocate: bool,
        queue: QueueHandle,
    ) -> OffloadResult<Mapped> {
        self.check_queue(queue)?;
        let opts = EnterOptions {
            never_deallocate,
            queue,
        };
        unsafe {
            self.regions
                .enter(host_address(host), size, kind, CounterKind::Structured, opts)
        }
    }

    /// Dynamic enter (`enter data`).
    ///
    /// # Errors
    /// See [`RegionManager::enter`]; `InvalidQueue` for an unknown queue.
    ///
    /// # Safety
    /// Same contract as [`Context::init`].
    pub unsafe fn enter_data<T>(
        &mut self,
        host: *mut T,
        size: usize,
        kind: MapKind,
        queue: QueueHandle,
    ) -> OffloadResult<Mapped> {
        self.check_queue(queue)?;
        unsafe {
            self.regions.enter(
                host_address(host),
                size,
                kind,
                CounterKind::Dynamic,
                EnterOptions::on(queue),
            )
        }
    }

    /// Structured enter of a mapping record. A null `record.host_ptr` is
    /// replaced by the runtime-allocated host buffer.
    ///
    /// # Errors
    /// `InvalidArgument` for an undefined map kind, otherwise as [`Context::init`].
    ///
    /// # Safety
    /// Same contract as [`Context::init`] for `record.host_ptr`.
    pub unsafe fn map_record(
        &mut self,
        record: &mut MappingRecord,
        queue: QueueHandle,
    ) -> OffloadResult<Mapped> {
        let kind = record.kind()?;
        let mapped = unsafe {
            self.init(record.host_ptr, record.num_bytes, kind, record.never_deallocate, queue)?
        };
        if record.host_ptr.is_null() && mapped.host_address != 0 {
            record.host_ptr = ptr::with_exposed_provenance_mut(mapped.host_address as usize);
        }
        Ok(mapped)
    }

    /// Structured enter with `present` semantics, or `fallback` if `host` is not mapped.
    ///
    /// # Errors
    /// See [`RegionManager::present_or`]; `InvalidQueue` for an unknown queue.
    ///
    /// # Safety
    /// Same contract as [`Context::init`].
    pub unsafe fn present_or<T>(
        &mut self,
        host: *mut T,
        size: usize,
        fallback: MapKind,
        queue: QueueHandle,
    ) -> OffloadResult<Mapped> {
        self.check_queue(queue)?;
        unsafe {
            self.regions.present_or(
                host_address(host),
                size,
                fallback,
                CounterKind::Structured,
                EnterOptions::on(queue),
            )
        }
    }

    /// Dynamic exit (`exit data`). Transfers run on `queue`.
    ///
    /// # Errors
    /// See [`RegionManager::exit`].
    pub fn exit_data<T>(&mut self, host: *mut T, kind: MapKind, queue: QueueHandle) -> OffloadResult<()> {
        self.check_queue(queue)?;
        self.regions
            .exit(host_address(host), kind, CounterKind::Dynamic, queue)
    }

    /// Dynamic exit that drops every dynamic reference (`exit data ... finalize`).
    ///
    /// # Errors
    /// See [`RegionManager::finalize`].
    pub fn exit_data_finalize<T>(
        &mut self,
        host: *mut T,
        kind: MapKind,
        queue: QueueHandle,
    ) -> OffloadResult<()> {
        self.check_queue(queue)?;
        self.regions.finalize(host_address(host), kind, queue)
    }

    /// Removes a mapping regardless of its counters.
    ///
    /// # Errors
    /// See [`RegionManager::delete`].
    pub fn delete<T>(&mut self, host: *mut T, copy_out: bool, queue: QueueHandle) -> OffloadResult<()> {
        self.check_queue(queue)?;
        self.regions.delete(host_address(host), copy_out, queue)
    }

    pub fn enter_region(&mut self) {
        self.regions.enter_region();
    }

    /// # Errors
    /// See [`RegionManager::exit_region`].
    pub fn exit_region(&mut self) -> OffloadResult<()> {
        self.regions.exit_region()
    }

    // ===========================================================================================
    // Lookup & Updates
    // ===========================================================================================

    /// # Errors
    /// Returns `OffloadError::NotFound` if `host` is not inside a mapping.
    pub fn use_device<T>(&self, host: *mut T) -> OffloadResult<DeviceAddress> {
        self.regions.use_device(host_address(host))
    }

    #[must_use]
    pub fn is_present<T>(&self, host: *mut T) -> bool {
        self.regions.is_present(host_address(host))
    }

    /// # Errors
    /// `NotFound` if `host` is not inside a mapping; transfer errors otherwise.
    pub fn update_host<T>(&mut self, host: *mut T, queue: QueueHandle) -> OffloadResult<()> {
        self.check_queue(queue)?;
        self.regions.update_host(host_address(host), queue)
    }

    /// # Errors
    /// `NotFound` if `host` is not inside a mapping; transfer errors otherwise.
    pub fn update_device<T>(&mut self, host: *mut T, queue: QueueHandle) -> OffloadResult<()> {
        self.check_queue(queue)?;
        self.regions.update_device(host_address(host), queue)
    }

    /// The mapping containing `host`, for inspection.
    #[must_use]
    pub fn entry<T>(&self, host: *mut T) -> Option<&MappingEntry> {
        self.regions.table().find_containing(host_address(host))
    }

    #[must_use]
    pub fn mapping_count(&self) -> usize {
        self.regions.table().len()
    }

    #[must_use]
    pub fn device_bytes_in_use(&self) -> u64 {
        self.regions.engine().device_bytes_in_use()
    }

    #[must_use]
    pub fn region_depth(&self) -> usize {
        self.regions.region_depth()
    }

    // ===========================================================================================
    // Queues
    // ===========================================================================================

    /// # Errors
    /// Propagates the device runtime's error.
    pub fn create_queue(&mut self) -> OffloadResult<QueueHandle> {
        let queue = self.regions.engine_mut().create_queue()?;
        self.queues.insert(queue);
        Ok(queue)
    }

    /// Drains and destroys `queue`. Mappings bound to it fall back to the default queue.
    ///
    /// # Errors
    /// `InvalidQueue` for an unknown queue; deferred errors from the drain.
    pub fn destroy_queue(&mut self, queue: QueueHandle) -> OffloadResult<()> {
        if queue.is_default() {
            return Err(OffloadError::InvalidArgument(
                "the default queue cannot be destroyed".to_string(),
            ));
        }
        if !self.queues.remove(&queue) {
            return Err(OffloadError::InvalidQueue(queue.0));
        }
        self.regions.retarget_queue(queue, QueueHandle::DEFAULT);
        self.regions.engine_mut().destroy_queue(queue)
    }

    /// Blocks until all work on `queue` has run. Waiting on the default queue waits for everything.
    ///
    /// # Errors
    /// `InvalidQueue` for an unknown queue; the first deferred device error.
    pub fn wait(&mut self, queue: QueueHandle) -> OffloadResult<()> {
        self.check_queue(queue)?;
        self.regions.engine_mut().synchronize(queue)
    }

    /// # Errors
    /// The first deferred device error on any queue.
    pub fn wait_all(&mut self) -> OffloadResult<()> {
        self.regions.engine_mut().synchronize_all()
    }

    // ===========================================================================================
    // Shutdown
    // ===========================================================================================

    /// Drains every queue and releases all remaining mappings.
    ///
    /// # Errors
    /// The first error hit during teardown; teardown always runs to completion.
    pub fn shutdown(mut self) -> OffloadResult<()> {
        self.teardown()
    }

    fn teardown(&mut self) -> OffloadResult<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;

        let remaining = self.regions.table().len();
        let mut first_err = self.regions.release_all().err();

        for queue in std::mem::take(&mut self.queues) {
            if let Err(e) = self.regions.engine_mut().destroy_queue(queue) {
                first_err.get_or_insert(e);
            }
        }

        info!("offload: context destroyed ({remaining} mappings released)");
        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            warn!("offload: teardown failed: {e}");
        }
    }
}
