//! C boundary consumed by generated code.
//!
//! Every function returns a [`Status`] code as `c_int` (`0` on success).
//! A context handle comes from [`offloadrt_create`] and must not be used
//! from two threads at once. A null queue handle is the default queue.

use crate::device::QueueHandle;
use crate::error::{OffloadError, OffloadResult, Status};
use crate::runtime::context::Context;
use crate::runtime::types::{MapKind, MappingRecord};
use std::ffi::{c_int, c_void};
use std::ptr;
use tracing::debug;

/// Opaque queue handle; null selects the default queue.
pub type OffloadQueue = *mut c_void;

fn queue_handle(queue: OffloadQueue) -> QueueHandle {
    QueueHandle(queue.addr() as u64)
}

fn status<T>(op: &str, res: &OffloadResult<T>) -> c_int {
    if let Err(e) = res {
        debug!("{op}: {e}");
    }
    Status::from(res) as c_int
}

/// Runs `f` on the context behind `ctx`, or reports `InvalidArgument` for null.
///
/// # Safety
/// `ctx` must be null or a live pointer returned by [`offloadrt_create`].
unsafe fn with_context<T>(
    ctx: *mut Context,
    op: &str,
    f: impl FnOnce(&mut Context) -> OffloadResult<T>,
) -> c_int {
    // SAFETY: guaranteed by the caller.
    let Some(ctx) = (unsafe { ctx.as_mut() }) else {
        return status::<()>(op, &Err(OffloadError::InvalidArgument("null context".to_string())));
    };
    status(op, &f(ctx))
}

// ===============================================================================================
// Lifecycle
// ===============================================================================================

/// Creates a context configured from the `OFFLOADRT_*` environment.
///
/// # Safety
/// `out` must be null or valid for a pointer write.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn offloadrt_create(out: *mut *mut Context) -> c_int {
    if out.is_null() {
        return Status::InvalidArgument as c_int;
    }
    let res = Context::from_env().map(|ctx| {
        // SAFETY: checked non-null above.
        unsafe { *out = Box::into_raw(Box::new(ctx)) };
    });
    status("offloadrt_create", &res)
}

/// Shuts the context down and frees it. The handle is invalid afterwards.
///
/// # Safety
/// `ctx` must be null or a live pointer returned by [`offloadrt_create`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn offloadrt_destroy(ctx: *mut Context) -> c_int {
    if ctx.is_null() {
        return Status::InvalidArgument as c_int;
    }
    // SAFETY: the handle was produced by `Box::into_raw` in `offloadrt_create`.
    let ctx = unsafe { Box::from_raw(ctx) };
    status("offloadrt_destroy", &ctx.shutdown())
}

// ===============================================================================================
// Data Regions
// ===============================================================================================

/// Structured enter.
///
/// # Safety
/// `ctx` as for [`offloadrt_destroy`]. Unless null, `host_ptr` must be valid
/// for `num_bytes` until the mapping is released.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn offloadrt_init(
    ctx: *mut Context,
    host_ptr: *mut c_void,
    num_bytes: usize,
    map_kind: c_int,
    never_deallocate: bool,
    queue: OffloadQueue,
) -> c_int {
    unsafe {
        with_context(ctx, "offloadrt_init", |ctx| {
            let kind = MapKind::from_raw(map_kind)?;
            ctx.init(host_ptr, num_bytes, kind, never_deallocate, queue_handle(queue))
        })
    }
}

/// Dynamic enter.
///
/// # Safety
/// Same as [`offloadrt_init`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn offloadrt_enter_data(
    ctx: *mut Context,
    host_ptr: *mut c_void,
    num_bytes: usize,
    map_kind: c_int,
    queue: OffloadQueue,
) -> c_int {
    unsafe {
        with_context(ctx, "offloadrt_enter_data", |ctx| {
            let kind = MapKind::from_raw(map_kind)?;
            ctx.enter_data(host_ptr, num_bytes, kind, queue_handle(queue))
        })
    }
}

/// Dynamic exit.
///
/// # Safety
/// `ctx` as for [`offloadrt_destroy`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn offloadrt_exit_data(
    ctx: *mut Context,
    host_ptr: *mut c_void,
    map_kind: c_int,
    queue: OffloadQueue,
) -> c_int {
    unsafe {
        with_context(ctx, "offloadrt_exit_data", |ctx| {
            let kind = MapKind::from_raw(map_kind)?;
            ctx.exit_data(host_ptr, kind, queue_handle(queue))
        })
    }
}

/// Dynamic exit dropping all dynamic references at once.
///
/// # Safety
/// `ctx` as for [`offloadrt_destroy`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn offloadrt_exit_data_finalize(
    ctx: *mut Context,
    host_ptr: *mut c_void,
    map_kind: c_int,
    queue: OffloadQueue,
) -> c_int {
    unsafe {
        with_context(ctx, "offloadrt_exit_data_finalize", |ctx| {
            let kind = MapKind::from_raw(map_kind)?;
            ctx.exit_data_finalize(host_ptr, kind, queue_handle(queue))
        })
    }
}

/// Structured enter that only maps with `fallback_kind` when `host_ptr` is absent.
///
/// # Safety
/// Same as [`offloadrt_init`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn offloadrt_present_or(
    ctx: *mut Context,
    host_ptr: *mut c_void,
    num_bytes: usize,
    fallback_kind: c_int,
    queue: OffloadQueue,
) -> c_int {
    unsafe {
        with_context(ctx, "offloadrt_present_or", |ctx| {
            let kind = MapKind::from_raw(fallback_kind)?;
            ctx.present_or(host_ptr, num_bytes, kind, queue_handle(queue))
        })
    }
}

/// # Safety
/// `ctx` as for [`offloadrt_destroy`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn offloadrt_enter_region(ctx: *mut Context) -> c_int {
    unsafe {
        with_context(ctx, "offloadrt_enter_region", |ctx| {
            ctx.enter_region();
            Ok(())
        })
    }
}

/// # Safety
/// `ctx` as for [`offloadrt_destroy`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn offloadrt_exit_region(ctx: *mut Context) -> c_int {
    unsafe { with_context(ctx, "offloadrt_exit_region", Context::exit_region) }
}

// ===============================================================================================
// Mapping Records
// ===============================================================================================

/// Fills `record`, rejecting an invalid map kind.
///
/// # Safety
/// `record` must be null or valid for writes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn offloadrt_mapping_init(
    record: *mut MappingRecord,
    host_ptr: *mut c_void,
    num_bytes: usize,
    map_kind: c_int,
    never_deallocate: bool,
) -> c_int {
    let res = MapKind::from_raw(map_kind).and_then(|kind| {
        // SAFETY: guaranteed by the caller.
        let record = unsafe { record.as_mut() }
            .ok_or_else(|| OffloadError::InvalidArgument("null mapping record".to_string()))?;
        *record = MappingRecord::new(host_ptr, num_bytes, kind, never_deallocate);
        Ok(())
    });
    status("offloadrt_mapping_init", &res)
}

/// Structured enter of `record`. A null `host_ptr` is replaced by a runtime-allocated buffer.
///
/// # Safety
/// `ctx` as for [`offloadrt_destroy`]; `record` must be null or valid for
/// reads and writes, and its `host_ptr` obeys the contract of [`offloadrt_init`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn offloadrt_map_record(
    ctx: *mut Context,
    record: *mut MappingRecord,
    queue: OffloadQueue,
) -> c_int {
    unsafe {
        with_context(ctx, "offloadrt_map_record", |ctx| {
            let record = record
                .as_mut()
                .ok_or_else(|| OffloadError::InvalidArgument("null mapping record".to_string()))?;
            ctx.map_record(record, queue_handle(queue))
        })
    }
}

// ===============================================================================================
// Lookup & Updates
// ===============================================================================================

/// Device pointer for `host_ptr` (or an address inside a mapping), null if unmapped.
///
/// The status is written to `status_out` when it is not null.
///
/// # Safety
/// `ctx` as for [`offloadrt_destroy`]; `status_out` null or valid for writes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn offloadrt_use_device(
    ctx: *mut Context,
    host_ptr: *mut c_void,
    status_out: *mut c_int,
) -> *mut c_void {
    let mut device = ptr::null_mut();
    let code = unsafe {
        with_context(ctx, "offloadrt_use_device", |ctx| {
            let addr = ctx.use_device(host_ptr)?;
            device = ptr::without_provenance_mut(addr as usize);
            Ok(())
        })
    };
    if !status_out.is_null() {
        // SAFETY: checked non-null; validity guaranteed by the caller.
        unsafe { *status_out = code };
    }
    device
}

/// # Safety
/// `ctx` must be null or a live context handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn offloadrt_is_present(ctx: *const Context, host_ptr: *mut c_void) -> bool {
    // SAFETY: guaranteed by the caller.
    unsafe { ctx.as_ref() }.is_some_and(|ctx| ctx.is_present(host_ptr))
}

/// # Safety
/// `ctx` as for [`offloadrt_destroy`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn offloadrt_update_host(
    ctx: *mut Context,
    host_ptr: *mut c_void,
    queue: OffloadQueue,
) -> c_int {
    unsafe {
        with_context(ctx, "offloadrt_update_host", |ctx| {
            ctx.update_host(host_ptr, queue_handle(queue))
        })
    }
}

/// # Safety
/// `ctx` as for [`offloadrt_destroy`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn offloadrt_update_device(
    ctx: *mut Context,
    host_ptr: *mut c_void,
    queue: OffloadQueue,
) -> c_int {
    unsafe {
        with_context(ctx, "offloadrt_update_device", |ctx| {
            ctx.update_device(host_ptr, queue_handle(queue))
        })
    }
}

// ===============================================================================================
// Queues
// ===============================================================================================

/// # Safety
/// `ctx` as for [`offloadrt_destroy`]; `out` null or valid for writes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn offloadrt_create_queue(ctx: *mut Context, out: *mut OffloadQueue) -> c_int {
    unsafe {
        with_context(ctx, "offloadrt_create_queue", |ctx| {
            let out = out
                .as_mut()
                .ok_or_else(|| OffloadError::InvalidArgument("null queue out-pointer".to_string()))?;
            let queue = ctx.create_queue()?;
            *out = ptr::without_provenance_mut(queue.0 as usize);
            Ok(())
        })
    }
}

/// # Safety
/// `ctx` as for [`offloadrt_destroy`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn offloadrt_destroy_queue(ctx: *mut Context, queue: OffloadQueue) -> c_int {
    unsafe {
        with_context(ctx, "offloadrt_destroy_queue", |ctx| {
            ctx.destroy_queue(queue_handle(queue))
        })
    }
}

/// # Safety
/// `ctx` as for [`offloadrt_destroy`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn offloadrt_wait(ctx: *mut Context, queue: OffloadQueue) -> c_int {
    unsafe { with_context(ctx, "offloadrt_wait", |ctx| ctx.wait(queue_handle(queue))) }
}

/// # Safety
/// `ctx` as for [`offloadrt_destroy`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn offloadrt_wait_all(ctx: *mut Context) -> c_int {
    unsafe { with_context(ctx, "offloadrt_wait_all", Context::wait_all) }
}
