mod common;

use common::{bytes_of, context};
use offload_rt::{MapKind, MappingRecord, OffloadError, QueueHandle};
use std::ptr;

const Q: QueueHandle = QueueHandle::DEFAULT;

#[test]
fn copyin_present_then_copyout_writes_back_once() {
    let mut ctx = context();
    let mut a: Vec<f32> = (0..100).map(|i| i as f32).collect();
    let n = bytes_of(&a);

    ctx.enter_region();
    unsafe {
        ctx.init(a.as_mut_ptr(), n, MapKind::Copyin, false, Q).unwrap();
    }
    ctx.enter_region();
    unsafe {
        ctx.init(a.as_mut_ptr(), n, MapKind::Present, false, Q).unwrap();
    }
    assert_eq!(ctx.entry(a.as_mut_ptr()).unwrap().structured_count(), 2);

    // Host-side scribbles must not be overwritten by the inner exit
    a.fill(-1.0);
    ctx.exit_region().unwrap();
    assert_eq!(a[42], -1.0);
    assert_eq!(ctx.entry(a.as_mut_ptr()).unwrap().structured_count(), 1);

    ctx.delete(a.as_mut_ptr(), true, Q).unwrap();
    assert_eq!(a[42], 42.0);
    assert_eq!(ctx.mapping_count(), 0);

    // The outer frame forgot the deleted mapping
    ctx.exit_region().unwrap();
}

#[test]
fn dynamic_and_structured_share_one_entry() {
    let mut ctx = context();
    let mut b = vec![0u64; 64];
    let n = bytes_of(&b);

    unsafe {
        ctx.enter_data(b.as_mut_ptr(), n, MapKind::Create, Q).unwrap();
    }
    let dev = ctx.use_device(b.as_mut_ptr()).unwrap();

    ctx.enter_region();
    let inner = unsafe { ctx.init(b.as_mut_ptr(), n, MapKind::Copy, false, Q) }.unwrap();
    assert_eq!(inner.device_address, dev);
    ctx.exit_region().unwrap();

    let entry = ctx.entry(b.as_mut_ptr()).unwrap();
    assert_eq!((entry.structured_count(), entry.dynamic_count()), (0, 1));
    assert_eq!(ctx.device_bytes_in_use(), n as u64);

    ctx.exit_data(b.as_mut_ptr(), MapKind::Delete, Q).unwrap();
    assert!(!ctx.is_present(b.as_mut_ptr()));
    assert_eq!(ctx.device_bytes_in_use(), 0);
}

#[test]
fn reregistration_with_other_size_is_rejected() {
    let mut ctx = context();
    let mut a = vec![0f32; 200];

    unsafe {
        ctx.enter_data(a.as_mut_ptr(), 400, MapKind::Copyin, Q).unwrap();
        let err = ctx.enter_data(a.as_mut_ptr(), 800, MapKind::Copyin, Q).unwrap_err();
        assert!(matches!(
            err,
            OffloadError::SizeMismatch {
                mapped: 400,
                requested: 800,
                ..
            }
        ));
    }
    assert_eq!(ctx.entry(a.as_mut_ptr()).unwrap().dynamic_count(), 1);
}

#[test]
fn straddling_an_existing_mapping_is_rejected() {
    let mut ctx = context();
    let mut a = vec![0u8; 256];
    let base = a.as_mut_ptr();

    unsafe {
        ctx.enter_data(base.add(64), 64, MapKind::Create, Q).unwrap();
        let err = ctx.enter_data(base, 128, MapKind::Create, Q).unwrap_err();
        assert!(matches!(err, OffloadError::SizeMismatch { mapped: 64, .. }));
    }
    assert_eq!(ctx.mapping_count(), 1);
}

#[test]
fn never_deallocate_keeps_device_copy() {
    let mut ctx = context();
    let mut g = vec![7i32; 16];
    let n = bytes_of(&g);

    ctx.enter_region();
    let first = unsafe { ctx.init(g.as_mut_ptr(), n, MapKind::Copyin, true, Q) }.unwrap();
    ctx.exit_region().unwrap();

    let entry = ctx.entry(g.as_mut_ptr()).unwrap();
    assert!(entry.state().is_unmapped());
    assert!(entry.never_deallocate());
    assert_eq!(ctx.device_bytes_in_use(), n as u64);

    // Re-entering reuses the allocation without copying
    g.fill(0);
    ctx.enter_region();
    let second = unsafe { ctx.init(g.as_mut_ptr(), n, MapKind::Copyin, true, Q) }.unwrap();
    assert_eq!(first.device_address, second.device_address);
    ctx.exit_region().unwrap();

    ctx.update_host(g.as_mut_ptr(), Q).unwrap();
    assert_eq!(g, vec![7; 16]);
}

#[test]
fn present_and_no_create_misses() {
    let mut ctx = context();
    let mut a = [0u8; 32];

    let err = unsafe { ctx.init(a.as_mut_ptr(), 32, MapKind::Present, false, Q) }.unwrap_err();
    assert!(matches!(err, OffloadError::NotFound(_)));

    let m = unsafe { ctx.enter_data(a.as_mut_ptr(), 32, MapKind::NoCreate, Q) }.unwrap();
    assert!(m.is_null());
    assert_eq!(ctx.mapping_count(), 0);
    assert!(matches!(ctx.use_device(a.as_mut_ptr()), Err(OffloadError::NotFound(_))));
}

#[test]
fn update_device_and_host_leave_counters_alone() {
    let mut ctx = context();
    let mut a = vec![1u16; 50];
    let n = bytes_of(&a);

    unsafe {
        ctx.enter_data(a.as_mut_ptr(), n, MapKind::Create, Q).unwrap();
    }
    a.fill(5);
    ctx.update_device(a.as_mut_ptr(), Q).unwrap();
    a.fill(0);
    // Interior address updates the whole mapping
    ctx.update_host(a[10..].as_mut_ptr(), Q).unwrap();

    assert_eq!(a, vec![5; 50]);
    assert_eq!(ctx.entry(a.as_mut_ptr()).unwrap().dynamic_count(), 1);
}

#[test]
fn copyout_mapping_copies_on_final_exit() {
    let mut ctx = context();
    let mut dst = vec![0u8; 128];

    unsafe {
        ctx.enter_data(dst.as_mut_ptr(), 128, MapKind::Copyout, Q).unwrap();
    }
    dst.fill(9);
    ctx.update_device(dst.as_mut_ptr(), Q).unwrap();
    dst.fill(0);

    // `create` exit still honours the copyout the mapping was created with
    ctx.exit_data(dst.as_mut_ptr(), MapKind::Create, Q).unwrap();
    assert_eq!(dst, vec![9; 128]);
}

#[test]
fn finalize_ignores_outstanding_dynamic_references() {
    let mut ctx = context();
    let mut a = vec![0u32; 8];

    unsafe {
        for _ in 0..4 {
            ctx.enter_data(a.as_mut_ptr(), 32, MapKind::Create, Q).unwrap();
        }
    }
    assert_eq!(ctx.entry(a.as_mut_ptr()).unwrap().dynamic_count(), 4);
    ctx.exit_data_finalize(a.as_mut_ptr(), MapKind::Create, Q).unwrap();
    assert_eq!(ctx.mapping_count(), 0);

    assert!(matches!(
        ctx.exit_data(a.as_mut_ptr(), MapKind::Create, Q),
        Err(OffloadError::NotFound(_))
    ));
}

#[test]
fn present_or_copy_maps_unmapped_arrays() {
    let mut ctx = context();
    let mut a = vec![4u8; 64];

    ctx.enter_region();
    unsafe {
        ctx.present_or(a.as_mut_ptr(), 64, MapKind::Copy, Q).unwrap();
    }
    assert!(ctx.is_present(a.as_mut_ptr()));
    a.fill(0);
    ctx.exit_region().unwrap();

    // Copied back on exit
    assert_eq!(a, vec![4; 64]);
    assert_eq!(ctx.mapping_count(), 0);
}

#[test]
fn mapping_record_with_runtime_buffer() {
    let mut ctx = context();
    let mut rec = MappingRecord::new(ptr::null_mut(), 4096, MapKind::Copyin, false);

    ctx.enter_region();
    let mapped = unsafe { ctx.map_record(&mut rec, Q) }.unwrap();
    assert!(!rec.host_ptr.is_null());
    assert!(ctx.is_present(rec.host_ptr));
    assert_eq!(ctx.use_device(rec.host_ptr).unwrap(), mapped.device_address);

    ctx.exit_region().unwrap();
    assert_eq!(ctx.mapping_count(), 0);
}

#[test]
fn unknown_record_kind_is_invalid() {
    let mut ctx = context();
    let mut rec = MappingRecord::default();
    let err = unsafe { ctx.map_record(&mut rec, Q) }.unwrap_err();
    assert!(matches!(err, OffloadError::InvalidArgument(_)));
}

#[test]
fn interior_range_running_past_the_address_space_is_rejected() {
    let mut ctx = context();
    let mut a = vec![0f32; 100];

    unsafe {
        ctx.enter_data(a.as_mut_ptr(), 400, MapKind::Copyin, Q).unwrap();
        let err = ctx
            .enter_data(a.as_mut_ptr().add(10), usize::MAX, MapKind::Copyin, Q)
            .unwrap_err();
        assert!(matches!(err, OffloadError::SizeMismatch { mapped: 400, .. }));
    }
    assert_eq!(ctx.mapping_count(), 1);
    assert_eq!(ctx.entry(a.as_mut_ptr()).unwrap().dynamic_count(), 1);
}
