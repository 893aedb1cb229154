mod common;

use common::{DEVICE_MEMORY, bytes_of, context};
use offload_rt::{MapKind, OffloadError, QueueHandle};

#[test]
fn deferred_copyout_is_visible_after_wait() {
    let mut ctx = context();
    let q = ctx.create_queue().unwrap();
    let mut a = vec![3.5f64; 32];
    let n = bytes_of(&a);

    unsafe {
        ctx.enter_data(a.as_mut_ptr(), n, MapKind::Copyin, q).unwrap();
    }
    ctx.wait(q).unwrap();

    a.fill(0.0);
    ctx.exit_data(a.as_mut_ptr(), MapKind::Copyout, q).unwrap();

    // Entry is gone at once, the copy and free wait for the queue
    assert!(!ctx.is_present(a.as_mut_ptr()));
    assert_eq!(a[0], 0.0);
    assert_eq!(ctx.device_bytes_in_use(), n as u64);

    ctx.wait(q).unwrap();
    assert_eq!(a, vec![3.5; 32]);
    assert_eq!(ctx.device_bytes_in_use(), 0);
}

#[test]
fn queues_are_fifo() {
    let mut ctx = context();
    let q = ctx.create_queue().unwrap();
    let mut a = vec![1u32; 16];

    unsafe {
        ctx.enter_data(a.as_mut_ptr(), 64, MapKind::Copyin, q).unwrap();
    }
    // The copyin still reads the host buffer when the queue runs
    a.fill(2);
    ctx.update_host(a.as_mut_ptr(), q).unwrap();
    ctx.wait(q).unwrap();

    assert_eq!(a, vec![2; 16]);
}

#[test]
fn default_queue_waits_for_everything() {
    let mut ctx = context();
    let q1 = ctx.create_queue().unwrap();
    let q2 = ctx.create_queue().unwrap();
    let mut a = vec![5u8; 64];
    let mut b = vec![6u8; 64];

    unsafe {
        ctx.enter_data(a.as_mut_ptr(), 64, MapKind::Copy, q1).unwrap();
        ctx.enter_data(b.as_mut_ptr(), 64, MapKind::Copy, q2).unwrap();
    }
    ctx.wait_all().unwrap();
    a.fill(0);
    b.fill(0);
    ctx.update_host(a.as_mut_ptr(), q1).unwrap();
    ctx.update_host(b.as_mut_ptr(), q2).unwrap();

    ctx.wait(QueueHandle::DEFAULT).unwrap();
    assert_eq!(a, vec![5; 64]);
    assert_eq!(b, vec![6; 64]);
}

#[test]
fn capacity_exhaustion_is_an_allocation_failure() {
    let mut ctx = context();
    let mut a = vec![0u8; 16];

    let too_big = usize::try_from(DEVICE_MEMORY).unwrap() + 1;
    let err = unsafe { ctx.enter_data(a.as_mut_ptr(), too_big, MapKind::Create, QueueHandle::DEFAULT) }
        .unwrap_err();
    assert!(matches!(err, OffloadError::AllocationFailure(_)));
    assert_eq!(ctx.mapping_count(), 0);
}

#[test]
fn queue_handles_are_validated() {
    let mut ctx = context();
    let q = ctx.create_queue().unwrap();
    ctx.destroy_queue(q).unwrap();

    assert!(matches!(ctx.wait(q), Err(OffloadError::InvalidQueue(_))));
    assert!(matches!(
        ctx.destroy_queue(QueueHandle::DEFAULT),
        Err(OffloadError::InvalidArgument(_))
    ));
    ctx.wait_all().unwrap();
}

#[test]
fn shutdown_drains_pending_copies() {
    let mut ctx = context();
    let q = ctx.create_queue().unwrap();
    let mut a = vec![8u16; 40];

    unsafe {
        ctx.enter_data(a.as_mut_ptr(), 80, MapKind::Copy, q).unwrap();
    }
    ctx.wait(q).unwrap();
    a.fill(0);

    ctx.shutdown().unwrap();
    assert_eq!(a, vec![8; 40]);
}

#[test]
fn exit_on_another_queue_waits_for_the_entry_queue() {
    let mut ctx = context();
    let q1 = ctx.create_queue().unwrap();
    let q2 = ctx.create_queue().unwrap();
    let mut a = vec![7u8; 64];

    unsafe {
        ctx.enter_data(a.as_mut_ptr(), 64, MapKind::Copyin, q1).unwrap();
    }
    // The copyin is still pending on q1 when q2 gets the copyout and free
    ctx.exit_data(a.as_mut_ptr(), MapKind::Copyout, q2).unwrap();
    ctx.wait(q2).unwrap();

    assert_eq!(a, vec![7; 64]);
    ctx.wait(q1).unwrap();
    assert_eq!(ctx.device_bytes_in_use(), 0);
}

#[test]
fn update_on_another_queue_sees_the_pending_copyin() {
    let mut ctx = context();
    let q1 = ctx.create_queue().unwrap();
    let q2 = ctx.create_queue().unwrap();
    let mut a = vec![4u32; 16];

    unsafe {
        ctx.enter_data(a.as_mut_ptr(), 64, MapKind::Copyin, q1).unwrap();
    }
    ctx.update_host(a.as_mut_ptr(), q2).unwrap();
    ctx.wait(q2).unwrap();
    assert_eq!(a, vec![4; 16]);

    ctx.exit_data(a.as_mut_ptr(), MapKind::Delete, q1).unwrap();
    ctx.wait_all().unwrap();
    assert_eq!(ctx.mapping_count(), 0);
}
