use offload_rt::Status;
use offload_rt::ffi::{
    OffloadQueue, offloadrt_create, offloadrt_create_queue, offloadrt_destroy,
    offloadrt_destroy_queue, offloadrt_enter_data, offloadrt_exit_data, offloadrt_use_device,
    offloadrt_wait,
};
use offload_rt::runtime::types::{MAP_KIND_COPY, MAP_KIND_COPYOUT};
use std::ffi::{c_int, c_void};
use std::ptr;

fn check(op: &str, code: c_int) -> Result<(), String> {
    if code == Status::Success as c_int {
        Ok(())
    } else {
        Err(format!("{op} failed with status {code}"))
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Asynchronous Queue Test (C boundary) ===");

    let mut ctx = ptr::null_mut();
    check("offloadrt_create", unsafe { offloadrt_create(&mut ctx) })?;
    println!("[+] Context created");

    let mut queue: OffloadQueue = ptr::null_mut();
    check("offloadrt_create_queue", unsafe { offloadrt_create_queue(ctx, &mut queue) })?;
    println!("[+] Queue {queue:p} created");

    let mut data: Vec<u32> = (0..256).collect();
    let host = data.as_mut_ptr().cast::<c_void>();
    let bytes = std::mem::size_of_val(data.as_slice());

    check("offloadrt_enter_data", unsafe {
        offloadrt_enter_data(ctx, host, bytes, MAP_KIND_COPY, queue)
    })?;
    check("offloadrt_wait", unsafe { offloadrt_wait(ctx, queue) })?;

    let mut status = 0;
    let dev = unsafe { offloadrt_use_device(ctx, host, &mut status) };
    check("offloadrt_use_device", status)?;
    println!("[+] Mapped {bytes} bytes at {host:p} -> {dev:p}");

    data.fill(0);
    check("offloadrt_exit_data", unsafe {
        offloadrt_exit_data(ctx, host, MAP_KIND_COPYOUT, queue)
    })?;
    println!("    Before wait: data[100] = {}", data[100]);

    check("offloadrt_wait", unsafe { offloadrt_wait(ctx, queue) })?;
    println!("    After wait:  data[100] = {}", data[100]);

    check("offloadrt_destroy_queue", unsafe { offloadrt_destroy_queue(ctx, queue) })?;
    check("offloadrt_destroy", unsafe { offloadrt_destroy(ctx) })?;
    println!("=== Done ===");
    Ok(())
}
