use offload_rt::{Context, MapKind, QueueHandle, RuntimeConfig};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Data Region Walkthrough ===");

    let mut ctx = Context::create(RuntimeConfig::from_env()?.log_filter("debug"))?;
    println!("[+] Context created: {:?}", ctx.config());

    let q = QueueHandle::DEFAULT;
    let mut a: Vec<f32> = (0..1024).map(|i| i as f32).collect();
    let mut b = vec![0f32; 1024];
    let bytes = std::mem::size_of_val(a.as_slice());

    // 1. Dynamic region around the whole computation
    unsafe { ctx.enter_data(a.as_mut_ptr(), bytes, MapKind::Copyin, q)? };
    println!("[+] enter data copyin(a): present = {}", ctx.is_present(a.as_mut_ptr()));

    // 2. Structured region nested inside it
    ctx.enter_region();
    unsafe {
        ctx.init(a.as_mut_ptr(), bytes, MapKind::Present, false, q)?;
        ctx.init(b.as_mut_ptr(), bytes, MapKind::Copyout, false, q)?;
    }
    let entry = ctx
        .entry(a.as_mut_ptr())
        .ok_or("a should be present")?;
    println!(
        "    a: structured = {}, dynamic = {}, device = 0x{:x}",
        entry.structured_count(),
        entry.dynamic_count(),
        entry.device_address()
    );

    // Stand-in for a kernel: produce b on the host and push it to the device
    for (dst, src) in b.iter_mut().zip(&a) {
        *dst = src * 2.0;
    }
    ctx.update_device(b.as_mut_ptr(), q)?;
    b.fill(0.0);

    ctx.exit_region()?;
    println!("[+] Left structured region: b[10] = {} (copied out)", b[10]);
    println!("    a still present: {}", ctx.is_present(a.as_mut_ptr()));

    // 3. Close the dynamic region
    ctx.exit_data(a.as_mut_ptr(), MapKind::Delete, q)?;
    println!(
        "[+] exit data delete(a): {} mappings, {} device bytes",
        ctx.mapping_count(),
        ctx.device_bytes_in_use()
    );

    ctx.shutdown()?;
    println!("=== Done ===");
    Ok(())
}
