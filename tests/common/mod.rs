#![allow(dead_code)]

use offload_rt::device::emulated::EmulatedDevice;
use offload_rt::{Context, RuntimeConfig};

pub const DEVICE_MEMORY: u64 = 8 << 20;

/// A context on a small emulated device with pageable runtime buffers.
pub fn context() -> Context {
    let config = RuntimeConfig::new()
        .device_memory(DEVICE_MEMORY)
        .pin_host(false);
    let device = EmulatedDevice::new(config.device_memory_bytes, config.device_alignment);
    Context::with_device(config, Box::new(device))
}

pub fn bytes_of<T>(buf: &[T]) -> usize {
    std::mem::size_of_val(buf)
}
