//! Reference-counted host/device data mapping runtime for offloaded data regions.
//!
//! Generated code maps host arrays into device memory with structured
//! (`data` constructs) and dynamic (`enter data`/`exit data`) regions. The
//! [`Context`] tracks every mapping in a present table and decides when device
//! memory is allocated, copied and released. [`ffi`] exposes the same
//! operations to C and Fortran callers.

pub mod config;
pub mod device;
pub mod error;
pub mod ffi;
pub mod runtime;

pub use config::RuntimeConfig;
pub use device::{DeviceAddress, DeviceRuntime, HostAddress, QueueHandle};
pub use error::{OffloadError, OffloadResult, Status};
pub use runtime::{Context, CounterKind, MapKind, Mapped, MappingRecord};
