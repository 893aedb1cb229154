use crate::error::{OffloadError, OffloadResult};
use std::ffi::{c_int, c_void};
use std::fmt;
use std::mem;

// ===============================================================================================
// Wire Values (must match the code generator's enumerations)
// ===============================================================================================

pub const MAP_KIND_UNDEFINED: c_int = 0;
pub const MAP_KIND_PRESENT: c_int = 1;
pub const MAP_KIND_DELETE: c_int = 2;
pub const MAP_KIND_CREATE: c_int = 3;
pub const MAP_KIND_NO_CREATE: c_int = 4;
pub const MAP_KIND_COPYIN: c_int = 5;
pub const MAP_KIND_COPYOUT: c_int = 6;
pub const MAP_KIND_COPY: c_int = 7;

pub const COUNTER_NONE: c_int = 0;
pub const COUNTER_STRUCTURED: c_int = 1;
pub const COUNTER_DYNAMIC: c_int = 2;

// ===============================================================================================
// Map Kind
// ===============================================================================================

/// The data clause requested by generated code.
///
/// `undefined` exists only on the wire and is rejected when decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapKind {
    Present,
    Delete,
    Create,
    NoCreate,
    Copyin,
    Copyout,
    Copy,
}

impl MapKind {
    /// Decodes a wire value.
    ///
    /// # Errors
    /// Returns `OffloadError::InvalidArgument` for `undefined` and unknown values.
    pub fn from_raw(raw: c_int) -> OffloadResult<Self> {
        match raw {
            MAP_KIND_PRESENT => Ok(Self::Present),
            MAP_KIND_DELETE => Ok(Self::Delete),
            MAP_KIND_CREATE => Ok(Self::Create),
            MAP_KIND_NO_CREATE => Ok(Self::NoCreate),
            MAP_KIND_COPYIN => Ok(Self::Copyin),
            MAP_KIND_COPYOUT => Ok(Self::Copyout),
            MAP_KIND_COPY => Ok(Self::Copy),
            MAP_KIND_UNDEFINED => Err(OffloadError::InvalidArgument(
                "map kind is undefined".to_string(),
            )),
            other => Err(OffloadError::InvalidArgument(format!(
                "unknown map kind {other}"
            ))),
        }
    }

    #[must_use]
    pub const fn to_raw(self) -> c_int {
        match self {
            Self::Present => MAP_KIND_PRESENT,
            Self::Delete => MAP_KIND_DELETE,
            Self::Create => MAP_KIND_CREATE,
            Self::NoCreate => MAP_KIND_NO_CREATE,
            Self::Copyin => MAP_KIND_COPYIN,
            Self::Copyout => MAP_KIND_COPYOUT,
            Self::Copy => MAP_KIND_COPY,
        }
    }

    /// Kinds that allocate device memory for an absent host address.
    #[must_use]
    pub const fn allocates(self) -> bool {
        matches!(self, Self::Create | Self::Copyin | Self::Copyout | Self::Copy)
    }

    #[must_use]
    pub const fn copies_in(self) -> bool {
        matches!(self, Self::Copyin | Self::Copy)
    }

    #[must_use]
    pub const fn copies_out(self) -> bool {
        matches!(self, Self::Copyout | Self::Copy)
    }
}

impl fmt::Display for MapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Present => "present",
            Self::Delete => "delete",
            Self::Create => "create",
            Self::NoCreate => "no_create",
            Self::Copyin => "copyin",
            Self::Copyout => "copyout",
            Self::Copy => "copy",
        };
        f.write_str(name)
    }
}

// ===============================================================================================
// Counter Kind
// ===============================================================================================

/// Which reference counter of a mapping an operation acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterKind {
    Structured,
    Dynamic,
}

impl CounterKind {
    /// # Errors
    /// Returns `OffloadError::InvalidArgument` for `none` and unknown values.
    pub fn from_raw(raw: c_int) -> OffloadResult<Self> {
        match raw {
            COUNTER_STRUCTURED => Ok(Self::Structured),
            COUNTER_DYNAMIC => Ok(Self::Dynamic),
            COUNTER_NONE => Err(OffloadError::InvalidArgument(
                "counter kind is none".to_string(),
            )),
            other => Err(OffloadError::InvalidArgument(format!(
                "unknown counter kind {other}"
            ))),
        }
    }

    #[must_use]
    pub const fn to_raw(self) -> c_int {
        match self {
            Self::Structured => COUNTER_STRUCTURED,
            Self::Dynamic => COUNTER_DYNAMIC,
        }
    }
}

impl fmt::Display for CounterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Structured => f.write_str("structured"),
            Self::Dynamic => f.write_str("dynamic"),
        }
    }
}

// ===============================================================================================
// Mapping Record
// ===============================================================================================

/// Fixed-layout mapping description shared with generated code.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MappingRecord {
    pub host_ptr: *mut c_void,
    pub num_bytes: usize,
    pub map_kind: c_int,
    pub never_deallocate: bool,
}

#[cfg(target_pointer_width = "64")]
const _: () = {
    assert!(mem::size_of::<MappingRecord>() == 24);
    assert!(mem::offset_of!(MappingRecord, num_bytes) == 8);
    assert!(mem::offset_of!(MappingRecord, map_kind) == 16);
    assert!(mem::offset_of!(MappingRecord, never_deallocate) == 20);
};

impl Default for MappingRecord {
    fn default() -> Self {
        Self {
            host_ptr: std::ptr::null_mut(),
            num_bytes: 0,
            map_kind: MAP_KIND_UNDEFINED,
            never_deallocate: false,
        }
    }
}

impl MappingRecord {
    #[must_use]
    pub const fn new(
        host_ptr: *mut c_void,
        num_bytes: usize,
        map_kind: MapKind,
        never_deallocate: bool,
    ) -> Self {
        Self {
            host_ptr,
            num_bytes,
            map_kind: map_kind.to_raw(),
            never_deallocate,
        }
    }

    /// # Errors
    /// Propagates the decoding error of an invalid `map_kind`.
    pub fn kind(&self) -> OffloadResult<MapKind> {
        MapKind::from_raw(self.map_kind)
    }
}

impl fmt::Display for MappingRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{host_ptr: {:p}, num_bytes: {}, map_kind: ", self.host_ptr, self.num_bytes)?;
        match self.kind() {
            Ok(kind) => write!(f, "{kind}")?,
            Err(_) => write!(f, "<{}>", self.map_kind)?,
        }
        write!(f, ", never_deallocate: {}}}", self.never_deallocate)
    }
}

/// Result of entering a data region: the (possibly runtime-allocated) host
/// address and the device address that shadows it. `device_address` is 0 for
/// a `no_create` miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapped {
    pub host_address: u64,
    pub device_address: u64,
}

impl Mapped {
    #[must_use]
    pub const fn is_null(&self) -> bool {
        self.device_address == 0
    }
}
