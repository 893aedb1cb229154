use thiserror::Error;

#[derive(Error, Debug)]
pub enum OffloadError {
    #[error("Device allocation or copy failed: {0}")]
    AllocationFailure(String),

    #[error("Host address 0x{0:x} is not present on the device")]
    NotFound(u64),

    #[error("Host address 0x{host:x} is mapped with {mapped} bytes, not {requested}")]
    SizeMismatch {
        host: u64,
        mapped: usize,
        requested: usize,
    },

    #[error("Reference counter of host address 0x{0:x} is already zero")]
    DoubleFree(u64),

    #[error("Host address 0x{0:x} is already registered in the present table")]
    DuplicateKey(u64),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unknown queue handle: {0}")]
    InvalidQueue(u64),

    #[error("Device Error: {0}")]
    Device(String),

    #[error("Configuration Error: {0}")]
    Config(String),
}

pub type OffloadResult<T> = Result<T, OffloadError>;

/// Status codes returned across the C boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Status {
    Success = 0,
    AllocationFailure = 1,
    NotFound = 2,
    SizeMismatch = 3,
    DoubleFree = 4,
    DuplicateKey = 5,
    InvalidArgument = 6,
    InvalidQueue = 7,
    DeviceError = 8,
    ConfigError = 9,
}

impl From<&OffloadError> for Status {
    fn from(err: &OffloadError) -> Self {
        match err {
            OffloadError::AllocationFailure(_) => Self::AllocationFailure,
            OffloadError::NotFound(_) => Self::NotFound,
            OffloadError::SizeMismatch { .. } => Self::SizeMismatch,
            OffloadError::DoubleFree(_) => Self::DoubleFree,
            OffloadError::DuplicateKey(_) => Self::DuplicateKey,
            OffloadError::InvalidArgument(_) => Self::InvalidArgument,
            OffloadError::InvalidQueue(_) => Self::InvalidQueue,
            OffloadError::Device(_) => Self::DeviceError,
            OffloadError::Config(_) => Self::ConfigError,
        }
    }
}

impl<T> From<&OffloadResult<T>> for Status {
    fn from(res: &OffloadResult<T>) -> Self {
        match res {
            Ok(_) => Self::Success,
            Err(e) => Self::from(e),
        }
    }
}
