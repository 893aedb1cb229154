use crate::error::{OffloadError, OffloadResult};
use std::env;

pub const ENV_LOG: &str = "OFFLOADRT_LOG";
pub const ENV_DEVICE_MEMORY: &str = "OFFLOADRT_DEVICE_MEMORY";
pub const ENV_PIN_HOST: &str = "OFFLOADRT_PIN_HOST";
pub const ENV_ALIGNMENT: &str = "OFFLOADRT_ALIGNMENT";

const DEFAULT_DEVICE_MEMORY: u64 = 4 * 1024 * 1024 * 1024;
const DEFAULT_ALIGNMENT: usize = 256;
const DEFAULT_LOG_FILTER: &str = "warn";

/// Runtime settings, read once when a [`crate::Context`] is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// `tracing` filter directive installed by `Context::create`.
    pub log_filter: String,
    /// Capacity of the emulated device heap in bytes.
    pub device_memory_bytes: u64,
    /// Page-lock host buffers that the runtime allocates itself.
    pub pin_host_buffers: bool,
    /// Alignment of every device allocation. Must be a power of two.
    pub device_alignment: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            device_memory_bytes: DEFAULT_DEVICE_MEMORY,
            pin_host_buffers: true,
            device_alignment: DEFAULT_ALIGNMENT,
        }
    }
}

impl RuntimeConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn device_memory(mut self, bytes: u64) -> Self {
        self.device_memory_bytes = bytes;
        self
    }

    #[must_use]
    pub const fn pin_host(mut self, pin: bool) -> Self {
        self.pin_host_buffers = pin;
        self
    }

    #[must_use]
    pub const fn alignment(mut self, align: usize) -> Self {
        self.device_alignment = align;
        self
    }

    #[must_use]
    pub fn log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = filter.into();
        self
    }

    /// Builds a configuration from the `OFFLOADRT_*` environment variables,
    /// falling back to defaults for unset ones.
    ///
    /// # Errors
    /// Returns `OffloadError::Config` if a variable is set but cannot be parsed.
    pub fn from_env() -> OffloadResult<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`RuntimeConfig::from_env`] but with an injectable lookup, so
    /// tests do not have to mutate the process environment.
    pub fn from_lookup<F>(lookup: F) -> OffloadResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(filter) = lookup(ENV_LOG) {
            cfg.log_filter = filter;
        }
        if let Some(raw) = lookup(ENV_DEVICE_MEMORY) {
            cfg.device_memory_bytes = parse_bytes(ENV_DEVICE_MEMORY, &raw)?;
        }
        if let Some(raw) = lookup(ENV_PIN_HOST) {
            cfg.pin_host_buffers = parse_bool(ENV_PIN_HOST, &raw)?;
        }
        if let Some(raw) = lookup(ENV_ALIGNMENT) {
            cfg.device_alignment = raw
                .trim()
                .parse::<usize>()
                .map_err(|e| OffloadError::Config(format!("{ENV_ALIGNMENT}={raw}: {e}")))?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// # Errors
    /// Returns `OffloadError::Config` for a zero capacity or a non power-of-two alignment.
    pub fn validate(&self) -> OffloadResult<()> {
        if self.device_memory_bytes == 0 {
            return Err(OffloadError::Config(
                "device memory capacity must be non-zero".to_string(),
            ));
        }
        if !self.device_alignment.is_power_of_two() {
            return Err(OffloadError::Config(format!(
                "device alignment {} is not a power of two",
                self.device_alignment
            )));
        }
        Ok(())
    }
}

/// Accepts plain byte counts and `K`/`M`/`G` binary suffixes (`512M`, `4G`).
fn parse_bytes(key: &str, raw: &str) -> OffloadResult<u64> {
    let s = raw.trim();
    let (digits, shift) = match s.as_bytes().last() {
        Some(b'k' | b'K') => (&s[..s.len() - 1], 10),
        Some(b'm' | b'M') => (&s[..s.len() - 1], 20),
        Some(b'g' | b'G') => (&s[..s.len() - 1], 30),
        _ => (s, 0),
    };

    let value = digits
        .parse::<u64>()
        .map_err(|e| OffloadError::Config(format!("{key}={raw}: {e}")))?;

    value
        .checked_mul(1u64 << shift)
        .ok_or_else(|| OffloadError::Config(format!("{key}={raw}: value overflows u64")))
}

fn parse_bool(key: &str, raw: &str) -> OffloadResult<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(OffloadError::Config(format!("{key}={raw}: expected a boolean"))),
    }
}
