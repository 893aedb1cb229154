pub mod context;
pub mod entry;
pub mod present;
pub mod region;
pub mod transfer;
pub mod types;

pub use context::Context;
pub use entry::{EntryState, MappingEntry, Transition};
pub use present::PresentTable;
pub use region::{EnterOptions, RegionManager};
pub use transfer::TransferEngine;
pub use types::{CounterKind, MapKind, Mapped, MappingRecord};
