use crate::device::HostAddress;
use crate::error::{OffloadError, OffloadResult};
use crate::runtime::entry::MappingEntry;
use std::collections::BTreeMap;

/// Registry of live mappings, keyed by host start address.
///
/// Regions never overlap, so the entry that starts at or below an address is
/// the only candidate that can contain it.
#[derive(Debug, Default)]
pub struct PresentTable {
    entries: BTreeMap<HostAddress, MappingEntry>,
}

impl PresentTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// Returns `OffloadError::DuplicateKey` if the host address is already registered.
    pub fn insert(&mut self, entry: MappingEntry) -> OffloadResult<()> {
        let key = entry.host_address();
        if self.entries.contains_key(&key) {
            return Err(OffloadError::DuplicateKey(key));
        }
        self.entries.insert(key, entry);
        Ok(())
    }

    #[must_use]
    pub fn find(&self, host: HostAddress) -> Option<&MappingEntry> {
        self.entries.get(&host)
    }

    /// The entry whose region contains `addr`, including its start address.
    #[must_use]
    pub fn find_containing(&self, addr: HostAddress) -> Option<&MappingEntry> {
        if let Some(entry) = self.entries.get(&addr) {
            return Some(entry);
        }
        self.entries
            .range(..=addr)
            .next_back()
            .map(|(_, e)| e)
            .filter(|e| e.contains(addr))
    }

    pub fn find_containing_mut(&mut self, addr: HostAddress) -> Option<&mut MappingEntry> {
        let key = self.find_containing(addr)?.host_address();
        self.entries.get_mut(&key)
    }

    /// The first registered region intersecting `[host, host + size)`.
    #[must_use]
    pub fn find_overlapping(&self, host: HostAddress, size: usize) -> Option<&MappingEntry> {
        let end = host.saturating_add(size.max(1) as u64);
        self.entries
            .range(..end)
            .next_back()
            .map(|(_, e)| e)
            .filter(|e| e.host_end() > host || e.host_address() == host)
    }

    /// Removes the entry registered at exactly `host`.
    pub fn erase(&mut self, host: HostAddress) -> Option<MappingEntry> {
        self.entries.remove(&host)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MappingEntry> {
        self.entries.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut MappingEntry> {
        self.entries.values_mut()
    }

    /// Empties the table, handing every entry to the caller.
    pub fn drain(&mut self) -> impl Iterator<Item = MappingEntry> {
        std::mem::take(&mut self.entries).into_values()
    }
}
