use std::collections::BTreeMap;

const GUARD_PAGE_SIZE: u64 = 4096;

/// A managed range of device virtual address space.
///
/// Hands out aligned, non-overlapping ranges separated by guard pages, so an
/// out-of-bounds device address never resolves to a neighbouring allocation.
#[derive(Debug)]
pub struct Aperture {
    base: u64,
    limit: u64,
    align: u64,
    guard_pages: u64,

    // Reserved start (including leading guard) -> reserved size (including both guards)
    reservations: BTreeMap<u64, u64>,
}

impl Aperture {
    #[must_use]
    pub fn new(base: u64, limit: u64, align: u64, guard_pages: u64) -> Self {
        Self {
            base,
            limit,
            align: align.max(1),
            guard_pages,
            reservations: BTreeMap::new(),
        }
    }

    const fn align_up(val: u64, align: u64) -> Option<u64> {
        match val.checked_add(align - 1) {
            Some(padded) => Some(padded & !(align - 1)),
            None => None,
        }
    }

    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr <= self.limit
    }

    /// Reserves `size` bytes and returns the first usable address.
    ///
    /// First-fit over the holes between existing reservations. Returns `None`
    /// when the aperture is exhausted.
    pub fn allocate_va(&mut self, size: usize, align: usize) -> Option<u64> {
        let size = size as u64;
        let align = std::cmp::max(align as u64, self.align);
        let guard = self.guard_pages * GUARD_PAGE_SIZE;

        let fits = |cursor: u64| -> Option<(u64, u64)> {
            let user = Self::align_up(cursor.checked_add(guard)?, align)?;
            let start = user - guard;
            Some((start, user.checked_add(size)?.checked_add(guard)?))
        };

        let mut cursor = self.base;

        for (&res_start, &res_size) in &self.reservations {
            let (start, end) = fits(cursor)?;
            if end <= res_start {
                self.reservations.insert(start, end - start);
                return Some(start + guard);
            }
            cursor = cursor.max(res_start + res_size);
        }

        let (start, end) = fits(cursor)?;
        if end - 1 <= self.limit {
            self.reservations.insert(start, end - start);
            return Some(start + guard);
        }

        None
    }

    /// Releases a range previously returned by [`Aperture::allocate_va`].
    /// Returns `false` if `addr` was not tracked.
    pub fn free_va(&mut self, addr: u64) -> bool {
        let guard = self.guard_pages * GUARD_PAGE_SIZE;
        // The tracked start is the address minus the leading guard
        let Some(tracked_start) = addr.checked_sub(guard) else {
            return false;
        };

        let freed = self.reservations.remove(&tracked_start).is_some();
        if !freed {
            tracing::warn!("aperture: tried to free VA 0x{addr:x} which was not tracked");
        }
        freed
    }

    #[must_use]
    pub fn reserved_ranges(&self) -> usize {
        self.reservations.len()
    }
}
