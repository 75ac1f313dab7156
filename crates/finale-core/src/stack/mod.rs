//! Stack registry: bounds and guard zones of every live execution stack.
//!
//! ## Layout
//!
//! Stacks grow toward lower addresses. A region's usable extent is
//! `[base, base + size)` and its guard zone is the fixed band
//! `[base - GUARD_ZONE_SIZE, base)` just past the growth end.
//!
//! ## Fault-context reads
//!
//! [`StackRegistry::classify`] runs inside a SIGSEGV handler, so the table is
//! a fixed array of atomic slots allocated up front. Each slot carries a
//! sequence counter (odd while a writer is mid-update); readers retry a slot
//! whose counter moved under them and never take the writer lock.

use std::sync::atomic::{AtomicUsize, Ordering, fence};

use parking_lot::Mutex;

use crate::error::RegistryError;

/// Width of the guard band below every registered stack.
pub const GUARD_ZONE_SIZE: usize = 64 * 1024;

/// Default number of slots in a registry.
pub const DEFAULT_CAPACITY: usize = 256;

/// Bounded retries for a slot that keeps changing under a fault-context reader.
const READ_RETRIES: usize = 8;

const NO_OWNER: usize = 0;

static NEXT_OWNER: AtomicUsize = AtomicUsize::new(OwnerId::PRIMARY.0 + 1);

/// Identity of the execution context that owns a stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(usize);

impl OwnerId {
    /// The process's primary (main thread) stack.
    pub const PRIMARY: OwnerId = OwnerId(1);

    /// Allocate a fresh identity for a fiber or runtime thread.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_OWNER.fetch_add(1, Ordering::Relaxed))
    }

    /// Rebuild from a raw value. Zero means "no owner".
    #[must_use]
    pub const fn from_raw(raw: usize) -> Option<Self> {
        if raw == NO_OWNER { None } else { Some(Self(raw)) }
    }

    #[must_use]
    pub const fn as_raw(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Bounds of one execution stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackRegion {
    pub owner: OwnerId,
    /// Lowest usable address.
    pub base: usize,
    pub size: usize,
    pub guard_lo: usize,
    pub guard_hi: usize,
}

impl StackRegion {
    /// A region whose guard zone is the standard band below `base`.
    #[must_use]
    pub const fn new(owner: OwnerId, base: usize, size: usize) -> Self {
        Self {
            owner,
            base,
            size,
            guard_lo: base.saturating_sub(GUARD_ZONE_SIZE),
            guard_hi: base,
        }
    }

    /// Replace the guard zone with explicit bounds `[lo, hi)`.
    #[must_use]
    pub const fn with_guard(mut self, lo: usize, hi: usize) -> Self {
        self.guard_lo = lo;
        self.guard_hi = hi;
        self
    }

    /// One past the highest usable address.
    #[must_use]
    pub const fn top(&self) -> usize {
        self.base.wrapping_add(self.size)
    }

    #[must_use]
    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.top()
    }

    #[must_use]
    pub const fn in_guard(&self, addr: usize) -> bool {
        addr >= self.guard_lo && addr < self.guard_hi
    }

    fn validate(&self) -> Result<(), RegistryError> {
        let owner = self.owner.as_raw();
        if self.size == 0
            || self.base.checked_add(self.size).is_none()
            || self.guard_lo > self.guard_hi
        {
            return Err(RegistryError::InvalidRegion { owner });
        }
        Ok(())
    }
}

/// Outcome of classifying a faulting address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackClassification {
    NotAStackFault,
    StackOverflow,
}

struct Slot {
    seq: AtomicUsize,
    owner: AtomicUsize,
    base: AtomicUsize,
    size: AtomicUsize,
    guard_lo: AtomicUsize,
    guard_hi: AtomicUsize,
}

impl Slot {
    const fn new() -> Self {
        Self {
            seq: AtomicUsize::new(0),
            owner: AtomicUsize::new(NO_OWNER),
            base: AtomicUsize::new(0),
            size: AtomicUsize::new(0),
            guard_lo: AtomicUsize::new(0),
            guard_hi: AtomicUsize::new(0),
        }
    }

    /// Caller holds the writer lock.
    fn write(&self, owner: usize, region: Option<&StackRegion>) {
        self.seq.fetch_add(1, Ordering::AcqRel);
        fence(Ordering::Release);
        let (base, size, lo, hi) =
            region.map_or((0, 0, 0, 0), |r| (r.base, r.size, r.guard_lo, r.guard_hi));
        self.base.store(base, Ordering::Relaxed);
        self.size.store(size, Ordering::Relaxed);
        self.guard_lo.store(lo, Ordering::Relaxed);
        self.guard_hi.store(hi, Ordering::Relaxed);
        self.owner.store(owner, Ordering::Relaxed);
        self.seq.fetch_add(1, Ordering::Release);
    }

    /// Consistent snapshot, or `None` if the slot is empty or kept changing.
    fn read(&self) -> Option<StackRegion> {
        for _ in 0..READ_RETRIES {
            let before = self.seq.load(Ordering::Acquire);
            if before % 2 == 1 {
                std::hint::spin_loop();
                continue;
            }
            let owner = self.owner.load(Ordering::Relaxed);
            let base = self.base.load(Ordering::Relaxed);
            let size = self.size.load(Ordering::Relaxed);
            let guard_lo = self.guard_lo.load(Ordering::Relaxed);
            let guard_hi = self.guard_hi.load(Ordering::Relaxed);
            fence(Ordering::Acquire);
            if self.seq.load(Ordering::Relaxed) != before {
                continue;
            }
            let owner = OwnerId::from_raw(owner)?;
            return Some(StackRegion {
                owner,
                base,
                size,
                guard_lo,
                guard_hi,
            });
        }
        None
    }

    fn owner_raw(&self) -> usize {
        self.owner.load(Ordering::Acquire)
    }
}

/// Fixed-capacity table of live stack regions.
pub struct StackRegistry<const N: usize = DEFAULT_CAPACITY> {
    slots: [Slot; N],
    writer: Mutex<()>,
}

impl<const N: usize> Default for StackRegistry<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> StackRegistry<N> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: [const { Slot::new() }; N],
            writer: Mutex::new(()),
        }
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Add a region for a newly created stack.
    pub fn register(&self, region: StackRegion) -> Result<(), RegistryError> {
        region.validate()?;
        let owner = region.owner.as_raw();
        let _guard = self.writer.lock();
        if self.slots.iter().any(|slot| slot.owner_raw() == owner) {
            return Err(RegistryError::DuplicateOwner { owner });
        }
        let slot = self
            .slots
            .iter()
            .find(|slot| slot.owner_raw() == NO_OWNER)
            .ok_or(RegistryError::Full { capacity: N })?;
        slot.write(owner, Some(&region));
        Ok(())
    }

    /// Remove the region of a stack being torn down.
    pub fn unregister(&self, owner: OwnerId) -> Result<StackRegion, RegistryError> {
        let raw = owner.as_raw();
        let _guard = self.writer.lock();
        let slot = self
            .slots
            .iter()
            .find(|slot| slot.owner_raw() == raw)
            .ok_or(RegistryError::UnknownOwner { owner: raw })?;
        let region = slot
            .read()
            .ok_or(RegistryError::UnknownOwner { owner: raw })?;
        slot.write(NO_OWNER, None);
        Ok(region)
    }

    /// Look up an owner's region. Lock-free.
    #[must_use]
    pub fn region(&self, owner: OwnerId) -> Option<StackRegion> {
        self.slots
            .iter()
            .filter(|slot| slot.owner_raw() == owner.as_raw())
            .find_map(Slot::read)
            .filter(|region| region.owner == owner)
    }

    /// Decide whether `addr` is a stack exhaustion of `current`'s stack.
    ///
    /// Only the currently executing owner's guard zone counts; a hit in some
    /// other stack's guard zone is an ordinary invalid access. Allocation-free
    /// and lock-free, safe to call from a signal handler.
    #[must_use]
    pub fn classify(&self, addr: usize, current: Option<OwnerId>) -> StackClassification {
        match current.and_then(|owner| self.region(owner)) {
            Some(region) if region.in_guard(addr) => StackClassification::StackOverflow,
            _ => StackClassification::NotAStackFault,
        }
    }

    /// Number of live regions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.owner_raw() != NO_OWNER)
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
