//! CPU bitmasks
//!
//! `CpuMask` is a plain value type used for affinity, sibling and core maps.
//! `AtomicCpuMask` backs the scheduler-wide idle and online maps, which are
//! read on hot paths without taking the global lock.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::types::CpuId;

/// Maximum number of physical CPUs a mask can describe
pub const MAX_CPUS: usize = 256;

const WORDS: usize = MAX_CPUS / 64;

#[inline]
const fn word(cpu: CpuId) -> usize {
    cpu / 64
}

#[inline]
const fn bit(cpu: CpuId) -> u64 {
    1u64 << (cpu % 64)
}

// ============================================================================
// CpuMask
// ============================================================================

/// Fixed-width set of CPU ids
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CpuMask {
    bits: [u64; WORDS],
}

impl CpuMask {
    pub const fn empty() -> Self {
        Self { bits: [0; WORDS] }
    }

    /// Mask with every representable CPU set
    pub const fn all() -> Self {
        Self { bits: [u64::MAX; WORDS] }
    }

    /// Mask with CPUs `0..n` set
    pub fn first_n(n: usize) -> Self {
        let mut mask = Self::empty();
        for cpu in 0..n.min(MAX_CPUS) {
            mask.set(cpu);
        }
        mask
    }

    pub fn single(cpu: CpuId) -> Self {
        let mut mask = Self::empty();
        mask.set(cpu);
        mask
    }

    pub fn from_cpus<I: IntoIterator<Item = CpuId>>(cpus: I) -> Self {
        let mut mask = Self::empty();
        for cpu in cpus {
            mask.set(cpu);
        }
        mask
    }

    #[inline]
    pub fn set(&mut self, cpu: CpuId) {
        if cpu < MAX_CPUS {
            self.bits[word(cpu)] |= bit(cpu);
        }
    }

    #[inline]
    pub fn clear(&mut self, cpu: CpuId) {
        if cpu < MAX_CPUS {
            self.bits[word(cpu)] &= !bit(cpu);
        }
    }

    #[inline]
    pub fn is_set(&self, cpu: CpuId) -> bool {
        cpu < MAX_CPUS && self.bits[word(cpu)] & bit(cpu) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|w| *w == 0)
    }

    /// Number of CPUs in the mask
    pub fn count(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn and(&self, other: &CpuMask) -> CpuMask {
        let mut out = *self;
        for (dst, src) in out.bits.iter_mut().zip(other.bits.iter()) {
            *dst &= *src;
        }
        out
    }

    pub fn or(&self, other: &CpuMask) -> CpuMask {
        let mut out = *self;
        for (dst, src) in out.bits.iter_mut().zip(other.bits.iter()) {
            *dst |= *src;
        }
        out
    }

    /// `self & !other`
    pub fn andnot(&self, other: &CpuMask) -> CpuMask {
        let mut out = *self;
        for (dst, src) in out.bits.iter_mut().zip(other.bits.iter()) {
            *dst &= !*src;
        }
        out
    }

    pub fn intersects(&self, other: &CpuMask) -> bool {
        self.bits.iter().zip(other.bits.iter()).any(|(a, b)| a & b != 0)
    }

    /// Lowest CPU in the mask
    pub fn first(&self) -> Option<CpuId> {
        self.next_from(0)
    }

    /// Lowest CPU strictly greater than `cpu`
    pub fn next(&self, cpu: CpuId) -> Option<CpuId> {
        self.next_from(cpu + 1)
    }

    fn next_from(&self, start: CpuId) -> Option<CpuId> {
        if start >= MAX_CPUS {
            return None;
        }
        let mut w = word(start);
        let mut bits = self.bits[w] & (u64::MAX << (start % 64));
        loop {
            if bits != 0 {
                return Some(w * 64 + bits.trailing_zeros() as usize);
            }
            w += 1;
            if w >= WORDS {
                return None;
            }
            bits = self.bits[w];
        }
    }

    /// Next CPU after `cpu`, wrapping around to the lowest one.
    ///
    /// Returns `cpu` itself when it is the only member, and `None` for an
    /// empty mask.
    pub fn cycle(&self, cpu: CpuId) -> Option<CpuId> {
        self.next(cpu).or_else(|| self.first())
    }

    pub fn iter(&self) -> CpuMaskIter<'_> {
        CpuMaskIter { mask: self, next: 0 }
    }
}

pub struct CpuMaskIter<'a> {
    mask: &'a CpuMask,
    next: CpuId,
}

impl Iterator for CpuMaskIter<'_> {
    type Item = CpuId;

    fn next(&mut self) -> Option<CpuId> {
        let cpu = self.mask.next_from(self.next)?;
        self.next = cpu + 1;
        Some(cpu)
    }
}

impl FromIterator<CpuId> for CpuMask {
    fn from_iter<I: IntoIterator<Item = CpuId>>(iter: I) -> Self {
        Self::from_cpus(iter)
    }
}

/// Formats as a range list, e.g. `{0-3,6}`
impl fmt::Display for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        let mut first = true;
        let mut iter = self.iter().peekable();
        while let Some(start) = iter.next() {
            let mut end = start;
            while iter.peek() == Some(&(end + 1)) {
                end = iter.next().unwrap_or(end);
            }
            if !first {
                write!(f, ",")?;
            }
            first = false;
            if start == end {
                write!(f, "{}", start)?;
            } else {
                write!(f, "{}-{}", start, end)?;
            }
        }
        write!(f, "}}")
    }
}

impl fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuMask{}", self)
    }
}

// Serialized as a list of CPU ids, which is how scenarios spell affinities.
impl Serialize for CpuMask {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter())
    }
}

impl<'de> Deserialize<'de> for CpuMask {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let cpus = Vec::<CpuId>::deserialize(deserializer)?;
        if let Some(bad) = cpus.iter().find(|cpu| **cpu >= MAX_CPUS) {
            return Err(serde::de::Error::custom(format!(
                "cpu {} out of range (max {})",
                bad,
                MAX_CPUS - 1
            )));
        }
        Ok(Self::from_cpus(cpus))
    }
}

// ============================================================================
// AtomicCpuMask
// ============================================================================

/// CPU mask with lock-free per-bit updates
#[derive(Default)]
pub struct AtomicCpuMask {
    bits: [AtomicU64; WORDS],
}

impl AtomicCpuMask {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn set(&self, cpu: CpuId) {
        if cpu < MAX_CPUS {
            self.bits[word(cpu)].fetch_or(bit(cpu), Ordering::AcqRel);
        }
    }

    #[inline]
    pub fn clear(&self, cpu: CpuId) {
        if cpu < MAX_CPUS {
            self.bits[word(cpu)].fetch_and(!bit(cpu), Ordering::AcqRel);
        }
    }

    #[inline]
    pub fn is_set(&self, cpu: CpuId) -> bool {
        cpu < MAX_CPUS && self.bits[word(cpu)].load(Ordering::Acquire) & bit(cpu) != 0
    }

    /// Snapshot of the whole mask. Words are read one at a time, so the
    /// result is not atomic as a whole.
    pub fn load(&self) -> CpuMask {
        let mut mask = CpuMask::empty();
        for (dst, src) in mask.bits.iter_mut().zip(self.bits.iter()) {
            *dst = src.load(Ordering::Acquire);
        }
        mask
    }
}

impl fmt::Debug for AtomicCpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AtomicCpuMask{}", self.load())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_clear_count() {
        let mut mask = CpuMask::empty();
        assert!(mask.is_empty());
        mask.set(0);
        mask.set(63);
        mask.set(64);
        mask.set(255);
        mask.set(256); // ignored
        assert_eq!(mask.count(), 4);
        assert!(mask.is_set(64));
        mask.clear(64);
        assert!(!mask.is_set(64));
        assert_eq!(mask.count(), 3);
    }

    #[test]
    fn test_cycle_wraps() {
        let mask = CpuMask::from_cpus([2, 5, 70]);
        assert_eq!(mask.cycle(2), Some(5));
        assert_eq!(mask.cycle(5), Some(70));
        assert_eq!(mask.cycle(70), Some(2));
        assert_eq!(mask.cycle(3), Some(5));
        assert_eq!(CpuMask::single(4).cycle(4), Some(4));
        assert_eq!(CpuMask::empty().cycle(0), None);
    }

    #[test]
    fn test_set_operations() {
        let a = CpuMask::first_n(4);
        let b = CpuMask::from_cpus([2, 3, 4]);
        assert_eq!(a.and(&b), CpuMask::from_cpus([2, 3]));
        assert_eq!(a.andnot(&b), CpuMask::from_cpus([0, 1]));
        assert_eq!(a.or(&b), CpuMask::first_n(5));
        assert!(a.intersects(&b));
        assert_eq!(b.iter().collect::<Vec<_>>(), vec![2, 3, 4]);
    }

    #[test]
    fn test_display_ranges() {
        let mask = CpuMask::from_cpus([0, 1, 2, 3, 6, 9, 10]);
        assert_eq!(mask.to_string(), "{0-3,6,9-10}");
        assert_eq!(CpuMask::empty().to_string(), "{}");
    }

    #[test]
    fn test_atomic_mask() {
        let mask = AtomicCpuMask::new();
        mask.set(1);
        mask.set(130);
        assert!(mask.is_set(130));
        mask.clear(1);
        assert_eq!(mask.load(), CpuMask::single(130));
    }

    #[test]
    fn test_serde_list() {
        let mask: CpuMask = serde_yaml::from_str("[0, 2, 3]").unwrap();
        assert_eq!(mask, CpuMask::from_cpus([0, 2, 3]));
        assert!(serde_yaml::from_str::<CpuMask>("[300]").is_err());
        assert_eq!(serde_json::to_string(&mask).unwrap(), "[0,2,3]");
    }
}
