//! Resident Set: per-process record of which virtual addresses currently
//! hold a frame, each tagged with the FIFO sequence number it was mapped
//! with. A fixed array, not a `Vec`, matching the teacher's `PROCS_MAX`
//! style of sizing process-owned tables up front.

use common::RESIDENT_MAX;

use crate::address::VAddr;

#[derive(Clone, Copy, Debug)]
pub struct ResidentEntry {
    pub va: usize,
    pub seq: u64,
}

#[derive(Debug)]
pub struct ResidentSet {
    entries: [Option<ResidentEntry>; RESIDENT_MAX],
    len: usize,
}

impl ResidentSet {
    pub const fn new() -> Self {
        Self {
            entries: [None; RESIDENT_MAX],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == RESIDENT_MAX
    }

    /// Records that `va` became resident with FIFO sequence `seq`.
    /// Panics if the set is already full: the caller (Replacement Policy)
    /// must evict before inserting.
    pub fn insert(&mut self, va: VAddr, seq: u64) {
        let slot = self
            .entries
            .iter_mut()
            .find(|e| e.is_none())
            .expect("resident set insert called while full");
        *slot = Some(ResidentEntry {
            va: va.as_usize(),
            seq,
        });
        self.len += 1;
    }

    /// Removes the entry for `va`, if present.
    pub fn remove(&mut self, va: VAddr) -> Option<ResidentEntry> {
        let slot = self
            .entries
            .iter_mut()
            .find(|e| matches!(e, Some(entry) if entry.va == va.as_usize()))?;
        let entry = slot.take();
        self.len -= 1;
        entry
    }

    pub fn contains(&self, va: VAddr) -> bool {
        self.entries
            .iter()
            .flatten()
            .any(|e| e.va == va.as_usize())
    }

    pub fn seq_of(&self, va: VAddr) -> Option<u64> {
        self.entries
            .iter()
            .flatten()
            .find(|e| e.va == va.as_usize())
            .map(|e| e.seq)
    }

    /// The entry with the lowest `seq` — the next FIFO victim.
    pub fn oldest(&self) -> Option<ResidentEntry> {
        self.entries.iter().flatten().min_by_key(|e| e.seq).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = ResidentEntry> + '_ {
        self.entries.iter().flatten().copied()
    }

    pub fn clear(&mut self) {
        self.entries = [None; RESIDENT_MAX];
        self.len = 0;
    }
}

impl Default for ResidentSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_remove_track_length() {
        let mut set = ResidentSet::new();
        set.insert(VAddr::new(0x1000), 0);
        set.insert(VAddr::new(0x2000), 1);
        assert_eq!(set.len(), 2);
        assert!(set.contains(VAddr::new(0x1000)));

        let removed = set.remove(VAddr::new(0x1000)).unwrap();
        assert_eq!(removed.va, 0x1000);
        assert_eq!(set.len(), 1);
        assert!(!set.contains(VAddr::new(0x1000)));
    }

    #[test]
    fn oldest_returns_lowest_seq() {
        let mut set = ResidentSet::new();
        set.insert(VAddr::new(0x1000), 5);
        set.insert(VAddr::new(0x2000), 2);
        set.insert(VAddr::new(0x3000), 9);

        let victim = set.oldest().unwrap();
        assert_eq!(victim.va, 0x2000);
        assert_eq!(victim.seq, 2);
    }

    #[test]
    #[should_panic(expected = "while full")]
    fn insert_past_capacity_panics() {
        let mut set = ResidentSet::new();
        for i in 0..RESIDENT_MAX {
            set.insert(VAddr::new((i + 1) * 0x1000), i as u64);
        }
        assert!(set.is_full());
        set.insert(VAddr::new(0xdead_000), RESIDENT_MAX as u64);
    }
}
