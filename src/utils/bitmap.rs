//! Bitmap data structure helper.

use std::fmt;

use crate::server::ReplicaId;
use crate::utils::QuorumKvError;

use fixedbitset::FixedBitSet;

/// Compact bitmap for replica ID -> bool mapping, used for fan-out target
/// sets and for tracking which replicas have answered a quorum request.
#[derive(Clone, PartialEq, Eq)]
pub struct ReplicaMap(FixedBitSet);

impl ReplicaMap {
    /// Creates a new bitmap of given size. If `ones` is true, all slots are
    /// marked true initially; otherwise, all slots are initially false.
    pub fn new(size: u8, ones: bool) -> Result<Self, QuorumKvError> {
        if size == 0 {
            return Err(QuorumKvError::msg(format!(
                "invalid bitmap size {}",
                size
            )));
        }
        let mut bitset = FixedBitSet::with_capacity(size as usize);

        if ones {
            bitset.set_range(.., true);
        }

        Ok(ReplicaMap(bitset))
    }

    /// Creates a new bitmap of given size with the given IDs set to true.
    pub fn from_ids(
        size: u8,
        ids: impl IntoIterator<Item = ReplicaId>,
    ) -> Result<Self, QuorumKvError> {
        let mut map = Self::new(size, false)?;
        for id in ids {
            map.set(id, true)?;
        }
        Ok(map)
    }

    /// Sets bit at index to given flag.
    #[inline]
    pub fn set(
        &mut self,
        idx: ReplicaId,
        flag: bool,
    ) -> Result<(), QuorumKvError> {
        if idx as usize >= self.0.len() {
            return Err(QuorumKvError::msg(format!(
                "index {} out of bound",
                idx
            )));
        }
        self.0.set(idx as usize, flag);
        Ok(())
    }

    /// Gets the bit flag at index.
    #[inline]
    pub fn get(&self, idx: ReplicaId) -> Result<bool, QuorumKvError> {
        if idx as usize >= self.0.len() {
            return Err(QuorumKvError::msg(format!(
                "index {} out of bound",
                idx
            )));
        }
        Ok(self.0[idx as usize])
    }

    /// Returns the size of the bitmap.
    #[inline]
    pub fn size(&self) -> u8 {
        self.0.len() as u8
    }

    /// Returns the number of trues in the bitmap.
    #[inline]
    pub fn count(&self) -> u8 {
        self.0.count_ones(..) as u8
    }

    /// Allows `for (id, bit) in map.iter()`.
    #[inline]
    pub fn iter(&self) -> ReplicaMapIter {
        ReplicaMapIter { map: self, idx: 0 }
    }

    /// Iterates over the IDs whose bit is set.
    #[inline]
    pub fn ones(&self) -> impl Iterator<Item = ReplicaId> + '_ {
        self.0.ones().map(|i| i as ReplicaId)
    }
}

/// Iterator over `ReplicaMap`, yielding `(id, bit)` pairs.
#[derive(Debug, Clone)]
pub struct ReplicaMapIter<'m> {
    map: &'m ReplicaMap,
    idx: usize,
}

impl Iterator for ReplicaMapIter<'_> {
    type Item = (ReplicaId, bool);

    fn next(&mut self) -> Option<Self::Item> {
        if self.idx < self.map.0.len() {
            let id = self.idx;
            self.idx += 1;
            Some((id as ReplicaId, self.map.0[id]))
        } else {
            None
        }
    }
}

// Implement `Debug` trait manually for better trace printing.
impl fmt::Debug for ReplicaMap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{{}; [", self.size())?;
        let mut first_idx = true;
        for i in self.ones() {
            if !first_idx {
                write!(f, ", {}", i)?;
            } else {
                write!(f, "{}", i)?;
                first_idx = false;
            }
        }
        write!(f, "]}}")
    }
}
