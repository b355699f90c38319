//! Bitmap data structure helper, used for quorum bookkeeping over the
//! positions of a cell's acceptor group.

use std::fmt;

use crate::utils::FleaseError;

use fixedbitset::FixedBitSet;

/// Compact bitmap for acceptor index -> responded mapping.
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap(FixedBitSet);

impl Bitmap {
    /// Creates a new all-false bitmap with one slot per acceptor.
    pub fn new(size: u8) -> Result<Self, FleaseError> {
        if size == 0 {
            return Err(FleaseError::msg(format!(
                "invalid bitmap size {}",
                size
            )));
        }
        Ok(Bitmap(FixedBitSet::with_capacity(size as usize)))
    }

    /// Marks the slot at index as set. Returns `Ok(true)` if it was not set
    /// before, `Ok(false)` for a duplicate.
    #[inline]
    pub fn mark(&mut self, idx: u8) -> Result<bool, FleaseError> {
        if idx as usize >= self.0.len() {
            return Err(FleaseError::msg(format!(
                "index {} out of bound",
                idx
            )));
        }
        Ok(!self.0.put(idx as usize))
    }

    /// Gets the bit flag at index.
    #[inline]
    pub fn get(&self, idx: u8) -> Result<bool, FleaseError> {
        if idx as usize >= self.0.len() {
            return Err(FleaseError::msg(format!(
                "index {} out of bound",
                idx
            )));
        }
        Ok(self.0[idx as usize])
    }

    /// Clears all slots.
    #[inline]
    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// Returns the size of the bitmap.
    #[inline]
    pub fn size(&self) -> u8 {
        self.0.len() as u8
    }

    /// Returns the number of set slots.
    #[inline]
    pub fn count(&self) -> u8 {
        self.0.count_ones(..) as u8
    }

    /// Strict majority quorum size over all slots: `size / 2 + 1`.
    #[inline]
    pub fn quorum(&self) -> u8 {
        self.size() / 2 + 1
    }

    /// True if a strict majority of slots are set.
    #[inline]
    pub fn has_quorum(&self) -> bool {
        self.count() >= self.quorum()
    }
}

// Implement `Debug` trait manually for better trace printing.
impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{{}; [", self.size())?;
        let mut first_idx = true;
        for i in self.0.ones() {
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
