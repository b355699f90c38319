//! Lease value type.

use std::fmt;

use crate::flease::{CellId, IGNORE_MASTER_EPOCH};

use serde::{Deserialize, Serialize};

/// A time-bounded, single-holder ownership grant over a cell. Immutable once
/// learned; a newer round outcome replaces it as a whole.
///
/// Two leases are equal iff they have the same holder and the same timeout;
/// the cell ID and master epoch do not take part in the comparison.
#[derive(Clone, Serialize, Deserialize)]
pub struct Lease {
    /// Cell this lease was learned for. Empty for the `EMPTY` sentinel.
    pub cell: CellId,

    /// Identity of the holder, `None` if nobody owns the cell.
    pub holder: Option<String>,

    /// Absolute expiration time in ms on the synchronized clock.
    pub timeout_ms: i64,

    /// Master epoch attached to this lease, or `IGNORE_MASTER_EPOCH`.
    pub master_epoch: i64,
}

impl Lease {
    /// The "no current owner" sentinel.
    pub const EMPTY: Lease = Lease {
        cell: CellId::EMPTY,
        holder: None,
        timeout_ms: 0,
        master_epoch: IGNORE_MASTER_EPOCH,
    };

    /// Creates a new lease value.
    pub fn new(
        cell: CellId,
        holder: Option<String>,
        timeout_ms: i64,
        master_epoch: i64,
    ) -> Self {
        Lease {
            cell,
            holder,
            timeout_ms,
            master_epoch,
        }
    }

    /// The `EMPTY` sentinel tagged with a cell ID.
    pub fn empty_for(cell: CellId) -> Self {
        Lease {
            cell,
            ..Lease::EMPTY
        }
    }

    /// True if this is the "no current owner" sentinel.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.holder.is_none() && self.timeout_ms == 0
    }

    /// True iff the synchronized clock reading `now_ms` is still before the
    /// lease timeout. The `EMPTY` sentinel is never valid.
    #[inline]
    pub fn is_valid(&self, now_ms: i64) -> bool {
        !self.is_empty() && now_ms < self.timeout_ms
    }

    /// True if both leases name the same holder (both-`None` included).
    #[inline]
    pub fn is_same_holder(&self, other: &Lease) -> bool {
        self.holder == other.holder
    }

    /// True if `identity` holds this lease.
    #[inline]
    pub fn is_held_by(&self, identity: &str) -> bool {
        self.holder.as_deref() == Some(identity)
    }
}

impl PartialEq for Lease {
    fn eq(&self, other: &Self) -> bool {
        self.holder == other.holder && self.timeout_ms == other.timeout_ms
    }
}

impl Eq for Lease {}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Lease({} {}/{} e{})",
            self.cell,
            self.holder.as_deref().unwrap_or("-"),
            self.timeout_ms,
            self.master_epoch
        )
    }
}

impl fmt::Display for Lease {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_sentinel() {
        assert!(Lease::EMPTY.is_empty());
        assert!(!Lease::EMPTY.is_valid(-5));
        let e = Lease::empty_for("c0".into());
        assert_eq!(e, Lease::EMPTY);
        assert_eq!(e.cell, CellId::from("c0"));
    }

    #[test]
    fn validity_window() {
        let l = Lease::new("c0".into(), Some("osd-1".into()), 1000, 3);
        assert!(l.is_valid(999));
        assert!(!l.is_valid(1000));
        assert!(l.is_held_by("osd-1"));
        assert!(!l.is_held_by("osd-2"));
    }

    #[test]
    fn equality_ignores_cell_and_epoch() {
        let a = Lease::new("c0".into(), Some("osd-1".into()), 1000, 3);
        let b = Lease::new("c1".into(), Some("osd-1".into()), 1000, 4);
        let c = Lease::new("c0".into(), Some("osd-1".into()), 1001, 3);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.is_same_holder(&c));
        assert!(Lease::EMPTY.is_same_holder(&Lease::empty_for("x".into())));
        assert!(!a.is_same_holder(&Lease::EMPTY));
    }
}
