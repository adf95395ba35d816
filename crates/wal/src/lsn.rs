use std::fmt;

/// Log sequence number: `(view_id, sequence_no)`, ordered lexicographically.
///
/// The view changes only when a new master takes over; within a view the
/// sequence number grows by one per committed entry and restarts at 1 when
/// the view is incremented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn {
    pub view_id: u64,
    pub sequence_no: u64,
}

impl Lsn {
    /// Marker for "nothing persisted yet".
    pub const ZERO: Lsn = Lsn::new(0, 0);

    /// Predecessor of the very first entry of a fresh engine, which is `(1, 1)`.
    pub const ORIGIN: Lsn = Lsn::new(1, 0);

    pub const fn new(view_id: u64, sequence_no: u64) -> Self {
        Self {
            view_id,
            sequence_no,
        }
    }

    /// Next LSN within the same view.
    #[must_use]
    pub fn next(self) -> Lsn {
        Lsn::new(self.view_id, self.sequence_no + 1)
    }

    /// First LSN of the following view.
    #[must_use]
    pub fn next_view(self) -> Lsn {
        Lsn::new(self.view_id + 1, 1)
    }

    /// True when `self` directly follows `prev` in the same view.
    pub fn is_successor_of(self, prev: Lsn) -> bool {
        self == prev.next()
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.view_id, self.sequence_no)
    }
}
