//! Log sequence addresses.
//!
//! An [`Lsa`] identifies a position in the write-ahead log as a
//! `(page, offset)` pair.  Ordering is lexicographic, so LSAs compare the
//! way log positions do.  The distinguished [`NULL_LSA`] sorts before every
//! real address and marks "no position" (unset, or quorum unmet).

use {
    serde::{Deserialize, Serialize},
    std::fmt,
};

/// A log sequence address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lsa {
    /// Log page the record lives on.
    pub page_id: i64,
    /// Byte offset within the page.
    pub offset: i32,
}

/// The null address: no log position.
pub const NULL_LSA: Lsa = Lsa {
    page_id: -1,
    offset: -1,
};

impl Lsa {
    /// Create an address from a page and an offset.
    pub const fn new(page_id: i64, offset: i32) -> Self {
        Self { page_id, offset }
    }

    /// Whether this is [`NULL_LSA`].
    pub fn is_null(&self) -> bool {
        self.page_id == NULL_LSA.page_id
    }
}

impl Default for Lsa {
    fn default() -> Self {
        NULL_LSA
    }
}

impl fmt::Display for Lsa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.page_id, self.offset)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
