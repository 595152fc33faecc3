use std::fmt::{self, Display, Formatter};

use crate::region::Pool;

// the library pads every pool by one page of each size so that regions can be
// aligned to page boundaries inside the reserved mapping
const PADDING_PAGES: u64 = 1;

/// Number of 2MB and 1GB pages that must be available on the host before the workload starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct Reservation {
    pub(crate) large_pages: u64,
    pub(crate) huge_pages: u64,
}

impl Display for Reservation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} 2MB pages and {} 1GB pages", self.large_pages, self.huge_pages)
    }
}

pub(crate) fn plan<'a>(pools: impl IntoIterator<Item = &'a Pool>) -> Reservation {
    let mut reservation = pools.into_iter().fold(Reservation::default(), |acc, pool| Reservation {
        large_pages: acc.large_pages + pool.large_pages(),
        huge_pages: acc.huge_pages + pool.huge_pages(),
    });
    reservation.large_pages += PADDING_PAGES;
    reservation.huge_pages += PADDING_PAGES;
    reservation
}
