use std::{
    fmt::{self, Display, Formatter},
    str::FromStr,
};

use crate::size::{GB, KB, MB};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum PageSize {
    Base,
    Large,
    Huge,
}

impl PageSize {
    pub(crate) const fn bytes(self) -> u64 {
        match self {
            PageSize::Base => 4 * KB,
            PageSize::Large => 2 * MB,
            PageSize::Huge => GB,
        }
    }
}

impl Display for PageSize {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            PageSize::Base => write!(f, "4KB"),
            PageSize::Large => write!(f, "2MB"),
            PageSize::Huge => write!(f, "1GB"),
        }
    }
}

/// Allocation path served by a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum PoolKind {
    Mmap,
    Brk,
}

impl Display for PoolKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            PoolKind::Mmap => write!(f, "mmap"),
            PoolKind::Brk => write!(f, "brk"),
        }
    }
}

impl FromStr for PoolKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mmap" => Ok(PoolKind::Mmap),
            "brk" => Ok(PoolKind::Brk),
            _ => anyhow::bail!("unknown pool {}", s),
        }
    }
}

/// Half-open byte range `[start, end)` inside a pool that the library backs with `page_size` pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SubRegion {
    pub(crate) page_size: PageSize,
    pub(crate) start: u64,
    pub(crate) end: u64,
}

impl SubRegion {
    pub(crate) const fn new(page_size: PageSize, start: u64, end: u64) -> Self {
        SubRegion { page_size, start, end }
    }

    pub(crate) const fn empty(page_size: PageSize) -> Self {
        SubRegion::new(page_size, 0, 0)
    }

    /// None if the region ends before it starts.
    pub(crate) fn size(&self) -> Option<u64> {
        self.end.checked_sub(self.start)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.size() == Some(0)
    }

    pub(crate) fn is_aligned(&self) -> bool {
        match self.size() {
            Some(size) => is_aligned(self.start, PageSize::Base.bytes()) && is_aligned(size, self.page_size.bytes()),
            None => false,
        }
    }

    // touching regions don't share a byte
    pub(crate) fn overlaps(&self, other: &SubRegion) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub(crate) fn pages(&self) -> u64 {
        page_count(self.size().unwrap_or(0), self.page_size)
    }
}

impl Display for SubRegion {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} region [{}, {})", self.page_size, self.start, self.end)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub(crate) enum RegionError {
    #[error("{pool} pool: {region} ends before it starts")]
    NegativeRegion { pool: PoolKind, region: SubRegion },
    #[error("{pool} pool: {region} exceeds the pool size {pool_size}")]
    RegionExceedsPool {
        pool: PoolKind,
        region: SubRegion,
        pool_size: u64,
    },
    #[error("{pool} pool: delta {delta} between 2MB region start {large_start} and 1GB region start {huge_start} is not a multiple of 2MB")]
    UnalignedDelta {
        pool: PoolKind,
        large_start: u64,
        huge_start: u64,
        delta: u64,
    },
    #[error("{pool} pool: {large} overlaps {huge}")]
    OverlappingRegions {
        pool: PoolKind,
        large: SubRegion,
        huge: SubRegion,
    },
    #[error("{pool} pool: {region} is not aligned. start must be a multiple of 4KB and size a multiple of the region page size")]
    MisalignedRegion { pool: PoolKind, region: SubRegion },
}

pub(crate) fn is_aligned(num: u64, alignment: u64) -> bool {
    num % alignment == 0
}

pub(crate) fn page_count(region_size: u64, granularity: PageSize) -> u64 {
    region_size / granularity.bytes()
}

/// Checks one pool's 2MB and 1GB regions against each other and against the pool size.
/// The first violated rule is reported, in the order: ordering of bounds, pool bounds,
/// start delta and overlap (only when both regions are used), alignment.
pub(crate) fn validate(pool: PoolKind, pool_size: u64, large: &SubRegion, huge: &SubRegion) -> Result<(), RegionError> {
    for region in [large, huge] {
        if region.size().is_none() {
            return Err(RegionError::NegativeRegion { pool, region: *region });
        }
    }

    for region in [large, huge] {
        if region.end > pool_size {
            return Err(RegionError::RegionExceedsPool {
                pool,
                region: *region,
                pool_size,
            });
        }
    }

    if !large.is_empty() && !huge.is_empty() {
        let delta = large.start.abs_diff(huge.start);
        if !is_aligned(delta, PageSize::Large.bytes()) {
            return Err(RegionError::UnalignedDelta {
                pool,
                large_start: large.start,
                huge_start: huge.start,
                delta,
            });
        }
        if large.overlaps(huge) {
            return Err(RegionError::OverlappingRegions {
                pool,
                large: *large,
                huge: *huge,
            });
        }
    }

    for region in [large, huge] {
        if !region.is_aligned() {
            return Err(RegionError::MisalignedRegion { pool, region: *region });
        }
    }
    Ok(())
}

/// Validated pool. Only constructed through [`Pool::new`], so page counts are exact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Pool {
    kind: PoolKind,
    size: u64,
    large: SubRegion,
    huge: SubRegion,
}

impl Pool {
    pub(crate) fn new(kind: PoolKind, size: u64, large: SubRegion, huge: SubRegion) -> Result<Self, RegionError> {
        debug_assert_eq!(large.page_size, PageSize::Large);
        debug_assert_eq!(huge.page_size, PageSize::Huge);
        validate(kind, size, &large, &huge)?;
        Ok(Pool { kind, size, large, huge })
    }

    pub(crate) fn kind(&self) -> PoolKind {
        self.kind
    }

    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    pub(crate) fn large(&self) -> &SubRegion {
        &self.large
    }

    pub(crate) fn huge(&self) -> &SubRegion {
        &self.huge
    }

    pub(crate) fn large_pages(&self) -> u64 {
        self.large.pages()
    }

    pub(crate) fn huge_pages(&self) -> u64 {
        self.huge.pages()
    }
}

impl Display for Pool {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} pool of {} bytes, {}, {}", self.kind, self.size, self.large, self.huge)
    }
}
