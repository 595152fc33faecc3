use std::{
    fs, io,
    path::{Path, PathBuf},
};

use tracing::{debug, warn};

use crate::{
    region::{PageSize, Pool, PoolKind, RegionError, SubRegion},
    size::{Size, SizeError},
};

// page size column value of rows that define the pool size instead of a region
const POOL_SIZE_ROW: i64 = -1;

#[derive(thiserror::Error, Debug)]
pub(crate) enum ConfigError {
    #[error("unable to read configuration file {}", .path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("library {} can't be found", .0.display())]
    LibraryNotFound(PathBuf),
    #[error("--{flag}")]
    InvalidSize {
        flag: &'static str,
        #[source]
        source: SizeError,
    },
    #[error("configuration file is empty, expected a header line")]
    MissingHeader,
    #[error("line {line}: expected 4 comma separated fields (type, page size, start offset, end offset), got {fields}")]
    MalformedRow { line: usize, fields: usize },
    #[error("line {line}: {value:?} is not a number")]
    InvalidNumber { line: usize, value: String },
    #[error("line {line}: unknown page size {page_size}. expected -1, 2097152 or 1073741824")]
    UnknownPageSize { line: usize, page_size: i64 },
    #[error("line {line}: negative offset {offset}")]
    NegativeOffset { line: usize, offset: i64 },
    #[error("line {line}: {pool} pool size ends at {end} before it starts at {start}")]
    NegativePoolSize {
        line: usize,
        pool: PoolKind,
        start: u64,
        end: u64,
    },
    #[error("line {line}: {pool} pool size is already defined")]
    DuplicatePoolSize { line: usize, pool: PoolKind },
    #[error("line {line}: {pool} pool already has a {page_size} region")]
    DuplicateRegion {
        line: usize,
        pool: PoolKind,
        page_size: PageSize,
    },
    #[error("{0} pool size is not defined")]
    MissingPoolSize(PoolKind),
    #[error(transparent)]
    Region(#[from] RegionError),
}

impl ConfigError {
    /// True if the input was missing, as opposed to present but invalid.
    pub(crate) fn is_missing_input(&self) -> bool {
        matches!(self, ConfigError::Unreadable { .. } | ConfigError::LibraryNotFound(_))
    }
}

/// Everything an invocation needs, resolved from the command line once and passed down by reference.
#[derive(Debug)]
pub(crate) struct LaunchConfig {
    pub pools: Pools,
    pub file_pool_size: Size,
    // absolute path, the library reads the same file
    pub config_file: Option<PathBuf>,
    pub library: PathBuf,
    pub analyze: bool,
    pub debug: bool,
    pub verbose: u8,
    pub reserve_script: PathBuf,
    pub lock_file: PathBuf,
    #[doc(hidden)]
    pub _non_exhaustive: (),
}

/// Pool definition before validation. Regions that were never mentioned are empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PoolDefinition {
    pub(crate) kind: PoolKind,
    pub(crate) size: Option<u64>,
    pub(crate) large: Option<SubRegion>,
    pub(crate) huge: Option<SubRegion>,
}

impl PoolDefinition {
    pub(crate) fn new(kind: PoolKind) -> Self {
        PoolDefinition {
            kind,
            size: None,
            large: None,
            huge: None,
        }
    }

    pub(crate) fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub(crate) fn with_region(mut self, region: SubRegion) -> Self {
        *self.region_mut(region.page_size) = Some(region);
        self
    }

    fn region_mut(&mut self, page_size: PageSize) -> &mut Option<SubRegion> {
        match page_size {
            PageSize::Large => &mut self.large,
            PageSize::Huge => &mut self.huge,
            PageSize::Base => unreachable!("pools have no base page regions"),
        }
    }

    pub(crate) fn validate(self) -> Result<Pool, ConfigError> {
        let size = self.size.ok_or(ConfigError::MissingPoolSize(self.kind))?;
        let large = self.large.unwrap_or(SubRegion::empty(PageSize::Large));
        let huge = self.huge.unwrap_or(SubRegion::empty(PageSize::Huge));
        Ok(Pool::new(self.kind, size, large, huge)?)
    }
}

/// Region offsets for one pool as given on the command line.
#[derive(Debug, Clone)]
pub(crate) struct InlinePool<'a> {
    pub(crate) pool_size: (&'static str, &'a str),
    pub(crate) start_2mb: (&'static str, &'a str),
    pub(crate) end_2mb: (&'static str, &'a str),
    pub(crate) start_1gb: (&'static str, &'a str),
    pub(crate) end_1gb: (&'static str, &'a str),
}

impl InlinePool<'_> {
    pub(crate) fn into_definition(self, kind: PoolKind) -> Result<PoolDefinition, ConfigError> {
        Ok(PoolDefinition::new(kind)
            .with_size(parse_size(self.pool_size)?.bytes())
            .with_region(SubRegion::new(
                PageSize::Large,
                parse_size(self.start_2mb)?.bytes(),
                parse_size(self.end_2mb)?.bytes(),
            ))
            .with_region(SubRegion::new(
                PageSize::Huge,
                parse_size(self.start_1gb)?.bytes(),
                parse_size(self.end_1gb)?.bytes(),
            )))
    }
}

pub(crate) fn parse_size((flag, value): (&'static str, &str)) -> Result<Size, ConfigError> {
    value
        .parse::<Size>()
        .map_err(|source| ConfigError::InvalidSize { flag, source })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Pools {
    pub(crate) mmap: Pool,
    pub(crate) brk: Pool,
}

impl Pools {
    pub(crate) fn from_definitions(mmap: PoolDefinition, brk: PoolDefinition) -> Result<Self, ConfigError> {
        Ok(Pools {
            mmap: mmap.validate()?,
            brk: brk.validate()?,
        })
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Pool> {
        [&self.mmap, &self.brk].into_iter()
    }
}

pub(crate) fn read_pools(path: &Path) -> Result<Pools, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;
    parse_pools(&content)
}

/// Parses the csv file shared with the allocation library:
///
/// ```text
/// type,page size,start offset,end offset
/// mmap,-1,0,17179869184
/// mmap,2097152,0,4194304
/// brk,-1,0,17179869184
/// ```
///
/// A page size of -1 defines the pool size as `end - start`.
pub(crate) fn parse_pools(content: &str) -> Result<Pools, ConfigError> {
    let mut lines = content.lines().enumerate();
    match lines.next() {
        Some((_, header)) => debug!("skipping configuration header {:?}", header),
        None => return Err(ConfigError::MissingHeader),
    }
    let mut mmap = PoolDefinition::new(PoolKind::Mmap);
    let mut brk = PoolDefinition::new(PoolKind::Brk);
    for (index, row) in lines {
        let line = index + 1;
        if row.trim().is_empty() {
            continue;
        }
        let fields = row.split(',').map(str::trim).collect::<Vec<_>>();
        if fields.len() != 4 {
            return Err(ConfigError::MalformedRow {
                line,
                fields: fields.len(),
            });
        }
        let definition = match fields[0].parse::<PoolKind>() {
            Ok(PoolKind::Mmap) => &mut mmap,
            Ok(PoolKind::Brk) => &mut brk,
            Err(err) => {
                warn!("line {}: skipping row. {}", line, err);
                continue;
            }
        };
        let page_size = parse_number(line, fields[1])?;
        let start = parse_offset(line, fields[2])?;
        let end = parse_offset(line, fields[3])?;
        match page_size {
            POOL_SIZE_ROW => {
                if definition.size.is_some() {
                    return Err(ConfigError::DuplicatePoolSize {
                        line,
                        pool: definition.kind,
                    });
                }
                let size = end.checked_sub(start).ok_or(ConfigError::NegativePoolSize {
                    line,
                    pool: definition.kind,
                    start,
                    end,
                })?;
                definition.size = Some(size);
            }
            page_size => {
                let page_size = region_page_size(page_size).ok_or(ConfigError::UnknownPageSize { line, page_size })?;
                let pool = definition.kind;
                let region = definition.region_mut(page_size);
                if region.is_some() {
                    return Err(ConfigError::DuplicateRegion { line, pool, page_size });
                }
                *region = Some(SubRegion::new(page_size, start, end));
            }
        }
    }
    Pools::from_definitions(mmap, brk)
}

fn region_page_size(bytes: i64) -> Option<PageSize> {
    [PageSize::Large, PageSize::Huge]
        .into_iter()
        .find(|page_size| page_size.bytes() as i64 == bytes)
}

fn parse_number(line: usize, value: &str) -> Result<i64, ConfigError> {
    value.parse::<i64>().map_err(|_| ConfigError::InvalidNumber {
        line,
        value: value.to_string(),
    })
}

fn parse_offset(line: usize, value: &str) -> Result<u64, ConfigError> {
    let offset = parse_number(line, value)?;
    u64::try_from(offset).map_err(|_| ConfigError::NegativeOffset { line, offset })
}
