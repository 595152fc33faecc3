use std::{
    collections::BTreeMap,
    env,
    ffi::{OsStr, OsString},
    path::Path,
};

use crate::{
    config::LaunchConfig,
    region::{Pool, PoolKind},
    size::{KB, MB},
};

pub(crate) const LD_PRELOAD: &str = "LD_PRELOAD";

const MMAP_FIRST_FIT_LIST_SIZE: u64 = MB;
const FILE_BACKED_FIRST_FIT_LIST_SIZE: u64 = 10 * KB;

/// Environment handed to the workload. Keys are kept ordered so that logs and tests are stable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Environment(BTreeMap<OsString, OsString>);

impl Environment {
    pub(crate) fn inherited() -> Self {
        env::vars_os().collect()
    }

    pub(crate) fn get(&self, key: impl AsRef<OsStr>) -> Option<&OsStr> {
        self.0.get(key.as_ref()).map(OsString::as_os_str)
    }

    pub(crate) fn set(&mut self, key: impl Into<OsString>, value: impl Into<OsString>) {
        self.0.insert(key.into(), value.into());
    }

    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }
}

impl<K: Into<OsString>, V: Into<OsString>> FromIterator<(K, V)> for Environment {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Environment(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl IntoIterator for Environment {
    type Item = (OsString, OsString);
    type IntoIter = std::collections::btree_map::IntoIter<OsString, OsString>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

fn pool_prefix(kind: PoolKind) -> &'static str {
    match kind {
        PoolKind::Mmap => "HPC_MMAP",
        PoolKind::Brk => "HPC_BRK",
    }
}

fn pool_variables(pool: &Pool) -> [(String, u64); 5] {
    let prefix = pool_prefix(pool.kind());
    [
        (format!("{}_1GB_START_OFFSET", prefix), pool.huge().start),
        (format!("{}_1GB_END_OFFSET", prefix), pool.huge().end),
        (format!("{}_2MB_START_OFFSET", prefix), pool.large().start),
        (format!("{}_2MB_END_OFFSET", prefix), pool.large().end),
        (format!("{}_POOL_SIZE", prefix), pool.size()),
    ]
}

/// Variables read by the allocation library. Every value is a decimal number or a path.
pub(crate) fn library_variables(cfg: &LaunchConfig) -> Environment {
    let mut vars = Environment::default();
    for pool in cfg.pools.iter() {
        for (key, value) in pool_variables(pool) {
            vars.set(key, value.to_string());
        }
    }
    vars.set("HPC_MMAP_FIRST_FIT_LIST_SIZE", MMAP_FIRST_FIT_LIST_SIZE.to_string());
    vars.set("HPC_FILE_BACKED_POOL_SIZE", cfg.file_pool_size.to_string());
    vars.set(
        "HPC_FILE_BACKED_FIRST_FIT_LIST_SIZE",
        FILE_BACKED_FIRST_FIT_LIST_SIZE.to_string(),
    );
    if cfg.analyze {
        vars.set("HPC_ANALYZE_HPBRS", "1");
    }
    if cfg.verbose > 0 {
        vars.set("HPC_VERBOSE_LEVEL", cfg.verbose.to_string());
    }
    if let Some(config_file) = &cfg.config_file {
        vars.set("HPC_CONFIGURATION_FILE", config_file.as_os_str());
    }
    vars
}

/// Appends the library to an existing preload list so that libraries preloaded by the caller still run first.
pub(crate) fn merge_preload(inherited: Option<&OsStr>, library: &Path) -> OsString {
    match inherited {
        Some(existing) => {
            let mut merged = existing.to_os_string();
            merged.push(":");
            merged.push(library.as_os_str());
            merged
        }
        None => library.as_os_str().to_os_string(),
    }
}

/// Layers library variables and `LD_PRELOAD` over a copy of the inherited environment.
pub(crate) fn build(cfg: &LaunchConfig, inherited: &Environment) -> Environment {
    let mut environment = inherited.clone();
    for (key, value) in library_variables(cfg) {
        environment.set(key, value);
    }
    environment.set(LD_PRELOAD, merge_preload(inherited.get(LD_PRELOAD), &cfg.library));
    environment
}
