use std::{
    fs::{self, File, OpenOptions},
    io,
    os::fd::AsRawFd,
    path::{Path, PathBuf},
    process::{Command, ExitStatus},
};

use anyhow::{Context, Result};
use tracing::{debug, info, info_span, warn};

use crate::{config::LaunchConfig, plan::Reservation, region::PageSize};

pub(crate) const RESERVE_SCRIPT: &str = "reserveHugePages.sh";

const REMEDIATION: &str = "please make sure that you already run:
    sudo bash -c \"echo 1 > /proc/sys/vm/overcommit_memory\"
    sudo bash -c \"echo never > /sys/kernel/mm/transparent_hugepage/enabled\"";

const HUGEPAGES_DIR: &str = "/sys/kernel/mm/hugepages";
const OVERCOMMIT_MEMORY: &str = "/proc/sys/vm/overcommit_memory";
const THP_ENABLED: &str = "/sys/kernel/mm/transparent_hugepage/enabled";

#[derive(thiserror::Error, Debug)]
pub(crate) enum ReserveError {
    #[error("unable to lock {}", .path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to run {}: {source}. {}", .script.display(), REMEDIATION)]
    Spawn { script: PathBuf, source: io::Error },
    #[error("{} failed to reserve {reservation} ({status}). {}", .script.display(), REMEDIATION)]
    Failed {
        script: PathBuf,
        reservation: Reservation,
        status: ExitStatus,
    },
}

/// Exclusive flock held until dropped. Every invocation on the host locks the same file,
/// so reservations never interleave.
#[derive(Debug)]
pub(crate) struct LockGuard {
    file: File,
}

impl LockGuard {
    /// Locks `path`. A missing file is created only with `create`, otherwise it is a `NotFound` error.
    pub(crate) fn acquire(path: &Path, create: bool) -> Result<Self, ReserveError> {
        let to_error = |source| ReserveError::Lock {
            path: path.to_path_buf(),
            source,
        };
        // the script itself is the default lock, it must not be opened for writing or it can't be executed
        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) if create && err.kind() == io::ErrorKind::NotFound => OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)
                .map_err(to_error)?,
            Err(err) => return Err(to_error(err)),
        };
        loop {
            if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) } == 0 {
                return Ok(LockGuard { file });
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(to_error(err));
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // closing the descriptor releases the lock too, unlocking explicitly keeps it obvious
        unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
    }
}

/// Makes the planned pages available on the host before the workload starts.
pub(crate) struct ReservationCoordinator<'a> {
    script: &'a Path,
    lock_file: &'a Path,
    debug: bool,
}

impl<'a> ReservationCoordinator<'a> {
    pub(crate) fn new(cfg: &'a LaunchConfig) -> Self {
        ReservationCoordinator {
            script: &cfg.reserve_script,
            lock_file: &cfg.lock_file,
            debug: cfg.debug,
        }
    }

    pub(crate) fn reserve(&self, reservation: Reservation) -> Result<(), ReserveError> {
        if self.debug {
            info!("debug mode, skipping reservation of {}", reservation);
            return Ok(());
        }
        let span = info_span!("reserve");
        let _enter = span.enter();

        check_host_policy();
        log_hugepages_status("before reservation");

        // a missing script used as its own lock must stay missing
        let _guard = LockGuard::acquire(self.lock_file, self.lock_file != self.script)?;
        debug!("acquired {}", self.lock_file.display());
        info!("reserving {} with {}", reservation, self.script.display());
        let status = Command::new(self.script)
            .arg(format!("-l{}", reservation.large_pages))
            .arg(format!("-h{}", reservation.huge_pages))
            .status()
            .map_err(|source| ReserveError::Spawn {
                script: self.script.to_path_buf(),
                source,
            })?;
        if !status.success() {
            return Err(ReserveError::Failed {
                script: self.script.to_path_buf(),
                reservation,
                status,
            });
        }

        log_hugepages_status("after reservation");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HugePagesStatus {
    pub(crate) total: u64,
    pub(crate) free: u64,
}

pub(crate) fn hugepages_status(dir: &Path, page_size: PageSize) -> Result<HugePagesStatus> {
    let dir = dir.join(format!("hugepages-{}kB", page_size.bytes() >> 10));
    let read = |name: &str| -> Result<u64> {
        let path = dir.join(name);
        let value = fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("parsing {}", path.display()))
    };
    Ok(HugePagesStatus {
        total: read("nr_hugepages")?,
        free: read("free_hugepages")?,
    })
}

fn log_hugepages_status(when: &str) {
    for page_size in [PageSize::Large, PageSize::Huge] {
        match hugepages_status(Path::new(HUGEPAGES_DIR), page_size) {
            Ok(status) => info!("{} pages {}: {} total, {} free", page_size, when, status.total, status.free),
            Err(err) => debug!("{} pages status is not available: {:#}", page_size, err),
        }
    }
}

/// Value between brackets, e.g. `never` for `always madvise [never]`.
pub(crate) fn selected_mode(content: &str) -> Option<&str> {
    let start = content.find('[')?;
    let end = content[start..].find(']')?;
    Some(&content[start + 1..start + end])
}

fn check_host_policy() {
    match fs::read_to_string(OVERCOMMIT_MEMORY) {
        Ok(mode) if mode.trim() != "1" => warn!(
            "{} is {}, reservation may fail unless it is 1",
            OVERCOMMIT_MEMORY,
            mode.trim()
        ),
        Ok(_) => {}
        Err(err) => debug!("reading {}: {}", OVERCOMMIT_MEMORY, err),
    }
    match fs::read_to_string(THP_ENABLED) {
        Ok(content) => match selected_mode(&content) {
            Some("never") | None => {}
            Some(mode) => warn!(
                "transparent huge pages are set to {}, reservation may fail unless they are disabled",
                mode
            ),
        },
        Err(err) => debug!("reading {}: {}", THP_ENABLED, err),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        os::unix::fs::PermissionsExt,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        thread,
        time::Duration,
    };

    use serial_test::serial;
    use tempfile::TempDir;

    use super::*;
    use crate::{
        config::{PoolDefinition, Pools},
        region::PoolKind,
        size::GB,
    };

    fn launch_config(dir: &Path, script: &str, debug: bool) -> LaunchConfig {
        let pool = |kind| PoolDefinition::new(kind).with_size(GB);
        LaunchConfig {
            pools: Pools::from_definitions(pool(PoolKind::Mmap), pool(PoolKind::Brk)).unwrap(),
            file_pool_size: "1GB".parse().unwrap(),
            config_file: None,
            library: dir.join("lib.so"),
            analyze: false,
            debug,
            verbose: 0,
            reserve_script: dir.join(script),
            lock_file: dir.join("reserve.lock"),
            _non_exhaustive: (),
        }
    }

    fn write_script(dir: &Path, name: &str, body: &str) {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    #[serial]
    fn test_reserve_passes_page_counts() {
        let dir = TempDir::new().unwrap();
        let args = dir.path().join("args");
        write_script(dir.path(), "reserve.sh", &format!("echo \"$@\" > {}", args.display()));
        let cfg = launch_config(dir.path(), "reserve.sh", false);
        ReservationCoordinator::new(&cfg)
            .reserve(Reservation {
                large_pages: 13,
                huge_pages: 7,
            })
            .unwrap();
        assert_eq!(fs::read_to_string(args).unwrap().trim(), "-l13 -h7");
    }

    #[test]
    #[serial]
    fn test_reserve_failure_is_fatal() {
        let dir = TempDir::new().unwrap();
        write_script(dir.path(), "reserve.sh", "exit 3");
        let cfg = launch_config(dir.path(), "reserve.sh", false);
        let err = ReservationCoordinator::new(&cfg)
            .reserve(Reservation::default())
            .unwrap_err();
        assert!(matches!(err, ReserveError::Failed { status, .. } if status.code() == Some(3)));
        let message = err.to_string();
        assert!(message.contains("/proc/sys/vm/overcommit_memory"), "{}", message);
        assert!(message.contains("transparent_hugepage"), "{}", message);
    }

    #[test]
    #[serial]
    fn test_missing_script() {
        let dir = TempDir::new().unwrap();
        let cfg = launch_config(dir.path(), "missing.sh", false);
        let err = ReservationCoordinator::new(&cfg)
            .reserve(Reservation::default())
            .unwrap_err();
        assert!(matches!(err, ReserveError::Spawn { .. }));
        assert!(err.to_string().contains("overcommit_memory"));
    }

    #[test]
    #[serial]
    fn test_missing_script_used_as_lock_is_not_created() {
        let dir = TempDir::new().unwrap();
        let mut cfg = launch_config(dir.path(), RESERVE_SCRIPT, false);
        cfg.lock_file = cfg.reserve_script.clone();
        for _ in 0..2 {
            let err = ReservationCoordinator::new(&cfg)
                .reserve(Reservation::default())
                .unwrap_err();
            assert!(
                matches!(&err, ReserveError::Lock { source, .. } if source.kind() == io::ErrorKind::NotFound),
                "{:?}",
                err
            );
            assert!(!cfg.reserve_script.exists());
        }
    }

    #[test]
    fn test_separate_lock_file_is_created() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("reserve.lock");
        assert!(matches!(
            LockGuard::acquire(&path, false),
            Err(ReserveError::Lock { .. })
        ));
        assert!(!path.exists());
        drop(LockGuard::acquire(&path, true).unwrap());
        assert!(path.exists());
    }

    #[test]
    fn test_debug_skips_everything() {
        let dir = TempDir::new().unwrap();
        let cfg = launch_config(dir.path(), "missing.sh", true);
        ReservationCoordinator::new(&cfg)
            .reserve(Reservation::default())
            .unwrap();
        assert!(!cfg.lock_file.exists());
    }

    #[test]
    fn test_lock_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("reserve.lock");
        let held = Arc::new(AtomicBool::new(true));

        let guard = LockGuard::acquire(&path, true).unwrap();
        let waiter = thread::spawn({
            let path = path.clone();
            let held = held.clone();
            move || {
                let _guard = LockGuard::acquire(&path, true).unwrap();
                held.load(Ordering::SeqCst)
            }
        });
        thread::sleep(Duration::from_millis(100));
        held.store(false, Ordering::SeqCst);
        drop(guard);
        assert!(!waiter.join().unwrap(), "second holder entered while the lock was held");
    }

    #[test]
    fn test_hugepages_status() {
        let dir = TempDir::new().unwrap();
        let pages = dir.path().join("hugepages-2048kB");
        fs::create_dir(&pages).unwrap();
        fs::write(pages.join("nr_hugepages"), "16\n").unwrap();
        fs::write(pages.join("free_hugepages"), "12\n").unwrap();
        assert_eq!(
            hugepages_status(dir.path(), PageSize::Large).unwrap(),
            HugePagesStatus { total: 16, free: 12 }
        );
        assert!(hugepages_status(dir.path(), PageSize::Huge).is_err());
    }

    #[test]
    fn test_selected_mode() {
        assert_eq!(selected_mode("always madvise [never]\n"), Some("never"));
        assert_eq!(selected_mode("[always] madvise never"), Some("always"));
        assert_eq!(selected_mode("never"), None);
    }
}
