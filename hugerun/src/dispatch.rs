use std::{
    ffi::OsString,
    io,
    os::unix::process::ExitStatusExt,
    process::{Command, ExitStatus},
    sync::Once,
};

use tracing::{debug, info, warn};

use crate::environment::Environment;

/// Exit code when the workload could not be started at all. Exit codes are 8 bits, so a
/// workload that exits with 255 itself is indistinguishable from this.
pub(crate) const DISPATCH_FAILURE_EXIT_CODE: u8 = 255;

#[derive(thiserror::Error, Debug)]
pub(crate) enum DispatchError {
    #[error("failed to start {}", .program.to_string_lossy())]
    Spawn {
        program: OsString,
        #[source]
        source: io::Error,
    },
    #[error("failed to wait for {}", .program.to_string_lossy())]
    Wait {
        program: OsString,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Workload {
    pub(crate) program: OsString,
    pub(crate) args: Vec<OsString>,
}

/// Runs the workload with exactly `environment` and waits for it without a timeout.
/// Arguments are passed as is, there is no shell in between.
pub(crate) fn dispatch(workload: &Workload, environment: Environment) -> Result<ExitStatus, DispatchError> {
    debug!(
        "starting {:?} {:?} with {} environment variables",
        workload.program,
        workload.args,
        environment.len()
    );
    // installed before spawning so an early ctrl-c can't kill us and orphan the workload
    ignore_interrupts();
    let mut child = Command::new(&workload.program)
        .args(&workload.args)
        .env_clear()
        .envs(environment)
        .spawn()
        .map_err(|source| DispatchError::Spawn {
            program: workload.program.clone(),
            source,
        })?;
    let status = child.wait().map_err(|source| DispatchError::Wait {
        program: workload.program.clone(),
        source,
    })?;
    info!("workload exited with {}", status);
    Ok(status)
}

// the terminal delivers ctrl-c to the workload too, it decides when to exit and we report how it did.
// exec resets the handler, so the workload keeps the default disposition
fn ignore_interrupts() {
    static INSTALLED: Once = Once::new();
    INSTALLED.call_once(|| {
        if let Err(err) = ctrlc::set_handler(|| {}) {
            warn!("unable to ignore interrupts while waiting for the workload: {}", err);
        }
    });
}

/// Exit code of the workload, or 128 + signal number if it was killed.
pub(crate) fn exit_code(status: ExitStatus) -> u8 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code as u8,
        (None, Some(signal)) => 128u8.wrapping_add(signal as u8),
        (None, None) => DISPATCH_FAILURE_EXIT_CODE,
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    fn shell(script: &str) -> Workload {
        Workload {
            program: "/bin/sh".into(),
            args: vec!["-c".into(), script.into()],
        }
    }

    fn path_only() -> Environment {
        [("PATH", "/usr/bin:/bin")].into_iter().collect()
    }

    #[test]
    #[serial]
    fn test_forwards_exit_code() {
        let status = dispatch(&shell("exit 7"), path_only()).unwrap();
        assert_eq!(exit_code(status), 7);
        let status = dispatch(&shell("true"), path_only()).unwrap();
        assert_eq!(exit_code(status), 0);
    }

    #[test]
    #[serial]
    fn test_signal_exit_code() {
        let status = dispatch(&shell("kill -TERM $$"), path_only()).unwrap();
        assert_eq!(exit_code(status), 128 + libc::SIGTERM as u8);
    }

    #[test]
    #[serial]
    fn test_environment_is_exact() {
        let mut environment = path_only();
        environment.set("HPC_MMAP_POOL_SIZE", "17179869184");
        let status = dispatch(
            &shell("test \"$HPC_MMAP_POOL_SIZE\" = 17179869184 && test -z \"$CARGO_PKG_NAME\""),
            environment,
        )
        .unwrap();
        assert!(status.success());
    }

    #[test]
    #[serial]
    fn test_arguments_are_not_interpreted_by_shell() {
        let workload = Workload {
            program: "/bin/sh".into(),
            args: vec!["-c".into(), "test \"$1\" = '$(exit 1); *'".into(), "sh".into(), "$(exit 1); *".into()],
        };
        assert!(dispatch(&workload, path_only()).unwrap().success());
    }

    #[test]
    #[serial]
    fn test_survives_interrupt_from_workload() {
        // the workload interrupts us as soon as it starts, before we get to wait for it
        let status = dispatch(&shell("kill -INT $PPID; exit 3"), path_only()).unwrap();
        assert_eq!(exit_code(status), 3);
    }

    #[test]
    #[serial]
    fn test_missing_program() {
        let workload = Workload {
            program: "/nonexistent/hugerun-workload".into(),
            args: vec![],
        };
        assert!(matches!(
            dispatch(&workload, path_only()),
            Err(DispatchError::Spawn { .. })
        ));
    }
}
