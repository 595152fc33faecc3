use std::{
    env,
    ffi::OsString,
    path::{Path, PathBuf},
    process::ExitCode,
};

use clap::{ArgAction, Parser};
use tracing::{debug, error, info, level_filters::LevelFilter};
use tracing_subscriber::{prelude::*, Registry};

use crate::{
    config::{ConfigError, InlinePool, LaunchConfig, Pools},
    dispatch::{DispatchError, Workload, DISPATCH_FAILURE_EXIT_CODE},
    environment::Environment,
    region::PoolKind,
    reserve::{ReservationCoordinator, ReserveError, RESERVE_SCRIPT},
};

mod config;
mod dispatch;
mod environment;
mod plan;
mod region;
mod reserve;
mod size;

const VALIDATION_EXIT_CODE: u8 = 65;
const MISSING_INPUT_EXIT_CODE: u8 = 66;
const PROVISIONING_EXIT_CODE: u8 = 71;

fn default_reserve_script() -> PathBuf {
    // the script is installed next to the binary
    env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_default()
        .join(RESERVE_SCRIPT)
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "run a program while preloading an allocation library that redirects its allocations
into preallocated pools backed with mixed page sizes"
)]
struct Opt {
    #[clap(
        short = 'z',
        long,
        help = "ask the library to analyze the pool sizes and write them to mosalloc_hpbrs_sizes.<pid>.csv"
    )]
    analyze: bool,

    #[clap(
        short,
        long,
        help = "don't reserve huge pages and don't touch host configuration, only validate and run"
    )]
    debug: bool,

    #[clap(short, long, default_value = "libhugealloc.so", help = "allocation library to preload")]
    library: PathBuf,

    #[clap(
        short,
        long,
        help = "csv file with pool sizes and regions, rows are: type (mmap or brk), page size (-1 for the pool size, 2097152 or 1073741824), start offset, end offset"
    )]
    config: Option<PathBuf>,

    #[clap(long, default_value = "1GB", help = "size of the file mapping pool")]
    file_pool_size: String,

    #[clap(long, default_value = "16GB", conflicts_with = "config", help = "size of the anonymous mapping pool")]
    anon_pool_size: String,
    #[clap(long, default_value = "0KB", conflicts_with = "config", help = "start offset of the anonymous 2MB region")]
    anon_start_2mb: String,
    #[clap(long, default_value = "0KB", conflicts_with = "config", help = "end offset of the anonymous 2MB region")]
    anon_end_2mb: String,
    #[clap(long, default_value = "0KB", conflicts_with = "config", help = "start offset of the anonymous 1GB region")]
    anon_start_1gb: String,
    #[clap(long, default_value = "0KB", conflicts_with = "config", help = "end offset of the anonymous 1GB region")]
    anon_end_1gb: String,

    #[clap(long, default_value = "16GB", conflicts_with = "config", help = "size of the brk pool")]
    brk_pool_size: String,
    #[clap(long, default_value = "0KB", conflicts_with = "config", help = "start offset of the brk 2MB region")]
    brk_start_2mb: String,
    #[clap(long, default_value = "0KB", conflicts_with = "config", help = "end offset of the brk 2MB region")]
    brk_end_2mb: String,
    #[clap(long, default_value = "0KB", conflicts_with = "config", help = "start offset of the brk 1GB region")]
    brk_start_1gb: String,
    #[clap(long, default_value = "0KB", conflicts_with = "config", help = "end offset of the brk 1GB region")]
    brk_end_1gb: String,

    #[clap(
        long,
        default_value = default_reserve_script().into_os_string(),
        help = "executable that reserves huge pages, invoked as <script> -l<2MB pages> -h<1GB pages>"
    )]
    reserve_script: PathBuf,

    #[clap(long, help = "file locked while reserving huge pages. defaults to the reserve script")]
    lock_file: Option<PathBuf>,

    #[clap(short, action = ArgAction::Count, help = "increase the library verbosity")]
    verbose: u8,

    #[clap(
        required = true,
        trailing_var_arg = true,
        allow_hyphen_values = true,
        value_name = "PROGRAM",
        help = "program to execute followed by its arguments"
    )]
    dispatch: Vec<OsString>,
}

impl Opt {
    fn inline_pool(&self, kind: PoolKind) -> InlinePool<'_> {
        match kind {
            PoolKind::Mmap => InlinePool {
                pool_size: ("anon-pool-size", self.anon_pool_size.as_str()),
                start_2mb: ("anon-start-2mb", self.anon_start_2mb.as_str()),
                end_2mb: ("anon-end-2mb", self.anon_end_2mb.as_str()),
                start_1gb: ("anon-start-1gb", self.anon_start_1gb.as_str()),
                end_1gb: ("anon-end-1gb", self.anon_end_1gb.as_str()),
            },
            PoolKind::Brk => InlinePool {
                pool_size: ("brk-pool-size", self.brk_pool_size.as_str()),
                start_2mb: ("brk-start-2mb", self.brk_start_2mb.as_str()),
                end_2mb: ("brk-end-2mb", self.brk_end_2mb.as_str()),
                start_1gb: ("brk-start-1gb", self.brk_start_1gb.as_str()),
                end_1gb: ("brk-end-1gb", self.brk_end_1gb.as_str()),
            },
        }
    }

    fn into_launch(self) -> Result<(LaunchConfig, Workload), ConfigError> {
        let file_pool_size = config::parse_size(("file-pool-size", self.file_pool_size.as_str()))?;
        let (pools, config_file) = match &self.config {
            Some(path) => {
                let pools = config::read_pools(path)?;
                let absolute = path.canonicalize().map_err(|source| ConfigError::Unreadable {
                    path: path.clone(),
                    source,
                })?;
                (pools, Some(absolute))
            }
            None => {
                let mmap = self.inline_pool(PoolKind::Mmap).into_definition(PoolKind::Mmap)?;
                let brk = self.inline_pool(PoolKind::Brk).into_definition(PoolKind::Brk)?;
                (Pools::from_definitions(mmap, brk)?, None)
            }
        };
        // the loader resolves relative preload entries against the workload cwd, not ours
        let library = self
            .library
            .canonicalize()
            .ok()
            .filter(|library| library.is_file())
            .ok_or_else(|| ConfigError::LibraryNotFound(self.library.clone()))?;
        let lock_file = self.lock_file.unwrap_or_else(|| self.reserve_script.clone());

        let mut dispatch = self.dispatch.into_iter();
        let program = dispatch.next().expect("clap requires at least one value");
        let cfg = LaunchConfig {
            pools,
            file_pool_size,
            config_file,
            library,
            analyze: self.analyze,
            debug: self.debug,
            verbose: self.verbose,
            reserve_script: self.reserve_script,
            lock_file,
            _non_exhaustive: (),
        };
        Ok((
            cfg,
            Workload {
                program,
                args: dispatch.collect(),
            },
        ))
    }
}

#[derive(thiserror::Error, Debug)]
enum Failure {
    #[error("invalid configuration")]
    Config(#[from] ConfigError),
    #[error("huge pages reservation")]
    Reserve(#[from] ReserveError),
    #[error("dispatch")]
    Dispatch(#[from] DispatchError),
}

impl Failure {
    fn exit_code(&self) -> u8 {
        match self {
            Failure::Config(err) if err.is_missing_input() => MISSING_INPUT_EXIT_CODE,
            Failure::Config(_) => VALIDATION_EXIT_CODE,
            Failure::Reserve(_) => PROVISIONING_EXIT_CODE,
            Failure::Dispatch(_) => DISPATCH_FAILURE_EXIT_CODE,
        }
    }
}

fn main() -> ExitCode {
    // stdout belongs to the workload
    let registry = Registry::default().with(
        tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        ),
    );
    tracing::dispatcher::set_global_default(registry.into()).expect("failed to set global default subscriber");

    let opt: Opt = Opt::parse();
    match run(opt) {
        Ok(code) => ExitCode::from(code),
        Err(failure) => {
            let code = failure.exit_code();
            error!("{:#}", anyhow::Error::from(failure));
            ExitCode::from(code)
        }
    }
}

fn run(opt: Opt) -> Result<u8, Failure> {
    let (cfg, workload) = opt.into_launch()?;
    for pool in cfg.pools.iter() {
        info!("{}", pool);
    }
    let reservation = plan::plan(cfg.pools.iter());
    info!("planned {}", reservation);

    let environment = environment::build(&cfg, &Environment::inherited());
    for (key, value) in environment::library_variables(&cfg) {
        debug!("{}={}", key.to_string_lossy(), value.to_string_lossy());
    }

    ReservationCoordinator::new(&cfg).reserve(reservation)?;

    let status = dispatch::dispatch(&workload, environment)?;
    Ok(dispatch::exit_code(status))
}
