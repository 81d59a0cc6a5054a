//! `updatedb`: rescans the filesystem and publishes a new locate database
//! (spec.md §6 Updater CLI).

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use lexopt::{Arg, Parser};

use rlocate::builder::{parse_mount_table, Builder};
use rlocate::codec::{Header, Reader, Writer};
use rlocate::config::{split_whitespace_list, Config};
use rlocate::dirmodel::Timestamp;
use rlocate::error::CoreError;

const DEFAULT_MOUNTINFO: &str = "/proc/self/mountinfo";
const DEFAULT_MOUNTS: &str = "/proc/mounts";

fn help() {
    println!(
        "Usage: updatedb [OPTIONS]\n\n\
         Options:\n\
         \x20 --output PATH             write the database to PATH\n\
         \x20 --database-root PATH      scan root (default /)\n\
         \x20 --prunepaths \"...\"        replace the pruned-path list\n\
         \x20 --add-prunepaths \"...\"    append to the pruned-path list\n\
         \x20 --prunenames \"...\"        replace the pruned-name list\n\
         \x20 --add-prunenames \"...\"    append to the pruned-name list\n\
         \x20 --prunefs \"...\"           replace the pruned-filesystem-type list\n\
         \x20 --add-prunefs \"...\"       append to the pruned-filesystem-type list\n\
         \x20 --prune-bind-mounts yes|no  prune no-op bind mounts (default yes)\n\
         \x20 --require-visibility yes|no enforce visibility at query time (default yes)\n\
         \x20 --verbose                 log each directory scanned or reused\n\
         \x20 --debug-pruning           log every pruning decision\n\
         \x20 -h, --help                print this help and exit\n\
         \x20 --version                 print the version and exit"
    );
}

fn parse_yes_no(val: &str, flag: &str) -> Result<bool, CoreError> {
    match val {
        "yes" => Ok(true),
        "no" => Ok(false),
        other => Err(CoreError::Arg(format!("{flag}: expected yes or no, got `{other}`"))),
    }
}

fn run() -> Result<(), CoreError> {
    let mut config = Config::default();
    let mut output: Option<PathBuf> = None;

    let mut parser = Parser::from_env();
    while let Some(arg) = parser.next().map_err(|e| CoreError::Arg(e.to_string()))? {
        match arg {
            Arg::Short('h') | Arg::Long("help") => {
                help();
                process::exit(0);
            }
            Arg::Long("version") => {
                println!("updatedb {}", env!("CARGO_PKG_VERSION"));
                process::exit(0);
            }
            Arg::Long("output") => {
                let val = parser.value().map_err(|e| CoreError::Arg(e.to_string()))?;
                output = Some(PathBuf::from(val));
            }
            Arg::Long("database-root") => {
                let val = parser.value().map_err(|e| CoreError::Arg(e.to_string()))?;
                config.scan_root = val.to_string_lossy().into_owned().into_bytes();
            }
            Arg::Long("prunepaths") => {
                let val = parser.value().map_err(|e| CoreError::Arg(e.to_string()))?;
                config.set_prune_paths(split_whitespace_list(&val.to_string_lossy()));
            }
            Arg::Long("add-prunepaths") => {
                let val = parser.value().map_err(|e| CoreError::Arg(e.to_string()))?;
                config.add_prune_paths(split_whitespace_list(&val.to_string_lossy()));
            }
            Arg::Long("prunenames") => {
                let val = parser.value().map_err(|e| CoreError::Arg(e.to_string()))?;
                config.set_prune_names(split_whitespace_list(&val.to_string_lossy()));
            }
            Arg::Long("add-prunenames") => {
                let val = parser.value().map_err(|e| CoreError::Arg(e.to_string()))?;
                config.add_prune_names(split_whitespace_list(&val.to_string_lossy()));
            }
            Arg::Long("prunefs") => {
                let val = parser.value().map_err(|e| CoreError::Arg(e.to_string()))?;
                let types = val.to_string_lossy().split_whitespace().map(str::to_string).collect();
                config.set_prune_fs_types(types);
            }
            Arg::Long("add-prunefs") => {
                let val = parser.value().map_err(|e| CoreError::Arg(e.to_string()))?;
                let types = val.to_string_lossy().split_whitespace().map(str::to_string).collect();
                config.add_prune_fs_types(types);
            }
            Arg::Long("prune-bind-mounts") => {
                let val = parser.value().map_err(|e| CoreError::Arg(e.to_string()))?;
                config.prune_bind_mounts = parse_yes_no(&val.to_string_lossy(), "--prune-bind-mounts")?;
            }
            Arg::Long("require-visibility") => {
                let val = parser.value().map_err(|e| CoreError::Arg(e.to_string()))?;
                config.check_visibility = parse_yes_no(&val.to_string_lossy(), "--require-visibility")?;
            }
            Arg::Long("verbose") => config.verbose = true,
            Arg::Long("debug-pruning") => config.debug_pruning = true,
            other => return Err(CoreError::Arg(format!("unexpected argument: {other:?}"))),
        }
    }

    if let Some(path) = output {
        config.output_path = path;
    }

    let level = if config.verbose || config.debug_pruning { log::LevelFilter::Debug } else { log::LevelFilter::Warn };
    env_logger::Builder::from_default_env().filter_level(level).init();

    let abort = rlocate::publish::install_abort_flag()?;

    let old_lock = rlocate::publish::LockedOldDatabase::open(&config.output_path)?;
    let old_reader = match &old_lock {
        Some(locked) => {
            let file = locked.file().try_clone().map_err(CoreError::Io)?;
            let mut reader = Reader::new(file);
            match reader.read_header() {
                Ok(header) if header.config_block == config.config_block() => Some(reader),
                Ok(_) => None, // config changed: every cached directory is invalidated
                Err(_) => None, // unreadable/corrupt: treat as absent, full rescan
            }
        }
        None => None,
    };

    let bind_mounts = if config.prune_bind_mounts {
        Some(rlocate::bind_mount::BindMountOracle::init(Path::new(DEFAULT_MOUNTINFO)))
    } else {
        None
    };
    let mount_table = std::fs::read_to_string(DEFAULT_MOUNTS).map(|s| parse_mount_table(&s)).unwrap_or_default();

    let mut pending = rlocate::publish::PendingDatabase::create(&config.output_path)?;
    let mut writer = Writer::new(pending.file_mut().try_clone().map_err(CoreError::Io)?);

    let header = Header {
        version: rlocate::codec::VERSION_0,
        check_visibility: config.check_visibility,
        scan_root: config.scan_root.clone(),
        config_block: config.config_block(),
    };
    writer.write_header(&header)?;

    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    let now_ts = Timestamp::new(now.as_secs(), now.subsec_nanos());

    let scan_root = config.scan_root.clone();
    let builder = Builder::new(&config, writer, old_reader, bind_mounts, mount_table, Arc::clone(&abort), now_ts);
    let (mut writer, stats) = builder.build(&scan_root)?;
    writer.flush().map_err(CoreError::Io)?;

    if config.verbose {
        log::info!(
            "{} directories written, {} reused, {} rescanned, {} pruned",
            stats.directories_written,
            stats.directories_reused,
            stats.directories_rescanned,
            stats.directories_pruned
        );
    }

    pending.set_mode(config.check_visibility)?;
    pending.commit()?;
    drop(old_lock);

    Ok(())
}

fn main() {
    if let Err(e) = run() {
        eprintln!("updatedb: {e}");
        process::exit(1);
    }
}
