//! `locate`: streams one or more databases and prints paths matching the
//! given patterns (spec.md §6 Locator CLI).

use std::fs::File;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::process;

use lexopt::{Arg, Parser};

use rlocate::codec::Reader;
use rlocate::error::CoreError;
use rlocate::matcher::{FollowPolicy, MatchTarget, PatternSet, QueryOptions, Syntax};

const DEFAULT_DATABASE: &str = "/var/lib/mlocate/mlocate.db";

fn help() {
    println!(
        "Usage: locate [OPTIONS] PATTERN...\n\n\
         Options:\n\
         \x20 --database DBPATH       colon-separated list of databases to search\n\
         \x20 --basename               match only the last path component\n\
         \x20 --wholename              match the whole path (default)\n\
         \x20 --ignore-case            case-insensitive matching\n\
         \x20 --count                  print only the number of matches\n\
         \x20 --limit N, -n N          stop after N matches\n\
         \x20 --null                   separate output with NUL instead of newline\n\
         \x20 --existing               only print entries that still exist\n\
         \x20 --follow                 follow a trailing symlink for --existing (default)\n\
         \x20 --nofollow               do not follow a trailing symlink for --existing\n\
         \x20 --regexp PAT             add PAT as a basic regular expression (repeatable)\n\
         \x20 --regex                  treat positional patterns as extended regular expressions\n\
         \x20 --quiet                  silence per-database I/O errors\n\
         \x20 --statistics             print database statistics instead of matching\n\
         \x20 -h, --help               print this help and exit\n\
         \x20 --version                print the version and exit"
    );
}

struct Options {
    databases: Vec<PathBuf>,
    target: MatchTarget,
    ignore_case: bool,
    syntax: Syntax,
    regexp_patterns: Vec<String>,
    query: QueryOptions,
    quiet: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            databases: Vec::new(),
            target: MatchTarget::WholePath,
            ignore_case: false,
            syntax: Syntax::Glob,
            regexp_patterns: Vec::new(),
            query: QueryOptions::default(),
            quiet: false,
        }
    }
}

fn database_list(opts: &[PathBuf]) -> Vec<PathBuf> {
    let mut list: Vec<PathBuf> = opts.to_vec();
    if let Ok(env_path) = std::env::var("LOCATE_PATH") {
        for segment in env_path.split(':') {
            list.push(if segment.is_empty() { PathBuf::from(DEFAULT_DATABASE) } else { PathBuf::from(segment) });
        }
    }
    if list.is_empty() {
        list.push(PathBuf::from(DEFAULT_DATABASE));
    }
    list
}

fn run() -> Result<i32, CoreError> {
    let mut opts = Options::default();
    let mut positional = Vec::new();

    let mut parser = Parser::from_env();
    while let Some(arg) = parser.next().map_err(|e| CoreError::Arg(e.to_string()))? {
        match arg {
            Arg::Short('h') | Arg::Long("help") => {
                help();
                process::exit(0);
            }
            Arg::Long("version") => {
                println!("locate {}", env!("CARGO_PKG_VERSION"));
                process::exit(0);
            }
            Arg::Long("database") => {
                let val = parser.value().map_err(|e| CoreError::Arg(e.to_string()))?;
                for segment in val.to_string_lossy().split(':') {
                    opts.databases.push(if segment.is_empty() {
                        PathBuf::from(DEFAULT_DATABASE)
                    } else {
                        PathBuf::from(segment)
                    });
                }
            }
            Arg::Long("basename") => opts.target = MatchTarget::Basename,
            Arg::Long("wholename") => opts.target = MatchTarget::WholePath,
            Arg::Long("ignore-case") => opts.ignore_case = true,
            Arg::Long("count") => opts.query.count_only = true,
            Arg::Short('n') | Arg::Long("limit") => {
                let val = parser.value().map_err(|e| CoreError::Arg(e.to_string()))?;
                let n: u64 = val
                    .to_string_lossy()
                    .parse()
                    .map_err(|_| CoreError::Arg("--limit expects a non-negative integer".into()))?;
                opts.query.limit = Some(n);
            }
            Arg::Long("null") => opts.query.null_separator = true,
            Arg::Long("existing") => opts.query.existing_only = true,
            Arg::Long("follow") => opts.query.follow = FollowPolicy::Follow,
            Arg::Long("nofollow") => opts.query.follow = FollowPolicy::NoFollow,
            Arg::Long("regexp") => {
                let val = parser.value().map_err(|e| CoreError::Arg(e.to_string()))?;
                opts.regexp_patterns.push(val.to_string_lossy().into_owned());
            }
            Arg::Long("regex") => opts.syntax = Syntax::Extended,
            Arg::Long("quiet") => opts.quiet = true,
            Arg::Long("statistics") => opts.query.statistics = true,
            Arg::Value(val) => positional.push(val.to_string_lossy().into_owned()),
            other => return Err(CoreError::Arg(format!("unexpected argument: {other:?}"))),
        }
    }

    env_logger::Builder::from_default_env().filter_level(log::LevelFilter::Warn).init();

    let mut patterns = opts.regexp_patterns.clone();
    patterns.extend(positional);
    if patterns.is_empty() && !opts.query.statistics {
        return Err(CoreError::Arg("no pattern given".into()));
    }

    // `--regexp` patterns are always basic regex; positional patterns use
    // whichever syntax `--regex` selected (default glob). Both groups feed
    // one pattern set, since a path matching either is a match.
    let positional_patterns: Vec<String> = patterns[opts.regexp_patterns.len()..].to_vec();
    let mut pattern_set = PatternSet::compile_groups(
        &[(Syntax::Basic, opts.regexp_patterns.as_slice()), (opts.syntax, positional_patterns.as_slice())],
        opts.ignore_case,
        opts.target,
    )?;

    // SAFETY: STDOUT_FILENO is always a valid fd argument to isatty.
    opts.query.escape_nonprintable = unsafe { libc::isatty(libc::STDOUT_FILENO) } != 0;

    let databases = database_list(&opts.databases);
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut total_matches: u64 = 0;
    let mut had_error = false;

    for db_path in &databases {
        let file = match File::open(db_path) {
            Ok(f) => f,
            Err(e) => {
                had_error = true;
                if !opts.quiet {
                    eprintln!("locate: {}: {}", db_path.display(), e);
                }
                continue;
            }
        };
        // Enforcement requires both the header flag and a restrictive file
        // mode: an operator who loosens the mode to world-readable after
        // the fact has implicitly opted the database out (spec.md §4.7).
        let world_readable = file.metadata().map(|m| m.permissions().mode() & 0o004 != 0).unwrap_or(true);
        let mut reader = Reader::new(file);
        let header = match reader.read_header() {
            Ok(h) => h,
            Err(e) => {
                had_error = true;
                if !opts.quiet {
                    eprintln!("locate: {}: {}", db_path.display(), e);
                }
                continue;
            }
        };
        let mut query = opts.query.clone();
        query.check_visibility = header.check_visibility && !world_readable;
        total_matches += rlocate::matcher::run_query(&mut reader, &mut pattern_set, &query, &mut out)?;
    }

    if had_error {
        return Ok(2);
    }
    Ok(if total_matches > 0 { 0 } else { 1 })
}

fn main() {
    match run() {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("locate: {e}");
            process::exit(2);
        }
    }
}
