//! MODULE `matcher`: streaming pattern matcher (spec.md §4.7).
//!
//! Reconstructs full paths while streaming a database, tests each against
//! the compiled pattern set, consults the [`crate::visibility`] cache, and
//! writes matches (or tallies counts/statistics).

use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use globset::GlobBuilder;

use crate::codec::Reader;
use crate::error::{CoreError, CoreResult};
use crate::path_order::join_path;
use crate::visibility::{Accessor, RealAccessor, VisibilityCache};

/// Pattern syntax mode, chosen by the query's configuration (spec.md §3,
/// §4.7, §6 `--regexp`/`--regex`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syntax {
    /// Literal substring, no glob metacharacters.
    Literal,
    Glob,
    /// POSIX basic regular expression.
    Basic,
    /// POSIX extended regular expression.
    Extended,
}

/// Whether a candidate path is tested as basename or whole path (spec.md
/// §4.7 "Basename vs whole-path").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchTarget {
    WholePath,
    Basename,
}

enum Compiled {
    /// Glob mode pattern with no glob metacharacters: matched by plain
    /// substring search, an order of magnitude faster than a compiled
    /// matcher (spec.md §4.7).
    Substring(String),
    Glob(globset::GlobMatcher),
    Regex(regex::Regex),
}

/// One compiled, case-folded query: a set of patterns plus the flags that
/// govern how they are applied.
pub struct PatternSet {
    patterns: Vec<Compiled>,
    case_insensitive: bool,
    target: MatchTarget,
    /// Reusable scratch buffer for the upper-cased candidate, so
    /// case-insensitive substring search allocates once per database, not
    /// once per candidate (spec.md §4.7, §9).
    scratch: String,
}

const GLOB_METACHARS: &[char] = &['*', '?', '[', '\\', ']'];

fn has_glob_metachars(s: &str) -> bool {
    s.chars().any(|c| GLOB_METACHARS.contains(&c))
}

/// Best-effort translation from POSIX basic regular expression syntax to
/// the extended syntax the `regex` crate accepts natively: in BRE, `(` `)`
/// `{` `}` `|` `+` `?` are literal unless escaped; in ERE they are special
/// unless escaped. This swaps escaped/unescaped status for exactly those
/// metacharacters and otherwise passes the pattern through unchanged.
fn basic_to_extended(pattern: &str) -> String {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::with_capacity(pattern.len());
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '\\' && i + 1 < chars.len() {
            let next = chars[i + 1];
            match next {
                '(' | ')' | '{' | '}' | '|' | '+' | '?' => {
                    out.push(next); // escaped => special in ERE => unescaped
                    i += 2;
                    continue;
                }
                _ => {
                    out.push(c);
                    out.push(next);
                    i += 2;
                    continue;
                }
            }
        }
        match c {
            '(' | ')' | '{' | '}' | '|' | '+' | '?' => {
                out.push('\\');
                out.push(c); // unescaped => literal in ERE => escaped
            }
            _ => out.push(c),
        }
        i += 1;
    }
    out
}

impl PatternSet {
    /// Compiles `patterns` under `syntax`. `case_insensitive` is a
    /// pattern-set attribute, not per-pattern (spec.md §3).
    pub fn compile(
        patterns: &[String],
        syntax: Syntax,
        case_insensitive: bool,
        target: MatchTarget,
    ) -> CoreResult<PatternSet> {
        Self::compile_groups(&[(syntax, patterns)], case_insensitive, target)
    }

    /// Compiles several pattern groups, each under its own syntax, into one
    /// pattern set: a path matches if it matches *any* pattern regardless
    /// of which group (syntax) it came from. This is how `--regexp`
    /// (always basic-regex) combines with the positional patterns (glob or
    /// `--regex`-extended) into a single query pass (spec.md §4.7, §6).
    pub fn compile_groups(
        groups: &[(Syntax, &[String])],
        case_insensitive: bool,
        target: MatchTarget,
    ) -> CoreResult<PatternSet> {
        let mut compiled = Vec::new();
        for (syntax, patterns) in groups {
            for p in *patterns {
                let c = match syntax {
                    Syntax::Literal => Compiled::Substring(fold_case(p, case_insensitive)),
                    Syntax::Glob => {
                        if has_glob_metachars(p) {
                            let glob = GlobBuilder::new(p)
                                .case_insensitive(case_insensitive)
                                .literal_separator(false)
                                .build()
                                .map_err(|e| CoreError::PatternCompile { pattern: p.clone(), source: Box::new(e) })?;
                            Compiled::Glob(glob.compile_matcher())
                        } else {
                            Compiled::Substring(fold_case(p, case_insensitive))
                        }
                    }
                    Syntax::Basic | Syntax::Extended => {
                        let ere = if *syntax == Syntax::Basic { basic_to_extended(p) } else { p.clone() };
                        let re = regex::RegexBuilder::new(&ere)
                            .case_insensitive(case_insensitive)
                            .build()
                            .map_err(|e| CoreError::PatternCompile { pattern: p.clone(), source: Box::new(e) })?;
                        Compiled::Regex(re)
                    }
                };
                compiled.push(c);
            }
        }
        Ok(PatternSet { patterns: compiled, case_insensitive, target, scratch: String::new() })
    }

    /// Tests `path` (raw database bytes) against every compiled pattern;
    /// any pattern matching is sufficient.
    pub fn is_match(&mut self, path: &[u8]) -> bool {
        let full = String::from_utf8_lossy(path);
        let candidate: &str = match self.target {
            MatchTarget::WholePath => &full,
            MatchTarget::Basename => full.rsplit('/').next().unwrap_or(&full),
        };

        self.scratch.clear();
        if self.case_insensitive {
            // Malformed sequences are already folded byte-wise by
            // from_utf8_lossy's replacement character before we get here;
            // encoding errors never abort the query (spec.md §4.7).
            for c in candidate.chars().flat_map(|c| c.to_uppercase()) {
                self.scratch.push(c);
            }
        }
        let folded: &str = if self.case_insensitive { &self.scratch } else { candidate };

        for pat in &self.patterns {
            let hit = match pat {
                Compiled::Substring(needle) => folded.contains(needle.as_str()),
                Compiled::Glob(g) => g.is_match(candidate),
                Compiled::Regex(re) => re.is_match(candidate),
            };
            if hit {
                return true;
            }
        }
        false
    }
}

fn fold_case(s: &str, case_insensitive: bool) -> String {
    if case_insensitive {
        s.to_uppercase()
    } else {
        s.to_string()
    }
}

/// Symlink-following policy for `--existing`, matching `--follow`/
/// `--nofollow` literally (spec.md §9 Open Question).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowPolicy {
    Follow,
    NoFollow,
}

/// Runtime options for one query, orthogonal to pattern compilation.
#[derive(Clone)]
pub struct QueryOptions {
    pub count_only: bool,
    pub null_separator: bool,
    pub limit: Option<u64>,
    pub existing_only: bool,
    pub follow: FollowPolicy,
    pub check_visibility: bool,
    pub statistics: bool,
    pub quiet: bool,
    /// Replace non-printable bytes with `?` when writing a newline-separated
    /// match. Set by the caller once it knows stdout is a terminal (spec.md
    /// §4.7); meaningless with `--null`, which needs the raw bytes back.
    pub escape_nonprintable: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        QueryOptions {
            count_only: false,
            null_separator: false,
            limit: None,
            existing_only: false,
            follow: FollowPolicy::Follow,
            check_visibility: false,
            statistics: false,
            quiet: false,
            escape_nonprintable: false,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Statistics {
    pub num_directories: u64,
    pub num_entries: u64,
    pub total_path_bytes: u64,
}

fn path_exists(path: &[u8], follow: FollowPolicy) -> bool {
    let p = Path::new(std::ffi::OsStr::from_bytes(path));
    match follow {
        FollowPolicy::Follow => p.exists(),
        FollowPolicy::NoFollow => p.symlink_metadata().is_ok(),
    }
}

/// Streams `reader`, matching every directory and entry path against
/// `patterns`, writing accepted paths to `out`. Returns the number of
/// matches found (for the locator's exit-code decision, spec.md §6).
#[allow(clippy::too_many_arguments)]
pub fn run_query<R: std::io::Read, W: Write>(
    reader: &mut Reader<R>,
    patterns: &mut PatternSet,
    opts: &QueryOptions,
    out: &mut W,
) -> CoreResult<u64> {
    run_query_with_accessor(reader, patterns, opts, out, &RealAccessor)
}

pub fn run_query_with_accessor<R: std::io::Read, W: Write>(
    reader: &mut Reader<R>,
    patterns: &mut PatternSet,
    opts: &QueryOptions,
    out: &mut W,
    accessor: &dyn Accessor,
) -> CoreResult<u64> {
    let mut visibility = VisibilityCache::new();
    let mut matches: u64 = 0;
    let mut stats = Statistics::default();

    'directories: while let Some(dir) = reader.read_directory()? {
        stats.num_directories += 1;
        stats.total_path_bytes += dir.path.len() as u64;

        if !opts.statistics && check_and_emit(&dir.path, patterns, opts, out, &mut visibility, accessor)? {
            matches += 1;
            if reached_limit(opts, matches) {
                break 'directories;
            }
        }

        for entry in &dir.entries {
            stats.num_entries += 1;
            stats.total_path_bytes += entry.name.len() as u64;
            if opts.statistics {
                continue;
            }
            let full = join_path(&dir.path, &entry.name);
            if check_and_emit(&full, patterns, opts, out, &mut visibility, accessor)? {
                matches += 1;
                if reached_limit(opts, matches) {
                    break 'directories;
                }
            }
        }
    }

    if opts.statistics {
        writeln!(
            out,
            "{}\t{} directories\t{} entries\t{} bytes in file names",
            stats.num_directories + stats.num_entries,
            stats.num_directories,
            stats.num_entries,
            stats.total_path_bytes
        )
        .map_err(CoreError::Io)?;
    } else if opts.count_only {
        writeln!(out, "{matches}").map_err(CoreError::Io)?;
    }

    Ok(matches)
}

fn reached_limit(opts: &QueryOptions, matches: u64) -> bool {
    matches!(opts.limit, Some(limit) if matches >= limit)
}

#[allow(clippy::too_many_arguments)]
fn check_and_emit<W: Write>(
    path: &[u8],
    patterns: &mut PatternSet,
    opts: &QueryOptions,
    out: &mut W,
    visibility: &mut VisibilityCache,
    accessor: &dyn Accessor,
) -> CoreResult<bool> {
    if !patterns.is_match(path) {
        return Ok(false);
    }
    if opts.existing_only && !path_exists(path, opts.follow) {
        return Ok(false);
    }
    if opts.check_visibility && !visibility.is_visible(path, accessor) {
        return Ok(false);
    }
    if !opts.count_only {
        emit(path, opts, out)?;
    }
    Ok(true)
}

fn emit<W: Write>(path: &[u8], opts: &QueryOptions, out: &mut W) -> CoreResult<()> {
    if !opts.null_separator && opts.escape_nonprintable && path.iter().any(|b| is_nonprintable(*b)) {
        let escaped: Vec<u8> = path.iter().map(|b| if is_nonprintable(*b) { b'?' } else { *b }).collect();
        out.write_all(&escaped).map_err(CoreError::Io)?;
    } else {
        out.write_all(path).map_err(CoreError::Io)?;
    }
    if opts.null_separator {
        out.write_all(&[0]).map_err(CoreError::Io)?;
    } else {
        out.write_all(b"\n").map_err(CoreError::Io)?;
    }
    Ok(())
}

/// Bytes that would garble a terminal if written raw: control characters
/// and anything outside the printable ASCII range. Matches `locate.c`'s
/// `--print`-mode substitution, which only ever triggers on a real tty.
fn is_nonprintable(b: u8) -> bool {
    !(0x20..=0x7e).contains(&b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Header, Writer};
    use crate::dirmodel::{Directory, Entry, Timestamp};
    use std::io::Cursor;

    fn sample_db() -> Vec<u8> {
        let mut buf = Vec::new();
        let mut w = Writer::new(&mut buf);
        w.write_header(&Header { version: 0, check_visibility: false, scan_root: b"/".to_vec(), config_block: vec![] })
            .unwrap();
        w.write_directory(&Directory {
            path: b"/".to_vec(),
            time: Timestamp::new(1, 0),
            entries: vec![Entry { name: b"usr".to_vec(), is_directory: true }],
        })
        .unwrap();
        w.write_directory(&Directory {
            path: b"/usr".to_vec(),
            time: Timestamp::new(1, 0),
            entries: vec![
                Entry { name: b"bin".to_vec(), is_directory: true },
                Entry { name: b"README.txt".to_vec(), is_directory: false },
            ],
        })
        .unwrap();
        w.flush().unwrap();
        buf
    }

    #[test]
    fn literal_substring_match() {
        let db = sample_db();
        let mut reader = Reader::new(Cursor::new(db));
        reader.read_header().unwrap();
        let mut patterns =
            PatternSet::compile(&["README".to_string()], Syntax::Literal, false, MatchTarget::WholePath).unwrap();
        let mut out = Vec::new();
        let opts = QueryOptions::default();
        let n = run_query(&mut reader, &mut patterns, &opts, &mut out).unwrap();
        assert_eq!(n, 1);
        assert_eq!(String::from_utf8_lossy(&out), "/usr/README.txt\n");
    }

    #[test]
    fn basename_only_matching() {
        let db = sample_db();
        let mut reader = Reader::new(Cursor::new(db));
        reader.read_header().unwrap();
        let mut patterns =
            PatternSet::compile(&["usr".to_string()], Syntax::Literal, false, MatchTarget::Basename).unwrap();
        let mut out = Vec::new();
        let opts = QueryOptions::default();
        let n = run_query(&mut reader, &mut patterns, &opts, &mut out).unwrap();
        // matches "/usr" (basename usr) but not "/usr/bin" nor "/usr/README.txt"
        assert_eq!(n, 1);
        assert_eq!(String::from_utf8_lossy(&out), "/usr\n");
    }

    #[test]
    fn glob_mode_with_wildcard() {
        let db = sample_db();
        let mut reader = Reader::new(Cursor::new(db));
        reader.read_header().unwrap();
        let mut patterns =
            PatternSet::compile(&["*.txt".to_string()], Syntax::Glob, false, MatchTarget::WholePath).unwrap();
        let mut out = Vec::new();
        let opts = QueryOptions::default();
        let n = run_query(&mut reader, &mut patterns, &opts, &mut out).unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn case_insensitive_substring() {
        let db = sample_db();
        let mut reader = Reader::new(Cursor::new(db));
        reader.read_header().unwrap();
        let mut patterns =
            PatternSet::compile(&["readme".to_string()], Syntax::Literal, true, MatchTarget::WholePath).unwrap();
        let mut out = Vec::new();
        let opts = QueryOptions::default();
        let n = run_query(&mut reader, &mut patterns, &opts, &mut out).unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn count_only_suppresses_paths_but_prints_the_tally() {
        let db = sample_db();
        let mut reader = Reader::new(Cursor::new(db));
        reader.read_header().unwrap();
        let mut patterns =
            PatternSet::compile(&["usr".to_string()], Syntax::Literal, false, MatchTarget::WholePath).unwrap();
        let mut out = Vec::new();
        let mut opts = QueryOptions::default();
        opts.count_only = true;
        let n = run_query(&mut reader, &mut patterns, &opts, &mut out).unwrap();
        assert_eq!(n, 2); // "/usr" and "/usr/bin" both contain "usr"
        assert_eq!(String::from_utf8_lossy(&out), "2\n");
    }

    #[test]
    fn limit_stops_early() {
        let db = sample_db();
        let mut reader = Reader::new(Cursor::new(db));
        reader.read_header().unwrap();
        let mut patterns = PatternSet::compile(&["".to_string()], Syntax::Literal, false, MatchTarget::WholePath).unwrap();
        let mut out = Vec::new();
        let mut opts = QueryOptions::default();
        opts.limit = Some(1);
        let n = run_query(&mut reader, &mut patterns, &opts, &mut out).unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn visibility_enforcement_drops_denied_paths() {
        struct DenyUsr;
        impl Accessor for DenyUsr {
            fn can_read_execute(&self, prefix: &[u8]) -> bool {
                prefix != b"/usr"
            }
        }
        let db = sample_db();
        let mut reader = Reader::new(Cursor::new(db));
        reader.read_header().unwrap();
        let mut patterns =
            PatternSet::compile(&["README".to_string()], Syntax::Literal, false, MatchTarget::WholePath).unwrap();
        let mut out = Vec::new();
        let mut opts = QueryOptions::default();
        opts.check_visibility = true;
        let n = run_query_with_accessor(&mut reader, &mut patterns, &opts, &mut out, &DenyUsr).unwrap();
        assert_eq!(n, 0);
        assert!(out.is_empty());
    }

    #[test]
    fn statistics_mode_tallies_instead_of_matching() {
        let db = sample_db();
        let mut reader = Reader::new(Cursor::new(db));
        reader.read_header().unwrap();
        let mut patterns =
            PatternSet::compile(&["nomatch".to_string()], Syntax::Literal, false, MatchTarget::WholePath).unwrap();
        let mut out = Vec::new();
        let mut opts = QueryOptions::default();
        opts.statistics = true;
        run_query(&mut reader, &mut patterns, &opts, &mut out).unwrap();
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("2 directories"));
        assert!(text.contains("3 entries"));
    }

    #[test]
    fn escape_nonprintable_substitutes_only_when_enabled() {
        let mut out = Vec::new();
        let mut opts = QueryOptions::default();
        opts.escape_nonprintable = true;
        emit(b"/weird\x01name", &opts, &mut out).unwrap();
        assert_eq!(out, b"/weird?name\n");

        let mut out = Vec::new();
        let opts = QueryOptions::default(); // escape_nonprintable false by default
        emit(b"/weird\x01name", &opts, &mut out).unwrap();
        assert_eq!(out, b"/weird\x01name\n");
    }

    #[test]
    fn escape_nonprintable_does_not_apply_to_null_separated_output() {
        let mut out = Vec::new();
        let mut opts = QueryOptions::default();
        opts.escape_nonprintable = true;
        opts.null_separator = true;
        emit(b"/weird\x01name", &opts, &mut out).unwrap();
        assert_eq!(out, b"/weird\x01name\0");
    }

    #[test]
    fn basic_regex_parens_are_literal_unless_escaped() {
        let translated = basic_to_extended(r"foo\(bar\)");
        assert_eq!(translated, "foo(bar)");
        let translated = basic_to_extended("foo(bar)");
        assert_eq!(translated, r"foo\(bar\)");
    }
}
