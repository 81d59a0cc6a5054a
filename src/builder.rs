//! MODULE `builder`: incremental merge/build engine (spec.md §4.6).
//!
//! Walks the filesystem in the same depth-first, name-sorted order the old
//! database was written in, keeping a one-directory lookahead (`OldDb`)
//! into it. A directory is reused verbatim -- no `readdir` -- when its path
//! and timestamp match the lookahead exactly; otherwise it is rescanned.
//! Directories modified within the freshness margin of "now" are always
//! rescanned and written back with the sentinel timestamp, so a same-second
//! write after the scan can never be missed by a future reuse decision.
//!
//! Descent is by relative `chdir`, one path component at a time, with a
//! saved cwd fd restored via `fchdir` on the way back out -- not by
//! re-resolving the full absolute path at every level. Re-resolving from
//! the root each time would let an attacker who swaps out an *ancestor*
//! directory for a symlink after we've already verified it reopen that race
//! on every descendant; anchoring each step on the fd of the directory we
//! already verified we're inside closes that window (spec.md §4.6 "Safe
//! descent", §5, §9).

use std::cmp::Ordering;
use std::ffi::OsStr;
use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use nix::sys::stat::{lstat, SFlag};
use nix::unistd::{chdir, fchdir};

use crate::bind_mount::BindMountOracle;
use crate::codec::{Reader, Writer};
use crate::config::Config;
use crate::dirmodel::{Directory, Entry, Timestamp};
use crate::error::{CoreError, CoreResult};
use crate::path_order::{join_path, name_cmp, path_cmp};

/// A directory's modification time within this many seconds of "now" cannot
/// be trusted: a write landing in the same second as the scan, after the
/// scan already read the directory, would leave the timestamp unchanged
/// while the listing goes stale (spec.md §3, §4.6).
pub const FRESHNESS_MARGIN_SECS: u64 = 3;

#[derive(Debug, Default, Clone, Copy)]
pub struct BuildStats {
    pub directories_written: u64,
    pub directories_reused: u64,
    pub directories_rescanned: u64,
    pub directories_pruned: u64,
    pub entries_pruned: u64,
}

fn bytes_to_path(b: &[u8]) -> &Path {
    Path::new(OsStr::from_bytes(b))
}

/// One-directory lookahead into the old database, advanced only as the
/// walker consumes entries in `path_cmp` order (spec.md §4.6).
struct OldDb<R: Read> {
    reader: Option<Reader<R>>,
    peeked: Option<Directory>,
}

impl<R: Read> OldDb<R> {
    fn new(reader: Option<Reader<R>>) -> Self {
        OldDb { reader, peeked: None }
    }

    fn peek(&mut self) -> CoreResult<Option<&Directory>> {
        if self.peeked.is_none() {
            if let Some(r) = &mut self.reader {
                self.peeked = r.read_directory()?;
            }
        }
        Ok(self.peeked.as_ref())
    }

    fn take(&mut self) -> Option<Directory> {
        self.peeked.take()
    }
}

/// Parses `/proc/mounts`-shaped lines (`device mount_point fs_type options
/// dump pass`) into `(mount_point, fs_type)` pairs, for the fs-type prune
/// check on mount-boundary crossings (spec.md §4.6, distinct from the
/// mountinfo table [`crate::bind_mount`] parses).
pub fn parse_mount_table(contents: &str) -> Vec<(Vec<u8>, String)> {
    let mut out = Vec::new();
    for line in contents.lines() {
        let mut fields = line.split_whitespace();
        let Some(_device) = fields.next() else { continue };
        let Some(mount_point) = fields.next() else { continue };
        let Some(fs_type) = fields.next() else { continue };
        out.push((mount_point.as_bytes().to_vec(), fs_type.to_string()));
    }
    // Longest mount point first, so a prefix search finds the most specific
    // mount covering a path.
    out.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
    out
}

fn lookup_fs_type<'a>(table: &'a [(Vec<u8>, String)], path: &[u8]) -> Option<&'a str> {
    for (mount_point, fs_type) in table {
        if path == mount_point.as_slice() {
            return Some(fs_type);
        }
        if path.starts_with(mount_point.as_slice()) {
            if mount_point.as_slice() == b"/" || path.get(mount_point.len()) == Some(&b'/') {
                return Some(fs_type);
            }
        }
    }
    None
}

/// Enters a directory relative to the current cwd (or by absolute path for
/// the scan root, `name_rel == None`), verifying the directory landed on is
/// the same one `lstat` reported moments earlier. Returns a handle to the
/// cwd we entered from, to be restored by [`restore`]. On any failure --
/// race detected or the `chdir`/`lstat` itself failing -- best-effort
/// restores the original cwd and returns an error for the caller to treat
/// as a local skip (spec.md §4.6, §7 "RaceDetected").
fn enter(name_rel: Option<&[u8]>, abs_path: &[u8], expected_dev: u64, expected_ino: u64) -> CoreResult<File> {
    let saved = File::open(".").map_err(CoreError::Io)?;
    let target: &Path = match name_rel {
        Some(name) => Path::new(OsStr::from_bytes(name)),
        None => bytes_to_path(abs_path),
    };
    if let Err(e) = chdir(target) {
        return Err(CoreError::Io(std::io::Error::from(e)));
    }
    let st = match lstat(Path::new(".")) {
        Ok(s) => s,
        Err(e) => {
            let _ = fchdir(saved.as_raw_fd());
            return Err(CoreError::Io(std::io::Error::from(e)));
        }
    };
    if st.st_dev as u64 != expected_dev || st.st_ino as u64 != expected_ino {
        let _ = fchdir(saved.as_raw_fd());
        return Err(CoreError::RaceDetected { path: bytes_to_path(abs_path).to_path_buf() });
    }
    Ok(saved)
}

/// Restores the cwd saved by [`enter`]. Failure here is fatal: the caller's
/// notion of "where we are" is no longer trustworthy, so the walk cannot
/// safely continue with siblings (spec.md §4.6 "RestoreFailed").
fn restore(saved: File) -> CoreResult<()> {
    fchdir(saved.as_raw_fd()).map_err(|e| CoreError::Io(std::io::Error::from(e)))
}

fn effective_timestamp(mtime: Timestamp, now: Timestamp) -> Timestamp {
    if now.sec.saturating_sub(mtime.sec) < FRESHNESS_MARGIN_SECS {
        Timestamp::SENTINEL
    } else {
        mtime
    }
}

/// Drives one full build: walks `scan_root`, merging against an optional
/// old database, and writes directory records to `writer` (spec.md §4.6).
pub struct Builder<'a, W: Write, R: Read> {
    config: &'a Config,
    old: OldDb<R>,
    writer: Writer<W>,
    bind_mounts: Option<BindMountOracle>,
    mount_table: Vec<(Vec<u8>, String)>,
    abort: Arc<AtomicBool>,
    now: Timestamp,
    stats: BuildStats,
}

impl<'a, W: Write, R: Read> Builder<'a, W, R> {
    pub fn new(
        config: &'a Config,
        writer: Writer<W>,
        old_reader: Option<Reader<R>>,
        bind_mounts: Option<BindMountOracle>,
        mount_table: Vec<(Vec<u8>, String)>,
        abort: Arc<AtomicBool>,
        now: Timestamp,
    ) -> Self {
        Builder {
            config,
            old: OldDb::new(old_reader),
            writer,
            bind_mounts,
            mount_table,
            abort,
            now,
            stats: BuildStats::default(),
        }
    }

    pub fn into_writer(self) -> Writer<W> {
        self.writer
    }

    /// Runs the build starting at `scan_root` and returns summary statistics
    /// for `--verbose` reporting (spec.md §2 ambient logging).
    pub fn build(mut self, scan_root: &[u8]) -> CoreResult<(Writer<W>, BuildStats)> {
        self.visit(scan_root.to_vec(), None, None)?;
        Ok((self.writer, self.stats))
    }

    fn skip_old_until(&mut self, path: &[u8]) -> CoreResult<()> {
        loop {
            match self.old.peek()? {
                Some(d) if path_cmp(&d.path, path) == Ordering::Less => {
                    self.old.take();
                }
                _ => break,
            }
        }
        Ok(())
    }

    /// Visits one directory: decides prune/reuse/rescan, writes its record,
    /// then descends into its subdirectories in name order. `name_rel` is
    /// the basename to `chdir` into relative to the already-entered parent;
    /// `None` only for the scan root, which is entered by absolute path.
    fn visit(&mut self, path: Vec<u8>, name_rel: Option<Vec<u8>>, parent_dev: Option<u64>) -> CoreResult<()> {
        if self.abort.load(AtomicOrdering::Relaxed) {
            return Err(CoreError::Config("build aborted by signal".into()));
        }

        self.skip_old_until(&path)?;

        if self.config.is_pruned_path(&path) {
            if self.config.debug_pruning {
                log::debug!("pruning {}: matched prune_paths", String::from_utf8_lossy(&path));
            }
            self.stats.directories_pruned += 1;
            return Ok(());
        }

        let lst = match name_rel.as_deref() {
            Some(name) => lstat(Path::new(OsStr::from_bytes(name))),
            None => lstat(bytes_to_path(&path)),
        };
        let lst = match lst {
            Ok(l) => l,
            Err(_) => {
                // Vanished or became unreadable between being listed by its
                // parent and being visited here: skip silently (spec.md §7,
                // "local-skip").
                self.stats.directories_pruned += 1;
                return Ok(());
            }
        };
        if (lst.st_mode & SFlag::S_IFMT.bits()) != SFlag::S_IFDIR.bits() {
            return Ok(());
        }

        let dev = lst.st_dev as u64;
        let ino = lst.st_ino as u64;

        if let Some(pdev) = parent_dev {
            if dev != pdev {
                if self.config.prune_bind_mounts {
                    if let Some(oracle) = &mut self.bind_mounts {
                        if oracle.is_bind_mount(&path) {
                            if self.config.debug_pruning {
                                log::debug!("pruning {}: no-op bind mount", String::from_utf8_lossy(&path));
                            }
                            self.stats.directories_pruned += 1;
                            return Ok(());
                        }
                    }
                }
                if let Some(fs_type) = lookup_fs_type(&self.mount_table, &path) {
                    if self.config.is_pruned_fs_type(fs_type) {
                        if self.config.debug_pruning {
                            log::debug!(
                                "pruning {}: fs type {} in prune_fs_types",
                                String::from_utf8_lossy(&path),
                                fs_type
                            );
                        }
                        self.stats.directories_pruned += 1;
                        return Ok(());
                    }
                }
            }
        }

        let mtime = Timestamp::new(lst.st_mtime as u64, lst.st_mtime_nsec as u32);
        let ctime = Timestamp::new(lst.st_ctime as u64, lst.st_ctime_nsec as u32);
        // The stored timestamp is max(ctime, mtime): a metadata-only change
        // (e.g. a rename of a child under this directory touches ctime but
        // may leave mtime alone on some filesystems) must still invalidate
        // reuse (spec.md §3).
        let dir_time = mtime.max(ctime);
        let old_match = self.old.peek()?.filter(|d| d.path == path).cloned();

        let mut entered: Option<File> = None;
        let (time, entries) = match &old_match {
            Some(old_dir) if old_dir.time == dir_time && !effective_timestamp(dir_time, self.now).is_sentinel() => {
                self.old.take();
                self.stats.directories_reused += 1;
                if self.config.verbose {
                    log::info!("reused {}", String::from_utf8_lossy(&path));
                }
                (dir_time, old_dir.entries.clone())
            }
            _ => {
                if old_match.is_some() {
                    self.old.take();
                }
                self.stats.directories_rescanned += 1;
                if self.config.verbose {
                    log::info!("scanning {}", String::from_utf8_lossy(&path));
                }
                let saved = match enter(name_rel.as_deref(), &path, dev, ino) {
                    Ok(f) => f,
                    Err(_) => {
                        // Race or chdir failure while trying to rescan: abandon
                        // this directory entirely (spec.md §4.6 "ChdirRace").
                        self.stats.directories_pruned += 1;
                        return Ok(());
                    }
                };
                let entries = self.scan_entries_here()?;
                entered = Some(saved);
                (effective_timestamp(dir_time, self.now), entries)
            }
        };

        self.writer.write_directory(&Directory { path: path.clone(), time, entries: entries.clone() })?;
        self.stats.directories_written += 1;

        let has_subdirs = entries.iter().any(|e| e.is_directory);
        if has_subdirs {
            let saved = match entered.take() {
                Some(s) => s,
                None => match enter(name_rel.as_deref(), &path, dev, ino) {
                    Ok(s) => s,
                    Err(_) => return Ok(()), // can't descend; the record already written stands
                },
            };
            for entry in &entries {
                if self.abort.load(AtomicOrdering::Relaxed) {
                    return Err(CoreError::Config("build aborted by signal".into()));
                }
                if entry.is_directory {
                    let child = join_path(&path, &entry.name);
                    self.visit(child, Some(entry.name.clone()), Some(dev))?;
                }
            }
            restore(saved)?;
        } else if let Some(saved) = entered {
            restore(saved)?;
        }

        Ok(())
    }

    /// Lists the entries of the directory we're already `chdir`'d into,
    /// dropping names matched by `prune_names` (spec.md §4.6).
    fn scan_entries_here(&mut self) -> CoreResult<Vec<Entry>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(".").map_err(CoreError::Io)? {
            let entry = entry.map_err(CoreError::Io)?;
            let name = entry.file_name().as_bytes().to_vec();
            if name == b"." || name == b".." {
                continue;
            }
            if self.config.is_pruned_name(&name) {
                if self.config.debug_pruning {
                    log::debug!("pruning name {}", String::from_utf8_lossy(&name));
                }
                self.stats.entries_pruned += 1;
                continue;
            }
            let is_directory = entry.file_type().map_err(CoreError::Io)?.is_dir();
            out.push(Entry { name, is_directory });
        }
        out.sort_by(|a, b| name_cmp(&a.name, &b.name));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freshness_margin_forces_sentinel() {
        let now = Timestamp::new(1_000, 0);
        let just_modified = Timestamp::new(998, 0);
        assert!(effective_timestamp(just_modified, now).is_sentinel());
    }

    #[test]
    fn old_enough_timestamp_is_kept() {
        let now = Timestamp::new(1_000, 0);
        let old_enough = Timestamp::new(500, 0);
        assert_eq!(effective_timestamp(old_enough, now), old_enough);
    }

    #[test]
    fn mount_table_prefix_lookup_is_most_specific() {
        let table = parse_mount_table("dev1 / ext4 rw 0 0\ndev2 /mnt/data tmpfs rw 0 0\n");
        assert_eq!(lookup_fs_type(&table, b"/mnt/data/x"), Some("tmpfs"));
        assert_eq!(lookup_fs_type(&table, b"/usr"), Some("ext4"));
    }

    #[test]
    fn mount_table_does_not_match_partial_segment() {
        let table = parse_mount_table("dev1 / ext4 rw 0 0\ndev2 /mnt tmpfs rw 0 0\n");
        // "/mnt2" is not under "/mnt" even though it shares the prefix text.
        assert_eq!(lookup_fs_type(&table, b"/mnt2"), Some("ext4"));
    }
}
