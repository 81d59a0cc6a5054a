//! MODULE `config`: the frozen configuration snapshot driving a build or a
//! query (spec.md §4.3).
//!
//! `--prunefoo` replaces the config-file value; `--add-prunefoo` appends
//! (spec.md §6). The resolved snapshot re-serializes into `config_block`,
//! the opaque bytes embedded verbatim in the database header -- a changed
//! prune set invalidates every cached directory, so requiring byte equality
//! between the old and new blocks is a cheap, sufficient cache key.

use std::path::PathBuf;

use crate::path_order::path_cmp;

/// Default prune paths mirroring historical `updatedb.conf` defaults.
pub const DEFAULT_PRUNE_PATHS: &[&str] = &["/tmp", "/var/tmp", "/var/spool", "/var/lib/mlocate"];
pub const DEFAULT_PRUNE_FS_TYPES: &[&str] = &["autofs", "proc", "sysfs", "tmpfs"];

/// Build-time configuration consumed read-only by [`crate::builder`] and
/// (in its serialized form) compared by [`crate::matcher`] (spec.md §4.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub scan_root: Vec<u8>,
    pub prune_paths: Vec<Vec<u8>>,
    pub prune_names: Vec<Vec<u8>>,
    pub prune_fs_types: Vec<String>,
    pub prune_bind_mounts: bool,
    pub check_visibility: bool,
    pub output_path: PathBuf,
    pub verbose: bool,
    pub debug_pruning: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            scan_root: b"/".to_vec(),
            prune_paths: dedup_sorted_paths(DEFAULT_PRUNE_PATHS.iter().map(|s| s.as_bytes().to_vec()).collect()),
            prune_names: dedup_sorted_names(vec![]),
            prune_fs_types: dedup_sorted_fs_types(DEFAULT_PRUNE_FS_TYPES.iter().map(|s| s.to_string()).collect()),
            prune_bind_mounts: true,
            check_visibility: true,
            output_path: PathBuf::from("/var/lib/mlocate/mlocate.db"),
            verbose: false,
            debug_pruning: false,
        }
    }
}

fn dedup_sorted_paths(mut paths: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
    paths.sort_by(|a, b| path_cmp(a, b));
    paths.dedup();
    paths
}

fn dedup_sorted_names(mut names: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
    names.sort();
    names.dedup();
    names
}

fn dedup_sorted_fs_types(types: Vec<String>) -> Vec<String> {
    let mut upper: Vec<String> = types.iter().map(|t| t.to_uppercase()).collect();
    upper.sort();
    upper.dedup();
    upper
}

impl Config {
    /// Re-serializes the prune sets and flags into the opaque bytes stored
    /// in the database header. Two configurations that resolve to the same
    /// effective prune sets/flags produce byte-identical blocks, which is
    /// exactly the cache key the updater compares against the old header.
    pub fn config_block(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for p in &self.prune_paths {
            out.extend_from_slice(p);
            out.push(0);
        }
        out.push(0xFF);
        for n in &self.prune_names {
            out.extend_from_slice(n);
            out.push(0);
        }
        out.push(0xFF);
        for t in &self.prune_fs_types {
            out.extend_from_slice(t.as_bytes());
            out.push(0);
        }
        out.push(0xFF);
        out.push(self.prune_bind_mounts as u8);
        out.push(self.check_visibility as u8);
        out
    }

    pub fn set_prune_paths(&mut self, paths: Vec<Vec<u8>>) {
        self.prune_paths = dedup_sorted_paths(paths);
    }

    pub fn add_prune_paths(&mut self, paths: Vec<Vec<u8>>) {
        let mut all = self.prune_paths.clone();
        all.extend(paths);
        self.prune_paths = dedup_sorted_paths(all);
    }

    pub fn set_prune_names(&mut self, names: Vec<Vec<u8>>) {
        self.prune_names = dedup_sorted_names(names);
    }

    pub fn add_prune_names(&mut self, names: Vec<Vec<u8>>) {
        let mut all = self.prune_names.clone();
        all.extend(names);
        self.prune_names = dedup_sorted_names(all);
    }

    pub fn set_prune_fs_types(&mut self, types: Vec<String>) {
        self.prune_fs_types = dedup_sorted_fs_types(types);
    }

    pub fn add_prune_fs_types(&mut self, types: Vec<String>) {
        let mut all = self.prune_fs_types.clone();
        all.extend(types);
        self.prune_fs_types = dedup_sorted_fs_types(all);
    }

    pub fn is_pruned_path(&self, path: &[u8]) -> bool {
        self.prune_paths.iter().any(|p| p.as_slice() == path)
    }

    pub fn is_pruned_name(&self, name: &[u8]) -> bool {
        self.prune_names.iter().any(|n| n.as_slice() == name)
    }

    pub fn is_pruned_fs_type(&self, fs_type: &str) -> bool {
        self.prune_fs_types.iter().any(|t| t == &fs_type.to_uppercase())
    }
}

/// Parses a whitespace-separated list of paths/names, as `updatedb.conf`
/// and the `--prunepaths`/`--prunenames` flags both accept (spec.md §6).
pub fn split_whitespace_list(s: &str) -> Vec<Vec<u8>> {
    s.split_whitespace().map(|p| p.as_bytes().to_vec()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_vs_append_prune_paths() {
        let mut c = Config { prune_paths: vec![], ..Config::default() };
        c.set_prune_paths(vec![b"/tmp".to_vec()]);
        assert_eq!(c.prune_paths, vec![b"/tmp".to_vec()]);
        c.add_prune_paths(vec![b"/var/tmp".to_vec()]);
        assert!(c.prune_paths.contains(&b"/tmp".to_vec()));
        assert!(c.prune_paths.contains(&b"/var/tmp".to_vec()));
    }

    #[test]
    fn config_block_is_deterministic() {
        let a = Config::default();
        let b = Config::default();
        assert_eq!(a.config_block(), b.config_block());
    }

    #[test]
    fn config_block_changes_with_prune_set() {
        let a = Config::default();
        let mut b = Config::default();
        b.add_prune_paths(vec![b"/mnt/extra".to_vec()]);
        assert_ne!(a.config_block(), b.config_block());
    }

    #[test]
    fn fs_type_matching_is_case_insensitive_but_stored_upper() {
        let mut c = Config::default();
        c.set_prune_fs_types(vec!["nfs".to_string()]);
        assert_eq!(c.prune_fs_types, vec!["NFS".to_string()]);
        assert!(c.is_pruned_fs_type("nfs"));
        assert!(c.is_pruned_fs_type("NFS"));
    }

    #[test]
    fn dedup_removes_duplicate_prune_paths() {
        let mut c = Config::default();
        c.set_prune_paths(vec![b"/tmp".to_vec(), b"/tmp".to_vec()]);
        assert_eq!(c.prune_paths.len(), 1);
    }
}
