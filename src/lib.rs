//! Incremental filesystem indexer and pattern locator, compatible with the
//! `mlocate` on-disk database format.
//!
//! The crate is split by concern: a total order on paths ([`path_order`]),
//! the wire codec ([`codec`]), the
//! in-memory directory shape ([`dirmodel`]), configuration ([`config`]),
//! the bind-mount oracle ([`bind_mount`]), the merge/build engine
//! ([`builder`]), the streaming match engine ([`matcher`]), the ancestor
//! visibility cache ([`visibility`]), and atomic publication ([`publish`]).
//! The two binaries in `src/bin/` are thin `lexopt`-based front ends over
//! this library.

pub mod bind_mount;
pub mod builder;
pub mod codec;
pub mod config;
pub mod dirmodel;
pub mod error;
pub mod matcher;
pub mod path_order;
pub mod publish;
pub mod visibility;

pub use config::Config;
pub use error::{CoreError, CoreResult};
