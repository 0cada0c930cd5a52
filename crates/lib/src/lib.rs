//! polyversion-lib: Core types and logic for building multi-revision documentation
//!
//! This crate provides the pieces used to build one documentation site per
//! version-control revision and merge them into a single output tree:
//! - `Revision`: immutable identity of one buildable point in history
//! - `RevisionProvider`: discovers, filters and materializes revisions (git)
//! - `Environment`: scoped command-execution context (plain, python venvs)
//! - `Builder`: turns an environment + output path + metadata into a build
//! - `Driver`: fans out isolated per-revision builds and merges the results
//! - `Codec`: JSON encoding of metadata with an extensible type registry

pub mod api;
pub mod builder;
pub mod codec;
pub mod config;
pub mod driver;
pub mod environment;
pub mod provider;
pub mod revision;
pub mod util;

pub use builder::{BuildError, Builder};
pub use codec::{Codec, CodecError, Value};
pub use driver::{Driver, DriverError, RunReport};
pub use environment::{Environment, ExecContext};
pub use provider::{DiscoveryError, MaterializeError, RevisionProvider};
pub use revision::{Revision, RevisionKind};
