//! loadstone-lua: the Lua evaluation layer for Loadstone
//!
//! Everything that touches the mlua runtime lives in this crate:
//! - `scan`: token-level scanning of `PKG.lua` sources (forbidden forms,
//!   literal glob/subpackage/import extraction, call-site annotations)
//! - `chunk`: chunk compilation against a predeclared environment
//! - `exec`: program execution with the `ExecHooks` seam back into the loader
//! - `resolver`: the constrained runtime for user-supplied file resolvers
//! - `value`: the attribute value tree exchanged with Lua
//!
//! The crate deliberately exposes syntax problems as plain data
//! ([`diag::SyntaxError`]) rather than `Err` values: a file that fails to
//! parse is a result, not a failure.

pub mod chunk;
pub mod diag;
pub mod exec;
pub mod resolver;
pub mod runtime;
pub mod scan;
pub mod value;

pub use diag::{Location, SyntaxError};
pub use exec::{ExecHooks, GlobArgs, ModuleChunk, TargetDecl};
pub use scan::ScanInfo;
pub use value::Value;
