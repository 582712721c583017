//! A small C-runtime substrate: process bring-up and tear-down, deferred-exit callbacks, static
//! initializer tables, mapped-image introspection, and a lock-free fixed-size block pool that does
//! not recurse into the general heap once warmed up.

pub mod config;

mod runtime;
pub use runtime::*;

mod error;
pub use error::*;

pub mod preinit;
