#![recursion_limit = "256"]
#![deny(nonstandard_style, future_incompatible)]

//! Safe bindings to libzfs for pool and dataset administration.
//!
//! This library marshals calls into libzfs and turns its error state into Rust errors. Everything
//! interesting about storage happens in the native library; what lives here is handle ownership,
//! name/value list building and error bookkeeping.
//!
//! # Overview
//! Every operation starts from a [`Libzfs`] context. It owns the backend that talks to the native
//! library and serializes each native call together with the read of the error it may leave
//! behind, because libzfs keeps its last error in shared state.
//!
//! ## zpool
//! [`zpool::Pool`] opens, creates, imports, exports and destroys pools. Device layouts are
//! described with [`zpool::VdevSpec`] and validated before anything is allocated natively.
//!
//! ## zfs
//! [`zfs::Dataset`] is a tree of open dataset handles with cached properties. Snapshots, clones,
//! rollback, rename, mounting and send/receive hang off it.
//!
//! # Backends
//! With the `native` feature [`Libzfs::native`] links against the system libzfs. Without it (and
//! in the test suite) [`native::memory::MemoryBackend`] stands in for the library.
//!
//! # Project Structure
//! ### parsers
//! Module for PEG parsers backed by [Pest](https://pest.rs/).
//!
//! ### native
//! The native call surface as traits, and the backends implementing it.

#[macro_use] extern crate derive_builder;
#[macro_use] extern crate getset;

#[macro_use] extern crate lazy_static;

#[macro_use] extern crate quick_error;

#[macro_use] pub extern crate slog;

// library modules
pub mod config;
pub mod errors;
pub mod libzfs;
pub mod log;
pub mod native;
pub mod nv;
pub mod parsers;
pub mod property;
pub mod zfs;
pub mod zpool;

pub use crate::{config::Config,
                errors::{Error, ErrorKind, Result},
                libzfs::Libzfs,
                log::GlobalLogger};

const VERSION: &str = env!("CARGO_PKG_VERSION");
