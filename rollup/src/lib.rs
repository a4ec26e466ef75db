//! The rollup streaming metrics aggregation relay.
//!
//! This library supports the rollup binary found elsewhere in this project.
//! Samples arrive over TCP in a line protocol, are folded into fixed width
//! time windows by [`rollup_window`] and are written out once per window
//! width to a configurable [`sink::Sink`].

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

pub mod config;
pub mod flusher;
pub mod ingest;
pub mod relay;
pub mod sink;
