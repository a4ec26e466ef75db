//! Windowed metric accumulation for the rollup relay.
//!
//! Samples arrive as `(path, value, timestamp)` triples from any number of
//! concurrent writers. Each is folded into the window `floor(timestamp /
//! retention)` for its path, see [`store::Store`]. Periodically a single
//! [`flush::Cycle`] drains the windows touched since its previous run,
//! reduces each to one value per [`aggregate::Mode`], hands the resulting
//! [`line::Line`] to an [`line::Emit`] implementation and discards windows
//! that have aged past the expiry horizon.

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

pub mod aggregate;
pub mod flush;
pub mod line;
pub mod store;
pub mod window;

pub use aggregate::{Mode, Summary, compute};
pub use flush::{Cycle, FlushReport};
pub use line::{Emit, Line};
pub use store::Store;
pub use window::{Width, WindowKey};
