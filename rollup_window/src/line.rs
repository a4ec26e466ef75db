//! The emitted representation of one aggregated window
//!
//! A [`Line`] is what leaves the relay: the metric path, the aggregate for one
//! window and the timestamp at which that window starts. Its [`Display`]
//! implementation is the wire format, three space separated fields terminated
//! by the caller:
//!
//! ```text
//! cpu.load 3.0 960
//! ```
//!
//! Where the line goes is the business of an [`Emit`] implementation.
//!
//! [`Display`]: std::fmt::Display

use std::{fmt, io};

#[derive(Debug, Clone, PartialEq)]
/// A single aggregated window, ready for emission.
pub struct Line {
    /// The metric path.
    pub path: String,
    /// The aggregate of every sample recorded into the window.
    pub value: f64,
    /// Start of the window in seconds since the unix epoch. Always a multiple
    /// of the window width.
    pub window_start: i64,
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Debug formatting of f64 is the shortest round-trip representation
        // and keeps the fractional part of integral values, "3.0" not "3".
        write!(f, "{} {:?} {}", self.path, self.value, self.window_start)
    }
}

/// Destination for emitted lines.
///
/// Implementations may buffer; [`Emit::flush`] is called once per flush
/// cycle after every line of that cycle has been offered.
pub trait Emit {
    /// Write a single line.
    ///
    /// # Errors
    ///
    /// Returns an error if the line could not be handed to the destination.
    /// The flush cycle reports the failure and moves on to the next line.
    fn emit(&mut self, line: &Line) -> io::Result<()>;

    /// Flush any buffered lines.
    ///
    /// # Errors
    ///
    /// Returns an error if buffered lines could not be delivered.
    fn flush(&mut self) -> io::Result<()>;
}

impl Emit for Vec<Line> {
    fn emit(&mut self, line: &Line) -> io::Result<()> {
        self.push(line.clone());
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
