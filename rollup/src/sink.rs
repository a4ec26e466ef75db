//! Destinations for aggregated lines.
//!
//! The relay writes one line per flushed window. By default lines go to
//! stdout, as a graphite style relay feeding a pipe. They may instead be
//! appended to a file or written to a downstream TCP listener such as a
//! carbon receiver.
//!
//! Delivery is at most once. The TCP sink connects lazily, and a failed write
//! drops the connection so the next line reconnects. The line that failed is
//! not retried. A failed connect marks the downstream as down for a backoff
//! period, during which lines fail without another connect attempt.
//!
//! ## Metrics
//!
//! `connection_failure`: Failed connects to the TCP downstream
//!

use std::{
    fs::{File, OpenOptions},
    io::{self, BufWriter, Stdout, Write},
    net::{SocketAddr, TcpStream},
    path::PathBuf,
    time::{Duration, Instant},
};

pub use rollup_window::{Emit, Line};
use serde::Deserialize;
use metrics::counter;
use tracing::{info, warn};

/// Errors produced by [`Sink`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Wrapper around [`io::Error`].
    #[error("[{context}] Io error: {err}")]
    Io {
        /// The context for the error, simple tag
        context: &'static str,
        /// The underlying error
        err: io::Error,
    },
}

fn default_timeout_ms() -> u64 {
    1_000
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
/// Configuration for [`Sink`]
pub enum Config {
    /// Write lines to stdout.
    #[default]
    Stdout,
    /// Append lines to a file, creating it if absent.
    File {
        /// Path of the output file
        path: PathBuf,
    },
    /// Write lines to a TCP listener.
    Tcp {
        /// address -- IP plus port -- to connect to
        addr: SocketAddr,
        /// Time allowed to establish a connection, in milliseconds
        #[serde(default = "default_timeout_ms")]
        connect_timeout_ms: u64,
        /// Time allowed for a single write, in milliseconds
        #[serde(default = "default_timeout_ms")]
        write_timeout_ms: u64,
        /// Time after a failed connect during which no reconnect is
        /// attempted, in milliseconds
        #[serde(default = "default_timeout_ms")]
        retry_backoff_ms: u64,
    },
}

#[derive(Debug)]
/// The output sink.
///
/// All destinations supported by rollup are a variant of this enum.
pub enum Sink {
    /// Buffered stdout.
    Stdout(BufWriter<Stdout>),
    /// Buffered append-only file.
    File(BufWriter<File>),
    /// See [`Tcp`] for details.
    Tcp(Tcp),
}

impl Sink {
    /// Create a new [`Sink`]
    ///
    /// # Errors
    ///
    /// Function will return an error if a file sink cannot be opened. TCP
    /// sinks do not connect until the first line is emitted.
    pub fn new(config: &Config) -> Result<Self, Error> {
        let sink = match config {
            Config::Stdout => Self::Stdout(BufWriter::new(io::stdout())),
            Config::File { path } => {
                let fp = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|err| Error::Io {
                        context: "open file sink",
                        err,
                    })?;
                Self::File(BufWriter::new(fp))
            }
            Config::Tcp {
                addr,
                connect_timeout_ms,
                write_timeout_ms,
                retry_backoff_ms,
            } => Self::Tcp(Tcp::new(
                *addr,
                Duration::from_millis(*connect_timeout_ms),
                Duration::from_millis(*write_timeout_ms),
                Duration::from_millis(*retry_backoff_ms),
            )),
        };
        Ok(sink)
    }
}

impl Emit for Sink {
    fn emit(&mut self, line: &Line) -> io::Result<()> {
        match self {
            Self::Stdout(w) => writeln!(w, "{line}"),
            Self::File(w) => writeln!(w, "{line}"),
            Self::Tcp(tcp) => tcp.emit(line),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Stdout(w) => w.flush(),
            Self::File(w) => w.flush(),
            Self::Tcp(tcp) => tcp.flush(),
        }
    }
}

#[derive(Debug)]
/// A lazily connected TCP destination.
pub struct Tcp {
    addr: SocketAddr,
    connect_timeout: Duration,
    write_timeout: Duration,
    retry_backoff: Duration,
    stream: Option<BufWriter<TcpStream>>,
    /// No connect is attempted before this instant.
    down_until: Option<Instant>,
    connect_attempts: u64,
}

impl Tcp {
    /// Create a new, unconnected, [`Tcp`] sink. Zero timeouts are raised to
    /// one millisecond.
    #[must_use]
    pub fn new(
        addr: SocketAddr,
        connect_timeout: Duration,
        write_timeout: Duration,
        retry_backoff: Duration,
    ) -> Self {
        let floor = Duration::from_millis(1);
        Self {
            addr,
            connect_timeout: connect_timeout.max(floor),
            write_timeout: write_timeout.max(floor),
            retry_backoff,
            stream: None,
            down_until: None,
            connect_attempts: 0,
        }
    }

    fn connect(&mut self) -> io::Result<BufWriter<TcpStream>> {
        if self.down_until.is_some_and(|until| Instant::now() < until) {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("downstream {addr} is down, not reconnecting yet", addr = self.addr),
            ));
        }

        self.connect_attempts += 1;
        let res = TcpStream::connect_timeout(&self.addr, self.connect_timeout).and_then(|stream| {
            stream.set_write_timeout(Some(self.write_timeout))?;
            stream.set_nodelay(true)?;
            Ok(stream)
        });
        match res {
            Ok(stream) => {
                self.down_until = None;
                info!(addr = %self.addr, "connected to downstream");
                Ok(BufWriter::new(stream))
            }
            Err(err) => {
                self.down_until = Some(Instant::now() + self.retry_backoff);
                counter!("connection_failure").increment(1);
                warn!(
                    addr = %self.addr,
                    attempt = self.connect_attempts,
                    backoff = ?self.retry_backoff,
                    "Failed to connect to downstream: {err}"
                );
                Err(err)
            }
        }
    }

    fn connection(&mut self) -> io::Result<&mut BufWriter<TcpStream>> {
        let stream = match self.stream.take() {
            Some(stream) => stream,
            None => self.connect()?,
        };
        Ok(self.stream.insert(stream))
    }

    fn emit(&mut self, line: &Line) -> io::Result<()> {
        let res = self
            .connection()
            .and_then(|conn| writeln!(conn, "{line}"));
        if res.is_err() {
            self.stream = None;
        }
        res
    }

    fn flush(&mut self) -> io::Result<()> {
        let Some(conn) = self.stream.as_mut() else {
            return Ok(());
        };
        let res = conn.flush();
        if res.is_err() {
            self.stream = None;
        }
        res
    }
}
