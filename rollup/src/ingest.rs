//! The line protocol speaking ingest server.
//!
//! Emitters open a TCP connection and write one sample per line:
//!
//! ```text
//! <path> <value> <timestamp>\n
//! ```
//!
//! Fields are separated by a single space, `value` is a float and `timestamp`
//! an integer count of seconds since the unix epoch. The first line that does
//! not conform closes the connection; lines accepted before it stand.
//!
//! ## Metrics
//!
//! `connection_accepted`: Incoming connections received
//! `connection_rejected`: Incoming connections closed for lack of capacity
//! `connection_current`: Connections currently open
//! `lines_received`: Lines accepted into the accumulator
//! `lines_rejected`: Lines that closed their connection
//!

use std::{
    io,
    net::SocketAddr,
    num::{ParseFloatError, ParseIntError},
    sync::Arc,
};

use futures::StreamExt;
use metrics::{Gauge, counter, gauge};
use rollup_signal::Watcher;
use rollup_window::Store;
use serde::Deserialize;
use tokio::{
    net::{TcpListener, TcpStream},
    pin,
    sync::{OwnedSemaphorePermit, Semaphore},
    task::JoinSet,
};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Server`]
pub enum Error {
    /// Wrapper for [`std::io::Error`].
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Reasons a line is refused.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The line does not have exactly three fields.
    #[error("expected 3 space separated fields, found {0}")]
    FieldCount(usize),
    /// The value field is not a float.
    #[error("value is not numeric: {0}")]
    Value(#[from] ParseFloatError),
    /// The timestamp field is not an integer.
    #[error("timestamp is not an integer: {0}")]
    Timestamp(#[from] ParseIntError),
    /// The value is NaN or infinite.
    #[error("value is not finite: {0}")]
    NotFinite(String),
}

fn default_binding_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 15_555))
}

fn default_max_connections() -> usize {
    1_024
}

fn default_max_line_length() -> usize {
    4_096
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
/// Configuration for [`Server`]
pub struct Config {
    /// address -- IP plus port -- to bind to
    #[serde(default = "default_binding_addr")]
    pub binding_addr: SocketAddr,
    /// Connections beyond this many are closed on accept
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Longest accepted line in bytes, excluding the newline
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            binding_addr: default_binding_addr(),
            max_connections: default_max_connections(),
            max_line_length: default_max_line_length(),
        }
    }
}

/// A single parsed line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample<'a> {
    /// The metric path
    pub path: &'a str,
    /// The observed value
    pub value: f64,
    /// Seconds since the unix epoch
    pub timestamp: i64,
}

/// Parse one line of the ingest protocol. Surrounding whitespace is ignored.
///
/// # Errors
///
/// Returns an error if the line does not have exactly three single-space
/// separated fields, if the value or timestamp do not parse or if the value
/// is NaN or infinite.
pub fn parse_line(line: &str) -> Result<Sample<'_>, ParseError> {
    let line = line.trim();
    let mut fields = line.split(' ');
    let (Some(path), Some(value), Some(timestamp), None) =
        (fields.next(), fields.next(), fields.next(), fields.next())
    else {
        return Err(ParseError::FieldCount(line.split(' ').count()));
    };

    let parsed: f64 = value.parse()?;
    if !parsed.is_finite() {
        return Err(ParseError::NotFinite(value.to_string()));
    }

    Ok(Sample {
        path,
        value: parsed,
        timestamp: timestamp.parse()?,
    })
}

/// An admitted connection. Holds one unit of the connection limit and counts
/// itself in `connection_current` until dropped, including when its task is
/// aborted.
struct Slot {
    _permit: OwnedSemaphorePermit,
    gauge: Gauge,
}

impl Slot {
    fn new(permit: OwnedSemaphorePermit, gauge: Gauge) -> Self {
        gauge.increment(1.0);
        Self {
            _permit: permit,
            gauge,
        }
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.gauge.decrement(1.0);
    }
}

#[derive(Debug)]
/// The ingest server.
pub struct Server {
    listener: TcpListener,
    config: Config,
    shutdown: Watcher,
}

impl Server {
    /// Bind a new [`Server`] to the configured address.
    ///
    /// # Errors
    ///
    /// Function will return an error if binding to the address fails.
    pub async fn bind(config: Config, shutdown: Watcher) -> Result<Self, Error> {
        let listener = TcpListener::bind(config.binding_addr).await?;
        Ok(Self {
            listener,
            config,
            shutdown,
        })
    }

    /// The address the server is listening on.
    ///
    /// # Errors
    ///
    /// Function will return an error if the socket address cannot be read.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.listener.local_addr()?)
    }

    /// Run [`Server`] to completion
    ///
    /// Accepts connections and feeds every parsed line into `store` until the
    /// shutdown signal is received. Open connections are then aborted.
    ///
    /// # Errors
    ///
    /// None known. Accept failures are logged and the server keeps going.
    pub async fn run(self, store: Arc<Store>) -> Result<(), Error> {
        let Self {
            listener,
            config,
            shutdown,
        } = self;
        let sem = Arc::new(Semaphore::new(config.max_connections));
        let mut join_set = JoinSet::new();

        let connection_accepted = counter!("connection_accepted");
        let connection_rejected = counter!("connection_rejected");
        let connection_current = gauge!("connection_current");

        let shutdown_wait = shutdown.recv();
        pin!(shutdown_wait);
        loop {
            tokio::select! {
                () = &mut shutdown_wait => {
                    info!("shutdown signal received, stopping ingest");
                    break;
                }

                incoming = listener.accept() => {
                    let (socket, peer) = match incoming {
                        Ok(sa) => sa,
                        Err(e) => {
                            warn!("Error accepting connection: {e}");
                            continue;
                        }
                    };

                    let Ok(permit) = Arc::clone(&sem).try_acquire_owned() else {
                        warn!(%peer, "ingest over connection capacity, closing connection");
                        connection_rejected.increment(1);
                        drop(socket);
                        continue;
                    };
                    connection_accepted.increment(1);

                    let slot = Slot::new(permit, connection_current.clone());
                    let store = Arc::clone(&store);
                    let max_line_length = config.max_line_length;
                    join_set.spawn(async move {
                        handle_connection(socket, peer, &store, max_line_length).await;
                        drop(slot);
                    });
                }
            }

            while join_set.try_join_next().is_some() {}
        }

        drop(listener);
        join_set.shutdown().await;
        Ok(())
    }
}

async fn handle_connection(
    socket: TcpStream,
    peer: SocketAddr,
    store: &Store,
    max_line_length: usize,
) {
    info!(%peer, "new connection");
    let lines_received = counter!("lines_received");
    let lines_rejected = counter!("lines_rejected");

    let mut lines = FramedRead::new(socket, LinesCodec::new_with_max_length(max_line_length));
    while let Some(frame) = lines.next().await {
        let line = match frame {
            Ok(line) => line,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                warn!(%peer, max_line_length, "line too long, closing connection");
                lines_rejected.increment(1);
                return;
            }
            Err(LinesCodecError::Io(err)) => {
                warn!(%peer, "read failed, closing connection: {err}");
                lines_rejected.increment(1);
                return;
            }
        };

        match parse_line(&line) {
            Ok(sample) => {
                store.add(sample.path, sample.value, sample.timestamp);
                lines_received.increment(1);
            }
            Err(err) => {
                warn!(%peer, "wrong input line {line:?}, closing connection: {err}");
                lines_rejected.increment(1);
                return;
            }
        }
    }
    debug!(%peer, "client disconnected");
}
