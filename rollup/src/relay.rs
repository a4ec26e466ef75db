//! The assembled relay.
//!
//! A [`Relay`] owns one accumulator shared by the ingest server and the flush
//! scheduler. Both stop on the same shutdown signal. Ingest is joined first so
//! that no sample lands after the final drain, then the scheduler, then the
//! accumulator is drained one last time.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use rollup_signal::{RegisterError, Watcher};
use rollup_window::{Cycle, Emit, FlushReport, Store};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::{
    config::{self, Config},
    flusher, ingest,
    sink::{self, Sink},
};

/// Errors produced by [`Relay`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// See [`crate::config::Error`].
    #[error(transparent)]
    Config(#[from] config::Error),
    /// See [`crate::sink::Error`].
    #[error(transparent)]
    Sink(#[from] sink::Error),
    /// See [`crate::ingest::Error`].
    #[error(transparent)]
    Ingest(#[from] ingest::Error),
    /// See [`crate::flusher::Error`].
    #[error(transparent)]
    Flusher(#[from] flusher::Error),
    /// Shutdown was signaled before the relay started.
    #[error("failed to register shutdown watcher: {0}")]
    Register(#[from] RegisterError),
    /// A relay task panicked.
    #[error("relay task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug)]
/// The ingest server and flush scheduler around one accumulator.
pub struct Relay {
    cycle: Arc<Cycle<Sink>>,
    server: ingest::Server,
    flusher: flusher::Flusher<Sink>,
}

impl Relay {
    /// Validate `config`, open the sink and bind the ingest server.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the sink cannot be
    /// opened or the ingest address cannot be bound.
    pub async fn bind(config: Config, shutdown: Watcher) -> Result<Self, Error> {
        let width = config.validate()?;
        let sink = Sink::new(&config.sink)?;

        let store = Arc::new(Store::new(width));
        let cycle = Arc::new(Cycle::new(
            store,
            config.mode,
            config.expire_seconds,
            sink,
        ));

        let server = ingest::Server::bind(config.ingest, shutdown.register()?).await?;
        let flusher = flusher::Flusher::new(
            Arc::clone(&cycle),
            Duration::from_secs(config.retention_seconds),
            shutdown,
        );
        info!(
            addr = %server.local_addr()?,
            retention = config.retention_seconds,
            expire = config.expire_seconds,
            mode = %config.mode,
            "relay bound"
        );

        Ok(Self {
            cycle,
            server,
            flusher,
        })
    }

    /// The address the ingest server is listening on.
    ///
    /// # Errors
    ///
    /// Function will return an error if the socket address cannot be read.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.server.local_addr()?)
    }

    /// Run the relay until shutdown, then drain the accumulator.
    ///
    /// # Errors
    ///
    /// Returns the first error of the ingest server or the scheduler. The
    /// final drain runs regardless.
    pub async fn run(self) -> Result<FlushReport, Error> {
        let Self {
            cycle,
            server,
            flusher,
        } = self;

        let ingest_handle = tokio::spawn(server.run(Arc::clone(cycle.store())));
        let flusher_handle = tokio::spawn(flusher.run());
        finish(cycle, ingest_handle, flusher_handle).await
    }
}

/// Join ingest, then the scheduler, then drain `cycle`. Errors are returned
/// only after the drain.
async fn finish<E>(
    cycle: Arc<Cycle<E>>,
    ingest_handle: JoinHandle<Result<(), ingest::Error>>,
    flusher_handle: JoinHandle<Result<(), flusher::Error>>,
) -> Result<FlushReport, Error>
where
    E: Emit + Send + 'static,
{
    let ingest_res = ingest_handle.await;
    match &ingest_res {
        Ok(Ok(())) => info!("ingest stopped"),
        Ok(Err(err)) => error!("ingest failed: {err}"),
        Err(err) => error!("ingest task failed: {err}"),
    }
    let flusher_res = flusher_handle.await;
    match &flusher_res {
        Ok(Ok(())) => info!("flush scheduler stopped"),
        Ok(Err(err)) => error!("flush scheduler failed: {err}"),
        Err(err) => error!("flush scheduler task failed: {err}"),
    }

    let report = tokio::task::spawn_blocking(move || cycle.drain()).await?;
    info!(
        emitted = report.emitted,
        failed = report.failed,
        "accumulator drained"
    );

    ingest_res??;
    flusher_res??;
    Ok(report)
}
