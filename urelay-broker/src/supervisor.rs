use std::{sync::Arc, time::Duration};
use tokio::sync::oneshot;

use crate::{
    transport::{Transport, TransportError},
    BrokerConfig, BrokerSession, SessionContext, Termination,
};

/// Keeps a [`BrokerSession`] alive across attempts.
///
/// Each attempt gets a fresh transport from `make_transport`. A failed
/// attempt is retried after the configured retry interval; without one, the
/// failure raises [`Termination::Fault`] so the ingest side shuts down. A
/// transport that cannot even be built counts as a failure without retry.
pub struct ConnectionSupervisor<F> {
    config: Arc<BrokerConfig>,
    context: SessionContext,
    make_transport: F,
}

impl<T, F> ConnectionSupervisor<F>
where
    T: Transport,
    F: FnMut(&BrokerConfig) -> Result<T, TransportError>,
{
    pub fn new(config: Arc<BrokerConfig>, context: SessionContext, make_transport: F) -> Self {
        Self {
            config,
            context,
            make_transport,
        }
    }

    pub async fn run(mut self) {
        let termination = self.context.termination.clone();
        let mut attempt = 0u64;

        while !termination.is_raised() {
            attempt += 1;
            let transport = match (self.make_transport)(&self.config) {
                Ok(transport) => transport,
                Err(e) => {
                    log::error!("Unable to set up the broker connection: {e}");
                    termination.raise(Termination::Fault);
                    break;
                }
            };

            log::debug!("Starting broker session attempt {attempt}");
            let mut session =
                BrokerSession::new(self.config.clone(), transport, self.context.clone());

            match session.start().await {
                Ok(()) => {
                    termination.raise(Termination::Shutdown);
                    break;
                }
                Err(e) => {
                    let Some(interval) = self.config.retry_interval else {
                        log::error!("The relayer has terminated due to a broker error: {e}");
                        termination.raise(Termination::Fault);
                        break;
                    };

                    log::warn!("Broker session failed, retrying in {interval:?}");
                    tokio::select! {
                        biased;
                        _ = termination.raised() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
            }
        }

        log::info!("Connection supervisor exiting after {attempt} attempt(s)");
    }
}

impl<T, F> ConnectionSupervisor<F>
where
    T: Transport + 'static,
    F: FnMut(&BrokerConfig) -> Result<T, TransportError> + Send + 'static,
{
    /// Run on a dedicated, detached thread with its own single threaded
    /// runtime. The thread is never joined, shutdown goes through the
    /// termination signal; the returned [`SupervisorExit`] only reports when
    /// the last session has finished closing.
    pub fn spawn(self) -> std::io::Result<SupervisorExit> {
        let termination = self.context.termination.clone();
        let (done_tx, done) = oneshot::channel();

        std::thread::Builder::new()
            .name("broker-session".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        log::error!("Unable to build broker session runtime: {e}");
                        termination.raise(Termination::Fault);
                        return;
                    }
                };
                runtime.block_on(self.run());
                let _ = done_tx.send(());
            })?;

        Ok(SupervisorExit { done })
    }
}

/// Completion notice of a spawned [`ConnectionSupervisor`]
#[derive(Debug)]
pub struct SupervisorExit {
    done: oneshot::Receiver<()>,
}

impl SupervisorExit {
    /// Wait at most `grace` for the session thread to close its link and
    /// connection. Returns `false` if it was still busy. A thread that died
    /// without reporting counts as finished.
    pub async fn wait(self, grace: Duration) -> bool {
        tokio::time::timeout(grace, self.done).await.is_ok()
    }
}
