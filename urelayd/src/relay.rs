use std::{sync::Arc, time::Duration};

use urelay_broker::{SessionContext, Termination, TerminationSignal};

use crate::{
    config::RelayConfig,
    ingest::{DatagramFilter, UdpIngestLoop},
    RelayResult,
};

/// How long shutdown waits for the broker session to flush and detach
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Raise [`Termination::Shutdown`] on Ctrl-C. The listener task ends on its
/// own once termination is raised for any other reason.
pub fn shutdown_on_ctrl_c(termination: Arc<TerminationSignal>) {
    tokio::spawn(async move {
        tokio::select! {
            res = tokio::signal::ctrl_c() => match res {
                Ok(()) => {
                    log::info!("Interrupt received, shutting down");
                    termination.raise(Termination::Shutdown);
                }
                Err(e) => log::warn!("Unable to listen for Ctrl-C: {e}"),
            },
            _ = termination.raised() => {}
        }
    });
}

/// Ingest side of the relayer. Waits for the broker sender to become ready,
/// binds the UDP socket and relays until termination is raised.
///
/// Returns the termination cause. A failed bind raises
/// [`Termination::Fault`] so the session thread stops too, then returns the
/// bind error.
pub async fn relay(config: RelayConfig, context: SessionContext) -> RelayResult<Termination> {
    let termination = context.termination.clone();

    log::info!("Waiting for the AMQP sender to become ready...");
    if !context.readiness.wait_or_terminated(&termination).await {
        return Ok(termination.cause().unwrap_or(Termination::Fault));
    }

    log::info!("Binding UDP socket to {}", config.bind);
    let ingest = match UdpIngestLoop::bind(
        config.bind,
        DatagramFilter::from_config(&config),
        context.handle.clone(),
        termination.clone(),
    )
    .await
    {
        Ok(ingest) => ingest,
        Err(e) => {
            termination.raise(Termination::Fault);
            return Err(e);
        }
    };

    ingest.run().await;
    Ok(termination.cause().unwrap_or(Termination::Shutdown))
}

/// Process exit status for the outcome of [`relay`]: 0 only for a requested
/// shutdown.
pub fn exit_status(outcome: &RelayResult<Termination>) -> u8 {
    match outcome {
        Ok(Termination::Shutdown) => 0,
        Ok(Termination::Fault) | Err(_) => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RelayError;

    #[test]
    fn only_shutdown_exits_cleanly() {
        assert_eq!(exit_status(&Ok(Termination::Shutdown)), 0);
        assert_eq!(exit_status(&Ok(Termination::Fault)), 1);
        assert_eq!(
            exit_status(&Err(RelayError::Config("missing queue".to_string()))),
            1
        );
    }
}
