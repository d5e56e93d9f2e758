use clap::Parser;
use std::{process::ExitCode, sync::Arc};

use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_log::LogTracer;
use tracing_subscriber::FmtSubscriber;

use urelay_broker::{
    transport::amqp::AmqpTransport, ConnectionSupervisor, SessionContext, Termination,
};
use urelayd::{
    config::{Args, RelayConfig},
    relay::{exit_status, relay, shutdown_on_ctrl_c, SHUTDOWN_GRACE},
    RelayResult,
};

fn main() -> ExitCode {
    let args = Args::parse();

    let _guard = match init_logging(&args) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Unable to set up logging: {e}");
            return ExitCode::FAILURE;
        }
    };

    let outcome = run(args);
    match &outcome {
        Ok(Termination::Shutdown) => log::info!("Relayer stopped"),
        Ok(Termination::Fault) => {
            log::error!("Relayer terminated after an unrecoverable broker failure")
        }
        Err(e) => log::error!("Relayer failed: {e}"),
    }
    ExitCode::from(exit_status(&outcome))
}

/// Route `log` records into tracing and install the subscriber. The returned
/// guard flushes the rolling file writer and must live until exit.
fn init_logging(args: &Args) -> Result<Option<WorkerGuard>, Box<dyn std::error::Error>> {
    LogTracer::init()?;

    let Some(dir) = &args.log_dir else {
        let sub = FmtSubscriber::builder()
            .with_max_level(args.log_level)
            .with_writer(std::io::stderr)
            .finish();
        tracing::subscriber::set_global_default(sub)?;
        return Ok(None);
    };

    let log = rolling::daily(dir, "urelayd.log");
    let (nb, guard) = tracing_appender::non_blocking(log);
    let sub = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_writer(nb)
        .with_ansi(false)
        .finish();
    tracing::subscriber::set_global_default(sub)?;
    Ok(Some(guard))
}

fn run(args: Args) -> RelayResult<Termination> {
    let config = RelayConfig::try_from(args)?;
    // surface address and credential problems before the session thread starts
    AmqpTransport::new(&config.broker)?;

    log::info!(
        "Relaying {} to {} on {}",
        config.bind,
        config.broker.queue,
        config.broker.address
    );
    if config.quadkeys {
        log::info!("Tile keys enabled at level {}", config.quadkey_level);
    }

    let context = SessionContext::default();
    let session_exit = ConnectionSupervisor::new(
        Arc::new(config.broker.clone()),
        context.clone(),
        AmqpTransport::new,
    )
    .spawn()?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        shutdown_on_ctrl_c(context.termination.clone());
        let outcome = relay(config, context).await;

        if !session_exit.wait(SHUTDOWN_GRACE).await {
            log::warn!("Broker session still closing after {SHUTDOWN_GRACE:?}, exiting anyway");
        }
        outcome
    })
}
