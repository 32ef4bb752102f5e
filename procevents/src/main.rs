use std::{process::ExitCode, time::Duration};

use anyhow::Context as _;
use clap::Parser;
use procevents::{
    bpf::EbpfBackend, lifecycle::Lifecycle, logger, shutdown::CancellationSignal,
    signal_handler::SignalHandler,
};
use tracing::info;

/// Bounds how long exit waits on blocking-pool work, such as a stdout write
/// to a reader that stopped draining.
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Streams process exec/exit events from the kernel as JSON lines on stdout.
///
/// Runs until SIGINT or SIGTERM; a second signal forces an immediate exit.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {}

fn main() -> ExitCode {
    let _cli = Cli::parse();

    let _log_guard = match logger::init_logging() {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> anyhow::Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(2)
        .thread_name("procevents")
        .build()
        .context("failed to build async runtime")?;

    let result = rt.block_on(async {
        let signal = CancellationSignal::new();
        SignalHandler::install(&signal)?;

        let artifact = aya::include_bytes_aligned!(concat!(env!("OUT_DIR"), "/procevents"));
        let backend = EbpfBackend::parse(artifact)?;
        Lifecycle::new(backend, signal)
            .run(Box::new(tokio::io::stdout()))
            .await?;

        info!("procevents exiting.");
        Ok::<(), anyhow::Error>(())
    });
    rt.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
    result
}
