use std::error::Error;
use std::path::PathBuf;

use clap::ArgMatches;
use keyflush_core::config::Settings;
use keyflush_core::parser::AccessLogParser;
use keyflush_core::{Coordinator, generator, report};
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod cmdline;
mod setup_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    setup_tracing::register();

    let matches = cmdline::root_cli().get_matches();
    if let Err(e) = run(matches).await {
        error!("{e:?}");
        return Err(e.into());
    }
    info!("Exiting...");

    Ok(())
}

async fn run(matches: ArgMatches) -> keyflush_core::Result<()> {
    match matches.subcommand() {
        Some(("run", args)) => run_pipeline(args).await,
        Some(("generate", args)) => {
            generator::generate(&cmdline::generator_config(args)).await?;
            Ok(())
        }
        Some(("report", args)) => print_report(args).await,
        _ => Err(keyflush_core::Error::Config(
            "no subcommand given".to_string(),
        )),
    }
}

async fn run_pipeline(args: &ArgMatches) -> keyflush_core::Result<()> {
    let mut settings = Settings::load()?;
    cmdline::apply_run_args(&mut settings, args)?;
    let coordinator = Coordinator::new(settings)?;

    let cln_token = CancellationToken::new();
    let shutdown_cln_token = cln_token.clone();
    // wait for SIG{INT,TERM} and cancel the readers, the final flush still runs
    let shutdown_handle: JoinHandle<()> = tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_cln_token.cancel();
    });

    let result = coordinator.run(cln_token).await;
    if !shutdown_handle.is_finished() {
        shutdown_handle.abort();
    }

    let summary = result?;
    for source in &summary.sources {
        info!(
            source = %source.name,
            read = source.read,
            skipped = source.skipped,
            completed = source.completed,
            "Source summary"
        );
    }
    Ok(())
}

async fn print_report(args: &ArgMatches) -> keyflush_core::Result<()> {
    let folders: Vec<PathBuf> = args
        .get_many::<PathBuf>("folders")
        .map(|f| f.cloned().collect())
        .unwrap_or_default();
    let parser = AccessLogParser::new()?;
    let report = report::scan(&folders, &parser).await?;

    let json = args.get_flag("json");
    for summary in report.summaries() {
        if json {
            println!("{}", summary.to_json()?);
        } else {
            println!("{}", summary.to_text());
        }
    }
    info!(files = report.files, skipped = report.skipped, "Report done");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal"),
            Err(e) => {
                error!(error = ?e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received terminate signal");
            }
            Err(e) => {
                error!(error = ?e, "Failed to install terminate handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
