use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;

use sftp_mirror::config::{Args, Endpoint, MirrorConfig};
use sftp_mirror::log::TransferLog;
use sftp_mirror::logger::{init_tracing, FanoutLogger, TextLogger, TracingLogger};
use sftp_mirror::mirror::{Mirror, MirrorReport};
use sftp_mirror::session::{LocalSession, SftpSession};

fn main() -> Result<()> {
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted by user. Exiting (Ctrl-C)...");
        // 128 + SIGINT
        std::process::exit(130);
    })
    .context("Error setting Ctrl-C handler")?;

    let args = Args::parse();
    let config = MirrorConfig::load(&args).context("invalid configuration")?;
    init_tracing(&config.log_level)?;

    let logger = build_logger(&config)?;
    let options = config.mirror_options();
    tracing::info!(
        src = %options.source_root.display(),
        dst = %options.destination_root.display(),
        workers = options.workers,
        "starting mirror"
    );

    let report = match config.endpoint {
        Endpoint::Sftp(ref sftp) => {
            let session = SftpSession::connect(sftp)
                .with_context(|| format!("failed to establish session with {}", sftp.addr()))?;
            let report = Mirror::new(&session, options, &logger).run();
            session.disconnect();
            report
        }
        Endpoint::Local => Mirror::new(&LocalSession::new(), options, &logger).run(),
    };

    print_summary(&report, args.verbose);
    Ok(())
}

fn build_logger(config: &MirrorConfig) -> Result<FanoutLogger> {
    let mut logger = FanoutLogger::new().with(Arc::new(TracingLogger));
    if let Some(ref path) = config.log_file {
        logger = logger.with(Arc::new(TextLogger::open(path)?));
    }
    if let Some(ref path) = config.journal {
        let journal = TransferLog::create(path)?;
        tracing::debug!(run_id = %journal.run_id(), path = %path.display(), "journal enabled");
        logger = logger.with(Arc::new(journal));
    }
    Ok(logger)
}

/// Transfer failures are reported here and never change the exit code
fn print_summary(report: &MirrorReport, verbose: bool) {
    let elapsed = report.elapsed.as_secs_f64();
    println!();
    println!("=== Mirror Complete ===");
    println!("Files copied: {}", report.files_copied());
    println!("Directories: {}", report.initial.directories);
    println!(
        "Total size: {:.2} MB",
        report.bytes_copied() as f64 / 1_048_576.0
    );
    println!("Time: {:.2}s", elapsed);
    if elapsed > 0.0 {
        println!(
            "Throughput: {:.2} MB/s",
            (report.bytes_copied() as f64 / 1_048_576.0) / elapsed
        );
    }
    if report.retry.attempted > 0 {
        println!(
            "Retried: {} ({} recovered)",
            report.retry.attempted, report.retry.succeeded
        );
    }

    if report.initial.walk_errors > 0 {
        println!("\nDirectories that could not be listed: {}", report.initial.walk_errors);
    }
    if !report.unrecovered.is_empty() {
        println!("\nFailed after retry: {}", report.unrecovered.len());
        if verbose {
            for task in &report.unrecovered {
                eprintln!("  - {}", task.source.display());
            }
        }
    }
    if !report.dropped.is_empty() {
        println!(
            "\nNot retried (retry queue full): {}",
            report.dropped.len()
        );
        if verbose {
            for task in &report.dropped {
                eprintln!("  - {}", task.source.display());
            }
        }
    }
}
