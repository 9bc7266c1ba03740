//! vaultsync client: one backup, restore or two-way sync job per run.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;

use vaultsync::cli::ClientOpts;
use vaultsync::logger::{init_tracing, Logger, NoopLogger, Tee, TextLogger};
use vaultsync::net::client::{run_job, JobParams};
use vaultsync::orchestrator::AbortFlag;
use vaultsync::progress::ProgressLogger;
use vaultsync::url::parse_remote_url;

fn main() -> Result<()> {
    let opts = ClientOpts::parse();
    init_tracing(if opts.verbose { "debug" } else { "warn" });

    let remote = parse_remote_url(&opts.url).with_context(|| {
        format!("invalid remote {:?}; expected vault://host[:port]/folder", opts.url)
    })?;

    // First Ctrl-C stops new files from starting; the second exits
    let abort = AbortFlag::new();
    {
        let abort = abort.clone();
        ctrlc::set_handler(move || {
            if abort.is_aborted() {
                std::process::exit(130);
            }
            eprintln!("\nInterrupted; letting files in flight finish (Ctrl-C again to exit)...");
            abort.abort();
        })
        .context("installing Ctrl-C handler")?;
    }

    let mut sinks: Vec<Box<dyn Logger>> = Vec::new();
    if let Some(ref p) = opts.log_file {
        sinks.push(Box::new(
            TextLogger::new(p).with_context(|| format!("opening log file {}", p.display()))?,
        ));
    }
    if opts.progress {
        sinks.push(Box::new(ProgressLogger::new(opts.verbose)));
    }
    let logger: Arc<dyn Logger> = if sinks.is_empty() {
        Arc::new(NoopLogger)
    } else {
        Arc::new(Tee(sinks))
    };

    let params = JobParams {
        port: remote.port,
        dry_run: opts.dry_run,
        max_connections: opts.max_connections,
        max_packet_size: opts.max_packet_size,
        ignore_hidden: opts.ignore_hidden,
        ignore_system: opts.ignore_system,
        ignored_patterns: opts.ignored_patterns.clone(),
        expected_backup_type: opts.backup_type,
        keep_alive: Duration::from_millis(opts.keep_alive_ms),
        compact_log: opts.compact_log,
        ..JobParams::new(&opts.source, &remote.host, &remote.folder, opts.direction)
    }
    .credentials(&opts.user, &opts.password);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    let summary = rt.block_on(run_job(&params, logger, abort))?;

    println!(
        "{}: {} sent, {} received, {} deleted, {} skipped, {} failed, {} conflicts ({:.1} MB in {:.1}s){}",
        params.direction.as_str(),
        summary.sent,
        summary.received,
        summary.deleted,
        summary.not_ready,
        summary.failed + summary.cancelled,
        summary.conflicts.len(),
        summary.bytes as f64 / 1_048_576.0,
        summary.elapsed.as_secs_f64(),
        if opts.dry_run { " [dry run]" } else { "" }
    );
    for (path, reason) in &summary.problems {
        eprintln!("  {}: {}", path, reason);
    }
    for path in &summary.conflicts {
        eprintln!("  conflict: {}", path);
    }
    if let Some(reason) = &summary.end_reason {
        eprintln!("server reported: {}", reason);
    }
    if !summary.is_success() {
        std::process::exit(1);
    }
    Ok(())
}
