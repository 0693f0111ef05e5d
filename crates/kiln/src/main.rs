//! Exercise the kiln runtime from the command line.
//!
//! # Examples
//!
//! ```sh
//! # Push 12 synthetic generations through a 6/min limiter with 3 workers
//! kiln simulate --prompt "red fox" --count 12 --rate 6 --workers 3
//!
//! # Every 4th generation fails with a retryable 503
//! kiln -v simulate --count 8 --fail-every 4 --out /tmp/kiln-out
//!
//! # See how a turn would be trimmed to a 4k window
//! kiln budget --system prompt.md --history transcript.txt \
//!   --message "Make the banner warmer" --limit 4096
//! ```

use clap::{Parser, Subcommand};
use kiln::prelude::*;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "kiln", version)]
struct Cli {
    /// Log verbosity on stderr (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a synthetic batch through the rate limiter and ticket pool and
    /// print the batch summary as JSON
    Simulate {
        /// Prompt for every ticket in the batch
        #[arg(long, default_value = "test pattern")]
        prompt: String,

        /// Number of tickets
        #[arg(long, default_value_t = 4)]
        count: usize,

        /// Generations allowed per rolling minute
        #[arg(long, default_value_t = 10)]
        rate: usize,

        /// Worker tasks
        #[arg(long, default_value_t = 4)]
        workers: usize,

        /// Simulated generation latency in milliseconds
        #[arg(long, default_value_t = 200)]
        latency_ms: u64,

        /// Fail every Nth generation attempt with HTTP 503 (0 = never)
        #[arg(long, default_value_t = 0)]
        fail_every: usize,

        /// Directory artifacts are written to (default: system temp dir)
        #[arg(long)]
        out: Option<PathBuf>,

        /// Give up waiting for the batch after this many seconds
        #[arg(long, default_value_t = 600)]
        timeout_secs: u64,
    },

    /// Trim a turn's context to the budget and print the result as JSON
    Budget {
        /// File holding the system prompt
        #[arg(long)]
        system: Option<PathBuf>,

        /// File holding the skills section
        #[arg(long)]
        skills: Option<PathBuf>,

        /// File holding the conversation history
        #[arg(long)]
        history: Option<PathBuf>,

        /// The user's message
        #[arg(long, default_value = "")]
        message: String,

        /// Model context window in tokens
        #[arg(long, default_value_t = 128_000)]
        limit: usize,

        /// Print only the report, not the trimmed text
        #[arg(long)]
        report_only: bool,
    },
}

// ── Helpers ────────────────────────────────────────────────────────

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .init();
}

fn read_section(path: Option<&PathBuf>) -> Result<String, String> {
    match path {
        Some(p) => std::fs::read_to_string(p)
            .map_err(|e| format!("failed to read '{}': {e}", p.display())),
        None => Ok(String::new()),
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("failed to serialize output: {e}"))
}

// ── Commands ───────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
async fn simulate(
    prompt: String,
    count: usize,
    rate: usize,
    workers: usize,
    latency_ms: u64,
    fail_every: usize,
    out: Option<PathBuf>,
    timeout_secs: u64,
) -> Result<String, String> {
    let out = out.unwrap_or_else(|| std::env::temp_dir().join("kiln-simulate"));
    tokio::fs::create_dir_all(&out)
        .await
        .map_err(|e| format!("failed to create '{}': {e}", out.display()))?;

    let attempts = Arc::new(AtomicUsize::new(0));
    let generator = FnGenerator(move |ticket: Ticket| {
        let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let path = out.join(format!("{}.txt", ticket.id));
        async move {
            tokio::time::sleep(Duration::from_millis(latency_ms)).await;
            if fail_every > 0 && attempt % fail_every == 0 {
                return Err(GenerationError::http(503, "synthetic outage"));
            }
            tokio::fs::write(&path, ticket.prompt.as_bytes())
                .await
                .map_err(|e| GenerationError::Other(e.to_string()))?;
            Ok::<_, GenerationError>(path)
        }
    });

    let config = RuntimeConfig::default()
        .with_limits(rate, workers)
        .with_retry(RetryConfig::default().with_initial_delay(Duration::from_millis(200)));
    let runtime = GenerationRuntime::build(config, Arc::new(generator), Arc::new(LoggingSink));

    let pool = runtime.pool();
    let batch = TicketPool::new_batch_id();
    for _ in 0..count {
        pool.submit(prompt.clone(), Params::new(), Some(&batch))
            .map_err(|e| e.to_string())?;
    }
    info!("Submitted {count} tickets as {batch}");

    let summary = pool
        .wait_for_batch(&batch, Some(Duration::from_secs(timeout_secs)))
        .await;
    info!("Batch {batch}: {}", summary.to_log_string());
    runtime.shutdown().await;
    to_json(&summary)
}

fn budget(
    system: Option<PathBuf>,
    skills: Option<PathBuf>,
    history: Option<PathBuf>,
    message: String,
    limit: usize,
    report_only: bool,
) -> Result<String, String> {
    let system = read_section(system.as_ref())?;
    let skills = read_section(skills.as_ref())?;
    let history = read_section(history.as_ref())?;

    let manager =
        ContextBudgetManager::new(ContextBudgetConfig::default().with_total_limit(limit));
    let ctx = manager.check_and_trim(&system, &skills, &history, &message);
    info!("{}", ctx.report.to_log_string());
    if report_only {
        to_json(&ctx.report)
    } else {
        to_json(&ctx)
    }
}

async fn run(cli: Cli) -> Result<String, String> {
    match cli.command {
        Command::Simulate {
            prompt,
            count,
            rate,
            workers,
            latency_ms,
            fail_every,
            out,
            timeout_secs,
        } => {
            simulate(
                prompt,
                count,
                rate,
                workers,
                latency_ms,
                fail_every,
                out,
                timeout_secs,
            )
            .await
        }
        Command::Budget {
            system,
            skills,
            history,
            message,
            limit,
            report_only,
        } => budget(system, skills, history, message, limit, report_only),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(output) => println!("{output}"),
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}
