use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use runlimit::ratelimit::Timestamp;
use runlimit::{LimiterConfig, LimiterError, RateLimiter};

const EXIT_DENY: u8 = 1;
const EXIT_INVALID: u8 = 2;
const EXIT_UNAVAILABLE: u8 = 3;
const EXIT_CORRUPT: u8 = 4;

/// Bound how often a program or program group may run.
///
/// Exit status: 0 allowed (or success), 1 denied, 2 invalid input or
/// configuration, 3 store unavailable, 4 storage corrupt. Every invocation
/// prints one JSON object on stdout; a human-readable line goes to stderr
/// unless --quiet is given.
#[derive(Parser, Debug)]
#[command(name = "runlimit", version)]
struct Cli {
    /// YAML configuration file
    #[arg(long, global = true, env = "RUNLIMIT_CONFIG")]
    config: Option<PathBuf>,

    /// Ledger file shared by all cooperating processes
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Give up waiting for the store lock after this many milliseconds
    #[arg(long, global = true)]
    lock_timeout_ms: Option<u64>,

    /// Maximum identifier length in characters
    #[arg(long = "max-id-len", global = true)]
    max_id_len: Option<usize>,

    /// Append one line per attempt to this file
    #[arg(long, global = true)]
    audit_log: Option<PathBuf>,

    /// Suppress the human-readable line
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Increase log verbosity (repeatable)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record an invocation if the limit allows it
    Attempt {
        /// Program or program group name
        #[arg(long)]
        id: String,
        /// Maximum invocations per window
        #[arg(long)]
        max: u32,
        /// Window length in seconds (fractions allowed)
        #[arg(long, allow_negative_numbers = true)]
        window: f64,
        /// Free-text note for the audit log
        note: Vec<String>,
    },
    /// Forget all recorded invocations of an identifier
    Reset {
        #[arg(long)]
        id: String,
    },
    /// Show invocations still inside a window, without counting one
    Inspect {
        #[arg(long)]
        id: String,
        #[arg(long, allow_negative_numbers = true)]
        window: f64,
    },
    /// Remove records older than a window from the store
    Prune {
        #[arg(long)]
        id: String,
        #[arg(long, allow_negative_numbers = true)]
        window: f64,
    },
    /// List identifiers with recorded invocations
    List,
    /// Print the effective configuration as YAML
    Config,
}

/// One machine-readable line per invocation.
#[derive(Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
enum Report<'a> {
    Allow {
        id: &'a str,
        remaining: u32,
    },
    Deny {
        id: &'a str,
        remaining: u32,
        retry_after_secs: f64,
    },
    Usage {
        id: &'a str,
        window_secs: f64,
        count: usize,
        oldest: Option<Timestamp>,
        newest: Option<Timestamp>,
    },
    Reset {
        id: &'a str,
    },
    Pruned {
        id: &'a str,
        dropped: usize,
    },
    Identifiers {
        identifiers: Vec<String>,
    },
    Error {
        kind: &'static str,
        message: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    match run(&cli) {
        Ok(code) => code,
        Err(err) => {
            let kind = err
                .downcast_ref::<LimiterError>()
                .map(LimiterError::kind)
                .unwrap_or("internal");
            emit(&Report::Error {
                kind,
                message: format!("{:#}", err),
            });
            if !cli.quiet {
                eprintln!("runlimit: error: {:#}", err);
            }
            ExitCode::from(exit_code_for(&err))
        }
    }
}

fn init_tracing(verbose: u8, json: bool) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn run(cli: &Cli) -> anyhow::Result<ExitCode> {
    let config = load_config(cli)?;
    debug!(store = %config.store.path.display(), "Configuration loaded");

    // The store is opened lazily, so `config` never touches it.
    let limiter = RateLimiter::new(config);
    let code = dispatch(cli, &limiter);
    limiter.close();
    code
}

fn dispatch(cli: &Cli, limiter: &RateLimiter) -> anyhow::Result<ExitCode> {
    match &cli.command {
        Command::Attempt {
            id,
            max,
            window,
            note,
        } => {
            let window = window_arg(*window)?;
            let note = note.join(" ");
            let note = (!note.is_empty()).then_some(note.as_str());
            let decision = limiter
                .attempt_with_note(id, *max, window, note)
                .with_context(|| format!("attempt for {:?}", id))?;

            if decision.allowed {
                emit(&Report::Allow {
                    id,
                    remaining: decision.remaining,
                });
                say(cli, format!("ALLOW {}: {} call(s) remaining", id, decision.remaining));
                Ok(ExitCode::SUCCESS)
            } else {
                let retry = decision.retry_after.as_secs_f64();
                emit(&Report::Deny {
                    id,
                    remaining: decision.remaining,
                    retry_after_secs: retry,
                });
                say(cli, format!("DENY {}: limit reached, retry in {:.1}s", id, retry));
                Ok(ExitCode::from(EXIT_DENY))
            }
        }
        Command::Reset { id } => {
            limiter
                .reset(id)
                .with_context(|| format!("reset of {:?}", id))?;
            emit(&Report::Reset { id });
            say(cli, format!("{}: history cleared", id));
            Ok(ExitCode::SUCCESS)
        }
        Command::Inspect { id, window } => {
            let window_secs = *window;
            let usage = limiter
                .inspect_usage(id, window_arg(window_secs)?)
                .with_context(|| format!("inspect of {:?}", id))?;
            let span = match (usage.oldest, usage.newest) {
                (Some(oldest), Some(newest)) => {
                    format!(" (oldest {}, newest {})", oldest.to_rfc3339(), newest.to_rfc3339())
                }
                _ => String::new(),
            };
            say(
                cli,
                format!(
                    "{}: {} call(s) in the last {}s{}",
                    id, usage.count, window_secs, span
                ),
            );
            emit(&Report::Usage {
                id,
                window_secs,
                count: usage.count,
                oldest: usage.oldest,
                newest: usage.newest,
            });
            Ok(ExitCode::SUCCESS)
        }
        Command::Prune { id, window } => {
            let dropped = limiter
                .prune(id, window_arg(*window)?)
                .with_context(|| format!("prune of {:?}", id))?;
            emit(&Report::Pruned { id, dropped });
            say(cli, format!("{}: removed {} expired record(s)", id, dropped));
            Ok(ExitCode::SUCCESS)
        }
        Command::List => {
            let identifiers = limiter.identifiers().context("listing identifiers")?;
            if !cli.quiet {
                for id in &identifiers {
                    eprintln!("{}", id);
                }
            }
            emit(&Report::Identifiers { identifiers });
            Ok(ExitCode::SUCCESS)
        }
        Command::Config => {
            print!("{}", limiter.config().to_yaml()?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<LimiterConfig> {
    let mut config =
        LimiterConfig::load(cli.config.as_deref()).context("loading configuration")?;

    if let Some(store) = &cli.store {
        config.store.path = store.clone();
    }
    if let Some(timeout) = cli.lock_timeout_ms {
        config.store.lock_timeout_ms = timeout;
    }
    if let Some(max_len) = cli.max_id_len {
        config.max_identifier_len = max_len;
    }
    if let Some(audit_log) = &cli.audit_log {
        config.audit_log = Some(audit_log.clone());
    }

    config.validate().context("validating configuration")?;
    Ok(config)
}

/// Seconds from the command line as a window length.
fn window_arg(secs: f64) -> runlimit::Result<Duration> {
    Duration::try_from_secs_f64(secs).map_err(|_| {
        LimiterError::InvalidPolicy(format!("window must be a positive number of seconds, got {}", secs))
    })
}

fn emit(report: &Report<'_>) {
    match serde_json::to_string(report) {
        Ok(line) => println!("{}", line),
        Err(e) => tracing::error!(error = %e, "Failed to encode report"),
    }
}

fn say(cli: &Cli, line: String) {
    if !cli.quiet {
        eprintln!("{}", line);
    }
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<LimiterError>() {
        Some(LimiterError::InvalidIdentifier(_))
        | Some(LimiterError::InvalidPolicy(_))
        | Some(LimiterError::Config(_)) => EXIT_INVALID,
        Some(LimiterError::StorageCorrupt(_)) => EXIT_CORRUPT,
        Some(LimiterError::StoreUnavailable(_)) | None => EXIT_UNAVAILABLE,
    }
}
