//! HDQL CLI
//!
//! Command-line surface for the HDQL query engine:
//! - `execute` runs a query and renders the result (text, JSON or CBOR)
//! - `parse` prints the canonical form and AST of a query
//! - `explain` prints the compiled execution plan
//! - `repl` starts an interactive session
//!
//! Exit codes: 0 success, 1 parse error, 2 compile error, 3 execution error
//! (including timeouts and store failures).

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use hdql_engine::{EngineConfig, QueryEngine, QueryError, QueryOptions, QueryResult};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod render;
mod repl;
mod store;

use render::OutputFormat;

#[derive(Parser)]
#[command(name = "hdql")]
#[command(
    author,
    version,
    about = "HDQL: structured semantic queries over embedded entities"
)]
struct Cli {
    /// Ingestion bundle (`.json`) or snapshot file to query
    #[arg(long, global = true)]
    store: Option<PathBuf>,
    /// Engine configuration (TOML); falls back to `$HDQL_CONFIG`
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Log more (`-v` debug, `-vv` trace); `RUST_LOG` overrides
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a query and print the result.
    Execute {
        query: String,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
        /// Keep at most this many results
        #[arg(long)]
        limit: Option<usize>,
        /// Write the result here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Report coverage gaps and opportunities instead of plain results
        #[arg(long)]
        analyze: bool,
        /// Abort once the query has run this long
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Print the canonical form and AST of a query.
    Parse {
        query: String,
        /// Print the AST as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the execution plan with cost estimates and index hints.
    Explain { query: String },

    /// Interactive session with history and entity browsing.
    Repl {
        /// Append-only history log (default `~/.hdql_history`)
        #[arg(long)]
        history: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", "error:".red().bold());
            let query_error = err.downcast_ref::<QueryError>();
            if let Some(trace) = query_error.and_then(QueryError::partial_trace) {
                let mut text = String::new();
                render::trace_text(&mut text, trace);
                eprint!("{text}");
            }
            let code = query_error.map_or(3, QueryError::exit_code);
            ExitCode::from(u8::try_from(code).unwrap_or(3))
        }
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Parse { query, json } => cmd_parse(&query, json),
        Commands::Explain { query } => {
            let engine = engine(cli.store.as_deref(), config)?;
            print!("{}", engine.explain(&query)?);
            Ok(())
        }
        Commands::Execute {
            query,
            format,
            limit,
            output,
            analyze,
            timeout_ms,
        } => {
            let engine = engine(cli.store.as_deref(), config)?;
            let options = QueryOptions {
                limit,
                timeout: timeout_ms.map(Duration::from_millis),
            };
            cmd_execute(&engine, &query, options, analyze, format, output.as_deref())
        }
        Commands::Repl { history } => {
            let engine = engine(cli.store.as_deref(), config)?;
            let history = history.or_else(default_history_path);
            repl::cmd_repl(engine, history)
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let from_env = std::env::var_os("HDQL_CONFIG").map(PathBuf::from);
    match path.map(Path::to_path_buf).or(from_env) {
        Some(path) => Ok(EngineConfig::load_or_default(&path)?),
        None => Ok(EngineConfig::default()),
    }
}

fn engine(store: Option<&Path>, config: EngineConfig) -> Result<QueryEngine> {
    let store = store::open_store(store, &config)?;
    Ok(QueryEngine::new(store, config))
}

fn default_history_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".hdql_history"))
}

fn cmd_parse(query: &str, json: bool) -> Result<()> {
    let ast = hdql_dsl::parse_query(query).map_err(QueryError::from)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&ast)?);
    } else {
        println!("{} {ast}", "canonical:".bold());
        println!("{ast:#?}");
    }
    Ok(())
}

fn cmd_execute(
    engine: &QueryEngine,
    query: &str,
    options: QueryOptions,
    analyze: bool,
    format: OutputFormat,
    output: Option<&Path>,
) -> Result<()> {
    let result = if analyze {
        QueryResult::Analysis(engine.analyze(query, options)?)
    } else {
        engine.execute(query, options)?
    };

    match output {
        Some(path) => {
            if format == OutputFormat::Text {
                colored::control::set_override(false);
            }
            let bytes = render::encode(&result, format)?;
            fs::write(path, bytes)
                .map_err(|e| anyhow!("failed to write {}: {e}", path.display()))?;
            eprintln!("{} wrote {}", "ok:".green().bold(), path.display());
        }
        None => {
            let bytes = render::encode(&result, format)?;
            let mut stdout = io::stdout().lock();
            stdout.write_all(&bytes)?;
            stdout.flush()?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn execute_flags_parse() {
        let cli = Cli::try_parse_from([
            "hdql",
            "--store",
            "bundle.json",
            "execute",
            "command(\"deps\")",
            "--format",
            "json",
            "--limit",
            "5",
            "--timeout-ms",
            "250",
        ])
        .unwrap();
        match cli.command {
            Commands::Execute {
                format,
                limit,
                timeout_ms,
                analyze,
                ..
            } => {
                assert_eq!(format, OutputFormat::Json);
                assert_eq!(limit, Some(5));
                assert_eq!(timeout_ms, Some(250));
                assert!(!analyze);
            }
            _ => panic!("expected execute"),
        }
        assert_eq!(cli.store, Some(PathBuf::from("bundle.json")));
    }

    #[test]
    fn parse_errors_map_to_exit_code_one() {
        let err = cmd_parse("command(", false).unwrap_err();
        assert_eq!(err.downcast_ref::<QueryError>().map(QueryError::exit_code), Some(1));
    }
}
