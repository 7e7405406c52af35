//! # nl2kql CLI
//!
//! Translate natural-language questions about log-analytics data into
//! validated KQL queries, grounded in an indexed workspace schema.
//!
//! ## Usage
//!
//! ```bash
//! nl2kql --config ./config/nl2kql.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `nl2kql init` | Create the database and seed example queries |
//! | `nl2kql ingest <snapshot.json>` | Index a schema snapshot |
//! | `nl2kql ask "<question>"` | Generate a validated KQL query |
//! | `nl2kql validate "<query>"` | Validate and auto-correct a query |
//! | `nl2kql feedback ...` | Record a verdict on a generated query |
//! | `nl2kql status` | Show collection counts and provider status |
//! | `nl2kql serve` | Start the HTTP server |
//!
//! ## Examples
//!
//! ```bash
//! nl2kql init
//! nl2kql ingest ./schema/workspace.json
//! nl2kql ask "Show me failed login attempts in the last week"
//! nl2kql feedback --question "failed logins" \
//!     --generated "SecurityEvent | where EventID == 4625" --rating good
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use nl2kql::config::load_config;
use nl2kql::ingest::{self, IngestOptions};
use nl2kql::server;
use nl2kql::workflow::{self, QueryRequest, WorkflowContext};
use nl2kql_core::models::{FeedbackRecord, Rating};
use nl2kql_core::validate::ValidationReport;

/// nl2kql: retrieval-grounded natural language to KQL.
#[derive(Parser)]
#[command(
    name = "nl2kql",
    about = "Translate natural-language questions into validated KQL queries",
    version,
    long_about = "nl2kql indexes a workspace's table schemas, field descriptions, sample values \
    and worked examples, retrieves the most relevant of them for each question, asks a language \
    model for a KQL query grounded in that context, and validates and auto-corrects the result."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/nl2kql.toml")]
    config: PathBuf,

    /// Log level filter when `RUST_LOG` is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database and seed built-in example queries.
    ///
    /// Idempotent: examples are only seeded into an empty collection.
    Init,

    /// Index a schema snapshot (JSON export of tables, columns and samples).
    Ingest {
        /// Path to the snapshot file.
        snapshot: PathBuf,

        /// Upsert into the existing collections instead of rebuilding them.
        #[arg(long)]
        append: bool,
    },

    /// Generate a KQL query for a question.
    Ask {
        question: String,

        /// Skip retrieval and generate from static schema hints only.
        #[arg(long)]
        no_rag: bool,

        /// Workspace identifier, passed through to logs.
        #[arg(long, default_value = "")]
        workspace: String,

        /// Print the full response as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Validate and auto-correct a KQL query against the indexed schema.
    Validate {
        query: String,

        #[arg(long)]
        json: bool,
    },

    /// Record feedback on a generated query.
    Feedback {
        /// The original question.
        #[arg(long)]
        question: String,

        /// The query that was generated.
        #[arg(long)]
        generated: String,

        /// A corrected query, if the generated one was wrong.
        #[arg(long)]
        corrected: Option<String>,

        /// `good` or `bad`.
        #[arg(long)]
        rating: Rating,
    },

    /// Show collection counts, refresh times and provider status.
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Start the HTTP server.
    Serve,
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn print_report(report: &ValidationReport) {
    println!("{}", report.corrected);
    println!();
    println!("valid: {}", report.is_valid);
    for c in &report.corrections {
        println!("  corrected: {}", c);
    }
    for w in &report.warnings {
        println!("  warning: {}", w);
    }
    for e in &report.errors {
        println!("  error: {}", e);
    }
    let cx = &report.complexity;
    println!(
        "complexity: {:.1} ({} impact), {} lines",
        cx.complexity_score, cx.performance_impact, cx.line_count
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let cfg = load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let ctx = WorkflowContext::open(cfg).await?;
            let seeded = ingest::seed_examples(&ctx).await?;
            println!("Database initialized successfully.");
            if seeded > 0 {
                println!("  seeded examples: {}", seeded);
            }
        }
        Commands::Ingest { snapshot, append } => {
            let snap = ingest::load_snapshot(&snapshot)?;
            let ctx = WorkflowContext::open(cfg).await?;
            let summary =
                ingest::run_ingest(&ctx, &snap, IngestOptions { replace: !append }).await?;
            println!("ingest {}", snapshot.display());
            println!("  tables: {}", summary.tables);
            println!("  field descriptions: {}", summary.field_descriptions);
            println!("  value sets: {}", summary.field_values);
            if summary.skipped_tables > 0 {
                println!("  skipped tables: {}", summary.skipped_tables);
            }
            if summary.generated_descriptions > 0 {
                println!("  generated descriptions: {}", summary.generated_descriptions);
            }
            if summary.degraded_embeddings > 0 {
                println!("  fallback embeddings: {}", summary.degraded_embeddings);
            }
            println!("ok");
        }
        Commands::Ask {
            question,
            no_rag,
            workspace,
            json,
        } => {
            let ctx = WorkflowContext::open(cfg).await?;
            let request = QueryRequest {
                natural_language: question,
                workspace_id: workspace,
                use_rag: !no_rag,
            };
            let response = workflow::answer(&ctx, &request).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                println!("{}", response.kql_query);
                println!();
                println!("valid: {}", response.is_valid);
                for w in &response.warnings {
                    println!("  warning: {}", w);
                }
                for e in &response.errors {
                    println!("  error: {}", e);
                }
                println!("context: {}", response.context_used.summary);
                if let Some(reason) = &response.fallback_reason {
                    println!("fallback: {}", reason);
                }
            }
        }
        Commands::Validate { query, json } => {
            let ctx = WorkflowContext::open(cfg).await?;
            let report = workflow::check_query(&ctx, &query).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
        }
        Commands::Feedback {
            question,
            generated,
            corrected,
            rating,
        } => {
            let ctx = WorkflowContext::open(cfg).await?;
            let record = FeedbackRecord {
                natural_language: question,
                generated_query: generated,
                corrected_query: corrected,
                rating,
            };
            let ack = workflow::record_feedback(&ctx, &record).await?;
            println!("feedback recorded");
            if let Some(id) = &ack.example_id {
                println!("  example: {} (used {} times)", id, ack.usage_count);
            }
        }
        Commands::Status { json } => {
            let ctx = WorkflowContext::open(cfg).await?;
            let report = workflow::status(&ctx).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("collections:");
                for c in &report.collections {
                    let refreshed = c
                        .last_refreshed
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "never".to_string());
                    println!("  {:<20} {:>6}  refreshed {}", c.kind.as_str(), c.count, refreshed);
                }
                println!("total items: {}", report.total_items);
                println!(
                    "embedding: {}{}",
                    report.embedding_provider,
                    if report.embedding_degraded { " (degraded)" } else { "" }
                );
                println!("generation: {}", report.generation_provider);
                if let Some(n) = report.feedback_records {
                    println!("feedback records: {}", n);
                }
            }
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
