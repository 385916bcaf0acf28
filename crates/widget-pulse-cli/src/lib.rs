//! `wp` command surface: the application controller that owns the identity
//! store and the event correlator, mapping page-lifecycle actions onto
//! subcommands.
//!
//! Stdout carries machine-parseable JSON only; logging goes to stderr.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use widget_pulse_core::{
    widget_catalog, widget_entry, widgets_in_category, DispatchOutcome, EventCorrelator,
    EventSink, IdentityRecord, IdentityStore, SessionError, SinkTransportError, SurveyResponses,
    WidgetCategory, WidgetEntry, UNKNOWN_WIDGET_ID,
};
use widget_pulse_sink_http::HttpEventSink;
use widget_pulse_store_sqlite::SqliteProfileStore;

#[derive(Debug, Parser)]
#[command(name = "wp")]
#[command(about = "WidgetPulse survey session CLI")]
pub struct Cli {
    #[arg(long, default_value = "./widget_pulse.sqlite3")]
    db: PathBuf,

    /// Remote collector endpoint. When unset the sink is disabled and
    /// dispatches settle as transport failures instead of being faked.
    #[arg(long)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create (or replace) the local identity and announce it to the sink.
    Register(RegisterArgs),
    /// Show the current registration state.
    Status,
    /// Submit a per-widget survey; requires a valid identity.
    Feedback(FeedbackArgs),
    /// Clear the in-memory and persisted identity. Debugging re-entry only.
    Reset,
    Catalog {
        #[command(subcommand)]
        command: CatalogCommand,
    },
}

#[derive(Debug, Args)]
pub struct RegisterArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    grade: String,
    #[arg(long)]
    phone: Option<String>,
}

#[derive(Debug, Args)]
pub struct FeedbackArgs {
    /// Widget page id (catalog slug).
    #[arg(long)]
    widget: String,
    /// Display title; defaults to the catalog title, else the page id.
    #[arg(long)]
    title: Option<String>,
    #[arg(long)]
    frequency: String,
    #[arg(long)]
    helpfulness: String,
    #[arg(long)]
    need: String,
}

#[derive(Debug, Subcommand)]
pub enum CatalogCommand {
    /// Resolve a page id to its numeric widget id.
    Resolve { page_id: String },
    /// List catalog entries, optionally for one category.
    List {
        #[arg(long)]
        category: Option<String>,
    },
}

#[derive(Debug, Serialize)]
struct StatusReport {
    registered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    record: Option<IdentityRecord>,
    ephemeral_session_id: String,
}

#[derive(Debug, Serialize)]
struct ResolvedWidget {
    page_id: String,
    numeric_id: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    category: Option<WidgetCategory>,
}

enum CliSink {
    Http(HttpEventSink),
    Disabled,
}

impl EventSink for CliSink {
    fn dispatch(&self, fields: &[(String, String)]) -> Result<String, SinkTransportError> {
        match self {
            Self::Http(sink) => sink.dispatch(fields),
            Self::Disabled => Err(SinkTransportError(
                "event sink disabled (no --endpoint configured)".to_string(),
            )),
        }
    }
}

/// Runs a fully parsed command line.
///
/// # Errors
/// Returns an error when the database cannot be opened or migrated, local
/// validation fails, or a catalog argument is invalid. Settled dispatch
/// failures are reported in the printed outcome, not as process errors.
pub fn run_cli(cli: Cli) -> Result<()> {
    init_tracing();

    match cli.command {
        Command::Catalog { command } => run_catalog(&command),
        Command::Register(args) => {
            let mut store = open_store(&cli.db)?;
            let correlator = build_correlator(cli.endpoint.as_deref());
            run_register(&args, &mut store, &correlator)
        }
        Command::Status => {
            let mut store = open_store(&cli.db)?;
            let record = store.current().cloned();
            let report = StatusReport {
                registered: record.as_ref().is_some_and(IdentityRecord::is_complete),
                record,
                ephemeral_session_id: store.ephemeral_session_id().to_string(),
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Feedback(args) => {
            let mut store = open_store(&cli.db)?;
            let correlator = build_correlator(cli.endpoint.as_deref());
            run_feedback(&args, &mut store, &correlator)
        }
        Command::Reset => {
            let mut store = open_store(&cli.db)?;
            store.reset()?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({ "reset": true }))?
            );
            Ok(())
        }
    }
}

fn run_register(
    args: &RegisterArgs,
    store: &mut IdentityStore<SqliteProfileStore>,
    correlator: &EventCorrelator<CliSink>,
) -> Result<()> {
    // Required-field validation happens here, before the store is touched.
    if args.name.trim().is_empty() || args.grade.trim().is_empty() {
        return Err(anyhow!("both --name and --grade must be non-empty"));
    }

    let record = store.register(&args.name, &args.grade, args.phone.as_deref())?;

    // Fire-and-forget: the identity is already durable, so the command
    // succeeds regardless of what the sink does.
    correlator.emit_registration(&record);

    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

fn run_feedback(
    args: &FeedbackArgs,
    store: &mut IdentityStore<SqliteProfileStore>,
    correlator: &EventCorrelator<CliSink>,
) -> Result<()> {
    let title = match &args.title {
        Some(title) => title.clone(),
        None => widget_entry(&args.widget)
            .map_or_else(|| args.widget.clone(), |entry| entry.title.to_string()),
    };

    let responses = SurveyResponses {
        frequency: args.frequency.clone(),
        helpfulness: args.helpfulness.clone(),
        need: args.need.clone(),
    };

    let identity = store.current().cloned();
    let outcome: DispatchOutcome = correlator
        .emit_feedback(identity.as_ref(), &args.widget, &title, &responses)
        .map_err(|err| match err {
            SessionError::Validation(message) => anyhow!(message),
            other => anyhow!(other),
        })?;

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

fn run_catalog(command: &CatalogCommand) -> Result<()> {
    match command {
        CatalogCommand::Resolve { page_id } => {
            let resolved = match widget_entry(page_id) {
                Some(entry) => ResolvedWidget {
                    page_id: page_id.clone(),
                    numeric_id: entry.numeric_id,
                    title: Some(entry.title),
                    category: Some(entry.category),
                },
                None => ResolvedWidget {
                    page_id: page_id.clone(),
                    numeric_id: UNKNOWN_WIDGET_ID,
                    title: None,
                    category: None,
                },
            };
            println!("{}", serde_json::to_string_pretty(&resolved)?);
            Ok(())
        }
        CatalogCommand::List { category } => {
            let entries: Vec<&WidgetEntry> = match category {
                Some(raw) => {
                    let parsed = WidgetCategory::parse(raw).ok_or_else(|| {
                        anyhow!(
                            "unknown category {raw} (expected one of: math, english, korean, social, science, etc)"
                        )
                    })?;
                    widgets_in_category(parsed)
                }
                None => widget_catalog().iter().collect(),
            };
            println!("{}", serde_json::to_string_pretty(&entries)?);
            Ok(())
        }
    }
}

fn open_store(db: &Path) -> Result<IdentityStore<SqliteProfileStore>> {
    let backend = SqliteProfileStore::open(db)?;
    backend.migrate()?;
    Ok(IdentityStore::new(backend))
}

fn build_correlator(endpoint: Option<&str>) -> EventCorrelator<CliSink> {
    let sink = match endpoint {
        Some(endpoint) => CliSink::Http(HttpEventSink::new(endpoint)),
        None => {
            tracing::debug!("no endpoint configured; events will not leave this machine");
            CliSink::Disabled
        }
    };
    EventCorrelator::new(sink)
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
