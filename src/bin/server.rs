//! Schema Server CLI
//!
//! Runs the aggregation server, or validates and diffs schema projects
//! offline.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use schema_server::changelog::ChangeLogDiffEntry;
use schema_server::transport::FileSystemPackageLoader;
use schema_server::{
    ChangeLogDiffFactory, CompilerAdapter, ParsedPackage, Schema, SchemaServer, SchemaServerConfig,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "schema-server")]
#[command(about = "Aggregate and validate schemas from file, git and push sources")]
struct Cli {
    /// Path to a configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server until interrupted
    Serve,

    /// Compile a project directory and report diagnostics
    Check {
        /// Project root (contains taxi.toml, or the sources directly)
        path: PathBuf,
    },

    /// Show the changelog diff between two project directories
    Diff {
        /// Project before the change
        old: PathBuf,
        /// Project after the change
        new: PathBuf,
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Print the effective configuration
    Config,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = cli.config.as_deref().and_then(Path::to_str);
    let config = SchemaServerConfig::load_from(config_path).context("failed to load configuration")?;

    match cli.command {
        Commands::Serve => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(serve(config))?;
        }

        Commands::Check { path } => {
            let parsed = compile_project(&path, &config)?;
            for message in &parsed.messages {
                println!("{}", message);
            }
            if !parsed.is_valid() {
                bail!(
                    "{} has errors in {} source(s)",
                    parsed.identifier(),
                    parsed.sources_with_errors.len()
                );
            }
            println!(
                "✓ {} ({} types, {} services)",
                parsed.identifier(),
                parsed.document.types.len(),
                parsed.document.services.len()
            );
        }

        Commands::Diff { old, new, format } => {
            let old = compile_project(&old, &config)?;
            let new = compile_project(&new, &config)?;
            for parsed in [&old, &new] {
                if !parsed.is_valid() {
                    bail!("{} does not compile, run `check` for details", parsed.identifier());
                }
            }

            let factory = ChangeLogDiffFactory::new(config.changelog.excluded_namespaces.clone())
                .with_type_details(config.changelog.include_type_details);
            let diffs = factory.build_diffs(
                &Schema::merge([old.document.as_ref()]),
                &Schema::merge([new.document.as_ref()]),
            );
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&diffs)?),
                OutputFormat::Text if diffs.is_empty() => println!("No changes"),
                OutputFormat::Text => {
                    for diff in &diffs {
                        print_diff(diff, 0);
                    }
                }
            }
        }

        Commands::Config => {
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}

async fn serve(config: SchemaServerConfig) -> anyhow::Result<()> {
    let server = SchemaServer::new(&config)?;
    let mut subscription = server.store().subscribe();
    server.start().await?;

    let store = server.store().clone();
    let reporter = tokio::spawn(async move {
        let mut last_reported = store.changelog().latest().map(|entry| entry.timestamp);
        while let Some(schema_set) = subscription.recv().await {
            info!(generation = schema_set.generation, "{}", schema_set.summary());
            let unseen: Vec<_> = store
                .changelog_entries()
                .into_iter()
                .rev()
                .filter(|entry| last_reported.map_or(true, |seen| entry.timestamp > seen))
                .collect();
            for entry in unseen {
                for diff in &entry.diffs {
                    info!(kind = ?diff.kind, member = %diff.schema_member, "{}", diff.display_name);
                }
                last_reported = Some(entry.timestamp);
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    reporter.abort();
    server.stop();
    Ok(())
}

fn compile_project(path: &Path, config: &SchemaServerConfig) -> anyhow::Result<ParsedPackage> {
    let loader = FileSystemPackageLoader::unwatched(path, &config.file);
    let package = loader
        .load_now()
        .with_context(|| format!("failed to load {}", path.display()))?;
    Ok(CompilerAdapter::default().validate(&[], package))
}

fn print_diff(diff: &ChangeLogDiffEntry, depth: usize) {
    println!("{}{:?}: {}", "  ".repeat(depth), diff.kind, diff.display_name);
    for child in &diff.children {
        print_diff(child, depth + 1);
    }
}
