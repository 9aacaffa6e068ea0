//! Parse a settings document and resolve keys against it from the command
//! line. Useful for checking what a document will actually serve before it
//! is published.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use beacon_core::StaticFlights;
use beacon_scope::FilterProviders;
use beacon_settings::{parse_document, SettingsResolver};

#[derive(Parser, Debug)]
#[command(name = "settings-inspect", about = "Inspect a beacon settings document")]
struct Cli {
    /// Path to the settings document (JSON).
    document: String,

    /// Collection path to resolve, e.g. "Feature\\X".
    #[arg(long)]
    path: Option<String>,

    /// Setting key to resolve; requires --path.
    #[arg(long, requires = "path")]
    key: Option<String>,

    /// Flights to treat as enabled, comma-separated.
    #[arg(long, value_delimiter = ',')]
    flights: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let text = std::fs::read_to_string(&cli.document)
        .with_context(|| format!("reading {}", cli.document))?;
    let document = parse_document(&text, &cli.document, None)
        .with_context(|| format!("parsing {}", cli.document))?;

    println!("version: {}", document.version);
    println!("scopes:  {}", document.scopes.len());

    let mut providers = FilterProviders::new();
    providers.register_flights(Arc::new(StaticFlights::new(cli.flights.clone())));
    let resolver = SettingsResolver::for_document(providers, &document);

    match (cli.path, cli.key) {
        (Some(path), Some(key)) => {
            match resolver
                .lookup_async(&document.settings, &path, &key)
                .await
            {
                Some(value) => println!("{}\\{} = {}", path, key, value),
                None => println!("{}\\{} is not set", path, key),
            }
        }
        (Some(path), None) => {
            let Some(possibilities) = document.settings.get(&path) else {
                println!("no settings under {}", path);
                return Ok(());
            };
            for (name, candidates) in possibilities.iter() {
                for candidate in candidates {
                    match &candidate.scope {
                        Some(scope) => {
                            println!("{} = {}  [when {}]", name, candidate.value, scope)
                        }
                        None => println!("{} = {}", name, candidate.value),
                    }
                }
            }
        }
        _ => {
            for (path, possibilities) in document.settings.iter() {
                println!("{} ({} settings)", path, possibilities.names().count());
            }
        }
    }

    Ok(())
}
