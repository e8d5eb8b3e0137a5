use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pricewatch_core::{RowId, Session, TermDraft};
use pricewatch_stores::{ClientConfig, Dashboard, FetchOutcome};
use tracing_subscriber::prelude::*;

#[derive(Debug, Parser)]
#[command(name = "pricewatch")]
#[command(about = "Marketplace price tracker command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List saved searches with their current pricing
    Terms,
    Listings {
        #[arg(long)]
        term: Option<RowId>,
    },
    Folders,
    Timeline {
        #[arg(long = "term")]
        terms: Vec<String>,
        #[arg(long = "source")]
        sources: Vec<String>,
    },
    AddTerm {
        marketplace: String,
        term: String,
        #[arg(long)]
        include: Vec<String>,
        #[arg(long)]
        exclude: Vec<String>,
        #[arg(long)]
        prime_only: bool,
        #[arg(long)]
        file: Option<RowId>,
    },
    /// Replace the tags of one saved search
    Tag { term_id: RowId, tags: Vec<String> },
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn signed_in(dashboard: &Dashboard, config: &ClientConfig) -> Result<Session> {
    if let Ok(session) = dashboard.require_session().await {
        return Ok(session);
    }
    let Some((email, password)) = config.credentials() else {
        bail!("not signed in: set PRICEWATCH_EMAIL and PRICEWATCH_PASSWORD");
    };
    if !dashboard.auth.login(email, password).await {
        let message = dashboard.auth.error().await.unwrap_or_default();
        bail!("login failed: {message}");
    }
    dashboard.require_session().await.context("session after login")
}

/// Initializes auth and the cache watcher. Nothing works without auth, so a
/// failed initialization ends the command.
async fn start(dashboard: &Dashboard) -> Result<()> {
    if !dashboard.start().await {
        let message = dashboard.auth.error().await.unwrap_or_default();
        bail!("auth did not initialize: {message}");
    }
    Ok(())
}

fn ensure(name: &str, outcome: FetchOutcome) -> Result<()> {
    if let Some(message) = outcome.error() {
        bail!("loading {name} failed: {message}");
    }
    Ok(())
}

fn price(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{v:.2}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    tracing::debug!(?cli, "parsed arguments");
    let config = ClientConfig::from_env();
    let dashboard = Dashboard::from_config(&config).await?;
    start(&dashboard).await?;

    match cli.command.unwrap_or(Commands::Terms) {
        Commands::Terms => {
            let session = signed_in(&dashboard, &config).await?;
            ensure("terms", dashboard.terms.fetch_all(&session).await)?;
            for term in dashboard.terms.all().await {
                println!(
                    "{:>4}  {:<8} {:<40} current={} lowest={} offers={}",
                    term.id,
                    term.marketplace,
                    term.term,
                    price(term.pricing.current_price),
                    price(term.pricing.lowest_price),
                    term.pricing.offer_count.unwrap_or(0),
                );
            }
        }
        Commands::Listings { term } => {
            let session = signed_in(&dashboard, &config).await?;
            ensure("listings", dashboard.listings.fetch_all(&session).await)?;
            let rows = match term {
                Some(term_id) => dashboard.listings.for_term(term_id).await,
                None => dashboard.listings.all().await,
            };
            for listing in rows {
                println!(
                    "{:>5}  {:<8} {:>10} {}  {}",
                    listing.id,
                    listing.source,
                    price(listing.price),
                    listing.title,
                    listing.url.unwrap_or_default(),
                );
            }
        }
        Commands::Folders => {
            let session = signed_in(&dashboard, &config).await?;
            ensure("folders", dashboard.folders.fetch_folders(&session).await)?;
            for folder in dashboard.folders.folders().await {
                println!("{} ({})", folder.name, folder.id);
                for file in folder.files {
                    println!("  - {} ({})", file.name, file.id);
                }
            }
        }
        Commands::Timeline { terms, sources } => {
            let session = signed_in(&dashboard, &config).await?;
            ensure("timeline", dashboard.timeline.fetch_timeline(&session).await)?;
            dashboard.timeline.set_terms(terms).await;
            dashboard.timeline.set_sources(sources).await;
            let chart = dashboard.timeline.chart_data().await;
            for (key, series) in &chart.series {
                println!("{key}");
                for (i, date) in chart.dates.iter().enumerate() {
                    let (Some(min_price), offers) = (series.min_prices[i], series.offers[i]) else {
                        continue;
                    };
                    println!("  {date}  min={min_price:.2} offers={}", offers.unwrap_or(0));
                }
            }
        }
        Commands::AddTerm {
            marketplace,
            term,
            include,
            exclude,
            prime_only,
            file,
        } => {
            let session = signed_in(&dashboard, &config).await?;
            let draft = TermDraft {
                marketplace,
                term,
                include,
                exclude,
                prime_only,
                file_id: file,
            };
            let term = dashboard.terms.add_term(&session, draft).await?;
            println!("added term {} ({} on {})", term.id, term.term, term.marketplace);
        }
        Commands::Tag { term_id, tags } => {
            let session = signed_in(&dashboard, &config).await?;
            let tags = dashboard.tags.set_tags(&session, term_id, &tags).await?;
            println!("term {term_id} tags: {}", tags.join(", "));
        }
        Commands::Serve { port } => {
            if config.credentials().is_some() {
                signed_in(&dashboard, &config).await?;
            }
            pricewatch_web::serve(dashboard, port.unwrap_or(config.web_port)).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pricewatch_backend::MemoryBackend;
    use pricewatch_stores::auth::INIT_FAILED;
    use std::sync::Arc;

    #[tokio::test]
    async fn start_fails_when_auth_cannot_listen() {
        let backend = Arc::new(MemoryBackend::new());
        backend.fail_next("listen", "realtime unavailable").await;
        let dashboard = Dashboard::new(backend.clone(), backend, None);

        let err = start(&dashboard).await.expect_err("auth init fails");
        assert!(err.to_string().contains(INIT_FAILED), "{err}");
    }

    #[tokio::test]
    async fn start_succeeds_against_the_memory_backend() {
        let backend = Arc::new(MemoryBackend::new());
        let dashboard = Dashboard::new(backend.clone(), backend, None);
        start(&dashboard).await.expect("started");
        assert!(dashboard.auth.is_initialized().await);
    }

    #[test]
    fn terms_is_the_default_command() {
        let cli = Cli::parse_from(["pricewatch"]);
        assert!(cli.command.is_none());
        let args = ["pricewatch", "timeline", "--term", "x100v", "--source", "ebay"];
        let cli = Cli::parse_from(args);
        assert!(matches!(cli.command, Some(Commands::Timeline { .. })));
    }
}
