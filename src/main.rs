use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracelens::app::{self, AppContext};
use tracelens::config::AppConfig;
use tracelens::embeddings::{EmbeddingsProvider, OpenAiEmbeddings};
use tracelens::pipeline::pii::PatternDetector;
use tracelens::pricing::{self, PricingTable};
use tracelens::{project, storage};

#[derive(Parser)]
#[command(name = "tracelens", about = "Self-hosted LLM trace collection and search")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server (default)
    Serve,
    /// Create a project and print its collector API key
    CreateProject {
        #[arg(long)]
        name: String,
        /// Override the configured PII redaction default
        #[arg(long)]
        pii_redaction: Option<bool>,
    },
    /// Create a scoped bearer token for the query API
    CreateToken {
        #[arg(long)]
        project_id: String,
        #[arg(long)]
        name: String,
        /// Comma-separated, e.g. messages:view,cost:view
        #[arg(long, value_delimiter = ',', default_value = "messages:view")]
        scopes: Vec<String>,
        #[arg(long)]
        expires_in_days: Option<u64>,
    },
    /// Register a guardrail display name
    AddGuardrail {
        #[arg(long)]
        project_id: String,
        #[arg(long)]
        slug: String,
        #[arg(long)]
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tracelens=info,tower_http=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load(Some(&cli.config))?;

    if let Err(msg) = config.validate() {
        eprintln!("Configuration error: {msg}");
        return Err(msg.into());
    }

    let pool = storage::sqlite::create_pool(&config.database)?;
    storage::sqlite::init_pool(&pool).await?;
    tracing::info!(db = %config.database.path.display(), "database initialized");

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config, pool).await,
        Command::CreateProject {
            name,
            pii_redaction,
        } => {
            let created = project::create_project(
                &pool,
                &name,
                pii_redaction.unwrap_or(config.pii.default_enabled),
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&created)?);
            Ok(())
        }
        Command::CreateToken {
            project_id,
            name,
            scopes,
            expires_in_days,
        } => {
            let created =
                project::create_token(&pool, &project_id, &name, scopes, expires_in_days).await?;
            println!("{}", serde_json::to_string_pretty(&created)?);
            Ok(())
        }
        Command::AddGuardrail {
            project_id,
            slug,
            name,
        } => {
            project::add_guardrail(&pool, &project_id, &slug, &name).await?;
            println!("guardrail {slug} registered");
            Ok(())
        }
    }
}

async fn serve(
    config: AppConfig,
    pool: deadpool_sqlite::Pool,
) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        "starting tracelens"
    );

    let pricing = Arc::new(PricingTable::new());
    let refresh_pricing = pricing.clone();
    let refresh_interval = config.pricing.refresh_interval_secs;
    let refresh_url = config.pricing.url.clone();
    tokio::spawn(async move {
        pricing::pricing_refresh_loop(refresh_pricing, refresh_interval, refresh_url).await;
    });

    let embeddings: Option<Arc<dyn EmbeddingsProvider>> = if config.embeddings.enabled {
        tracing::info!(model = %config.embeddings.model, "embeddings enabled");
        Some(Arc::new(OpenAiEmbeddings::new(&config.embeddings)))
    } else {
        tracing::info!("embeddings disabled, free-text search unavailable");
        None
    };

    let detector = Arc::new(PatternDetector::from_names(&config.pii.detectors));
    let addr = format!("{}:{}", config.server.host, config.server.port);

    let app = app::router(AppContext {
        config,
        pool,
        estimator: pricing,
        detector,
        embeddings,
    })?;

    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }

    tracing::info!("shutting down...");
}
