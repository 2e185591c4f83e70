//! Turnstile - token metering and progression sync engine

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use turnstile::{
    config::Args,
    db::MongoClient,
    feed::{spawn_processor_task, ChangeFeed, IdentityChangeProcessor, InMemoryFeed, MongoChangeFeed},
    reconcile::{spawn_reconciliation_task, ReconciliationSweep},
    stores::{
        IdentityDirectory, InMemoryMeteringStore, InMemoryProgressionStore, MeteringStore,
        MongoMeteringStore, PgConfig, PgProgressionStore, ProgressionStore,
    },
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    // Initialize tracing/logging
    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("turnstile={},info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  Turnstile - metering & progression");
    info!("======================================");
    info!("Build: {} ({})", env!("GIT_COMMIT_SHORT"), env!("BUILD_TIMESTAMP"));
    info!("Mode: {}", if args.dev_mode { "DEVELOPMENT" } else { "PRODUCTION" });
    info!("Weekly limit: {}", args.weekly_limit);
    info!(
        "Conversion: threshold {}, {} tokens/exp, {} exp/level",
        args.conversion_threshold, args.tokens_per_experience, args.experience_per_level
    );
    info!("Sweep: every {}s", args.sweep_interval_secs);
    if !args.dev_mode {
        info!("MongoDB: {}", args.mongodb_uri);
        info!("PostgreSQL: {}", args.database_url);
    }
    info!("======================================");

    if args.dev_mode {
        // Dev mode runs the full wiring against in-memory stores and an
        // empty feed; useful for exercising the daemon without backends.
        info!("Dev mode: using in-memory stores");
        let metering = Arc::new(InMemoryMeteringStore::new());
        let progression = Arc::new(InMemoryProgressionStore::new());
        let feed = InMemoryFeed::new(Vec::new());
        run(args, metering, progression, feed).await
    } else {
        let mongo = match MongoClient::new(&args.mongodb_uri, &args.mongodb_db).await {
            Ok(client) => client,
            Err(e) => {
                error!("MongoDB connection failed: {}", e);
                std::process::exit(1);
            }
        };

        let metering = match MongoMeteringStore::new(&mongo).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                error!("Metering store setup failed: {}", e);
                std::process::exit(1);
            }
        };

        let pg_config = PgConfig {
            url: args.database_url.clone(),
            max_connections: args.pg_max_connections,
            ..PgConfig::default()
        };
        let progression = match PgProgressionStore::connect(&pg_config).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                error!("PostgreSQL connection failed: {}", e);
                std::process::exit(1);
            }
        };

        let feed = match MongoChangeFeed::open(&mongo).await {
            Ok(feed) => feed,
            Err(e) => {
                error!("Change feed setup failed: {}", e);
                std::process::exit(1);
            }
        };

        run(args, metering, progression, feed).await
    }
}

/// Wire the background machinery and run until interrupted.
///
/// The synchronous consumption API is the library's
/// [`turnstile::orchestrator::ConsumptionOrchestrator`]; this binary runs
/// the two long-lived tasks around it. Components receive their store
/// clients explicitly; nothing here owns a global connection.
async fn run<M, P, F>(
    args: Args,
    metering: Arc<M>,
    progression: Arc<P>,
    feed: F,
) -> anyhow::Result<()>
where
    M: MeteringStore + IdentityDirectory + 'static,
    P: ProgressionStore + 'static,
    F: ChangeFeed + Send + 'static,
{
    let sweep = Arc::new(ReconciliationSweep::new(
        args.sweep_config(),
        Arc::clone(&metering),
        Arc::clone(&progression),
    ));
    let sweep_handle = spawn_reconciliation_task(sweep);
    info!("Reconciliation sweep started (every {}s)", args.sweep_interval_secs);

    let processor = IdentityChangeProcessor::new(
        args.processor_config(),
        feed,
        Arc::clone(&progression),
        Arc::clone(&metering),
    );
    let processor_handle = spawn_processor_task(processor);
    info!("Identity change processor started");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    sweep_handle.abort();
    processor_handle.abort();

    Ok(())
}
