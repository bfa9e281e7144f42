use sqlx::postgres::PgPoolOptions;
use std::process::ExitCode;
use std::sync::Arc;
use switchyard_core::IdGenerator;
use switchyard_messaging::{
    BROKER_TYPE, Consumer, ConsumerOptions, Feed, NatsBus, NatsDedupStore, retry_feed_topic,
};
use switchyard_scheduler::WaitTaskPoller;
use switchyard_server::{
    api::{self, AppState},
    config::ServerConfig,
    db::PgWorkflowStore,
    error::StartupError,
};
use switchyard_workflow::{Decider, WorkflowEventHandler, WorkflowMessage};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,switchyard=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(%error, "switchyard stopped");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), StartupError> {
    // Load configuration from environment
    let config = ServerConfig::from_env().map_err(|e| StartupError::Config {
        details: e.to_string(),
    })?;
    tracing::info!(application = %config.application_name, "Loaded configuration");

    let ids = Arc::new(match config.node_id {
        Some(node_id) => {
            IdGenerator::with_node_id(node_id).map_err(|e| StartupError::IdGenerator {
                details: e.to_string(),
            })?
        }
        None => IdGenerator::new(),
    });
    tracing::info!(node_id = ids.node_id(), "id generator ready");

    // Create database connection pool
    let db_pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .map_err(|e| StartupError::Database {
            details: e.to_string(),
        })?;

    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&db_pool)
        .await
        .map_err(|e| StartupError::Migrations {
            details: e.to_string(),
        })?;

    let nats_config = config.nats_config();
    let jetstream = switchyard_messaging::nats::connect(&nats_config)
        .await
        .map_err(|e| StartupError::Nats {
            details: e.to_string(),
        })?;
    let bus = NatsBus::new(jetstream.clone(), &nats_config);
    let dedup = NatsDedupStore::new(&jetstream, &nats_config)
        .await
        .map_err(|e| StartupError::Nats {
            details: e.to_string(),
        })?;

    let store = PgWorkflowStore::new(db_pool, config.application_name.clone());
    let decider = Arc::new(Decider::new(store.clone(), bus.clone(), Arc::clone(&ids)));
    let options = ConsumerOptions::new(
        config.application_name.clone(),
        BROKER_TYPE,
        config.topics.retries.clone(),
    )
    .with_retry(config.consumer.retry_policy())
    .with_dedup_ttl(config.consumer.dedup_ttl());
    let consumer = Arc::new(Consumer::<WorkflowMessage, _, _, _>::new(
        WorkflowEventHandler::new(decider),
        bus.clone(),
        dedup,
        Arc::clone(&ids),
        options,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    // One loop per partition and feed keeps each correlation key on one loop
    let feeds = [
        (config.topics.workflow_event.clone(), Feed::Primary),
        (
            retry_feed_topic(&config.topics.workflow_event, &config.application_name),
            Feed::Retries,
        ),
    ];
    for (topic, feed) in feeds {
        for partition in 0..bus.partitions() {
            let subscription = bus
                .subscribe(&topic, partition, &config.application_name)
                .await
                .map_err(|e| StartupError::Nats {
                    details: e.to_string(),
                })?;
            let consumer = Arc::clone(&consumer);
            let shutdown = shutdown_rx.clone();
            tracing::debug!(%topic, partition, ?feed, "starting consumer");
            tasks.push(tokio::spawn(async move {
                consumer.run(subscription, feed, shutdown).await;
            }));
        }
    }

    let poller = WaitTaskPoller::new(
        store.clone(),
        bus.clone(),
        Arc::clone(&ids),
        config.poller_config(),
    );
    let poller_shutdown = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move {
        poller.run(poller_shutdown).await;
    }));

    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown requested");
        let _ = shutdown_tx.send(true);
    });

    let state = AppState::new(
        Arc::new(store),
        Arc::new(bus),
        Arc::clone(&ids),
        config.topics.workflow_event.clone(),
    );
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .map_err(|e| StartupError::Listen {
            addr: config.listen_addr.clone(),
            details: e.to_string(),
        })?;
    tracing::info!("listening on http://{}", config.listen_addr);

    let served = axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(wait_for_shutdown(shutdown_rx))
        .await;

    for task in tasks {
        if let Err(error) = task.await {
            tracing::warn!(%error, "background task ended abnormally");
        }
    }
    tracing::info!("switchyard stopped cleanly");

    served.map_err(|e| StartupError::Serve {
        details: e.to_string(),
    })
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::warn!(%error, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                tracing::warn!(%error, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
