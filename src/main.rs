use std::sync::Arc;

use backup_broker::backup::storage::presign::ObjectStorageAdapter;
use backup_broker::backup::storage::s3_storage::S3ClientFactory;
use backup_broker::config::AppConfig;
use backup_broker::db;
use backup_broker::routes::{self, AppState};
use dotenv::dotenv;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Load .env file
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(err) = run().await {
        error!(error = %err, "Server terminated");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::from_env()?;

    // Initialize the database
    let db_pool = db::init_db(&config.database_url).await?;
    info!(database_url = %config.database_url, "Database initialized");

    let state = Arc::new(AppState {
        db_pool,
        presigner: ObjectStorageAdapter::new(Arc::new(S3ClientFactory::default())),
        presigned_url_expiry_minutes: config.presigned_url_expiry_minutes,
    });

    let app = routes::router(state);

    info!(address = %config.bind_address, "Server starting");
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
