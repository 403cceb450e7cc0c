use sqlx::{
    migrate::MigrateDatabase,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use chrono::{DateTime, Utc};
use std::str::FromStr;

use crate::backup::path_safety::validate_relative;
use crate::backup::storage::{Snapshot, StorageVolumeConfig};
use crate::backup::{BackupError, Result};

// Database connection pool type
pub type DbPool = Pool<Sqlite>;

/// Initialize the database, running migrations if necessary
pub async fn init_db(database_url: &str) -> Result<DbPool> {
    let in_memory = database_url.contains(":memory:");

    // Create database if it doesn't exist
    if !in_memory && !Sqlite::database_exists(database_url).await.unwrap_or(false) {
        Sqlite::create_database(database_url).await?;
    }

    let mut options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .foreign_keys(true);
    if !in_memory {
        options = options.journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
    }

    // Every in-memory connection is its own database, so keep exactly one
    let pool = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?
    } else {
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?
    };

    // Run migrations
    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

/// Register a storage volume and return its id
pub async fn create_volume(pool: &DbPool, name: &str, volume: &StorageVolumeConfig) -> Result<i64> {
    volume.validate()?;
    let config = volume.config_json()?.to_string();

    let result = sqlx::query(
        r#"
        INSERT INTO volumes (name, type, config)
        VALUES (?, ?, ?)
        "#
    )
    .bind(name)
    .bind(volume.kind())
    .bind(config)
    .execute(pool)
    .await?;

    Ok(result.last_insert_rowid())
}

/// Record an artifact written to `volume_id` and return the snapshot id
pub async fn create_snapshot(
    pool: &DbPool,
    volume_id: i64,
    filename: &str,
    database_name: Option<&str>,
) -> Result<i64> {
    if filename.is_empty() {
        return Err(BackupError::Validation("snapshot filename must not be empty".to_string()));
    }
    validate_relative(filename)?;

    let result = sqlx::query(
        r#"
        INSERT INTO snapshots (volume_id, filename, database_name, created_at)
        VALUES (?, ?, ?, ?)
        "#
    )
    .bind(volume_id)
    .bind(filename)
    .bind(database_name)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(result.last_insert_rowid())
}

/// Get a snapshot together with the volume holding it
pub async fn get_snapshot(pool: &DbPool, id: i64) -> Result<Snapshot> {
    let row = sqlx::query(
        r#"
        SELECT s.id, s.filename, s.database_name, s.created_at, v.type, v.config
        FROM snapshots s
        JOIN volumes v ON v.id = s.volume_id
        WHERE s.id = ?
        "#
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Err(BackupError::SnapshotNotFound);
    };

    let kind: String = row.try_get("type")?;
    let config: String = row.try_get("config")?;
    let config = serde_json::from_str(&config)
        .map_err(|e| BackupError::Database(format!("volume configuration of snapshot {} is not JSON: {}", id, e)))?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;

    Ok(Snapshot {
        id: row.try_get("id")?,
        volume: StorageVolumeConfig::from_parts(&kind, config)?,
        filename: row.try_get("filename")?,
        database_name: row.try_get("database_name")?,
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::path_safety::PathRejection;
    use crate::backup::storage::LocalVolumeConfig;
    use std::path::PathBuf;

    async fn pool() -> DbPool {
        init_db("sqlite::memory:").await.unwrap()
    }

    fn local_volume() -> StorageVolumeConfig {
        StorageVolumeConfig::Local(LocalVolumeConfig {
            path: PathBuf::from("/var/backups"),
        })
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let pool = pool().await;
        let volume_id = create_volume(&pool, "primary", &local_volume()).await.unwrap();
        let snapshot_id = create_snapshot(&pool, volume_id, "prod/app/file.sql.gz", Some("app"))
            .await
            .unwrap();

        let snapshot = get_snapshot(&pool, snapshot_id).await.unwrap();
        assert_eq!(snapshot.id, snapshot_id);
        assert_eq!(snapshot.volume, local_volume());
        assert_eq!(snapshot.filename, "prod/app/file.sql.gz");
        assert_eq!(snapshot.database_name.as_deref(), Some("app"));
    }

    #[tokio::test]
    async fn test_missing_snapshot() {
        let pool = pool().await;
        assert!(matches!(get_snapshot(&pool, 42).await, Err(BackupError::SnapshotNotFound)));
    }

    #[tokio::test]
    async fn test_unknown_volume_type_is_unsupported() {
        let pool = pool().await;
        let volume_id = sqlx::query("INSERT INTO volumes (name, type, config) VALUES ('tape', 'tape', '{}')")
            .execute(&pool)
            .await
            .unwrap()
            .last_insert_rowid();
        let snapshot_id = create_snapshot(&pool, volume_id, "file.tar", None).await.unwrap();

        let result = get_snapshot(&pool, snapshot_id).await;
        assert!(matches!(result, Err(BackupError::UnsupportedStorageType(kind)) if kind == "tape"));
    }

    #[tokio::test]
    async fn test_unsafe_snapshot_filename_is_rejected() {
        let pool = pool().await;
        let volume_id = create_volume(&pool, "primary", &local_volume()).await.unwrap();

        let result = create_snapshot(&pool, volume_id, "../outside.sql.gz", None).await;
        assert!(matches!(result, Err(BackupError::UnsafePath(PathRejection::Traversal))));
    }

    #[tokio::test]
    async fn test_duplicate_volume_name_is_database_error() {
        let pool = pool().await;
        create_volume(&pool, "primary", &local_volume()).await.unwrap();
        let result = create_volume(&pool, "primary", &local_volume()).await;
        assert!(matches!(result, Err(BackupError::Database(_))));
    }
}
