//! Naming of backup artifacts.
//!
//! Artifacts are grouped by server and database and carry a sortable
//! timestamp plus a short random suffix:
//! `{server}/{database}/{server}_{database}_{YYYY-MM-DD_HHMMSS}_{random}.{ext}`

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::{Rng, thread_rng};

use crate::backup::connection::DatabaseType;

const SUFFIX_LEN: usize = 6;

/// Generates artifact filenames for one server
#[derive(Debug, Clone)]
pub struct SnapshotNaming {
    server: String,
    database_type: DatabaseType,
}

impl SnapshotNaming {
    pub fn new(server_name: &str, database_type: DatabaseType) -> Self {
        Self {
            server: sanitize_component(server_name),
            database_type,
        }
    }

    /// Filename for a dump of `database` taken now
    pub fn filename(&self, database: &str) -> String {
        self.filename_with_time(database, Utc::now())
    }

    /// Filename for a dump of `database` taken at `timestamp`
    pub fn filename_with_time(&self, database: &str, timestamp: DateTime<Utc>) -> String {
        let database = sanitize_component(database);
        format!(
            "{server}/{database}/{server}_{database}_{stamp}_{suffix}.{ext}",
            server = self.server,
            stamp = timestamp.format("%Y-%m-%d_%H%M%S"),
            suffix = random_suffix(),
            ext = self.database_type.dump_extension(),
        )
    }
}

/// Replace anything outside `[A-Za-z0-9_-]` so names are safe path components
pub fn sanitize_component(value: &str) -> String {
    let cleaned: String = value
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '-' })
        .collect();
    if cleaned.is_empty() {
        "unnamed".to_string()
    } else {
        cleaned
    }
}

fn random_suffix() -> String {
    let mut rng = thread_rng();
    (0..SUFFIX_LEN)
        .map(|_| rng.sample(Alphanumeric) as char)
        .collect::<String>()
        .to_lowercase()
}
