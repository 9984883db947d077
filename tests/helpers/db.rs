use std::time::Duration;

use portcullis::storage::SeaOrmStore;
use sea_orm::Database;
use sea_orm_migration::MigratorTrait;
use tempfile::NamedTempFile;

/// SQLite-backed store with automatic cleanup
pub struct TestDb {
    store: SeaOrmStore,
    _temp_file: NamedTempFile,
}

impl TestDb {
    /// Create a new test database with migrations applied
    pub async fn new() -> Self {
        let temp_file = NamedTempFile::new().expect("Failed to create temp file");
        let db_path = temp_file.path().to_str().expect("Invalid temp file path");
        let db_url = format!("sqlite://{}?mode=rwc", db_path);

        let connection = Database::connect(&db_url)
            .await
            .expect("Failed to connect to test database");

        migration::Migrator::up(&connection, None)
            .await
            .expect("Failed to run migrations");

        Self {
            store: SeaOrmStore::new(connection, Duration::from_secs(2)),
            _temp_file: temp_file,
        }
    }

    pub fn store(&self) -> SeaOrmStore {
        self.store.clone()
    }
}
