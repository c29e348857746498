use anyhow::Context;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::{migrate::MigrateDatabase, sqlite::SqlitePoolOptions, Sqlite, SqlitePool};
use std::path::Path;

/// Key holding the JSON array of chats.
pub const CHATS_KEY: &str = "ma_ai_chats";
/// Key holding the UI language code.
pub const LANGUAGE_KEY: &str = "ma_ai_language";
/// Key holding the API credential.
pub const API_KEY_KEY: &str = "openai_api_key";

const MIGRATIONS_SQL: &str = "
-- Application Settings Table (Key-Value)
CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
);
";

/// String-keyed persistent store.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<String>, anyhow::Error>;
    async fn save(&self, key: &str, value: &str) -> Result<(), anyhow::Error>;
}

/// Loads and deserializes a JSON value. `Ok(None)` when the key is absent.
pub async fn load_json<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<T>, anyhow::Error> {
    match store.load(key).await? {
        Some(raw) => {
            let value = serde_json::from_str(&raw)
                .with_context(|| format!("Malformed JSON stored under '{}'", key))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

pub async fn save_json<T: Serialize + ?Sized>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> Result<(), anyhow::Error> {
    let raw = serde_json::to_string(value)
        .with_context(|| format!("Failed to serialize value for '{}'", key))?;
    store.save(key, &raw).await
}

/// SQLite-backed store, one row per key.
#[derive(Debug)]
pub struct StorageManager {
    pool: SqlitePool,
}

impl StorageManager {
    /// Opens (creating if needed) the database file and runs migrations.
    pub async fn new(db_path: &Path) -> Result<Self, anyhow::Error> {
        // Ensure the parent directory exists
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await.context("Failed to create database directory")?;
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.to_string_lossy());
        log::info!("Connecting to database: {}", db_url);

        if !Sqlite::database_exists(&db_url).await.unwrap_or(false) {
            log::info!("Database file not found, creating...");
            Sqlite::create_database(&db_url).await.context("Failed to create database")?;
        }

        let pool = SqlitePoolOptions::new()
            .connect(&db_url)
            .await
            .context("Failed to connect to SQLite database")?;

        Self::run_migrations(&pool).await?;

        Ok(Self { pool })
    }

    /// Private in-memory database. A single connection, since every
    /// `:memory:` connection would otherwise see its own database.
    pub async fn in_memory() -> Result<Self, anyhow::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory SQLite database")?;
        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    async fn run_migrations(pool: &SqlitePool) -> Result<(), anyhow::Error> {
        log::info!("Running database migrations...");
        sqlx::query(MIGRATIONS_SQL)
            .execute(pool)
            .await
            .context("Failed to run database migrations")?;
        log::info!("Database migrations completed.");
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for StorageManager {
    async fn load(&self, key: &str) -> Result<Option<String>, anyhow::Error> {
        log::debug!("Loading setting '{}'", key);
        sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("Failed to load setting '{}'", key))
    }

    async fn save(&self, key: &str, value: &str) -> Result<(), anyhow::Error> {
        log::debug!("Saving setting '{}' ({} bytes)", key, value.len());
        sqlx::query(
            r#"
            INSERT INTO settings (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to save setting '{}'", key))?;
        Ok(())
    }
}

/// Process-local store; nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn load(&self, key: &str) -> Result<Option<String>, anyhow::Error> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn save(&self, key: &str, value: &str) -> Result<(), anyhow::Error> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::i18n::Language;
    use crate::models::{Chat, Message};

    fn sample_chats() -> Vec<Chat> {
        let mut first = Chat::titled_from("how do I bake bread", Language::En);
        first.messages.push(Message::user("how do I bake bread", vec![]));
        first.messages.push(Message::assistant("Start with flour.", "AM Base"));
        vec![first, Chat::new(Language::Hy)]
    }

    #[tokio::test]
    async fn sqlite_store_round_trips_chat_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = StorageManager::new(&dir.path().join("nested").join("ma-ai.sqlite"))
            .await
            .unwrap();

        let chats = sample_chats();
        save_json(&store, CHATS_KEY, &chats).await.unwrap();
        let loaded: Vec<Chat> = load_json(&store, CHATS_KEY).await.unwrap().unwrap();
        assert_eq!(loaded, chats);
    }

    #[tokio::test]
    async fn sqlite_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ma-ai.sqlite");
        {
            let store = StorageManager::new(&path).await.unwrap();
            store.save(LANGUAGE_KEY, "hy").await.unwrap();
            store.save(LANGUAGE_KEY, "en").await.unwrap();
        }
        let store = StorageManager::new(&path).await.unwrap();
        assert_eq!(store.load(LANGUAGE_KEY).await.unwrap().as_deref(), Some("en"));
        assert_eq!(store.load(API_KEY_KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn in_memory_sqlite_keeps_values() {
        let store = StorageManager::in_memory().await.unwrap();
        store.save(API_KEY_KEY, "sk-test").await.unwrap();
        assert_eq!(store.load(API_KEY_KEY).await.unwrap().as_deref(), Some("sk-test"));
    }

    #[tokio::test]
    async fn malformed_json_is_an_error_not_a_panic() {
        let store = MemoryStore::new();
        store.save(CHATS_KEY, "[{\"id\": 12").await.unwrap();
        let result: Result<Option<Vec<Chat>>, _> = load_json(&store, CHATS_KEY).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn missing_key_loads_as_none() {
        let store = MemoryStore::new();
        let loaded: Option<Vec<Chat>> = load_json(&store, CHATS_KEY).await.unwrap();
        assert!(loaded.is_none());
    }
}
