// Declare the modules
pub mod api;
pub mod commands;
pub mod config;
pub mod error;
pub mod i18n;
pub mod manager;
pub mod models;
pub mod shell;
pub mod state;
pub mod storage;
pub mod typing;

#[cfg(test)]
mod test_support;

use anyhow::Context;
use api::{LLMApiProvider, OpenAICompatibleProvider};
use config::AppConfig;
use manager::ChatManager;
use std::sync::Arc;
use storage::StorageManager;

pub fn run() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    let config = AppConfig::from_env()?;
    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;

    runtime.block_on(async {
        let db_path = config.db_path();
        log::info!("Opening chat store at {}", db_path.display());
        let storage_manager = StorageManager::new(&db_path).await?;

        let api_provider: Arc<dyn LLMApiProvider> = Arc::new(OpenAICompatibleProvider::new());

        // Credential from the environment or keyring, used only when none is stored
        let fallback_api_key = config.api_key_ref.as_deref().and_then(|key_ref| {
            match config::get_api_key(key_ref) {
                Ok(key) => Some(key),
                Err(e) => {
                    log::info!("No API key from '{}': {:#}", key_ref, e);
                    None
                }
            }
        });

        let manager = ChatManager::new(Arc::new(storage_manager), api_provider, config.models.clone());
        manager.load(fallback_api_key).await?;

        shell::run_shell(manager, &config).await
    })
}
