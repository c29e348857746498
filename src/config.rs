use crate::models::ModelConfig;
use crate::typing::TypingTimings;
use anyhow::{Context, Result};
use keyring::Entry;
use std::path::PathBuf;

/// Name of the built-in model shown in the selector.
pub const DEFAULT_MODEL_NAME: &str = "AM Base";
const DEFAULT_API_URL: &str = "https://api.openai.com/v1";
const DEFAULT_UPSTREAM_MODEL: &str = "gpt-4o-mini";
const DEFAULT_API_KEY_REF: &str = "env:OPENAI_API_KEY";
const DB_FILE_NAME: &str = "ma-ai.sqlite";

/// Process-level settings, read once at startup.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub models: Vec<ModelConfig>,
    /// Where to find the credential when the store has none ("env:VAR" or "keyring").
    pub api_key_ref: Option<String>,
    pub typing: TypingTimings,
}

impl AppConfig {
    /// Builds the configuration from `MA_AI_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let data_dir = match lookup("MA_AI_DATA_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => dirs::data_local_dir()
                .context("Could not determine local data directory; set MA_AI_DATA_DIR")?
                .join("ma-ai"),
        };

        let api_url = lookup("MA_AI_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let base_model = lookup("MA_AI_MODEL").unwrap_or_else(|| DEFAULT_UPSTREAM_MODEL.to_string());

        let mut models = vec![openai_model(DEFAULT_MODEL_NAME, &base_model, &api_url)];
        if let Some(extra) = lookup("MA_AI_MODELS") {
            for pair in extra.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                let (name, model) = pair
                    .split_once('=')
                    .with_context(|| format!("Invalid MA_AI_MODELS entry '{}', expected Name=model", pair))?;
                let name = name.trim();
                if models.iter().any(|m| m.name == name) {
                    log::warn!("Ignoring duplicate model name in MA_AI_MODELS: {}", name);
                    continue;
                }
                models.push(openai_model(name, model.trim(), &api_url));
            }
        }

        let api_key_ref = match lookup("MA_AI_API_KEY_REF") {
            Some(r) if r.trim().is_empty() => None,
            Some(r) => Some(r),
            None => Some(DEFAULT_API_KEY_REF.to_string()),
        };

        let typing = match lookup("MA_AI_TYPING").as_deref() {
            None | Some("standard") => TypingTimings::STANDARD,
            Some("brisk") => TypingTimings::BRISK,
            Some(other) => anyhow::bail!("Unsupported MA_AI_TYPING value: {}", other),
        };

        Ok(Self { data_dir, models, api_key_ref, typing })
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILE_NAME)
    }
}

fn openai_model(name: &str, model: &str, api_url: &str) -> ModelConfig {
    ModelConfig {
        name: name.to_string(),
        provider: "openai_compatible".to_string(),
        api_url: api_url.to_string(),
        model: model.to_string(),
    }
}

// --- API Key Retrieval ---

const KEYRING_SERVICE: &str = "ma_ai_api_key";
const KEYRING_USER: &str = "default";

/// Retrieves the API key from the source named by `key_ref`: an environment
/// variable (`env:NAME`) or the OS keyring (`keyring`).
pub fn get_api_key(key_ref: &str) -> Result<String> {
    match key_ref {
        r if r.starts_with("env:") => {
            let env_var_name = r.trim_start_matches("env:");
            log::debug!("Retrieving API key from environment variable: {}", env_var_name);
            std::env::var(env_var_name).context(format!(
                "Failed to get API key from environment variable '{}'",
                env_var_name
            ))
        }
        "keyring" => {
            let entry = Entry::new(KEYRING_SERVICE, KEYRING_USER)
                .context("Failed to create keyring entry")?;
            log::debug!("Retrieving API key from keyring for service: {}", KEYRING_SERVICE);
            entry
                .get_password()
                .context("Failed to get API key from keyring. Please set it with /key.")
        }
        other => Err(anyhow::anyhow!("Unsupported api_key_ref format: {}", other)),
    }
}

/// Stores an API key in the OS keyring.
pub fn set_api_key_in_keyring(api_key: &str) -> Result<()> {
    let entry = Entry::new(KEYRING_SERVICE, KEYRING_USER)
        .context("Failed to create keyring entry for setting password")?;
    log::info!("Setting API key in keyring for service: {}", KEYRING_SERVICE);
    entry
        .set_password(api_key)
        .context("Failed to set API key in keyring")
}
