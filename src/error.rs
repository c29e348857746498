use thiserror::Error;
use uuid::Uuid;

use crate::i18n::{self, Key, Language};

/// Errors a caller of the chat manager is expected to branch on.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChatError {
    /// No API key configured; nothing was changed.
    #[error("API key is not configured")]
    MissingCredential,

    /// A reply is still streaming into this chat.
    #[error("a reply is already streaming into chat {chat_id}")]
    Busy { chat_id: Uuid },

    #[error("unknown model: {0}")]
    UnknownModel(String),
}

impl ChatError {
    /// Text to show the user, if this error has a localized form.
    pub fn user_message(&self, language: Language) -> String {
        match self {
            ChatError::MissingCredential => i18n::translate(language, Key::MissingApiKey).to_string(),
            ChatError::Busy { .. } => i18n::translate(language, Key::Busy).to_string(),
            ChatError::UnknownModel(_) => self.to_string(),
        }
    }
}
