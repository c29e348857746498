use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::i18n::{self, Key, Language};

/// Titles longer than this are cut and get an ellipsis.
pub const TITLE_MAX_CHARS: usize = 40;
const TITLE_MAX_WORDS: usize = 4;
const TITLE_ELLIPSIS: &str = "...";

/// Who authored a message. Never changes after creation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Assistant,
}

/// Metadata of a file the user attached to a message.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Attachment {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub size: u64,
}

// Represents a single message in a chat
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
    pub id: Uuid,
    pub text: String,
    pub sender: Sender,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    // Only set on assistant messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl Message {
    pub fn user(text: impl Into<String>, attachments: Vec<Attachment>) -> Self {
        Self {
            id: Uuid::now_v7(),
            text: text.into(),
            sender: Sender::User,
            timestamp: Utc::now(),
            attachments,
            model: None,
        }
    }

    pub fn assistant(text: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            text: text.into(),
            sender: Sender::Assistant,
            timestamp: Utc::now(),
            attachments: Vec::new(),
            model: Some(model.into()),
        }
    }

    /// Empty assistant message created when the first chunk of a reply arrives.
    pub fn placeholder(model: impl Into<String>) -> Self {
        Self::assistant(String::new(), model)
    }

    pub fn is_assistant(&self) -> bool {
        self.sender == Sender::Assistant
    }
}

// A single conversation: ordered messages plus metadata
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Chat {
    pub id: Uuid,
    pub title: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    // Set once the automatic title has been assigned
    #[serde(default)]
    pub auto_titled: bool,
}

impl Chat {
    /// New empty chat with the localized placeholder title.
    pub fn new(language: Language) -> Self {
        Self::with_title(i18n::translate(language, Key::NewChat).to_string(), false)
    }

    /// New empty chat whose title was already derived from its first message.
    pub fn titled_from(text: &str, language: Language) -> Self {
        Self::with_title(derive_chat_title(text, language), true)
    }

    fn with_title(title: String, auto_titled: bool) -> Self {
        Self {
            id: Uuid::now_v7(),
            title,
            messages: Vec::new(),
            created_at: Utc::now(),
            auto_titled,
        }
    }

    pub fn last_assistant_index(&self) -> Option<usize> {
        self.messages.iter().rposition(Message::is_assistant)
    }
}

// Represents a configured API endpoint/model
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ModelConfig {
    pub name: String, // Name shown in the model selector (e.g., "AM Base")
    pub provider: String, // e.g., "openai_compatible"
    pub api_url: String, // Base URL
    pub model: String, // Upstream model id sent with the request
}

/// Derives a chat title from the first message: its first four space-separated
/// words kept verbatim, cut to 40 characters plus an ellipsis when the raw text
/// is longer than that.
pub fn derive_chat_title(text: &str, language: Language) -> String {
    let words: Vec<&str> = text.trim().split(' ').take(TITLE_MAX_WORDS).collect();
    let mut title = words.join(" ");
    if text.chars().count() > TITLE_MAX_CHARS {
        title = title.chars().take(TITLE_MAX_CHARS).collect();
        title.push_str(TITLE_ELLIPSIS);
    }
    if title.is_empty() {
        return i18n::translate(language, Key::NewChat).to_string();
    }
    title
}

/// Sidebar buckets by creation date.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChatAge {
    Today,
    Last7Days,
    Last30Days,
    Older,
}

impl ChatAge {
    pub fn label(self, language: Language) -> &'static str {
        let key = match self {
            ChatAge::Today => Key::Today,
            ChatAge::Last7Days => Key::Last7Days,
            ChatAge::Last30Days => Key::Last30Days,
            ChatAge::Older => Key::Older,
        };
        i18n::translate(language, key)
    }
}

/// Groups chats relative to midnight of `now` in its own time zone.
/// Only non-empty groups are returned, newest bucket first; chats keep
/// their list order inside a group.
pub fn group_chats_by_date<'a, Tz: TimeZone>(
    chats: &'a [Chat],
    now: &DateTime<Tz>,
) -> Vec<(ChatAge, Vec<&'a Chat>)> {
    let midnight = now
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .and_then(|naive| now.timezone().from_local_datetime(&naive).earliest())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| now.with_timezone(&Utc));
    let seven_days_ago = midnight - Duration::days(7);
    let thirty_days_ago = midnight - Duration::days(30);

    let mut groups: Vec<(ChatAge, Vec<&Chat>)> = [
        ChatAge::Today,
        ChatAge::Last7Days,
        ChatAge::Last30Days,
        ChatAge::Older,
    ]
    .into_iter()
    .map(|age| (age, Vec::new()))
    .collect();

    for chat in chats {
        let slot = if chat.created_at >= midnight {
            0
        } else if chat.created_at >= seven_days_ago {
            1
        } else if chat.created_at >= thirty_days_ago {
            2
        } else {
            3
        };
        groups[slot].1.push(chat);
    }

    groups.retain(|(_, chats)| !chats.is_empty());
    groups
}
