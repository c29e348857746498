use crate::config::DEFAULT_MODEL_NAME;
use crate::i18n::Language;
use crate::models::{Chat, Message};
use uuid::Uuid;

/// Everything the client knows about the session. The active chat is held
/// by id only, so it can never drift from its entry in `chats`.
#[derive(Clone, Debug, PartialEq)]
pub struct AppState {
    /// Most recently created first.
    pub chats: Vec<Chat>,
    pub active_chat_id: Option<Uuid>,
    pub language: Language,
    pub selected_model: String,
    pub api_key: Option<String>,
    /// True while at least one reply is streaming.
    pub responding: bool,
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            chats: Vec::new(),
            active_chat_id: None,
            language: Language::default(),
            selected_model: DEFAULT_MODEL_NAME.to_string(),
            api_key: None,
            responding: false,
        }
    }
}

impl AppState {
    pub fn active_chat(&self) -> Option<&Chat> {
        self.active_chat_id.and_then(|id| self.chat(id))
    }

    pub fn chat(&self, id: Uuid) -> Option<&Chat> {
        self.chats.iter().find(|c| c.id == id)
    }

    fn chat_mut(&mut self, id: Uuid) -> Option<&mut Chat> {
        self.chats.iter_mut().find(|c| c.id == id)
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.is_empty())
    }
}

/// The closed set of state transitions.
#[derive(Clone, Debug)]
pub enum Action {
    /// Replaces the chat list with what the store returned.
    ChatsLoaded(Vec<Chat>),
    /// Inserts at the head of the list and makes it active.
    CreateChat(Chat),
    SelectChat(Uuid),
    DeleteChat(Uuid),
    DeleteAllChats,
    AppendMessage { chat_id: Uuid, message: Message },
    /// Automatic title; ignored once the chat has one.
    SetChatTitle { chat_id: Uuid, title: String },
    /// Sets the final text of a streamed assistant message.
    FinalizeMessage { chat_id: Uuid, message_id: Uuid, text: String },
    /// Drops the message and everything after it.
    TruncateFromMessage { chat_id: Uuid, message_id: Uuid },
    SetResponding(bool),
    SetLanguage(Language),
    SetModel(String),
    SetApiKey(Option<String>),
}

impl Action {
    /// Whether applying this action may change the persisted chat list.
    pub fn changes_chats(&self) -> bool {
        matches!(
            self,
            Action::CreateChat(_)
                | Action::DeleteChat(_)
                | Action::DeleteAllChats
                | Action::AppendMessage { .. }
                | Action::SetChatTitle { .. }
                | Action::FinalizeMessage { .. }
                | Action::TruncateFromMessage { .. }
        )
    }

    pub fn is_deletion(&self) -> bool {
        matches!(self, Action::DeleteChat(_) | Action::DeleteAllChats)
    }
}

/// Applies `action` to `state` and returns the new state.
pub fn reduce(mut state: AppState, action: Action) -> AppState {
    match action {
        Action::ChatsLoaded(chats) => {
            state.chats = chats;
            if state.active_chat_id.is_some_and(|id| state.chat(id).is_none()) {
                state.active_chat_id = None;
            }
        }
        Action::CreateChat(chat) => {
            state.active_chat_id = Some(chat.id);
            state.chats.insert(0, chat);
        }
        Action::SelectChat(id) => {
            if state.chat(id).is_some() {
                state.active_chat_id = Some(id);
            } else {
                log::warn!("Ignoring selection of unknown chat {}", id);
            }
        }
        Action::DeleteChat(id) => {
            state.chats.retain(|c| c.id != id);
            if state.active_chat_id == Some(id) {
                state.active_chat_id = None;
            }
        }
        Action::DeleteAllChats => {
            state.chats.clear();
            state.active_chat_id = None;
        }
        Action::AppendMessage { chat_id, message } => match state.chat_mut(chat_id) {
            Some(chat) => chat.messages.push(message),
            None => log::warn!("Dropping message {} for missing chat {}", message.id, chat_id),
        },
        Action::SetChatTitle { chat_id, title } => {
            if let Some(chat) = state.chat_mut(chat_id) {
                if !chat.auto_titled {
                    chat.title = title;
                    chat.auto_titled = true;
                }
            }
        }
        Action::FinalizeMessage { chat_id, message_id, text } => {
            let target = state
                .chat_mut(chat_id)
                .and_then(|chat| chat.messages.iter_mut().find(|m| m.id == message_id));
            match target {
                Some(message) if message.is_assistant() && message.text.is_empty() => {
                    message.text = text;
                }
                Some(_) => log::warn!("Message {} is not an open assistant reply; not finalizing", message_id),
                None => log::warn!("Cannot finalize missing message {} in chat {}", message_id, chat_id),
            }
        }
        Action::TruncateFromMessage { chat_id, message_id } => {
            if let Some(chat) = state.chat_mut(chat_id) {
                if let Some(idx) = chat.messages.iter().position(|m| m.id == message_id) {
                    chat.messages.truncate(idx);
                }
            }
        }
        Action::SetResponding(responding) => state.responding = responding,
        Action::SetLanguage(language) => state.language = language,
        Action::SetModel(model) => state.selected_model = model,
        Action::SetApiKey(key) => state.api_key = key.filter(|k| !k.is_empty()),
    }
    state
}
