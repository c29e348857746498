use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::{broadcast, Mutex, MutexGuard, Notify};
use uuid::Uuid;

use crate::api::{CompletionMessage, LLMApiProvider};
use crate::error::ChatError;
use crate::i18n::{self, Key, Language};
use crate::models::{derive_chat_title, Attachment, Chat, Message, ModelConfig};
use crate::state::{reduce, Action, AppState};
use crate::storage::{self, KeyValueStore, API_KEY_KEY, CHATS_KEY, LANGUAGE_KEY};

const EVENT_BUFFER: usize = 1024;

/// Notifications for the front-end and the typing scheduler.
#[derive(Clone, Debug, PartialEq)]
pub enum ChatEvent {
    ChatsChanged,
    ActiveChatChanged { chat_id: Option<Uuid> },
    RespondingChanged { responding: bool },
    /// The empty assistant message was added at the first chunk.
    AssistantMessageStarted { chat_id: Uuid, message_id: Uuid },
    AssistantChunk { chat_id: Uuid, message_id: Uuid, delta: String },
    /// Final text is available. `visible` is true when the message is the
    /// last one of the active chat.
    AssistantMessageFinalized { chat_id: Uuid, message_id: Uuid, text: String, visible: bool },
    StreamFailed { chat_id: Uuid, error: String },
}

/// Owns the chat list and drives completion streams into it.
#[derive(Clone)]
pub struct ChatManager {
    state: Arc<Mutex<AppState>>,
    store: Arc<dyn KeyValueStore>,
    api_provider: Arc<dyn LLMApiProvider>,
    models: Arc<Vec<ModelConfig>>,
    // chat id -> cancellation signal of its outstanding stream
    active_streams: Arc<DashMap<Uuid, Arc<Notify>>>,
    events: broadcast::Sender<ChatEvent>,
}

/// Removes the chat's entry from `active_streams` when dropped.
struct StreamGuard {
    streams: Arc<DashMap<Uuid, Arc<Notify>>>,
    chat_id: Uuid,
    cancel: Arc<Notify>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.streams.remove(&self.chat_id);
    }
}

/// A set of actions applied under one lock.
struct Transaction<'a> {
    state: MutexGuard<'a, AppState>,
    chats_changed: bool,
    deleted: bool,
}

impl Transaction<'_> {
    fn apply(&mut self, action: Action) {
        self.chats_changed |= action.changes_chats();
        self.deleted |= action.is_deletion();
        let current = std::mem::take(&mut *self.state);
        *self.state = reduce(current, action);
    }
}

/// Everything a stream needs once the request has been prepared.
struct PendingReply {
    chat_id: Uuid,
    history: Vec<CompletionMessage>,
    model: ModelConfig,
    api_key: String,
    guard: StreamGuard,
}

enum StreamOutcome {
    Completed,
    Cancelled,
}

#[derive(Default)]
struct StreamProgress {
    placeholder: Option<Uuid>,
    buffer: String,
}

impl ChatManager {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        api_provider: Arc<dyn LLMApiProvider>,
        models: Vec<ModelConfig>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            state: Arc::new(Mutex::new(AppState::default())),
            store,
            api_provider,
            models: Arc::new(models),
            active_streams: Arc::new(DashMap::new()),
            events,
        }
    }

    /// Reads chats, language and credential from the store. `fallback_api_key`
    /// is used when the store has no credential.
    pub async fn load(&self, fallback_api_key: Option<String>) -> anyhow::Result<()> {
        let chats = match storage::load_json::<Vec<Chat>>(self.store.as_ref(), CHATS_KEY).await {
            Ok(chats) => chats.unwrap_or_default(),
            Err(e) => {
                log::error!("Ignoring unreadable chat list: {:?}", e);
                Vec::new()
            }
        };

        let language = match self.store.load(LANGUAGE_KEY).await? {
            Some(code) => code.parse::<Language>().unwrap_or_else(|e| {
                log::warn!("{}; keeping default language", e);
                Language::default()
            }),
            None => Language::default(),
        };

        let api_key = self
            .store
            .load(API_KEY_KEY)
            .await?
            .filter(|k| !k.is_empty())
            .or(fallback_api_key);

        log::info!("Loaded {} chats, language {}", chats.len(), language);
        let mut txn = self.begin().await;
        txn.apply(Action::ChatsLoaded(chats));
        txn.apply(Action::SetLanguage(language));
        txn.apply(Action::SetApiKey(api_key));
        drop(txn);
        self.emit(ChatEvent::ChatsChanged);
        Ok(())
    }

    pub async fn snapshot(&self) -> AppState {
        self.state.lock().await.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    pub fn models(&self) -> &[ModelConfig] {
        &self.models
    }

    /// Starts an empty chat at the head of the list and makes it active.
    pub async fn create_chat(&self) -> Chat {
        let mut txn = self.begin().await;
        let chat = Chat::new(txn.state.language);
        log::info!("Creating new chat {}", chat.id);
        txn.apply(Action::CreateChat(chat.clone()));
        self.commit(txn).await;
        self.emit(ChatEvent::ActiveChatChanged { chat_id: Some(chat.id) });
        chat
    }

    /// Appends a user message to the active chat (creating one if needed) and
    /// streams the assistant's reply into it.
    pub async fn send_message(&self, text: &str, attachments: Vec<Attachment>) -> Result<(), ChatError> {
        let mut txn = self.begin().await;
        let (api_key, model) = self.request_settings(&txn.state)?;
        let language = txn.state.language;

        let active = txn.state.active_chat_id;
        let (chat_id, guard, created) = match active {
            Some(chat_id) => (chat_id, self.claim_stream(chat_id)?, false),
            None => {
                let chat = Chat::titled_from(text, language);
                let chat_id = chat.id;
                log::info!("No active chat; creating {} for first message", chat_id);
                txn.apply(Action::CreateChat(chat));
                (chat_id, self.claim_stream(chat_id)?, true)
            }
        };

        let is_first = txn.state.chat(chat_id).is_some_and(|c| c.messages.is_empty());
        txn.apply(Action::AppendMessage { chat_id, message: Message::user(text, attachments) });
        if is_first {
            txn.apply(Action::SetChatTitle { chat_id, title: derive_chat_title(text, language) });
        }
        txn.apply(Action::SetResponding(true));
        let history = history_of(&txn.state, chat_id);
        self.commit(txn).await;

        if created {
            self.emit(ChatEvent::ActiveChatChanged { chat_id: Some(chat_id) });
        }
        self.emit(ChatEvent::RespondingChanged { responding: true });

        self.stream_reply(PendingReply { chat_id, history, model, api_key, guard }).await;
        Ok(())
    }

    /// Replaces the last assistant reply of the active chat with a new one.
    /// No-op when there is nothing to regenerate.
    pub async fn regenerate(&self) -> Result<(), ChatError> {
        let mut txn = self.begin().await;
        let Some(chat) = txn.state.active_chat() else {
            log::debug!("Regenerate requested without an active chat");
            return Ok(());
        };
        let Some(idx) = chat.last_assistant_index() else {
            log::debug!("Chat {} has no assistant reply to regenerate", chat.id);
            return Ok(());
        };
        let (chat_id, message_id) = (chat.id, chat.messages[idx].id);

        let (api_key, model) = self.request_settings(&txn.state)?;
        let guard = self.claim_stream(chat_id)?;

        log::info!("Regenerating reply {} in chat {}", message_id, chat_id);
        txn.apply(Action::TruncateFromMessage { chat_id, message_id });
        txn.apply(Action::SetResponding(true));
        let history = history_of(&txn.state, chat_id);
        self.commit(txn).await;
        self.emit(ChatEvent::RespondingChanged { responding: true });

        self.stream_reply(PendingReply { chat_id, history, model, api_key, guard }).await;
        Ok(())
    }

    pub async fn select_chat(&self, chat_id: Uuid) {
        let mut txn = self.begin().await;
        txn.apply(Action::SelectChat(chat_id));
        let active = txn.state.active_chat_id;
        drop(txn);
        self.emit(ChatEvent::ActiveChatChanged { chat_id: active });
    }

    /// Deletes one chat, abandoning its stream if one is outstanding.
    pub async fn delete_chat(&self, chat_id: Uuid) {
        log::warn!("Deleting chat {}", chat_id);
        self.cancel(chat_id);
        let mut txn = self.begin().await;
        let was_active = txn.state.active_chat_id == Some(chat_id);
        txn.apply(Action::DeleteChat(chat_id));
        self.commit(txn).await;
        if was_active {
            self.emit(ChatEvent::ActiveChatChanged { chat_id: None });
        }
    }

    pub async fn delete_all_chats(&self) {
        log::warn!("Deleting all chats");
        for entry in self.active_streams.iter() {
            entry.value().notify_one();
        }
        let mut txn = self.begin().await;
        txn.apply(Action::DeleteAllChats);
        self.commit(txn).await;
        self.emit(ChatEvent::ActiveChatChanged { chat_id: None });
    }

    pub async fn set_language(&self, language: Language) {
        let mut txn = self.begin().await;
        txn.apply(Action::SetLanguage(language));
        drop(txn);
        if let Err(e) = self.store.save(LANGUAGE_KEY, language.code()).await {
            log::error!("Failed to persist language {}: {:?}", language, e);
        }
    }

    /// Switches to the next language (ru -> hy -> en -> ru).
    pub async fn toggle_language(&self) -> Language {
        let next = self.state.lock().await.language.next();
        self.set_language(next).await;
        next
    }

    pub async fn set_model(&self, name: &str) -> Result<(), ChatError> {
        if !self.models.iter().any(|m| m.name == name) {
            return Err(ChatError::UnknownModel(name.to_string()));
        }
        let mut txn = self.begin().await;
        txn.apply(Action::SetModel(name.to_string()));
        Ok(())
    }

    /// Stores the credential. An empty key clears it.
    pub async fn set_api_key(&self, api_key: &str) {
        let api_key = api_key.trim();
        let mut txn = self.begin().await;
        txn.apply(Action::SetApiKey(Some(api_key.to_string())));
        drop(txn);
        if let Err(e) = self.store.save(API_KEY_KEY, api_key).await {
            log::error!("Failed to persist API key: {:?}", e);
        }
    }

    /// Abandons the outstanding stream of `chat_id`. Returns false when none is
    /// running.
    pub fn cancel(&self, chat_id: Uuid) -> bool {
        match self.active_streams.get(&chat_id) {
            Some(cancel) => {
                log::warn!("Cancellation requested for stream in chat {}", chat_id);
                cancel.notify_one();
                true
            }
            None => false,
        }
    }

    pub fn is_streaming(&self, chat_id: Uuid) -> bool {
        self.active_streams.contains_key(&chat_id)
    }

    // --- internals ---

    async fn begin(&self) -> Transaction<'_> {
        Transaction {
            state: self.state.lock().await,
            chats_changed: false,
            deleted: false,
        }
    }

    /// Mirrors the chat list to the store if the transaction changed it. An
    /// empty list is only written when a deletion emptied it.
    async fn commit(&self, txn: Transaction<'_>) {
        if !txn.chats_changed {
            return;
        }
        if txn.state.chats.is_empty() && !txn.deleted {
            log::debug!("Chat list is empty; not persisting");
        } else if let Err(e) = storage::save_json(self.store.as_ref(), CHATS_KEY, &txn.state.chats).await {
            log::error!("Failed to persist chat list: {:?}", e);
        }
        drop(txn);
        self.emit(ChatEvent::ChatsChanged);
    }

    fn emit(&self, event: ChatEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn request_settings(&self, state: &AppState) -> Result<(String, ModelConfig), ChatError> {
        let Some(api_key) = state.api_key.clone().filter(|k| !k.is_empty()) else {
            log::warn!("Rejecting request: API key is not configured");
            return Err(ChatError::MissingCredential);
        };
        let model = self
            .models
            .iter()
            .find(|m| m.name == state.selected_model)
            .cloned()
            .ok_or_else(|| ChatError::UnknownModel(state.selected_model.clone()))?;
        Ok((api_key, model))
    }

    fn claim_stream(&self, chat_id: Uuid) -> Result<StreamGuard, ChatError> {
        match self.active_streams.entry(chat_id) {
            Entry::Occupied(_) => {
                log::warn!("Rejecting request: chat {} already has a stream outstanding", chat_id);
                Err(ChatError::Busy { chat_id })
            }
            Entry::Vacant(slot) => {
                let cancel = Arc::new(Notify::new());
                slot.insert(cancel.clone());
                Ok(StreamGuard { streams: self.active_streams.clone(), chat_id, cancel })
            }
        }
    }

    /// Runs the stream to its end and records the outcome in the chat.
    async fn stream_reply(&self, reply: PendingReply) {
        let PendingReply { chat_id, history, model, api_key, guard } = reply;
        let mut progress = StreamProgress::default();

        let result = self
            .consume_stream(chat_id, &history, &model, &api_key, &guard.cancel, &mut progress)
            .await;

        let mut txn = self.begin().await;
        let mut finalized = None;
        match result {
            Ok(outcome) => {
                if matches!(outcome, StreamOutcome::Cancelled) {
                    log::warn!("Stream for chat {} cancelled after {} chars", chat_id, progress.buffer.chars().count());
                }
                match progress.placeholder {
                    Some(message_id) => {
                        txn.apply(Action::FinalizeMessage {
                            chat_id,
                            message_id,
                            text: progress.buffer.clone(),
                        });
                        finalized = Some(message_id);
                    }
                    None => log::warn!("Stream for chat {} ended without content", chat_id),
                }
            }
            Err(e) => {
                log::error!("Stream for chat {} failed: {:?}", chat_id, e);
                let text = i18n::translate(txn.state.language, Key::ErrorResponse);
                txn.apply(Action::AppendMessage { chat_id, message: Message::assistant(text, &model.name) });
                self.emit(ChatEvent::StreamFailed { chat_id, error: format!("{:#}", e) });
            }
        }

        let responding = self.active_streams.iter().any(|entry| *entry.key() != chat_id);
        txn.apply(Action::SetResponding(responding));
        let visible = finalized.is_some_and(|message_id| {
            txn.state.active_chat_id == Some(chat_id)
                && txn.state.chat(chat_id).and_then(|c| c.messages.last()).map(|m| m.id) == Some(message_id)
        });
        // The chat stays busy until its outcome is applied
        drop(guard);
        self.commit(txn).await;

        if let Some(message_id) = finalized {
            self.emit(ChatEvent::AssistantMessageFinalized {
                chat_id,
                message_id,
                text: progress.buffer,
                visible,
            });
        }
        self.emit(ChatEvent::RespondingChanged { responding });
    }

    async fn consume_stream(
        &self,
        chat_id: Uuid,
        history: &[CompletionMessage],
        model: &ModelConfig,
        api_key: &str,
        cancel: &Notify,
        progress: &mut StreamProgress,
    ) -> anyhow::Result<StreamOutcome> {
        let request = self.api_provider.send_chat_stream_request(model, api_key, history);
        let mut delta_stream = tokio::select! {
            biased;
            _ = cancel.notified() => return Ok(StreamOutcome::Cancelled),
            stream = request => stream?,
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.notified() => return Ok(StreamOutcome::Cancelled),
                next = delta_stream.next() => next,
            };
            let Some(delta) = next else {
                return Ok(StreamOutcome::Completed);
            };
            let delta = delta?;

            let message_id = match progress.placeholder {
                Some(id) => id,
                None => {
                    let placeholder = Message::placeholder(&model.name);
                    let id = placeholder.id;
                    let mut txn = self.begin().await;
                    txn.apply(Action::AppendMessage { chat_id, message: placeholder });
                    self.commit(txn).await;
                    progress.placeholder = Some(id);
                    self.emit(ChatEvent::AssistantMessageStarted { chat_id, message_id: id });
                    id
                }
            };

            log::debug!("Chat {}: received {} byte chunk", chat_id, delta.len());
            progress.buffer.push_str(&delta);
            self.emit(ChatEvent::AssistantChunk { chat_id, message_id, delta });
        }
    }
}

fn history_of(state: &AppState, chat_id: Uuid) -> Vec<CompletionMessage> {
    state
        .chat(chat_id)
        .map(|chat| chat.messages.iter().map(CompletionMessage::from).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Role;
    use crate::models::Sender;
    use crate::storage::MemoryStore;
    use crate::test_support::{manager_with, Reply, ScriptedProvider};

    async fn wait_for(
        events: &mut broadcast::Receiver<ChatEvent>,
        pred: impl Fn(&ChatEvent) -> bool,
    ) -> ChatEvent {
        loop {
            let event = events.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    }

    fn texts(chat: &Chat) -> Vec<(Sender, String)> {
        chat.messages.iter().map(|m| (m.sender, m.text.clone())).collect()
    }

    #[tokio::test]
    async fn send_without_credential_changes_nothing() {
        let (manager, provider, store) = manager_with(vec![], None).await;
        let before = manager.snapshot().await;

        let result = manager.send_message("hello", vec![]).await;

        assert_eq!(result, Err(ChatError::MissingCredential));
        assert_eq!(manager.snapshot().await, before);
        assert!(!manager.snapshot().await.responding);
        assert!(provider.requests().is_empty());
        assert!(store.load(CHATS_KEY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn first_send_creates_chat_with_message_and_reply() {
        let (manager, provider, _) = manager_with(vec![Reply::chunks(&["Բարև", ", ", "world"])], Some("sk")).await;

        manager.send_message("Say hello to me please", vec![]).await.unwrap();

        let state = manager.snapshot().await;
        assert_eq!(state.chats.len(), 1);
        let chat = state.active_chat().unwrap();
        assert_eq!(chat.title, "Say hello to me");
        assert_eq!(
            texts(chat),
            vec![
                (Sender::User, "Say hello to me please".to_string()),
                (Sender::Assistant, "Բարև, world".to_string()),
            ]
        );
        assert_eq!(chat.messages[1].model.as_deref(), Some("AM Base"));
        assert!(!state.responding);

        let requests = provider.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0], vec![CompletionMessage { role: Role::User, content: "Say hello to me please".into() }]);
    }

    #[tokio::test]
    async fn send_into_created_chat_assigns_title_from_first_message() {
        let (manager, _, _) = manager_with(vec![Reply::chunks(&["ok"]), Reply::chunks(&["ok"])], Some("sk")).await;
        let chat = manager.create_chat().await;
        assert_eq!(chat.title, "Новый чат");

        manager.send_message("one two three four five", vec![]).await.unwrap();
        manager.send_message("something else entirely", vec![]).await.unwrap();

        let state = manager.snapshot().await;
        assert_eq!(state.chats.len(), 1);
        assert_eq!(state.active_chat().unwrap().title, "one two three four");
        assert_eq!(state.active_chat().unwrap().messages.len(), 4);
    }

    #[tokio::test]
    async fn placeholder_stays_empty_until_stream_completes() {
        let (reply, chunks) = Reply::channel();
        let (manager, _, _) = manager_with(vec![reply], Some("sk")).await;
        let mut events = manager.subscribe();

        let sender = manager.clone();
        let task = tokio::spawn(async move { sender.send_message("hi", vec![]).await });

        chunks.unbounded_send(Ok("Hel".into())).unwrap();
        wait_for(&mut events, |e| matches!(e, ChatEvent::AssistantMessageStarted { .. })).await;
        chunks.unbounded_send(Ok("lo".into())).unwrap();
        wait_for(&mut events, |e| matches!(e, ChatEvent::AssistantChunk { delta, .. } if delta == "lo")).await;

        let state = manager.snapshot().await;
        assert!(state.responding);
        let last = state.active_chat().unwrap().messages.last().unwrap().clone();
        assert_eq!(last.sender, Sender::Assistant);
        assert_eq!(last.text, "");

        drop(chunks);
        task.await.unwrap().unwrap();

        let finalized = wait_for(&mut events, |e| matches!(e, ChatEvent::AssistantMessageFinalized { .. })).await;
        assert_eq!(
            finalized,
            ChatEvent::AssistantMessageFinalized {
                chat_id: manager.snapshot().await.active_chat_id.unwrap(),
                message_id: last.id,
                text: "Hello".into(),
                visible: true,
            }
        );
        let state = manager.snapshot().await;
        assert_eq!(state.active_chat().unwrap().messages.last().unwrap().text, "Hello");
        assert!(!state.responding);
    }

    #[tokio::test]
    async fn regenerate_replaces_last_reply() {
        let (manager, provider, _) =
            manager_with(vec![Reply::chunks(&["B"]), Reply::chunks(&["B", "2"])], Some("sk")).await;
        manager.send_message("A", vec![]).await.unwrap();
        let old_reply = manager.snapshot().await.active_chat().unwrap().messages[1].id;

        manager.regenerate().await.unwrap();

        let state = manager.snapshot().await;
        let chat = state.active_chat().unwrap();
        assert_eq!(
            texts(chat),
            vec![(Sender::User, "A".to_string()), (Sender::Assistant, "B2".to_string())]
        );
        assert!(chat.messages.iter().all(|m| m.id != old_reply));
        assert_eq!(provider.requests()[1], vec![CompletionMessage { role: Role::User, content: "A".into() }]);
    }

    #[tokio::test]
    async fn regenerate_without_reply_is_noop() {
        let (manager, provider, _) = manager_with(vec![Reply::chunks(&[])], Some("sk")).await;
        manager.send_message("only a question", vec![]).await.unwrap();
        let before = manager.snapshot().await;
        assert_eq!(before.active_chat().unwrap().messages.len(), 1);
        assert!(!before.responding);

        manager.regenerate().await.unwrap();

        assert_eq!(manager.snapshot().await, before);
        assert_eq!(provider.requests().len(), 1);
    }

    #[tokio::test]
    async fn regenerate_without_credential_keeps_reply() {
        let (manager, _, _) = manager_with(vec![Reply::chunks(&["B"])], Some("sk")).await;
        manager.send_message("A", vec![]).await.unwrap();
        manager.set_api_key("").await;
        let before = manager.snapshot().await;

        assert_eq!(manager.regenerate().await, Err(ChatError::MissingCredential));
        assert_eq!(manager.snapshot().await, before);
    }

    #[tokio::test]
    async fn transport_failure_appends_localized_error() {
        let (manager, _, _) = manager_with(vec![Reply::Refuse("401 Unauthorized".into())], Some("sk")).await;
        manager.set_language(Language::En).await;
        let mut events = manager.subscribe();

        manager.send_message("hello", vec![]).await.unwrap();

        let state = manager.snapshot().await;
        let chat = state.active_chat().unwrap();
        assert_eq!(
            texts(chat),
            vec![
                (Sender::User, "hello".to_string()),
                (Sender::Assistant, i18n::translate(Language::En, Key::ErrorResponse).to_string()),
            ]
        );
        assert!(!state.responding);
        let failed = wait_for(&mut events, |e| matches!(e, ChatEvent::StreamFailed { .. })).await;
        assert!(matches!(failed, ChatEvent::StreamFailed { error, .. } if error.contains("401")));
    }

    #[tokio::test]
    async fn mid_stream_failure_leaves_placeholder_before_error() {
        let (manager, _, _) = manager_with(
            vec![Reply::Chunks(vec![Ok("par".into()), Err("connection reset".into())])],
            Some("sk"),
        )
        .await;

        manager.send_message("hello", vec![]).await.unwrap();

        let state = manager.snapshot().await;
        let chat = state.active_chat().unwrap();
        assert_eq!(chat.messages.len(), 3);
        assert_eq!(chat.messages[1].sender, Sender::Assistant);
        assert_eq!(chat.messages[1].text, "");
        assert_eq!(chat.messages[2].text, i18n::translate(Language::Ru, Key::ErrorResponse));
    }

    #[tokio::test]
    async fn second_send_while_streaming_is_rejected() {
        let (reply, chunks) = Reply::channel();
        let (manager, _, _) = manager_with(vec![reply], Some("sk")).await;
        let mut events = manager.subscribe();
        let sender = manager.clone();
        let task = tokio::spawn(async move { sender.send_message("first", vec![]).await });

        chunks.unbounded_send(Ok("x".into())).unwrap();
        let ChatEvent::AssistantMessageStarted { chat_id, .. } =
            wait_for(&mut events, |e| matches!(e, ChatEvent::AssistantMessageStarted { .. })).await
        else {
            unreachable!()
        };
        let before = manager.snapshot().await;

        assert_eq!(manager.send_message("second", vec![]).await, Err(ChatError::Busy { chat_id }));
        assert_eq!(manager.regenerate().await, Err(ChatError::Busy { chat_id }));
        assert_eq!(manager.snapshot().await, before);
        assert!(manager.is_streaming(chat_id));

        drop(chunks);
        task.await.unwrap().unwrap();
        assert!(!manager.is_streaming(chat_id));
    }

    #[tokio::test]
    async fn chat_stays_busy_until_reply_is_finalized() {
        let (reply, chunks) = Reply::channel();
        let (manager, provider, _) = manager_with(vec![reply, Reply::chunks(&["late"])], Some("sk")).await;
        let mut events = manager.subscribe();
        let sender = manager.clone();
        let first = tokio::spawn(async move { sender.send_message("first", vec![]).await });

        chunks.unbounded_send(Ok("answer".into())).unwrap();
        let ChatEvent::AssistantMessageStarted { chat_id, .. } =
            wait_for(&mut events, |e| matches!(e, ChatEvent::AssistantMessageStarted { .. })).await
        else {
            unreachable!()
        };

        // Queue a second send on the lock, then let the stream end behind it
        let lock = manager.state.lock().await;
        let sender = manager.clone();
        let second = tokio::spawn(async move { sender.send_message("second", vec![]).await });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        drop(chunks);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        drop(lock);

        assert_eq!(second.await.unwrap(), Err(ChatError::Busy { chat_id }));
        first.await.unwrap().unwrap();

        let state = manager.snapshot().await;
        assert_eq!(
            texts(state.active_chat().unwrap()),
            vec![(Sender::User, "first".to_string()), (Sender::Assistant, "answer".to_string())]
        );
        assert!(!state.responding);
        assert_eq!(provider.requests().len(), 1);
    }

    #[tokio::test]
    async fn deleting_chat_cancels_its_stream() {
        let (reply, _chunks) = Reply::channel();
        let (manager, _, _) = manager_with(vec![reply], Some("sk")).await;
        let mut events = manager.subscribe();
        let sender = manager.clone();
        let task = tokio::spawn(async move { sender.send_message("hello", vec![]).await });

        wait_for(&mut events, |e| *e == ChatEvent::RespondingChanged { responding: true }).await;
        let chat_id = manager.snapshot().await.active_chat_id.unwrap();
        assert!(manager.is_streaming(chat_id));

        manager.delete_chat(chat_id).await;
        task.await.unwrap().unwrap();

        let state = manager.snapshot().await;
        assert!(!manager.is_streaming(chat_id));
        assert!(!state.responding);
        assert!(state.chats.is_empty());
    }

    #[tokio::test]
    async fn cancel_finalizes_with_partial_text() {
        let (reply, chunks) = Reply::channel();
        let (manager, _, _) = manager_with(vec![reply], Some("sk")).await;
        let mut events = manager.subscribe();
        let sender = manager.clone();
        let task = tokio::spawn(async move { sender.send_message("tell me", vec![]).await });

        chunks.unbounded_send(Ok("part".into())).unwrap();
        let ChatEvent::AssistantChunk { chat_id, .. } =
            wait_for(&mut events, |e| matches!(e, ChatEvent::AssistantChunk { .. })).await
        else {
            unreachable!()
        };

        assert!(manager.cancel(chat_id));
        task.await.unwrap().unwrap();

        let state = manager.snapshot().await;
        assert_eq!(state.active_chat().unwrap().messages[1].text, "part");
        assert!(!state.responding);
        assert!(!manager.cancel(chat_id));
    }

    #[tokio::test]
    async fn deleting_chats_updates_active_pointer() {
        let (manager, _, _) = manager_with(vec![], Some("sk")).await;
        let first = manager.create_chat().await;
        let second = manager.create_chat().await;

        manager.delete_chat(first.id).await;
        assert_eq!(manager.snapshot().await.active_chat_id, Some(second.id));

        manager.delete_chat(second.id).await;
        let state = manager.snapshot().await;
        assert_eq!(state.active_chat_id, None);
        assert!(state.chats.is_empty());
    }

    #[tokio::test]
    async fn select_chat_switches_active_chat() {
        let (manager, _, _) = manager_with(vec![], Some("sk")).await;
        let first = manager.create_chat().await;
        manager.create_chat().await;
        let mut events = manager.subscribe();

        manager.select_chat(first.id).await;

        assert_eq!(manager.snapshot().await.active_chat_id, Some(first.id));
        assert_eq!(events.recv().await.unwrap(), ChatEvent::ActiveChatChanged { chat_id: Some(first.id) });
    }

    #[tokio::test]
    async fn chat_list_survives_reload() {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(ScriptedProvider::new(vec![Reply::chunks(&["answer"])]));
        let models = crate::test_support::models();
        let manager = ChatManager::new(store.clone(), provider.clone(), models.clone());
        manager.load(Some("sk".into())).await.unwrap();
        manager.send_message("question", vec![]).await.unwrap();
        manager.toggle_language().await;

        let reloaded = ChatManager::new(store, provider, models);
        reloaded.load(None).await.unwrap();

        let before = manager.snapshot().await;
        let after = reloaded.snapshot().await;
        assert_eq!(after.chats, before.chats);
        assert_eq!(after.language, Language::Hy);
        assert_eq!(after.active_chat_id, None);
    }

    #[tokio::test]
    async fn delete_all_is_persisted() {
        let (manager, _, store) = manager_with(vec![], Some("sk")).await;
        manager.create_chat().await;
        manager.create_chat().await;

        manager.delete_all_chats().await;

        let stored: Vec<Chat> = storage::load_json(&*store, CHATS_KEY).await.unwrap().unwrap();
        assert!(stored.is_empty());
        assert!(manager.snapshot().await.active_chat().is_none());
    }

    #[tokio::test]
    async fn malformed_stored_chats_start_empty() {
        let store = Arc::new(MemoryStore::new());
        store.save(CHATS_KEY, "{not json").await.unwrap();
        store.save(LANGUAGE_KEY, "xx").await.unwrap();
        let manager = ChatManager::new(store, Arc::new(ScriptedProvider::new(vec![])), crate::test_support::models());

        manager.load(None).await.unwrap();

        let state = manager.snapshot().await;
        assert!(state.chats.is_empty());
        assert_eq!(state.language, Language::Ru);
    }

    #[tokio::test]
    async fn stored_credential_wins_over_fallback() {
        let store = Arc::new(MemoryStore::new());
        store.save(API_KEY_KEY, "sk-stored").await.unwrap();
        let manager = ChatManager::new(store, Arc::new(ScriptedProvider::new(vec![])), crate::test_support::models());

        manager.load(Some("sk-env".into())).await.unwrap();

        assert_eq!(manager.snapshot().await.api_key.as_deref(), Some("sk-stored"));
    }

    #[tokio::test]
    async fn toggle_language_cycles_and_persists() {
        let (manager, _, store) = manager_with(vec![], None).await;
        assert_eq!(manager.toggle_language().await, Language::Hy);
        assert_eq!(manager.toggle_language().await, Language::En);
        assert_eq!(store.load(LANGUAGE_KEY).await.unwrap().as_deref(), Some("en"));
        assert_eq!(manager.toggle_language().await, Language::Ru);
    }

    #[tokio::test]
    async fn set_model_rejects_unknown_names() {
        let (manager, _, _) = manager_with(vec![], None).await;
        assert_eq!(manager.set_model("AM Pro").await, Ok(()));
        assert_eq!(manager.snapshot().await.selected_model, "AM Pro");
        assert_eq!(
            manager.set_model("GPT-9").await,
            Err(ChatError::UnknownModel("GPT-9".into()))
        );
    }
}
