use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use futures::channel::mpsc;
use futures::{stream, StreamExt};

use crate::api::{CompletionMessage, DeltaStream, LLMApiProvider};
use crate::manager::ChatManager;
use crate::models::ModelConfig;
use crate::storage::MemoryStore;

/// What the scripted provider does for one request.
pub enum Reply {
    /// Yields the fragments in order, then ends.
    Chunks(Vec<Result<String, String>>),
    /// Fails before any fragment is produced.
    Refuse(String),
    /// Yields whatever the test pushes; ends when the sender is dropped.
    Channel(mpsc::UnboundedReceiver<Result<String>>),
}

impl Reply {
    pub fn chunks(parts: &[&str]) -> Self {
        Reply::Chunks(parts.iter().map(|p| Ok(p.to_string())).collect())
    }

    pub fn channel() -> (Self, mpsc::UnboundedSender<Result<String>>) {
        let (tx, rx) = mpsc::unbounded();
        (Reply::Channel(rx), tx)
    }
}

pub struct ScriptedProvider {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<Vec<CompletionMessage>>>,
}

impl ScriptedProvider {
    pub fn new(replies: Vec<Reply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Histories received so far, in call order.
    pub fn requests(&self) -> Vec<Vec<CompletionMessage>> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LLMApiProvider for ScriptedProvider {
    async fn send_chat_stream_request(
        &self,
        _config: &ModelConfig,
        _api_key: &str,
        messages: &[CompletionMessage],
    ) -> Result<DeltaStream> {
        self.requests.lock().unwrap().push(messages.to_vec());
        let reply = self.replies.lock().unwrap().pop_front();
        match reply {
            Some(Reply::Chunks(parts)) => {
                let items = parts.into_iter().map(|p| p.map_err(anyhow::Error::msg));
                Ok(stream::iter(items).boxed())
            }
            Some(Reply::Refuse(reason)) => Err(anyhow::anyhow!(reason)),
            Some(Reply::Channel(rx)) => Ok(rx.boxed()),
            None => Err(anyhow::anyhow!("no scripted reply left")),
        }
    }
}

pub fn models() -> Vec<ModelConfig> {
    ["AM Base", "AM Pro"]
        .into_iter()
        .map(|name| ModelConfig {
            name: name.to_string(),
            provider: "openai_compatible".to_string(),
            api_url: "http://localhost:0/v1".to_string(),
            model: "test-model".to_string(),
        })
        .collect()
}

/// A loaded manager over a fresh in-memory store.
pub async fn manager_with(
    replies: Vec<Reply>,
    api_key: Option<&str>,
) -> (ChatManager, Arc<ScriptedProvider>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let provider = Arc::new(ScriptedProvider::new(replies));
    let manager = ChatManager::new(store.clone(), provider.clone(), models());
    manager.load(api_key.map(str::to_string)).await.unwrap();
    (manager, provider, store)
}
