use std::io::Write;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

use crate::commands::{self, Command};
use crate::config::{self, AppConfig};
use crate::i18n::{self, Key};
use crate::manager::{ChatEvent, ChatManager};
use crate::models::{group_chats_by_date, Attachment, Chat, Sender};
use crate::typing::{RevealFrame, TypingScheduler};

/// Line-oriented front-end: reads intents from stdin, renders replies through
/// the typing scheduler.
pub async fn run_shell(manager: ChatManager, config: &AppConfig) -> Result<()> {
    let (typing_task, mut frames) = TypingScheduler::spawn(manager.subscribe(), config.typing);
    let mut events = manager.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut pending_attachments: Vec<Attachment> = Vec::new();
    let mut revealed = 0usize;

    println!("MA AI. Type /help for commands.");
    let state = manager.snapshot().await;
    if !state.has_api_key() {
        println!("{}", i18n::translate(state.language, Key::MissingApiKey));
    }

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read from stdin")? else { break };
                let command = match commands::parse_command(&line) {
                    Ok(Some(command)) => command,
                    Ok(None) => continue,
                    Err(e) => {
                        println!("{}", e);
                        continue;
                    }
                };
                if command == Command::Quit {
                    break;
                }
                handle_command(&manager, config, command, &mut pending_attachments).await;
            }
            Some(frame) = frames.recv() => {
                let language = manager.snapshot().await.language;
                match frame {
                    RevealFrame::Thinking { .. } => {
                        revealed = 0;
                        print!("{} ", i18n::translate(language, Key::Thinking));
                    }
                    RevealFrame::Reveal { visible, .. } => {
                        if revealed == 0 {
                            print!("\r\x1b[2K");
                        }
                        print!("{}", &visible[revealed..]);
                        revealed = visible.len();
                    }
                    RevealFrame::Done { .. } => println!(),
                }
                std::io::stdout().flush().ok();
            }
            event = events.recv() => match event {
                Ok(ChatEvent::StreamFailed { chat_id, .. }) => {
                    let state = manager.snapshot().await;
                    if let Some(last) = state.chat(chat_id).and_then(|c| c.messages.last()) {
                        println!("! {}", last.text);
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    typing_task.abort();
    Ok(())
}

async fn handle_command(
    manager: &ChatManager,
    config: &AppConfig,
    command: Command,
    pending_attachments: &mut Vec<Attachment>,
) {
    let language = manager.snapshot().await.language;
    match command {
        Command::Send(text) => {
            let attachments = std::mem::take(pending_attachments);
            let manager = manager.clone();
            tokio::spawn(async move {
                if let Err(e) = manager.send_message(&text, attachments).await {
                    println!("! {}", e.user_message(language));
                }
            });
        }
        Command::Regenerate => {
            let manager = manager.clone();
            tokio::spawn(async move {
                if let Err(e) = manager.regenerate().await {
                    println!("! {}", e.user_message(language));
                }
            });
        }
        Command::NewChat => {
            let chat = manager.create_chat().await;
            println!("# {}", chat.title);
        }
        Command::ListChats => {
            let state = manager.snapshot().await;
            if state.chats.is_empty() {
                println!("{}", i18n::translate(language, Key::NoChats));
                return;
            }
            for (age, chats) in group_chats_by_date(&state.chats, &chrono::Local::now()) {
                println!("{}", age.label(language));
                for chat in chats {
                    let position = state.chats.iter().position(|c| c.id == chat.id).unwrap_or(0) + 1;
                    let marker = if state.active_chat_id == Some(chat.id) { '*' } else { ' ' };
                    println!(" {}{:>3}. {}", marker, position, chat.title);
                }
            }
        }
        Command::Switch(position) => match chat_at(manager, position).await {
            Some(chat) => {
                manager.select_chat(chat.id).await;
                print_transcript(&chat);
            }
            None => println!("No chat #{}", position),
        },
        Command::Delete(position) => match chat_at(manager, position).await {
            Some(chat) => {
                manager.delete_chat(chat.id).await;
                println!("Deleted \"{}\"", chat.title);
            }
            None => println!("No chat #{}", position),
        },
        Command::DeleteAll { confirmed: false } => {
            let count = manager.snapshot().await.chats.len();
            println!("This deletes all {} chats. Type /delete-all confirm to proceed.", count);
        }
        Command::DeleteAll { confirmed: true } => {
            manager.delete_all_chats().await;
            println!("{}", i18n::translate(language, Key::NoChats));
        }
        Command::Language(Some(next)) => {
            manager.set_language(next).await;
            println!("{}", next.native_name());
        }
        Command::Language(None) => {
            let next = manager.toggle_language().await;
            println!("{}", next.native_name());
        }
        Command::Model(Some(name)) => match manager.set_model(&name).await {
            Ok(()) => println!("Model: {}", name),
            Err(e) => println!("! {}", e.user_message(language)),
        },
        Command::Model(None) => {
            let selected = manager.snapshot().await.selected_model;
            for model in manager.models() {
                let marker = if model.name == selected { '*' } else { ' ' };
                println!(" {} {} ({})", marker, model.name, model.model);
            }
        }
        Command::SetKey(key) => {
            manager.set_api_key(&key).await;
            if config.api_key_ref.as_deref() == Some("keyring") && !key.is_empty() {
                if let Err(e) = config::set_api_key_in_keyring(&key) {
                    log::error!("Failed to store API key in keyring: {:?}", e);
                }
            }
            println!("{}", if key.is_empty() { "API key cleared" } else { "API key saved" });
        }
        Command::Attach(path) => match describe_attachment(&path).await {
            Ok(attachment) => {
                println!("Attached {} ({} bytes)", attachment.name, attachment.size);
                pending_attachments.push(attachment);
            }
            Err(e) => println!("! {:#}", e),
        },
        Command::Stop => {
            let state = manager.snapshot().await;
            let stopped = state.active_chat_id.is_some_and(|id| manager.cancel(id));
            if !stopped {
                println!("Nothing to stop");
            }
        }
        Command::Help => println!("{}", commands::HELP),
        Command::Quit => {}
    }
}

async fn chat_at(manager: &ChatManager, position: usize) -> Option<Chat> {
    manager.snapshot().await.chats.get(position - 1).cloned()
}

fn print_transcript(chat: &Chat) {
    println!("# {}", chat.title);
    for message in &chat.messages {
        let who = match message.sender {
            Sender::User => ">",
            Sender::Assistant => "<",
        };
        println!("{} {}", who, message.text);
    }
}

async fn describe_attachment(path: &std::path::Path) -> Result<Attachment> {
    let metadata = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("Cannot read {}", path.display()))?;
    anyhow::ensure!(metadata.is_file(), "{} is not a file", path.display());
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let mime_type = path
        .extension()
        .and_then(|ext| ext.to_str())
        .and_then(|ext| match ext.to_ascii_lowercase().as_str() {
            "txt" | "md" => Some("text/plain"),
            "json" => Some("application/json"),
            "pdf" => Some("application/pdf"),
            "png" => Some("image/png"),
            "jpg" | "jpeg" => Some("image/jpeg"),
            _ => None,
        })
        .map(str::to_string);
    Ok(Attachment { name, mime_type, size: metadata.len() })
}
