// Front-end intents typed at the prompt

use crate::i18n::Language;
use anyhow::{Context, Result};
use std::path::PathBuf;

#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    Send(String),
    NewChat,
    Regenerate,
    ListChats,
    /// 1-based position in the chat list.
    Switch(usize),
    Delete(usize),
    /// Only `confirmed` deletes anything.
    DeleteAll { confirmed: bool },
    /// `None` cycles to the next language.
    Language(Option<Language>),
    /// `None` lists the configured models.
    Model(Option<String>),
    SetKey(String),
    Attach(PathBuf),
    Stop,
    Help,
    Quit,
}

pub const HELP: &str = "\
Type a message and press Enter to send it.
  /new              start a new chat
  /regen            regenerate the last reply
  /chats            list chats
  /switch N         open chat N
  /delete N         delete chat N
  /delete-all       delete every chat (asks for confirmation)
  /lang [ru|hy|en]  set or cycle the language
  /model [NAME]     select or list models
  /key KEY          set the API key (empty clears it)
  /attach PATH      attach a file to the next message
  /stop             stop the reply being generated
  /help             show this help
  /quit             exit";

/// Parses one input line. Blank lines yield `Ok(None)`.
pub fn parse_command(line: &str) -> Result<Option<Command>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(Command::Send(line.to_string())));
    };

    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };

    let command = match name {
        "new" => Command::NewChat,
        "regen" | "regenerate" => Command::Regenerate,
        "chats" => Command::ListChats,
        "switch" => Command::Switch(parse_position(arg)?),
        "delete" => Command::Delete(parse_position(arg)?),
        "delete-all" => match arg {
            "" => Command::DeleteAll { confirmed: false },
            "confirm" => Command::DeleteAll { confirmed: true },
            other => anyhow::bail!("Unexpected argument '{}'; use /delete-all confirm", other),
        },
        "lang" => Command::Language(if arg.is_empty() { None } else { Some(arg.parse()?) }),
        "model" => Command::Model((!arg.is_empty()).then(|| arg.to_string())),
        "key" => Command::SetKey(arg.to_string()),
        "attach" => {
            anyhow::ensure!(!arg.is_empty(), "/attach needs a file path");
            Command::Attach(PathBuf::from(arg))
        }
        "stop" => Command::Stop,
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => anyhow::bail!("Unknown command: /{} (try /help)", other),
    };
    Ok(Some(command))
}

fn parse_position(arg: &str) -> Result<usize> {
    let n: usize = arg
        .parse()
        .with_context(|| format!("Expected a chat number, got '{}'", arg))?;
    anyhow::ensure!(n > 0, "Chat numbers start at 1");
    Ok(n)
}
