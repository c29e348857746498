use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// UI languages supported by the client.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Ru,
    Hy,
    En,
}

impl Language {
    /// Order used when cycling through languages.
    pub const ALL: [Language; 3] = [Language::Ru, Language::Hy, Language::En];

    pub fn code(self) -> &'static str {
        match self {
            Language::Ru => "ru",
            Language::Hy => "hy",
            Language::En => "en",
        }
    }

    pub fn native_name(self) -> &'static str {
        match self {
            Language::Ru => "Русский",
            Language::Hy => "Հայերեն",
            Language::En => "English",
        }
    }

    /// The language after this one, wrapping around.
    pub fn next(self) -> Language {
        let idx = Self::ALL.iter().position(|l| *l == self).unwrap_or(0);
        Self::ALL[(idx + 1) % Self::ALL.len()]
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Language {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ru" => Ok(Language::Ru),
            "hy" => Ok(Language::Hy),
            "en" => Ok(Language::En),
            other => Err(anyhow::anyhow!("Unsupported language code: {}", other)),
        }
    }
}

/// Keys for the UI strings the core needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Key {
    NewChat,
    ErrorResponse,
    MissingApiKey,
    Busy,
    Thinking,
    Today,
    Last7Days,
    Last30Days,
    Older,
    NoChats,
}

pub fn translate(lang: Language, key: Key) -> &'static str {
    match (lang, key) {
        (Language::Ru, Key::NewChat) => "Новый чат",
        (Language::Hy, Key::NewChat) => "Նոր զրույց",
        (Language::En, Key::NewChat) => "New chat",

        (Language::Ru, Key::ErrorResponse) => "Извините, произошла ошибка при обработке запроса. Пожалуйста, проверьте API ключ и попробуйте снова.",
        (Language::Hy, Key::ErrorResponse) => "Ներողություն, հարցումը մշակելիս սխալ տեղի ունեցավ։ Խնդրում ենք ստուգել API բանալին և կրկին փորձել։",
        (Language::En, Key::ErrorResponse) => "Sorry, something went wrong while processing your request. Please check the API key and try again.",

        (Language::Ru, Key::MissingApiKey) => "Пожалуйста, настройте API ключ в админ панели",
        (Language::Hy, Key::MissingApiKey) => "Խնդրում ենք կարգավորել API բանալին ադմինիստրատորի վահանակում",
        (Language::En, Key::MissingApiKey) => "Please configure the API key in the admin panel",

        (Language::Ru, Key::Busy) => "Ответ ещё генерируется, подождите",
        (Language::Hy, Key::Busy) => "Պատասխանը դեռ գեներացվում է, սպասեք",
        (Language::En, Key::Busy) => "A reply is still being generated, please wait",

        (Language::Ru, Key::Thinking) => "Думаю...",
        (Language::Hy, Key::Thinking) => "Մտածում եմ...",
        (Language::En, Key::Thinking) => "Thinking...",

        (Language::Ru, Key::Today) => "Сегодня",
        (Language::Hy, Key::Today) => "Այսօր",
        (Language::En, Key::Today) => "Today",

        (Language::Ru, Key::Last7Days) => "Последние 7 дней",
        (Language::Hy, Key::Last7Days) => "Վերջին 7 օրը",
        (Language::En, Key::Last7Days) => "Previous 7 days",

        (Language::Ru, Key::Last30Days) => "Последние 30 дней",
        (Language::Hy, Key::Last30Days) => "Վերջին 30 օրը",
        (Language::En, Key::Last30Days) => "Previous 30 days",

        (Language::Ru, Key::Older) => "Ранее",
        (Language::Hy, Key::Older) => "Ավելի վաղ",
        (Language::En, Key::Older) => "Older",

        (Language::Ru, Key::NoChats) => "Чатов пока нет",
        (Language::Hy, Key::NoChats) => "Զրույցներ դեռ չկան",
        (Language::En, Key::NoChats) => "No chats yet",
    }
}
