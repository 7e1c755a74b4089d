//! Chat bot front end

pub mod commands;
pub mod telegram;

pub use commands::{BotHandler, Command, Sender};
pub use telegram::{MessageHandler, TelegramBot};
