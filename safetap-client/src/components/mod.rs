pub mod chat_history;
