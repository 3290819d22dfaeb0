//! LLM連携（チャット補完 + 意図分類）

pub mod classifier;
pub mod client;

pub use classifier::{is_conversational_followup, ClassifyOutcome, IntentClassifier};
pub use client::{ChatMessage, ChatOutcome, ChatProvider, HttpChatClient};
