//! Core type definitions shared across the workspace.

pub mod conversation;

pub use conversation::ConversationId;
