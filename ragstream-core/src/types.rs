//! Core data types shared by the prompt assembler, providers, and relay.

use serde::{Deserialize, Serialize};

/// Represents a participant role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
        }
    }
}

/// A single chat message sent upstream.
///
/// Serializes to the `{"role": ..., "content": ...}` shape both provider
/// families accept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

impl PromptMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// One unit of model output produced by an upstream adapter.
///
/// A fragment with `done = true` is the terminal signal and carries no text;
/// adapters never yield anything after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFragment {
    pub text: String,
    pub done: bool,
}

impl StreamFragment {
    /// A text-bearing fragment.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            done: false,
        }
    }

    /// The terminal signal.
    pub fn terminal() -> Self {
        Self {
            text: String::new(),
            done: true,
        }
    }
}
