//! Prompt assembly: the fixed system policy plus a user message that either
//! carries the raw question or wraps it with retrieved context.

use crate::types::PromptMessage;

/// Domain policy sent as the system message on every request.
pub const SYSTEM_PROMPT: &str = "\
You are an intelligent assistant for a Car Rental Application.
Answer questions as a car rental agent.
- Answer user questions clearly and concisely.
- Always stay within the context of car rental (vehicles, bookings, pricing, policies).
- If asked something outside this domain, politely decline and redirect back to car rentals.
- If the user's request is ambiguous or incomplete, ask targeted clarifying questions.
- If the answer is not present in the provided context, say you don't know.
";

/// Separator placed between retrieved chunks inside the context block.
pub const CONTEXT_SEPARATOR: &str = "\n---\n";

/// The system + user message pair built for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledPrompt {
    pub system: String,
    pub user: String,
    /// Number of context chunks injected into `user`.
    pub context_chunks: usize,
}

impl AssembledPrompt {
    /// The two messages in upstream order.
    pub fn messages(&self) -> [PromptMessage; 2] {
        [
            PromptMessage::system(self.system.clone()),
            PromptMessage::user(self.user.clone()),
        ]
    }
}

/// Build the prompt for `user_prompt` given the retrieved `context` chunks.
///
/// With no context the user message is the prompt verbatim. Otherwise the
/// prompt is wrapped in a template restricting the model to the supplied
/// context, with the chunks joined by [`CONTEXT_SEPARATOR`].
pub fn assemble(user_prompt: &str, context: &[String]) -> AssembledPrompt {
    let user = if context.is_empty() {
        user_prompt.to_string()
    } else {
        format!(
            "Use ONLY the context below to answer. If unsure, say you don't know.\n\
             Context:\n\
             ---\n\
             {}\n\
             ---\n\
             Question: {}\n",
            context.join(CONTEXT_SEPARATOR),
            user_prompt
        )
    };

    AssembledPrompt {
        system: SYSTEM_PROMPT.to_string(),
        user,
        context_chunks: context.len(),
    }
}
