//! Prompt Building
//!
//! Assembles the dialogue context sent to the language model for one reply and serializes
//! it to the OpenAI chat message layout.

use serde_json::{json, Value};
use unicode_segmentation::UnicodeSegmentation;
use voice_session_core::{DialogueContext, DialogueItem, Role};

/// Builds the context for one reply
pub struct PromptBuilder {
    items: Vec<DialogueItem>,
}

impl PromptBuilder {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    /// Agent persona plus spoken-reply guidelines
    pub fn system_prompt(mut self, persona: &str, language: Option<&str>) -> Self {
        let mut system = persona.trim().to_string();
        if !system.is_empty() {
            system.push_str("\n\n");
        }
        system.push_str(
            "## Response Format\n\
             Respond naturally as if speaking on a phone call. Do not use bullet points, headers, \
             or markdown formatting. Keep responses brief and conversational. Ask one question at a time.",
        );
        if let Some(language) = language.filter(|l| !l.is_empty()) {
            system.push_str(&format!("\nReply in the user's language ({}).", language));
        }

        self.items.push(DialogueItem::message(Role::System, system));
        self
    }

    /// Add retrieved context (speculative lookup result)
    pub fn with_context(mut self, context: &str) -> Self {
        if !context.trim().is_empty() {
            let context_msg = format!(
                "## Relevant Information\n{}\n\nUse this information to answer the user's question if relevant.",
                context.trim()
            );
            self.items.push(DialogueItem::message(Role::System, context_msg));
        }
        self
    }

    /// Add conversation history, skipping its system prompt
    pub fn with_history(mut self, history: &DialogueContext) -> Self {
        self.items.extend(
            history
                .items()
                .iter()
                .filter(|item| item.role() != Some(Role::System))
                .cloned(),
        );
        self
    }

    /// Add current user message
    pub fn user_message(mut self, message: &str) -> Self {
        self.items.push(DialogueItem::message(Role::User, message));
        self
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    /// Build final context
    pub fn build(self) -> DialogueContext {
        let mut context = DialogueContext::new();
        for item in self.items {
            context.push(item);
        }
        context
    }

    /// Build with context window limit
    ///
    /// Keeps every system message and the most recent conversation items that fit,
    /// dropping the oldest first.
    pub fn build_with_limit(self, max_tokens: usize) -> DialogueContext {
        let current_tokens: usize = self.items.iter().map(item_tokens).sum();
        if current_tokens <= max_tokens {
            return self.build();
        }

        let (system_items, conversation): (Vec<_>, Vec<_>) = self
            .items
            .into_iter()
            .partition(|item| item.role() == Some(Role::System));

        let system_tokens: usize = system_items.iter().map(item_tokens).sum();
        let available_tokens = max_tokens.saturating_sub(system_tokens);

        let mut kept = Vec::new();
        let mut used_tokens = 0;
        for item in conversation.into_iter().rev() {
            let tokens = item_tokens(&item);
            if used_tokens + tokens > available_tokens {
                break;
            }
            used_tokens += tokens;
            kept.push(item);
        }
        kept.reverse();

        tracing::debug!(
            "Context truncated: {} -> {} tokens ({} items kept)",
            current_tokens,
            system_tokens + used_tokens,
            system_items.len() + kept.len()
        );

        let mut context = DialogueContext::new();
        for item in system_items.into_iter().chain(kept) {
            context.push(item);
        }
        context
    }
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Rough token estimate; Devanagari-heavy text tokenizes about twice as densely
pub fn estimate_tokens(text: &str) -> usize {
    let grapheme_count = text.graphemes(true).count();
    let devanagari_count = text
        .chars()
        .filter(|c| ('\u{0900}'..='\u{097F}').contains(c))
        .count();

    if devanagari_count > grapheme_count / 3 {
        grapheme_count.max(1) / 2
    } else {
        grapheme_count.max(1) / 4
    }
}

fn item_tokens(item: &DialogueItem) -> usize {
    match item {
        DialogueItem::Message { content, .. } => estimate_tokens(content),
        DialogueItem::FunctionCall { name, arguments, .. } => {
            estimate_tokens(name) + estimate_tokens(arguments)
        }
        DialogueItem::FunctionCallOutput { output, .. } => estimate_tokens(output),
    }
}

/// Serialize a context to OpenAI chat messages
///
/// Consecutive function calls become one assistant message with several `tool_calls`.
pub fn to_openai_messages(context: &DialogueContext) -> Vec<Value> {
    let mut messages: Vec<Value> = Vec::with_capacity(context.len());

    for item in context.items() {
        match item {
            DialogueItem::Message { role, content } => {
                messages.push(json!({ "role": role.to_string(), "content": content }));
            }
            DialogueItem::FunctionCall {
                call_id,
                name,
                arguments,
            } => {
                let call = json!({
                    "id": call_id,
                    "type": "function",
                    "function": { "name": name, "arguments": arguments },
                });
                let merged = messages
                    .last_mut()
                    .and_then(|last| last.get_mut("tool_calls"))
                    .and_then(Value::as_array_mut)
                    .map(|calls| calls.push(call.clone()))
                    .is_some();
                if !merged {
                    messages.push(json!({
                        "role": "assistant",
                        "content": Value::Null,
                        "tool_calls": [call],
                    }));
                }
            }
            DialogueItem::FunctionCallOutput { call_id, output } => {
                messages.push(json!({
                    "role": "tool",
                    "tool_call_id": call_id,
                    "content": output,
                }));
            }
        }
    }

    messages
}
