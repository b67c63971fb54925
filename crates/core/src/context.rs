//! Dialogue context
//!
//! Ordered, append-only history of one conversation as seen by the language model.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    /// Tool/function response role
    Tool,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

/// One entry of the dialogue context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DialogueItem {
    Message {
        role: Role,
        content: String,
    },
    FunctionCall {
        call_id: String,
        name: String,
        arguments: String,
    },
    FunctionCallOutput {
        call_id: String,
        output: String,
    },
}

impl DialogueItem {
    pub fn message(role: Role, content: impl Into<String>) -> Self {
        Self::Message {
            role,
            content: content.into(),
        }
    }

    pub fn role(&self) -> Option<Role> {
        match self {
            Self::Message { role, .. } => Some(*role),
            _ => None,
        }
    }
}

/// Ordered dialogue history
///
/// Items are only ever appended. When a bound is set, the oldest non-system
/// items fall off the front; a leading system message is always kept.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DialogueContext {
    items: Vec<DialogueItem>,
    #[serde(skip)]
    max_items: Option<usize>,
}

impl DialogueContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context seeded with a system prompt
    pub fn with_system_prompt(prompt: impl Into<String>) -> Self {
        let mut ctx = Self::new();
        ctx.push(DialogueItem::message(Role::System, prompt));
        ctx
    }

    /// Keep at most `max_items` entries (plus the system prompt)
    pub fn with_max_items(mut self, max_items: usize) -> Self {
        self.max_items = Some(max_items);
        self.enforce_bound();
        self
    }

    pub fn push(&mut self, item: DialogueItem) {
        self.items.push(item);
        self.enforce_bound();
    }

    pub fn add_user(&mut self, content: impl Into<String>) {
        self.push(DialogueItem::message(Role::User, content));
    }

    pub fn add_assistant(&mut self, content: impl Into<String>) {
        self.push(DialogueItem::message(Role::Assistant, content));
    }

    pub fn items(&self) -> &[DialogueItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Content of the most recent user message
    pub fn last_user_message(&self) -> Option<&str> {
        self.items.iter().rev().find_map(|item| match item {
            DialogueItem::Message {
                role: Role::User,
                content,
            } => Some(content.as_str()),
            _ => None,
        })
    }

    /// Replace the system prompt, inserting one if absent
    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        let prompt = prompt.into();
        match self.items.first_mut() {
            Some(DialogueItem::Message {
                role: Role::System,
                content,
            }) => *content = prompt,
            _ => self.items.insert(0, DialogueItem::message(Role::System, prompt)),
        }
    }

    fn enforce_bound(&mut self) {
        let Some(max) = self.max_items else {
            return;
        };
        let has_system = matches!(self.items.first(), Some(item) if item.role() == Some(Role::System));
        let start = usize::from(has_system);
        let body = self.items.len() - start;
        if body > max {
            self.items.drain(start..start + (body - max));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_preserved() {
        let mut ctx = DialogueContext::with_system_prompt("be brief");
        ctx.add_user("hi");
        ctx.push(DialogueItem::FunctionCall {
            call_id: "c1".into(),
            name: "weather".into(),
            arguments: "{}".into(),
        });
        ctx.push(DialogueItem::FunctionCallOutput {
            call_id: "c1".into(),
            output: "sunny".into(),
        });
        ctx.add_assistant("It is sunny.");

        let roles: Vec<_> = ctx.items().iter().map(|i| i.role()).collect();
        assert_eq!(
            roles,
            vec![Some(Role::System), Some(Role::User), None, None, Some(Role::Assistant)]
        );
        assert_eq!(ctx.last_user_message(), Some("hi"));
    }

    #[test]
    fn test_bound_keeps_system_prompt() {
        let mut ctx = DialogueContext::with_system_prompt("sys").with_max_items(2);
        ctx.add_user("one");
        ctx.add_assistant("two");
        ctx.add_user("three");

        assert_eq!(ctx.len(), 3);
        assert_eq!(ctx.items()[0].role(), Some(Role::System));
        assert_eq!(
            ctx.items()[1],
            DialogueItem::message(Role::Assistant, "two")
        );
        assert_eq!(ctx.last_user_message(), Some("three"));
    }

    #[test]
    fn test_set_system_prompt() {
        let mut ctx = DialogueContext::new();
        ctx.add_user("hello");
        ctx.set_system_prompt("first");
        ctx.set_system_prompt("second");
        assert_eq!(ctx.items()[0], DialogueItem::message(Role::System, "second"));
        assert_eq!(ctx.len(), 2);
    }
}
