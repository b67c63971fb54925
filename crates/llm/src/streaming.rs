//! Streaming reply assembly
//!
//! Collects the deltas of one model reply: content is passed on as it arrives (for
//! segmentation and synthesis), tool-call fragments are stitched back together by index, and
//! a leading emoji is lifted off as the reply's emotion tag.

use std::collections::BTreeMap;

use voice_session_core::{ChatDelta, DialogueItem};

/// A complete tool call requested by the model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCall {
    pub call_id: String,
    pub name: String,
    pub arguments: String,
}

impl ToolCall {
    pub fn into_item(self) -> DialogueItem {
        DialogueItem::FunctionCall {
            call_id: self.call_id,
            name: self.name,
            arguments: self.arguments,
        }
    }
}

/// Everything the model produced for one reply
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssembledReply {
    /// Spoken text (emotion tag removed)
    pub text: String,
    pub emotion: Option<&'static str>,
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Default)]
struct PartialCall {
    call_id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// Emoji the model may open a reply with, and the emotion reported to the client
const EMOTIONS: &[(char, &str)] = &[
    ('😊', "happy"),
    ('😀', "happy"),
    ('😂', "laughing"),
    ('😆', "laughing"),
    ('😢', "sad"),
    ('😭', "crying"),
    ('😠', "angry"),
    ('😡', "angry"),
    ('😲', "surprised"),
    ('😮', "surprised"),
    ('🤔', "thinking"),
    ('😌', "relaxed"),
    ('😉', "winking"),
    ('😍', "loving"),
    ('😳', "embarrassed"),
    ('😴', "sleepy"),
    ('😐', "neutral"),
];

fn emotion_for(c: char) -> Option<&'static str> {
    EMOTIONS.iter().find(|(e, _)| *e == c).map(|(_, name)| *name)
}

/// Accumulates one streamed reply
#[derive(Debug, Default)]
pub struct ReplyAssembler {
    text: String,
    /// Leading whitespace/emoji not yet resolved
    head: Option<String>,
    emotion: Option<&'static str>,
    calls: BTreeMap<usize, PartialCall>,
    started: bool,
}

impl ReplyAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a delta, returning text ready to be spoken
    pub fn push(&mut self, delta: &ChatDelta) -> Option<String> {
        for call in &delta.tool_calls {
            let partial = self.calls.entry(call.index).or_default();
            if call.call_id.is_some() {
                partial.call_id = call.call_id.clone();
            }
            if let Some(name) = &call.name {
                partial.name.get_or_insert_with(String::new).push_str(name);
            }
            partial.arguments.push_str(&call.arguments);
        }

        let content = delta.content.as_deref().filter(|c| !c.is_empty())?;
        let speakable = if self.started {
            content.to_string()
        } else {
            self.resolve_head(content)?
        };

        self.text.push_str(&speakable);
        Some(speakable)
    }

    /// Emotion detected at the start of the reply, once known
    pub fn emotion(&self) -> Option<&'static str> {
        self.emotion
    }

    /// Text spoken so far
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn finish(mut self) -> AssembledReply {
        if let Some(head) = self.head.take() {
            self.text.push_str(head.trim_start());
        }

        let tool_calls = self
            .calls
            .into_iter()
            .filter_map(|(index, call)| {
                let Some(name) = call.name else {
                    tracing::warn!(index, "Dropping tool call without a name");
                    return None;
                };
                Some(ToolCall {
                    call_id: call.call_id.unwrap_or_else(|| format!("call_{}", index)),
                    name,
                    arguments: call.arguments,
                })
            })
            .collect();

        AssembledReply {
            text: self.text,
            emotion: self.emotion,
            tool_calls,
        }
    }

    /// Hold back the opening of the reply until the first visible character is known
    fn resolve_head(&mut self, content: &str) -> Option<String> {
        let head = self.head.get_or_insert_with(String::new);
        head.push_str(content);

        let first = head.trim_start().chars().next()?;
        self.started = true;

        let mut rest = std::mem::take(head);
        self.head = None;
        if let Some(emotion) = emotion_for(first) {
            self.emotion = Some(emotion);
            let trimmed = rest.trim_start();
            rest = trimmed[first.len_utf8()..].trim_start().to_string();
        } else {
            rest = rest.trim_start().to_string();
        }

        if rest.is_empty() {
            None
        } else {
            Some(rest)
        }
    }
}
