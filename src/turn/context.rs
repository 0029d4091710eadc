//! Conversation context with a bounded sliding window.

use std::collections::VecDeque;

use crate::events::{ChatTurn, Role};

/// Role-tagged dialogue history handed to the generation service.
///
/// The system prompt is pinned: trimming only evicts the oldest user and
/// assistant messages, so long sessions keep their instructions while the
/// window slides forward.
pub struct ContextWindow {
    system_prompt: String,
    history: VecDeque<ChatTurn>,
    max_messages: usize,
}

impl ContextWindow {
    pub fn new(system_prompt: impl Into<String>, max_messages: usize) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            history: VecDeque::new(),
            max_messages,
        }
    }

    pub fn push_user(&mut self, text: impl Into<String>) {
        self.push(Role::User, text.into());
    }

    pub fn push_assistant(&mut self, text: impl Into<String>) {
        self.push(Role::Assistant, text.into());
    }

    fn push(&mut self, role: Role, text: String) {
        self.history.push_back(ChatTurn { role, text });
        while self.history.len() > self.max_messages {
            self.history.pop_front();
        }
    }

    /// Snapshot for one generation request: system prompt first, then the
    /// retained history oldest-first.
    pub fn messages(&self) -> Vec<ChatTurn> {
        let mut out = Vec::with_capacity(self.history.len() + 1);
        if !self.system_prompt.is_empty() {
            out.push(ChatTurn {
                role: Role::System,
                text: self.system_prompt.clone(),
            });
        }
        out.extend(self.history.iter().cloned());
        out
    }

    /// Number of retained history messages, excluding the system prompt.
    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}
