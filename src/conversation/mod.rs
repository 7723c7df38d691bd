//! Conversation State: bounded, ordered history of exchanges.
//!
//! Turns are immutable once appended. The oldest turns fall off the front
//! when the retention limit is exceeded. `window(k)` bounds what gets sent
//! along with a synthesis request.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One exchange entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Bounded conversation history.
#[derive(Debug, Clone)]
pub struct ConversationState {
    turns: VecDeque<ConversationTurn>,
    retention: usize,
}

impl ConversationState {
    /// Create an empty history that keeps at most `retention` turns.
    pub fn new(retention: usize) -> Self {
        Self {
            turns: VecDeque::new(),
            retention: retention.max(1),
        }
    }

    /// Append a turn. User turns with blank content are rejected.
    ///
    /// Returns whether the turn was stored.
    pub fn append(&mut self, turn: ConversationTurn) -> bool {
        if turn.role == Role::User && turn.content.trim().is_empty() {
            return false;
        }
        self.turns.push_back(turn);
        if self.turns.len() > self.retention {
            self.turns.pop_front();
        }
        true
    }

    /// The last `k` turns, oldest first.
    pub fn window(&self, k: usize) -> Vec<ConversationTurn> {
        let skip = self.turns.len().saturating_sub(k);
        self.turns.iter().skip(skip).cloned().collect()
    }

    /// Drop the oldest turns until at most `m` remain.
    pub fn trim(&mut self, m: usize) {
        while self.turns.len() > m {
            self.turns.pop_front();
        }
    }

    pub fn turns(&self) -> impl Iterator<Item = &ConversationTurn> {
        self.turns.iter()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_rejects_blank_user_turn() {
        let mut conv = ConversationState::new(10);
        assert!(!conv.append(ConversationTurn::user("   ")));
        assert!(conv.is_empty());
        assert!(conv.append(ConversationTurn::assistant("")));
        assert_eq!(conv.len(), 1);
    }

    #[test]
    fn window_returns_last_k_oldest_first() {
        let mut conv = ConversationState::new(10);
        for i in 0..5 {
            conv.append(ConversationTurn::user(format!("msg {i}")));
        }
        let w = conv.window(2);
        assert_eq!(w.len(), 2);
        assert_eq!(w[0].content, "msg 3");
        assert_eq!(w[1].content, "msg 4");

        assert_eq!(conv.window(100).len(), 5);
        assert!(conv.window(0).is_empty());
    }

    #[test]
    fn retention_drops_from_front() {
        let mut conv = ConversationState::new(3);
        for i in 0..5 {
            conv.append(ConversationTurn::user(format!("msg {i}")));
        }
        assert_eq!(conv.len(), 3);
        assert_eq!(conv.turns().next().unwrap().content, "msg 2");
    }

    #[test]
    fn trim_keeps_newest() {
        let mut conv = ConversationState::new(10);
        conv.append(ConversationTurn::user("a"));
        conv.append(ConversationTurn::assistant("b"));
        conv.append(ConversationTurn::user("c"));
        conv.trim(1);
        assert_eq!(conv.len(), 1);
        assert_eq!(conv.window(1)[0].content, "c");
    }
}
