// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Append-only conversation history.
//!
//! The session's event loop is the single writer; turns are sealed on
//! append and never mutated afterwards. Tool-result turns interleave with
//! the user/assistant alternation and carry the audit record of the call
//! that produced them.

use std::time::SystemTime;

use serde_json::{json, Value};

use crate::tools::ToolCallRecord;

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One sealed contribution to the conversation.
#[derive(Debug, Clone)]
pub struct ConversationTurn {
    /// Monotonically increasing within a call.
    pub seq: u64,
    pub role: Role,
    /// Spoken or prompt text. Empty for structured tool results and for
    /// assistant turns interrupted before any token was produced.
    pub content: String,
    /// Audit record for tool turns.
    pub tool_call: Option<ToolCallRecord>,
    /// Set on assistant turns cut short by barge-in or call end.
    pub interrupted: bool,
    pub timestamp: SystemTime,
}

/// The ordered turn log for one call.
#[derive(Debug, Default)]
pub struct ConversationHistory {
    turns: Vec<ConversationTurn>,
    next_seq: u64,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Seal the system turn. Exactly one, first.
    pub fn push_system(&mut self, content: impl Into<String>) {
        debug_assert!(self.turns.is_empty(), "system turn must come first");
        self.push(Role::System, content.into(), None, false);
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.push(Role::User, content.into(), None, false);
    }

    pub fn push_assistant(&mut self, content: impl Into<String>, interrupted: bool) {
        self.push(Role::Assistant, content.into(), None, interrupted);
    }

    /// Seal a tool-result turn. Appended between the user turn that led to
    /// the call and the assistant turn that consumed the result.
    pub fn push_tool(&mut self, record: ToolCallRecord) {
        self.push(Role::Tool, String::new(), Some(record), false);
    }

    fn push(
        &mut self,
        role: Role,
        content: String,
        tool_call: Option<ToolCallRecord>,
        interrupted: bool,
    ) {
        self.turns.push(ConversationTurn {
            seq: self.next_seq,
            role,
            content,
            tool_call,
            interrupted,
            timestamp: SystemTime::now(),
        });
        self.next_seq += 1;
    }

    /// The most recent user utterance, if any.
    pub fn last_user_text(&self) -> Option<&str> {
        self.turns
            .iter()
            .rev()
            .find(|t| t.role == Role::User)
            .map(|t| t.content.as_str())
    }

    /// The most recent completed (uninterrupted) assistant turn, if any.
    pub fn last_assistant_text(&self) -> Option<&str> {
        self.turns
            .iter()
            .rev()
            .find(|t| t.role == Role::Assistant && !t.interrupted)
            .map(|t| t.content.as_str())
    }

    pub fn user_turns(&self) -> usize {
        self.turns.iter().filter(|t| t.role == Role::User).count()
    }

    pub fn assistant_turns(&self) -> usize {
        self.turns
            .iter()
            .filter(|t| t.role == Role::Assistant)
            .count()
    }

    /// Total executed tool calls recorded across the call.
    pub fn tool_calls(&self) -> usize {
        self.turns.iter().filter(|t| t.role == Role::Tool).count()
    }

    /// Render the chat-completion message list: the system turn plus the
    /// spoken user/assistant turns. Tool turns are audit records and are
    /// not replayed across turns; assistant turns interrupted before any
    /// text are skipped.
    pub fn to_messages(&self) -> Vec<Value> {
        self.turns
            .iter()
            .filter_map(|turn| {
                let role = match turn.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                    Role::Tool => return None,
                };
                if turn.content.is_empty() {
                    return None;
                }
                Some(json!({"role": role, "content": turn.content}))
            })
            .collect()
    }

    /// Render a readable transcript for the call log.
    pub fn transcript(&self) -> String {
        self.turns
            .iter()
            .filter(|t| matches!(t.role, Role::User | Role::Assistant) && !t.content.is_empty())
            .map(|t| {
                let speaker = match t.role {
                    Role::User => "Customer",
                    _ => "AI",
                };
                format!("{}: {}", speaker, t.content)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// The most recent speaking role, ignoring system and tool turns.
    pub fn last_speaker(&self) -> Option<Role> {
        self.turns
            .iter()
            .rev()
            .find(|t| matches!(t.role, Role::User | Role::Assistant))
            .map(|t| t.role)
    }

    /// Check the alternation invariant: ignoring system and tool turns,
    /// user and assistant turns strictly alternate (no two consecutive
    /// turns from the same speaker).
    pub fn alternation_ok(&self) -> bool {
        let mut last: Option<Role> = None;
        for turn in &self.turns {
            match turn.role {
                Role::System | Role::Tool => continue,
                role => {
                    if last == Some(role) {
                        return false;
                    }
                    last = Some(role);
                }
            }
        }
        true
    }

    /// Check that sequence numbers are strictly increasing.
    pub fn seq_monotonic(&self) -> bool {
        self.turns.windows(2).all(|w| w[0].seq < w[1].seq)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolOutcome;
    use std::time::Duration;

    fn sample_record() -> ToolCallRecord {
        ToolCallRecord {
            name: "get_working_hours".to_string(),
            arguments: json!({"tenant_id": "acme"}),
            outcome: ToolOutcome::Ok(json!({"working_hours": []})),
            latency: Duration::from_millis(12),
        }
    }

    fn greeted() -> ConversationHistory {
        let mut history = ConversationHistory::new();
        history.push_system("You are the AI receptionist.");
        history.push_assistant("G'day! How can I help?", false);
        history
    }

    #[test]
    fn sequence_numbers_increase() {
        let mut history = greeted();
        history.push_user("Hi there");
        history.push_assistant("Hello!", false);
        assert!(history.seq_monotonic());
        assert_eq!(history.turns()[0].seq, 0);
        assert_eq!(history.turns()[3].seq, 3);
    }

    #[test]
    fn alternation_holds_with_tool_turns() {
        let mut history = greeted();
        history.push_user("What are your hours?");
        history.push_tool(sample_record());
        history.push_assistant("Nine to five.", false);
        history.push_user("Thanks, bye");
        history.push_assistant("No worries, bye!", false);
        assert!(history.alternation_ok());
        assert_eq!(history.user_turns(), 2);
        assert_eq!(history.assistant_turns(), 3);
        assert_eq!(history.tool_calls(), 1);
    }

    #[test]
    fn alternation_detects_consecutive_user_turns() {
        let mut history = greeted();
        history.push_user("one");
        history.push_user("two");
        assert!(!history.alternation_ok());
    }

    #[test]
    fn interrupted_assistant_turn_preserves_alternation() {
        let mut history = greeted();
        history.push_user("Tell me everything about drains");
        // Barge-in before any token: empty content, interrupted flag set.
        history.push_assistant("", true);
        history.push_user("Actually, just your hours");
        history.push_assistant("Nine to five.", false);
        assert!(history.alternation_ok());
    }

    #[test]
    fn messages_skip_tool_and_empty_turns() {
        let mut history = greeted();
        history.push_user("What are your hours?");
        history.push_tool(sample_record());
        history.push_assistant("", true);
        let messages = history.to_messages();
        assert_eq!(messages.len(), 3); // system, greeting, user
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["role"], "assistant");
        assert_eq!(messages[2]["role"], "user");
    }

    #[test]
    fn transcript_reads_like_a_dialogue() {
        let mut history = greeted();
        history.push_user("Hi");
        history.push_assistant("Hello!", false);
        let transcript = history.transcript();
        assert!(transcript.contains("AI: G'day! How can I help?"));
        assert!(transcript.contains("Customer: Hi"));
        assert!(transcript.ends_with("AI: Hello!"));
    }

    #[test]
    fn last_accessors() {
        let mut history = greeted();
        history.push_user("first");
        history.push_assistant("partial", true);
        history.push_user("second");
        assert_eq!(history.last_user_text(), Some("second"));
        // The interrupted turn is not a completed assistant response.
        assert_eq!(history.last_assistant_text(), Some("G'day! How can I help?"));
    }
}
