use chrono::{DateTime, Utc};
use handoff_core::{HandoffError, HandoffResult, MessagePart, MessageRole, SessionMessage};
use serde::{Deserialize, Serialize};
use std::fmt::Write;

/// Most messages a single transcript query returns, whatever limit is asked.
pub const DEFAULT_TRANSCRIPT_CAP: usize = 100;

/// Options for reading a task's session transcript.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptQuery {
    /// Include reasoning parts.
    #[serde(default)]
    pub include_thinking: bool,
    /// Include tool output.
    #[serde(default)]
    pub include_tool_results: bool,
    /// Exclusive cursor: only messages after this id are returned.
    #[serde(default)]
    pub since_message_id: Option<String>,
    /// Requested page size; clamped to the configured cap.
    #[serde(default)]
    pub limit: Option<usize>,
}

/// One rendered message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptMessage {
    /// Host message id, usable as a cursor.
    pub id: String,
    /// Author of the message.
    pub role: MessageRole,
    /// When the host recorded the message.
    pub created_at: DateTime<Utc>,
    /// Rendered parts, one per line.
    pub text: String,
}

/// A page of a task's session transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transcript {
    /// Task the transcript belongs to.
    pub task_id: String,
    /// Session read, absent for a task that never started.
    pub session_id: Option<String>,
    /// Messages in session order.
    pub messages: Vec<TranscriptMessage>,
    /// More messages follow the page; pass `next_cursor` to continue.
    pub has_more: bool,
    /// Id of the last returned message when `has_more` is set.
    pub next_cursor: Option<String>,
}

impl Transcript {
    /// A page with no messages, for a task without a session.
    pub fn empty(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            session_id: None,
            messages: Vec::new(),
            has_more: false,
            next_cursor: None,
        }
    }

    /// Builds one page from a session's full history.
    pub fn build(
        task_id: impl Into<String>,
        session_id: impl Into<String>,
        history: &[SessionMessage],
        query: &TranscriptQuery,
        cap: usize,
    ) -> HandoffResult<Self> {
        let start = match &query.since_message_id {
            Some(cursor) => {
                history
                    .iter()
                    .position(|m| m.id == *cursor)
                    .ok_or_else(|| {
                        HandoffError::InvalidInput(format!("unknown message cursor '{cursor}'"))
                    })?
                    + 1
            }
            None => 0,
        };
        let cap = cap.max(1);
        let limit = query.limit.unwrap_or(cap).clamp(1, cap);

        let mut rendered = history[start..]
            .iter()
            .filter_map(|m| render_message(m, query));
        let messages: Vec<TranscriptMessage> = rendered.by_ref().take(limit).collect();
        let has_more = rendered.next().is_some();
        let next_cursor = if has_more {
            messages.last().map(|m| m.id.clone())
        } else {
            None
        };

        Ok(Self {
            task_id: task_id.into(),
            session_id: Some(session_id.into()),
            messages,
            has_more,
            next_cursor,
        })
    }

    /// Plain-text rendering, one block per message.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for message in &self.messages {
            let _ = writeln!(
                out,
                "[{}] {}",
                message.role,
                message.created_at.format("%Y-%m-%d %H:%M:%S")
            );
            let _ = writeln!(out, "{}\n", message.text);
        }
        if let Some(cursor) = self.next_cursor.as_deref().filter(|_| self.has_more) {
            let _ = writeln!(out, "(more messages after {cursor})");
        }
        out
    }
}

/// Renders the parts the query asks for; `None` when nothing is left.
fn render_message(message: &SessionMessage, query: &TranscriptQuery) -> Option<TranscriptMessage> {
    let lines: Vec<String> = message
        .parts
        .iter()
        .filter_map(|part| match part {
            MessagePart::Text { text } if !text.trim().is_empty() => Some(text.clone()),
            MessagePart::Reasoning { text } if query.include_thinking => {
                Some(format!("[thinking] {text}"))
            }
            MessagePart::ToolCall { tool, input, .. } => Some(format!("[tool: {tool}] {input}")),
            MessagePart::ToolResult {
                tool,
                output,
                is_error,
                ..
            } if query.include_tool_results => {
                let label = if *is_error { "tool error" } else { "tool result" };
                Some(format!("[{label}: {tool}] {output}"))
            }
            _ => None,
        })
        .collect();

    if lines.is_empty() {
        return None;
    }
    Some(TranscriptMessage {
        id: message.id.clone(),
        role: message.role,
        created_at: message.created_at,
        text: lines.join("\n"),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn history(n: usize) -> Vec<SessionMessage> {
        (0..n)
            .map(|i| SessionMessage::assistant_text(format!("m{i}"), format!("reply {i}")))
            .collect()
    }

    #[test]
    fn test_filters_reasoning_and_tool_results_by_default() {
        let msg = SessionMessage::new("m0", MessageRole::Assistant)
            .with_part(MessagePart::Reasoning {
                text: "hmm".into(),
            })
            .with_part(MessagePart::ToolCall {
                call_id: "c1".into(),
                tool: "grep".into(),
                input: serde_json::json!({"pattern": "todo"}),
            })
            .with_part(MessagePart::ToolResult {
                call_id: "c1".into(),
                tool: "grep".into(),
                output: "3 matches".into(),
                is_error: false,
            })
            .with_part(MessagePart::Text {
                text: "Found three.".into(),
            });

        let plain = Transcript::build("t", "s", &[msg.clone()], &TranscriptQuery::default(), 100)
            .unwrap();
        let text = &plain.messages[0].text;
        assert!(text.contains("[tool: grep]"));
        assert!(text.contains("Found three."));
        assert!(!text.contains("hmm"));
        assert!(!text.contains("3 matches"));

        let query = TranscriptQuery {
            include_thinking: true,
            include_tool_results: true,
            ..TranscriptQuery::default()
        };
        let full = Transcript::build("t", "s", &[msg], &query, 100).unwrap();
        assert!(full.messages[0].text.contains("[thinking] hmm"));
        assert!(full.messages[0].text.contains("[tool result: grep] 3 matches"));
    }

    #[test]
    fn test_reasoning_only_message_is_skipped() {
        let msg = SessionMessage::new("m0", MessageRole::Assistant).with_part(
            MessagePart::Reasoning {
                text: "private".into(),
            },
        );
        let page = Transcript::build("t", "s", &[msg], &TranscriptQuery::default(), 100).unwrap();
        assert!(page.messages.is_empty());
        assert!(!page.has_more);
    }

    #[test]
    fn test_cursor_is_exclusive_and_paginates() {
        let history = history(5);
        let query = TranscriptQuery {
            since_message_id: Some("m1".into()),
            limit: Some(2),
            ..TranscriptQuery::default()
        };
        let page = Transcript::build("t", "s", &history, &query, 100).unwrap();
        let ids: Vec<_> = page.messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m2", "m3"]);
        assert!(page.has_more);
        assert_eq!(page.next_cursor.as_deref(), Some("m3"));

        let query = TranscriptQuery {
            since_message_id: page.next_cursor.clone(),
            ..query
        };
        let last = Transcript::build("t", "s", &history, &query, 100).unwrap();
        assert_eq!(last.messages.len(), 1);
        assert!(!last.has_more);
        assert!(last.next_cursor.is_none());
    }

    #[test]
    fn test_limit_clamped_to_cap() {
        let history = history(150);
        let query = TranscriptQuery {
            limit: Some(1000),
            ..TranscriptQuery::default()
        };
        let page = Transcript::build("t", "s", &history, &query, DEFAULT_TRANSCRIPT_CAP).unwrap();
        assert_eq!(page.messages.len(), 100);
        assert!(page.has_more);
    }

    #[test]
    fn test_unknown_cursor_is_invalid_input() {
        let query = TranscriptQuery {
            since_message_id: Some("nope".into()),
            ..TranscriptQuery::default()
        };
        let err = Transcript::build("t", "s", &history(2), &query, 100).unwrap_err();
        assert!(matches!(err, HandoffError::InvalidInput(_)));
    }

    #[test]
    fn test_render() {
        let page =
            Transcript::build("t", "s", &history(2), &TranscriptQuery::default(), 1).unwrap();
        let text = page.render();
        assert!(text.contains("[assistant]"));
        assert!(text.contains("reply 0"));
        assert!(text.contains("(more messages after m0)"));
        assert!(Transcript::empty("t").render().is_empty());
    }
}
