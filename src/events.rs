//! Typed events decoded from the engine's output stream.

use serde::{Deserialize, Serialize};

/// Severity assigned to untagged engine text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    Default,
    Warning,
    Error,
}

/// How a prompt affects the evaluation queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
    /// The engine finished the previous command and is ready for the next one
    Main,
    /// The engine is blocked on an interactive answer
    Question,
}

/// One decoded unit of engine output
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Event {
    /// The first prompt after startup; `pid` is taken from the banner text
    EngineStarted { pid: Option<u32> },
    /// Math output, passed through unrendered; `label` is the output label if any
    MathOutput { text: String, label: Option<String> },
    Prompt { text: String, kind: PromptKind },
    StatusBarText { text: String },
    SymbolAnnouncement { symbols: Vec<String> },
    VariableAnnouncement { name: String, value: String },
    PlainText { text: String, severity: Severity },
}

impl Event {
    /// Events that count against a command's output cap
    pub fn is_content(&self) -> bool {
        matches!(self, Event::MathOutput { .. } | Event::PlainText { .. })
    }

    pub fn is_main_prompt(&self) -> bool {
        matches!(
            self,
            Event::Prompt {
                kind: PromptKind::Main,
                ..
            }
        )
    }

    pub fn is_question(&self) -> bool {
        matches!(
            self,
            Event::Prompt {
                kind: PromptKind::Question,
                ..
            }
        )
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Event::PlainText {
                severity: Severity::Error,
                ..
            }
        )
    }
}

/// Merge runs of consecutive same-severity `PlainText` events into one text cell
/// whose lines are joined with `\n`.
pub fn coalesce_text(events: Vec<Event>) -> Vec<Event> {
    let mut merged: Vec<Event> = Vec::with_capacity(events.len());
    for event in events {
        if let Event::PlainText { text, severity } = &event {
            if let Some(Event::PlainText {
                text: previous,
                severity: previous_severity,
            }) = merged.last_mut()
            {
                if *previous_severity == *severity {
                    previous.push('\n');
                    previous.push_str(text);
                    continue;
                }
            }
        }
        merged.push(event);
    }
    merged
}
