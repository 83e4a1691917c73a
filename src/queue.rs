//! FIFO of pending commands with a single "working" marker.
//!
//! The working command, when there is one, is always the head: commands are
//! only ever removed from the front, and only the front can be marked.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Opaque handle to a collaborator-owned cell; never dereferenced here
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellRef(pub u64);

/// A unit of work submitted by a collaborator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    id: u64,
    text: String,
    record_history: bool,
    origin: Option<CellRef>,
    /// Answers to hand out, in order, when the engine asks questions
    answers: VecDeque<String>,
}

impl Command {
    /// Monotonically increasing sequence index
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn record_history(&self) -> bool {
        self.record_history
    }

    pub fn origin(&self) -> Option<CellRef> {
        self.origin
    }

    pub fn answers_left(&self) -> usize {
        self.answers.len()
    }
}

#[derive(Debug, Default)]
pub struct EvaluationQueue {
    commands: VecDeque<Command>,
    working: bool,
    next_id: u64,
}

impl EvaluationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a command and return its sequence index
    pub fn push(
        &mut self,
        text: impl Into<String>,
        record_history: bool,
        origin: Option<CellRef>,
        answers: Vec<String>,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.commands.push_back(Command {
            id,
            text: text.into(),
            record_history,
            origin,
            answers: answers.into(),
        });
        id
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// `(queued commands, answers left in the current command)`
    pub fn length(&self) -> (usize, usize) {
        let answers = self.head().map_or(0, Command::answers_left);
        (self.commands.len(), answers)
    }

    pub fn head(&self) -> Option<&Command> {
        self.commands.front()
    }

    /// The transmitted, not yet acknowledged command
    pub fn working(&self) -> Option<&Command> {
        if self.working {
            self.commands.front()
        } else {
            None
        }
    }

    pub fn is_working(&self) -> bool {
        self.working
    }

    /// Mark the head as working
    pub fn start_head(&mut self) -> Option<&Command> {
        self.working = !self.commands.is_empty();
        self.working()
    }

    /// Clear the working marker but keep the head (engine asked a question)
    pub fn suspend(&mut self) {
        self.working = false;
    }

    /// Re-mark the head as working after a question was answered
    pub fn resume(&mut self) {
        self.working = !self.commands.is_empty();
    }

    /// Next stored answer of the head command
    pub fn take_answer(&mut self) -> Option<String> {
        self.commands.front_mut()?.answers.pop_front()
    }

    /// Remove the head; used both for acknowledged and for rejected commands
    pub fn pop_head(&mut self) -> Option<Command> {
        self.working = false;
        self.commands.pop_front()
    }

    /// Drop everything, returning the removed commands in order
    pub fn clear(&mut self) -> Vec<Command> {
        self.working = false;
        self.commands.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_monotonic_across_clear() {
        let mut queue = EvaluationQueue::new();
        assert_eq!(queue.push("a;", true, None, vec![]), 0);
        assert_eq!(queue.push("b;", true, None, vec![]), 1);
        queue.clear();
        assert_eq!(queue.push("c;", false, Some(CellRef(9)), vec![]), 2);
        assert_eq!(queue.head().unwrap().origin(), Some(CellRef(9)));
    }

    #[test]
    fn test_working_marker_tracks_head() {
        let mut queue = EvaluationQueue::new();
        assert!(queue.start_head().is_none());
        assert!(!queue.is_working());

        queue.push("a;", true, None, vec![]);
        queue.push("b;", true, None, vec![]);
        assert_eq!(queue.start_head().unwrap().text(), "a;");
        queue.suspend();
        assert!(queue.working().is_none());
        queue.resume();
        assert_eq!(queue.working().unwrap().text(), "a;");

        assert_eq!(queue.pop_head().unwrap().text(), "a;");
        assert!(!queue.is_working());
        assert_eq!(queue.head().unwrap().text(), "b;");
    }

    #[test]
    fn test_answers_are_reported_and_consumed() {
        let mut queue = EvaluationQueue::new();
        queue.push(
            "asksign(x);",
            true,
            None,
            vec!["pos;".to_string(), "neg;".to_string()],
        );
        queue.push("1;", true, None, vec![]);
        assert_eq!(queue.length(), (2, 2));
        assert_eq!(queue.take_answer().as_deref(), Some("pos;"));
        assert_eq!(queue.length(), (2, 1));
        queue.pop_head();
        assert_eq!(queue.length(), (1, 0));
        assert!(queue.take_answer().is_none());
    }
}
