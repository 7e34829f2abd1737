//! Waiting-task queue: priority first, submission order second.

use taskrig_core::TaskDefinition;

#[derive(Default)]
pub(crate) struct SubmissionQueue {
    entries: Vec<QueueEntry>,
    next_seq: u64,
}

struct QueueEntry {
    seq: u64,
    def: TaskDefinition,
}

impl SubmissionQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, def: TaskDefinition) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push(QueueEntry { seq, def });
    }

    /// Highest priority wins; among equals, the earliest submission.
    pub(crate) fn pop(&mut self) -> Option<TaskDefinition> {
        let best = self
            .entries
            .iter()
            .enumerate()
            .max_by_key(|(_, e)| (e.def.priority, std::cmp::Reverse(e.seq)))
            .map(|(idx, _)| idx)?;
        Some(self.entries.remove(best).def)
    }

    /// Remove a specific waiting task, if present.
    pub(crate) fn remove(&mut self, id: &str) -> Option<TaskDefinition> {
        let idx = self.entries.iter().position(|e| e.def.id == id)?;
        Some(self.entries.remove(idx).def)
    }

    /// Remove every waiting task (shutdown drain).
    pub(crate) fn drain_all(&mut self) -> Vec<TaskDefinition> {
        self.entries.drain(..).map(|e| e.def).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
