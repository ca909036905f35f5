use serde::Serialize;
use std::fmt;

use crate::item::ItemId;

/// Orchestrator state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunState {
  #[default]
  Idle,
  Discovering,
  Retrying,
  ProcessingItem,
  Verifying,
  Deleting,
  Persisting,
  Draining,
  Done,
  Failed,
  Cancelled,
}

impl RunState {
  pub fn is_terminal(self) -> bool {
    matches!(self, RunState::Done | RunState::Failed | RunState::Cancelled)
  }
}

impl fmt::Display for RunState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      RunState::Idle => "idle",
      RunState::Discovering => "discovering",
      RunState::Retrying => "retrying",
      RunState::ProcessingItem => "processing",
      RunState::Verifying => "verifying",
      RunState::Deleting => "deleting",
      RunState::Persisting => "persisting",
      RunState::Draining => "draining",
      RunState::Done => "done",
      RunState::Failed => "failed",
      RunState::Cancelled => "cancelled",
    };
    f.write_str(name)
  }
}

/// End-of-run report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
  pub state: RunState,
  /// Items processed at least once this run
  pub attempted: Vec<ItemId>,
  /// Downloaded, verified, deleted remotely and recorded
  pub completed: Vec<ItemId>,
  /// Some wanted variants failed; left for a later run
  pub partial: Vec<ItemId>,
  /// Fully downloaded but the remote refused or failed the deletion
  pub deletion_failures: Vec<ItemId>,
  /// Already recorded as completed by an earlier run
  pub skipped: usize,
  pub fatal: Option<String>,
}

impl RunSummary {
  pub fn succeeded(&self) -> bool {
    self.state == RunState::Done
  }

  pub(crate) fn note_attempt(&mut self, id: &str) {
    push_unique(&mut self.attempted, id);
  }

  pub(crate) fn note_completed(&mut self, id: &str) {
    self.partial.retain(|p| p != id);
    self.deletion_failures.retain(|p| p != id);
    push_unique(&mut self.completed, id);
  }

  pub(crate) fn note_partial(&mut self, id: &str) {
    push_unique(&mut self.partial, id);
  }

  pub(crate) fn note_deletion_failure(&mut self, id: &str) {
    self.partial.retain(|p| p != id);
    push_unique(&mut self.deletion_failures, id);
  }
}

fn push_unique(list: &mut Vec<ItemId>, id: &str) {
  if !list.iter().any(|x| x == id) {
    list.push(id.to_string());
  }
}

impl fmt::Display for RunSummary {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(f, "Run {}", self.state)?;
    writeln!(f, "  attempted:          {}", self.attempted.len())?;
    writeln!(f, "  completed:          {}", self.completed.len())?;
    writeln!(f, "  partial:            {}", self.partial.len())?;
    writeln!(f, "  deletion failures:  {}", self.deletion_failures.len())?;
    write!(f, "  already completed:  {}", self.skipped)?;
    for id in &self.partial {
      write!(f, "\n  left for retry:     {id}")?;
    }
    for id in &self.deletion_failures {
      write!(f, "\n  not deleted:        {id}")?;
    }
    if let Some(reason) = &self.fatal {
      write!(f, "\n  fatal:              {reason}")?;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_completion_clears_earlier_failures() {
    let mut summary = RunSummary::default();
    summary.note_attempt("a");
    summary.note_partial("a");
    summary.note_attempt("a");
    summary.note_completed("a");

    assert_eq!(summary.attempted, vec!["a".to_string()]);
    assert!(summary.partial.is_empty());
    assert_eq!(summary.completed, vec!["a".to_string()]);
  }

  #[test]
  fn test_display_mentions_fatal_reason() {
    let summary = RunSummary {
      state: RunState::Failed,
      fatal: Some("discovery failed 5 times".to_string()),
      ..RunSummary::default()
    };
    let text = summary.to_string();
    assert!(text.starts_with("Run failed"));
    assert!(text.contains("fatal:              discovery failed 5 times"));
    assert!(!summary.succeeded());
  }
}
