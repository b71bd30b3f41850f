use std::fmt;

use tracing::{debug, warn};

/// Where a single run is. Every run starts `Idle` and ends in `Done` or
/// `Failed`; streaming runs skip `PostProcessing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    PreProcessing,
    Generating,
    PostProcessing,
    Done,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Failed)
    }

    pub fn can_advance_to(self, next: PipelineState) -> bool {
        use PipelineState::*;
        match (self, next) {
            (s, Failed) => !s.is_terminal(),
            (Idle, PreProcessing)
            | (PreProcessing, Generating)
            | (Generating, PostProcessing)
            | (Generating, Done)
            | (PostProcessing, Done) => true,
            _ => false,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Idle => "idle",
            PipelineState::PreProcessing => "pre-processing",
            PipelineState::Generating => "generating",
            PipelineState::PostProcessing => "post-processing",
            PipelineState::Done => "done",
            PipelineState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Tracks one run through its states.
#[derive(Debug)]
pub struct RunState {
    current: PipelineState,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            current: PipelineState::Idle,
        }
    }
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> PipelineState {
        self.current
    }

    /// Move to `next`. Illegal transitions are logged and ignored.
    pub fn advance(&mut self, next: PipelineState) -> bool {
        if !self.current.can_advance_to(next) {
            warn!(from = %self.current, to = %next, "ignored illegal pipeline transition");
            return false;
        }
        debug!(from = %self.current, to = %next, "pipeline transition");
        self.current = next;
        true
    }

    pub fn fail(&mut self) {
        self.advance(PipelineState::Failed);
    }
}

#[cfg(test)]
mod tests {
    use super::PipelineState::*;
    use super::*;

    #[test]
    fn full_run_path() {
        let mut state = RunState::new();
        for next in [PreProcessing, Generating, PostProcessing, Done] {
            assert!(state.advance(next));
        }
        assert!(state.current().is_terminal());
    }

    #[test]
    fn streaming_skips_post_processing() {
        let mut state = RunState::new();
        assert!(state.advance(PreProcessing));
        assert!(state.advance(Generating));
        assert!(state.advance(Done));
    }

    #[test]
    fn failure_from_any_live_state_only() {
        for from in [Idle, PreProcessing, Generating, PostProcessing] {
            assert!(from.can_advance_to(Failed));
        }
        assert!(!Done.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Failed));
    }

    #[test]
    fn skipping_stages_is_rejected() {
        let mut state = RunState::new();
        assert!(!state.advance(Generating));
        assert_eq!(state.current(), Idle);
        assert!(!Idle.can_advance_to(Done));
        assert!(!Done.can_advance_to(Idle));
    }
}
