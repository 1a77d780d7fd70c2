use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Pipeline phases reported through [`ProgressSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Clinical,
    Imaging,
    Merging,
    Downloading,
    Extracting,
    Organizing,
    CleaningUp,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Phase::Clinical => "clinical",
            Phase::Imaging => "imaging",
            Phase::Merging => "merging",
            Phase::Downloading => "downloading",
            Phase::Extracting => "extracting",
            Phase::Organizing => "organizing",
            Phase::CleaningUp => "cleaning-up",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProgressEvent {
    pub phase: Phase,
    pub completed: usize,
    pub total: usize,
}

/// Observability hook the core calls as work items complete. The core holds
/// no display state; presentation layers subscribe by implementing this.
pub trait ProgressSink: Send + Sync {
    fn event(&self, event: ProgressEvent);
}

pub struct NullSink;

impl ProgressSink for NullSink {
    fn event(&self, _event: ProgressEvent) {}
}

/// Completion counter for one phase, shared across worker threads.
pub struct PhaseProgress<'a> {
    phase: Phase,
    total: usize,
    completed: AtomicUsize,
    sink: &'a dyn ProgressSink,
}

impl<'a> PhaseProgress<'a> {
    pub fn new(phase: Phase, total: usize, sink: &'a dyn ProgressSink) -> Self {
        Self {
            phase,
            total,
            completed: AtomicUsize::new(0),
            sink,
        }
    }

    pub fn tick(&self) {
        let completed = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        self.sink.event(ProgressEvent {
            phase: self.phase,
            completed,
            total: self.total,
        });
    }
}
