use std::fmt;

use chrono::{DateTime, Utc};

use crate::acquire::{AcquireReport, DEFAULT_THREADS, FileAcquirer};
use crate::archive::{ArchiveExpander, DEFAULT_FORMATS, ExpandReport};
use crate::domain::FilterSet;
use crate::error::HarvestError;
use crate::gdc::ClinicalRegistry;
use crate::idc::ImagingRegistry;
use crate::organize::{FileOrganizer, OrganizeReport};
use crate::progress::ProgressSink;
use crate::store::DataStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Downloading,
    Extracting,
    Organizing,
    CleaningUp,
    Done,
    Failed,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PipelineState::Idle => "idle",
            PipelineState::Downloading => "downloading",
            PipelineState::Extracting => "extracting",
            PipelineState::Organizing => "organizing",
            PipelineState::CleaningUp => "cleaning-up",
            PipelineState::Done => "done",
            PipelineState::Failed => "failed",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineReport {
    pub acquire: AcquireReport,
    pub expand: ExpandReport,
    pub organize: OrganizeReport,
    pub cleaned: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Sequences Acquirer → Expander → Organizer → cleanup for one invocation.
/// Linear, no branching, no retries at this level: each stage owns its own
/// retries, and every stage is idempotent, so re-running the pipeline after
/// a failed run resumes from whatever is missing on disk.
pub struct PipelineDriver<C: ClinicalRegistry> {
    store: DataStore,
    clinical: C,
    imaging: Vec<Box<dyn ImagingRegistry>>,
    filters: FilterSet,
    threads: usize,
    state: PipelineState,
}

impl<C: ClinicalRegistry> PipelineDriver<C> {
    pub fn new(
        store: DataStore,
        clinical: C,
        imaging: Vec<Box<dyn ImagingRegistry>>,
        filters: FilterSet,
    ) -> Self {
        Self {
            store,
            clinical,
            imaging,
            filters,
            threads: DEFAULT_THREADS,
            state: PipelineState::Idle,
        }
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn run(&mut self, sink: &dyn ProgressSink) -> Result<PipelineReport, HarvestError> {
        let started_at = Utc::now();
        match self.run_stages(sink) {
            Ok((acquire, expand, organize, cleaned)) => {
                self.state = PipelineState::Done;
                Ok(PipelineReport {
                    acquire,
                    expand,
                    organize,
                    cleaned,
                    started_at,
                    finished_at: Utc::now(),
                })
            }
            Err(err) => {
                tracing::error!(stage = %self.state, %err, "pipeline aborted");
                self.state = PipelineState::Failed;
                Err(err)
            }
        }
    }

    fn run_stages(
        &mut self,
        sink: &dyn ProgressSink,
    ) -> Result<(AcquireReport, ExpandReport, OrganizeReport, usize), HarvestError> {
        self.state = PipelineState::Downloading;
        let acquire = {
            let mut acquirer = FileAcquirer::new(
                self.store.clone(),
                &self.clinical,
                &self.imaging,
                self.filters.clone(),
            )?
            .with_threads(self.threads);
            acquirer.process_cases(sink)?
        };

        self.state = PipelineState::Extracting;
        let expand = ArchiveExpander::new(self.store.clone()).expand(&DEFAULT_FORMATS, sink)?;

        self.state = PipelineState::Organizing;
        let organizer = FileOrganizer::new(self.store.clone(), self.filters.clone())?;
        let organize = organizer.organize(sink)?;

        self.state = PipelineState::CleaningUp;
        let cleaned = organizer.cleanup()?;

        Ok((acquire, expand, organize, cleaned))
    }
}
