//! End-to-end connectome estimation
//!
//! Runs the stages strictly in order, each consuming the artifacts of the
//! one before:
//!
//! 1. provision the output tree
//! 2. build the gradient table and the canonicalized reference stack
//! 3. align the diffusion stack to the atlas
//! 4. fit tensors and track streamlines (archives persisted immediately)
//! 5. build, summarise and save the connectivity graph
//!
//! Every stage emits `started`, `completed` or `failed` log events under the
//! `connectome::pipeline` target. The first failure ends the run; the error
//! names the stage and the last state reached.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::{error, info};
use thiserror::Error;

use crate::error::{PipelineError, Result};
use crate::gradients::{self, GradientTable, DEFAULT_B0_THRESHOLD};
use crate::graph::{ConnectivityGraph, GraphAttributes, GraphSummary};
use crate::layout::OutputLayout;
use crate::nifti_io;
use crate::register::{self, AlignmentRequest, RegistrationParams};
use crate::track::{self, StreamlineSet, TensorField, TensorFitParams, TrackingParams};
use crate::volume::{BrainMask, DiffusionStack, LabelVolume};

const LOG_TARGET: &str = "connectome::pipeline";

/// Progress of one run
///
/// Runs only move forward, one state at a time; any failure jumps to the
/// terminal `Failed` state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Pending,
    DirsReady,
    GradientTableReady,
    Aligned,
    Tracked,
    Graphed,
    Done,
    Failed,
}

impl PipelineState {
    /// The only state reachable by success from `self`
    pub fn successor(self) -> Option<PipelineState> {
        use PipelineState::*;
        match self {
            Pending => Some(DirsReady),
            DirsReady => Some(GradientTableReady),
            GradientTableReady => Some(Aligned),
            Aligned => Some(Tracked),
            Tracked => Some(Graphed),
            Graphed => Some(Done),
            Done | Failed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Failed)
    }

    /// Validate a transition; `None` when it is not allowed
    pub fn transition(self, next: PipelineState) -> Option<PipelineState> {
        let allowed = match next {
            PipelineState::Failed => !self.is_terminal(),
            _ => self.successor() == Some(next),
        };
        if allowed {
            Some(next)
        } else {
            None
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Pending => "PENDING",
            PipelineState::DirsReady => "DIRS_READY",
            PipelineState::GradientTableReady => "GRADIENT_TABLE_READY",
            PipelineState::Aligned => "ALIGNED",
            PipelineState::Tracked => "TRACKED",
            PipelineState::Graphed => "GRAPHED",
            PipelineState::Done => "DONE",
            PipelineState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// The five stages of a run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Provision,
    GradientTable,
    Align,
    Track,
    Graph,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Stage::Provision => "provision",
            Stage::GradientTable => "gradient_table",
            Stage::Align => "align",
            Stage::Track => "track",
            Stage::Graph => "graph",
        }
    }

    /// State reached when this stage succeeds
    pub fn completes(self) -> PipelineState {
        match self {
            Stage::Provision => PipelineState::DirsReady,
            Stage::GradientTable => PipelineState::GradientTableReady,
            Stage::Align => PipelineState::Aligned,
            Stage::Track => PipelineState::Tracked,
            Stage::Graph => PipelineState::Graphed,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A stage failure, with where the run stopped
#[derive(Debug, Error)]
#[error("stage '{stage}' failed (last state {last_state}): {source}")]
pub struct PipelineFailure {
    pub stage: Stage,
    /// Last state reached before the failure
    pub last_state: PipelineState,
    #[source]
    pub source: PipelineError,
}

/// Stage implementations the orchestrator drives
///
/// `NativeToolkit` is the in-crate implementation; tests substitute their own.
pub trait Toolkit {
    /// Build the gradient table and write the canonicalized reference stack
    fn gradient_table(&self, bvals: &Path, bvecs: &Path, dwi: &Path, reference: &Path) -> Result<GradientTable>;

    /// Align the reference stack to the atlas; returns the aligned stack path
    fn align(&self, request: &AlignmentRequest<'_>) -> Result<PathBuf>;

    /// Fit tensors and track streamlines on the aligned stack
    fn track(
        &self,
        stack: &DiffusionStack,
        mask: &BrainMask,
        table: &GradientTable,
    ) -> Result<(TensorField, StreamlineSet)>;
}

/// Algorithm settings for every stage
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub b0_threshold: f64,
    pub registration: RegistrationParams,
    pub tensor_fit: TensorFitParams,
    pub tracking: TrackingParams,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            b0_threshold: DEFAULT_B0_THRESHOLD,
            registration: RegistrationParams::default(),
            tensor_fit: TensorFitParams::default(),
            tracking: TrackingParams::default(),
        }
    }
}

/// Stage implementations built on this crate's modules
#[derive(Clone, Debug, Default)]
pub struct NativeToolkit {
    pub config: PipelineConfig,
}

impl NativeToolkit {
    pub fn new(config: PipelineConfig) -> Self {
        NativeToolkit { config }
    }
}

impl Toolkit for NativeToolkit {
    fn gradient_table(&self, bvals: &Path, bvecs: &Path, dwi: &Path, reference: &Path) -> Result<GradientTable> {
        gradients::build_gradient_table(bvals, bvecs, dwi, reference, self.config.b0_threshold)
    }

    fn align(&self, request: &AlignmentRequest<'_>) -> Result<PathBuf> {
        let output = register::align_to_atlas(request, &self.config.registration)?;
        Ok(output.aligned)
    }

    fn track(
        &self,
        stack: &DiffusionStack,
        mask: &BrainMask,
        table: &GradientTable,
    ) -> Result<(TensorField, StreamlineSet)> {
        track::fit_and_track(stack, mask, table, &self.config.tensor_fit, &self.config.tracking)
    }
}

/// Input files of one run
#[derive(Clone, Debug)]
pub struct PipelineInputs {
    pub dwi: PathBuf,
    pub bvals: PathBuf,
    pub bvecs: PathBuf,
    pub structural: PathBuf,
    pub atlas: PathBuf,
    pub mask: PathBuf,
    pub labels: PathBuf,
    pub output_dir: PathBuf,
}

/// Wall-clock time of one stage
#[derive(Clone, Debug)]
pub struct StageTiming {
    pub stage: Stage,
    pub elapsed: Duration,
    /// Stage output was already present and reused
    pub skipped: bool,
}

/// Paths of the durable artifacts
#[derive(Clone, Debug)]
pub struct Artifacts {
    pub reference: PathBuf,
    pub aligned: PathBuf,
    pub tensors: PathBuf,
    pub fibers: PathBuf,
    pub graph: PathBuf,
}

/// Outcome of a successful run
#[derive(Clone, Debug)]
pub struct PipelineReport {
    pub artifacts: Artifacts,
    pub summary: GraphSummary,
    pub streamline_count: usize,
    pub timings: Vec<StageTiming>,
    pub elapsed: Duration,
    pub final_state: PipelineState,
}

impl PipelineReport {
    /// Operator-facing completion line
    pub fn completion_message(&self) -> String {
        format!("Complete! Execution took: {:.3} sec", self.elapsed.as_secs_f64())
    }
}

/// Mutable bookkeeping of a run in progress
struct RunTracker {
    state: PipelineState,
    timings: Vec<StageTiming>,
}

impl RunTracker {
    fn advance(&mut self, next: PipelineState) {
        match self.state.transition(next) {
            Some(state) => self.state = state,
            None => unreachable!("illegal pipeline transition {} -> {}", self.state, next),
        }
    }

    /// Run one stage with start/finish events; `skip` marks reused output
    fn stage<T>(
        &mut self,
        stage: Stage,
        skip: bool,
        body: impl FnOnce() -> Result<T>,
    ) -> std::result::Result<T, PipelineFailure> {
        info!(target: LOG_TARGET, "stage={} status=started", stage);
        let start = Instant::now();
        match body() {
            Ok(value) => {
                let elapsed = start.elapsed();
                self.advance(stage.completes());
                self.timings.push(StageTiming { stage, elapsed, skipped: skip });
                let status = if skip { "skipped" } else { "completed" };
                info!(
                    target: LOG_TARGET,
                    "stage={} status={} elapsed_ms={} state={}",
                    stage,
                    status,
                    elapsed.as_millis(),
                    self.state
                );
                Ok(value)
            }
            Err(source) => {
                let last_state = self.state;
                self.advance(PipelineState::Failed);
                error!(
                    target: LOG_TARGET,
                    "stage={} status=failed elapsed_ms={} last_state={} error=\"{}\"",
                    stage,
                    start.elapsed().as_millis(),
                    last_state,
                    source
                );
                Err(PipelineFailure { stage, last_state, source })
            }
        }
    }
}

/// Load the aligned stack, mask and labels and check they share one grid
fn load_atlas_space(aligned: &Path, mask: &Path, labels: &Path) -> Result<(DiffusionStack, BrainMask, LabelVolume)> {
    let stack = nifti_io::read_stack(aligned)?;
    let mask = BrainMask::from_volume(&nifti_io::read_volume(mask)?);
    let labels = LabelVolume::from_volume(&nifti_io::read_volume(labels)?)?;

    stack.geometry.ensure_matches(&mask.geometry, "aligned diffusion stack", "brain mask")?;
    stack.geometry.ensure_matches(&labels.geometry, "aligned diffusion stack", "label volume")?;
    Ok((stack, mask, labels))
}

/// Sequential stage runner
///
/// Every run overwrites earlier artifacts unless resume is switched on with
/// [`Pipeline::with_resume`].
pub struct Pipeline<T: Toolkit> {
    toolkit: T,
    resume: bool,
}

impl Pipeline<NativeToolkit> {
    pub fn native(config: PipelineConfig) -> Self {
        Pipeline::new(NativeToolkit::new(config))
    }
}

impl<T: Toolkit> Pipeline<T> {
    pub fn new(toolkit: T) -> Self {
        Pipeline { toolkit, resume: false }
    }

    /// Reuse aligned and tracked artifacts left by an earlier run
    ///
    /// Tracking output is only reused when the aligned stack it was tracked
    /// on is reused too.
    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    /// Execute every stage in order
    ///
    /// # Returns
    /// A report on success, or the first stage failure. Artifacts written
    /// before the failure are left in place.
    pub fn run(&self, inputs: &PipelineInputs) -> std::result::Result<PipelineReport, PipelineFailure> {
        let total = Instant::now();
        let layout = OutputLayout::new(&inputs.output_dir, &inputs.dwi, &inputs.labels);
        let mut run = RunTracker {
            state: PipelineState::Pending,
            timings: Vec::with_capacity(5),
        };
        info!(
            target: LOG_TARGET,
            "run started: dwi={} labels={} output={}",
            inputs.dwi.display(),
            inputs.labels.display(),
            inputs.output_dir.display()
        );

        run.stage(Stage::Provision, false, || layout.provision())?;

        let reference = layout.reference_volume();
        let table = run.stage(Stage::GradientTable, false, || {
            let table = self.toolkit.gradient_table(&inputs.bvals, &inputs.bvecs, &inputs.dwi, &reference)?;
            info!(target: LOG_TARGET, "gradient table: {}", table);
            Ok(table)
        })?;

        let aligned_path = layout.aligned_volume();
        let reuse_aligned = self.resume && aligned_path.is_file();
        let aligned = run.stage(Stage::Align, reuse_aligned, || {
            if reuse_aligned {
                return Ok(aligned_path.clone());
            }
            let request = AlignmentRequest {
                reference: &reference,
                table: &table,
                structural: &inputs.structural,
                atlas: &inputs.atlas,
                layout: &layout,
            };
            self.toolkit.align(&request)
        })?;

        let tensors_path = layout.tensors();
        let fibers_path = layout.fibers();
        let reuse_tracks = reuse_aligned && tensors_path.is_file() && fibers_path.is_file();
        let (streamlines, labels) = run.stage(Stage::Track, reuse_tracks, || {
            let (stack, mask, labels) = load_atlas_space(&aligned, &inputs.mask, &inputs.labels)?;
            if reuse_tracks {
                let streamlines = StreamlineSet::read_archive(&fibers_path, stack.geometry.clone())?;
                return Ok((streamlines, labels));
            }
            let (field, streamlines) = self.toolkit.track(&stack, &mask, &table)?;
            field.write_archive(&tensors_path)?;
            streamlines.write_archive(&fibers_path)?;
            Ok((streamlines, labels))
        })?;
        let streamline_count = streamlines.len();

        let graph_path = layout.graph();
        let summary = run.stage(Stage::Graph, false, || {
            let region_count = labels.region_count();
            let mut graph = ConnectivityGraph::new(layout.graph_name(), region_count, labels)?
                .with_attributes(GraphAttributes {
                    source: layout.dwi_name().to_string(),
                    labels: layout.label_name().to_string(),
                    ..Default::default()
                });
            graph.make_graph(&streamlines);
            let summary = graph.summary();
            graph.save_graph(&graph_path)?;
            Ok(summary)
        })?;

        run.advance(PipelineState::Done);
        for line in summary.to_string().lines() {
            info!(target: LOG_TARGET, "{}", line);
        }

        Ok(PipelineReport {
            artifacts: Artifacts {
                reference,
                aligned,
                tensors: tensors_path,
                fibers: fibers_path,
                graph: graph_path,
            },
            summary,
            streamline_count,
            timings: run.timings,
            elapsed: total.elapsed(),
            final_state: run.state,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_states_move_forward_only() {
        use PipelineState::*;
        let order = [Pending, DirsReady, GradientTableReady, Aligned, Tracked, Graphed, Done];
        for pair in order.windows(2) {
            assert_eq!(pair[0].transition(pair[1]), Some(pair[1]));
            assert_eq!(pair[1].transition(pair[0]), None);
        }
        assert_eq!(Pending.transition(Aligned), None);
        assert_eq!(Aligned.transition(Failed), Some(Failed));
        assert_eq!(Done.transition(Failed), None);
        assert_eq!(Failed.transition(Pending), None);
        assert_eq!(Done.successor(), None);
    }

    #[test]
    fn test_stage_completion_states() {
        assert_eq!(Stage::Provision.completes(), PipelineState::DirsReady);
        assert_eq!(Stage::Graph.completes(), PipelineState::Graphed);
        assert_eq!(Stage::GradientTable.to_string(), "gradient_table");
    }

    /// Fails the gradient stage and counts later calls
    struct BrokenGradients {
        later_calls: Cell<usize>,
    }

    impl Toolkit for BrokenGradients {
        fn gradient_table(&self, _: &Path, _: &Path, _: &Path, _: &Path) -> Result<GradientTable> {
            Err(PipelineError::contract("3 b-values for 4 volumes"))
        }

        fn align(&self, _: &AlignmentRequest<'_>) -> Result<PathBuf> {
            self.later_calls.set(self.later_calls.get() + 1);
            Ok(PathBuf::new())
        }

        fn track(
            &self,
            _: &DiffusionStack,
            _: &BrainMask,
            _: &GradientTable,
        ) -> Result<(TensorField, StreamlineSet)> {
            self.later_calls.set(self.later_calls.get() + 1);
            Err(PipelineError::contract("unreachable"))
        }
    }

    #[test]
    fn test_failure_stops_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let inputs = PipelineInputs {
            dwi: dir.path().join("dwi.nii.gz"),
            bvals: dir.path().join("dwi.bval"),
            bvecs: dir.path().join("dwi.bvec"),
            structural: dir.path().join("t1.nii.gz"),
            atlas: dir.path().join("atlas.nii.gz"),
            mask: dir.path().join("mask.nii.gz"),
            labels: dir.path().join("labels.nii.gz"),
            output_dir: dir.path().join("out"),
        };
        let toolkit = BrokenGradients { later_calls: Cell::new(0) };
        let pipeline = Pipeline::new(toolkit);

        let failure = pipeline.run(&inputs).unwrap_err();
        assert_eq!(failure.stage, Stage::GradientTable);
        assert_eq!(failure.last_state, PipelineState::DirsReady);
        assert!(matches!(failure.source, PipelineError::DataContract(_)));
        assert!(failure.to_string().contains("gradient_table"));
        assert_eq!(pipeline.toolkit.later_calls.get(), 0);

        // directories were provisioned before the failure
        assert!(dir.path().join("out").join("graphs").is_dir());
    }

    #[test]
    fn test_provisioning_failure_is_first_stage() {
        let dir = tempfile::tempdir().unwrap();
        let blocked = dir.path().join("blocked");
        std::fs::write(&blocked, b"file").unwrap();
        let inputs = PipelineInputs {
            dwi: dir.path().join("dwi.nii.gz"),
            bvals: dir.path().join("dwi.bval"),
            bvecs: dir.path().join("dwi.bvec"),
            structural: dir.path().join("t1.nii.gz"),
            atlas: dir.path().join("atlas.nii.gz"),
            mask: dir.path().join("mask.nii.gz"),
            labels: dir.path().join("labels.nii.gz"),
            output_dir: blocked,
        };
        let failure = Pipeline::native(PipelineConfig::default()).run(&inputs).unwrap_err();
        assert_eq!(failure.stage, Stage::Provision);
        assert_eq!(failure.last_state, PipelineState::Pending);
        assert!(matches!(failure.source, PipelineError::Provisioning { .. }));
    }

    #[test]
    fn test_completion_message() {
        let report = PipelineReport {
            artifacts: Artifacts {
                reference: PathBuf::new(),
                aligned: PathBuf::new(),
                tensors: PathBuf::new(),
                fibers: PathBuf::new(),
                graph: PathBuf::new(),
            },
            summary: GraphSummary {
                name: "g".to_string(),
                node_count: 0,
                edge_count: 0,
                total_weight: 0,
                min_degree: 0,
                max_degree: 0,
                mean_degree: 0.0,
                isolated_nodes: 0,
            },
            streamline_count: 0,
            timings: Vec::new(),
            elapsed: Duration::from_millis(1500),
            final_state: PipelineState::Done,
        };
        assert_eq!(report.completion_message(), "Complete! Execution took: 1.500 sec");
    }
}
