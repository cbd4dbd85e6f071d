//! Workflow graph
//!
//! A [`WorkflowGraph`] is the straight-line stage sequence executed once per
//! pass. It can only be obtained from [`GraphBuilder::build`], which checks
//! that:
//! 1. The graph is non-empty and acyclic
//! 2. There is exactly one entry and one terminal stage
//! 3. No stage branches or merges, and no stage kind repeats
//! 4. Every field a stage reads is available when it runs
//!
//! Looping is not part of the graph; the feedback controller re-runs it.

use crate::context::{Context, Field, FieldSet};
use crate::error::PipelineError;
use crate::stages::{Stage, StageEnv, StageKind};
use crate::state::{validate_transition, PassPhase, TransitionError};
use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Which pass a graph is built for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphMode {
    Initial,
    Feedback,
}

/// Handle to a stage added to a [`GraphBuilder`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StageId(NodeIndex);

/// Graph construction and execution errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("workflow graph has no stages")]
    Empty,

    #[error("workflow graph contains a cycle")]
    Cycle,

    #[error("workflow graph needs exactly one entry stage, found {0}")]
    Entries(usize),

    #[error("workflow graph needs exactly one terminal stage, found {0}")]
    Terminals(usize),

    #[error("{0} stage branches or merges")]
    Branching(StageKind),

    #[error("{stage} stage reads `{field}`, which is not available at that point")]
    UnsatisfiedRead { stage: StageKind, field: Field },

    #[error("{0} stage appears more than once")]
    DuplicateStage(StageKind),

    #[error("unknown stage handle")]
    UnknownStage,

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// Failure of one pass
#[derive(Debug)]
pub struct PassFailure {
    /// Stage that failed, `None` if the pass failed between stages
    pub stage: Option<StageKind>,
    pub error: PipelineError,
    /// Context at the failure point; outputs of completed stages included
    pub partial: Context,
}

/// Builder for [`WorkflowGraph`]
pub struct GraphBuilder {
    mode: GraphMode,
    graph: DiGraph<Arc<dyn Stage>, ()>,
    available: FieldSet,
}

impl std::fmt::Debug for GraphBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphBuilder")
            .field("mode", &self.mode)
            .field("stages", &self.graph.node_count())
            .field("available", &self.available)
            .finish()
    }
}

impl GraphBuilder {
    /// Builder whose entry can rely on the user's input fields
    #[must_use]
    pub fn new(mode: GraphMode) -> Self {
        Self {
            mode,
            graph: DiGraph::new(),
            available: Self::input_fields(),
        }
    }

    /// Fields every pass-1 context may carry
    #[must_use]
    pub fn input_fields() -> FieldSet {
        [Field::UserInput, Field::ImageSource].into_iter().collect()
    }

    /// Replace the fields available at entry
    #[must_use]
    pub fn with_available(mut self, available: FieldSet) -> Self {
        self.available = available;
        self
    }

    /// Add a stage node
    pub fn add_stage(&mut self, stage: Arc<dyn Stage>) -> StageId {
        StageId(self.graph.add_node(stage))
    }

    /// Add a transition between two stages
    ///
    /// # Errors
    /// `GraphError::UnknownStage` if either handle is not from this builder.
    pub fn connect(&mut self, from: StageId, to: StageId) -> Result<(), GraphError> {
        if self.graph.node_weight(from.0).is_none() || self.graph.node_weight(to.0).is_none() {
            return Err(GraphError::UnknownStage);
        }
        self.graph.update_edge(from.0, to.0, ());
        Ok(())
    }

    /// Add `stages` and connect them in order
    #[must_use]
    pub fn chain(mut self, stages: impl IntoIterator<Item = Arc<dyn Stage>>) -> Self {
        let mut previous: Option<StageId> = None;
        for stage in stages {
            let id = self.add_stage(stage);
            if let Some(prev) = previous {
                self.graph.update_edge(prev.0, id.0, ());
            }
            previous = Some(id);
        }
        self
    }

    /// Validate and seal the graph
    ///
    /// # Errors
    /// The first [`GraphError`] found.
    pub fn build(self) -> Result<WorkflowGraph, GraphError> {
        let graph = self.graph;
        if graph.node_count() == 0 {
            return Err(GraphError::Empty);
        }
        if is_cyclic_directed(&graph) {
            return Err(GraphError::Cycle);
        }

        let entries = graph
            .node_indices()
            .filter(|n| graph.neighbors_directed(*n, Direction::Incoming).next().is_none())
            .count();
        if entries != 1 {
            return Err(GraphError::Entries(entries));
        }
        let terminals = graph
            .node_indices()
            .filter(|n| graph.neighbors_directed(*n, Direction::Outgoing).next().is_none())
            .count();
        if terminals != 1 {
            return Err(GraphError::Terminals(terminals));
        }
        for node in graph.node_indices() {
            let outgoing = graph.neighbors_directed(node, Direction::Outgoing).count();
            let incoming = graph.neighbors_directed(node, Direction::Incoming).count();
            if outgoing > 1 || incoming > 1 {
                return Err(GraphError::Branching(graph[node].kind()));
            }
        }

        let order = toposort(&graph, None).map_err(|_| GraphError::Cycle)?;

        let mut fields = self.available.clone();
        for node in &order {
            let stage = &graph[*node];
            if let Some(field) = stage.reads().iter().find(|f| !fields.contains(*f)) {
                return Err(GraphError::UnsatisfiedRead {
                    stage: stage.kind(),
                    field,
                });
            }
            fields = fields.union(&stage.writes());
        }

        let sequence: Vec<StageKind> = order.iter().map(|n| graph[*n].kind()).collect();
        if let Some(dup) = sequence
            .iter()
            .enumerate()
            .find_map(|(i, k)| sequence[..i].contains(k).then_some(*k))
        {
            return Err(GraphError::DuplicateStage(dup));
        }
        tracing::debug!(mode = ?self.mode, ?sequence, "workflow graph validated");

        Ok(WorkflowGraph {
            mode: self.mode,
            graph,
            order,
            sequence,
            available: self.available,
            fields_after: fields,
        })
    }
}

/// Validated straight-line stage sequence
pub struct WorkflowGraph {
    mode: GraphMode,
    graph: DiGraph<Arc<dyn Stage>, ()>,
    order: Vec<NodeIndex>,
    sequence: Vec<StageKind>,
    available: FieldSet,
    fields_after: FieldSet,
}

impl std::fmt::Debug for WorkflowGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowGraph")
            .field("mode", &self.mode)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

impl WorkflowGraph {
    #[inline]
    #[must_use]
    pub fn mode(&self) -> GraphMode {
        self.mode
    }

    /// Stage kinds in execution order
    #[inline]
    #[must_use]
    pub fn sequence(&self) -> &[StageKind] {
        &self.sequence
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    #[must_use]
    pub fn entry(&self) -> StageId {
        StageId(self.order[0])
    }

    #[must_use]
    pub fn terminal(&self) -> StageId {
        StageId(self.order[self.order.len() - 1])
    }

    /// Fields assumed available at entry
    #[must_use]
    pub fn available(&self) -> &FieldSet {
        &self.available
    }

    /// Fields available once the pass has completed
    #[must_use]
    pub fn fields_after(&self) -> &FieldSet {
        &self.fields_after
    }

    fn advance(&self, phase: &mut PassPhase, to: PassPhase) -> Result<(), GraphError> {
        validate_transition(&self.sequence, *phase, to)?;
        *phase = to;
        Ok(())
    }

    /// Execute every stage once, in order
    ///
    /// Stops at the first failing stage. Cancellation is checked before each
    /// stage; inside stages it is honoured by the call guard.
    ///
    /// # Errors
    /// [`PassFailure`] naming the failing stage, with the partial context.
    #[tracing::instrument(name = "pass", skip_all, fields(pass = ctx.pass(), mode = ?self.mode))]
    pub async fn run_pass(&self, ctx: Context, env: &StageEnv) -> Result<Context, PassFailure> {
        let mut ctx = ctx;
        let mut phase = PassPhase::Entry;

        for node in &self.order {
            let stage = &self.graph[*node];
            let kind = stage.kind();
            let failed = |error: PipelineError, ctx: Context| PassFailure {
                stage: Some(kind),
                error,
                partial: ctx,
            };

            if env.cancel.is_cancelled() {
                return Err(failed(PipelineError::Cancelled, ctx));
            }
            if let Err(e) = self.advance(&mut phase, PassPhase::Stage(kind)) {
                return Err(failed(e.into(), ctx));
            }

            tracing::info!(stage = %kind, "stage started");
            let started = Instant::now();
            let output = match stage.run(&ctx, env).await {
                Ok(output) => output,
                Err(error) => {
                    phase = PassPhase::Failed;
                    tracing::warn!(stage = %kind, ?phase, error = %error, "stage failed");
                    metrics::counter!(
                        "scenecraft_stage_failures_total",
                        "stage" => kind.to_string(),
                        "kind" => error.kind()
                    )
                    .increment(1);
                    return Err(failed(error, ctx));
                }
            };

            if let Some(field) = output.field() {
                if !stage.writes().contains(field) {
                    let error = PipelineError::MalformedOutput {
                        stage: kind,
                        reason: format!("stage may not write `{field}`"),
                    };
                    return Err(failed(error, ctx));
                }
            }
            let written = ctx.apply(output);
            tracing::info!(
                stage = %kind,
                field = ?written,
                elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                "stage completed"
            );
        }

        if let Err(e) = self.advance(&mut phase, PassPhase::Terminal) {
            return Err(PassFailure {
                stage: None,
                error: e.into(),
                partial: ctx,
            });
        }
        Ok(ctx)
    }
}
