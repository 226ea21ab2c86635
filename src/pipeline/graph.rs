//! The wired stage graph produced by the composer.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::CompositionError;

use super::context::Channel;
use super::stage::{Port, Stage};

/// One end of an edge.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Endpoint {
    /// The external primary input.
    Source(PathBuf),
    /// A stage, by index.
    Stage(usize),
    /// The export sink.
    Sink(PathBuf),
}

/// Connects an output port to an input port.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Edge {
    pub from: Endpoint,
    pub from_port: Port,
    pub to: Endpoint,
    pub to_port: Port,
}

impl Edge {
    fn new(from: Endpoint, to: Endpoint) -> Self {
        Self {
            from,
            from_port: Port::OutFile,
            to,
            to_port: Port::InFile,
        }
    }

    /// True for stage-to-stage connections.
    pub fn is_internal(&self) -> bool {
        matches!(
            (&self.from, &self.to),
            (Endpoint::Stage(_), Endpoint::Stage(_))
        )
    }
}

/// Where a confound-regression stage gets its design matrix.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ConfoundWiring {
    /// No preparation was needed; the raw confounds file feeds the design.
    RawPassThrough(PathBuf),
    /// The confounds channel's export feeds the design.
    Prepared(PathBuf),
    /// Preparation was configured but no prepared confounds were available,
    /// so the raw file feeds the design unchanged.
    RawFallback(PathBuf),
}

impl ConfoundWiring {
    pub fn design_path(&self) -> &Path {
        match self {
            ConfoundWiring::RawPassThrough(p)
            | ConfoundWiring::Prepared(p)
            | ConfoundWiring::RawFallback(p) => p,
        }
    }
}

/// Ordered stages plus their connections.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineGraph {
    name: String,
    #[serde(skip)]
    channel: Channel,
    stages: Vec<Stage>,
    edges: Vec<Edge>,
    confound_wiring: Option<ConfoundWiring>,
}

impl PipelineGraph {
    pub(crate) fn new(name: impl Into<String>, channel: Channel) -> Self {
        Self {
            name: name.into(),
            channel,
            stages: Vec::new(),
            edges: Vec::new(),
            confound_wiring: None,
        }
    }

    pub(crate) fn push_stage(&mut self, stage: Stage) {
        self.stages.push(stage);
    }

    pub(crate) fn connect(&mut self, from: Endpoint, to: Endpoint) {
        self.edges.push(Edge::new(from, to));
    }

    pub(crate) fn set_confound_wiring(&mut self, wiring: ConfoundWiring) {
        self.confound_wiring = Some(wiring);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Stages in execution order.
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn confound_wiring(&self) -> Option<&ConfoundWiring> {
        self.confound_wiring.as_ref()
    }

    pub fn internal_edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(|e| e.is_internal())
    }

    /// The external input feeding stage 0.
    pub fn source(&self) -> Option<&Path> {
        self.edges.iter().find_map(|e| match &e.from {
            Endpoint::Source(path) => Some(path.as_path()),
            _ => None,
        })
    }

    /// The export sink fed by the last stage, if any.
    pub fn sink(&self) -> Option<&Path> {
        self.edges.iter().find_map(|e| match &e.to {
            Endpoint::Sink(path) => Some(path.as_path()),
            _ => None,
        })
    }

    /// Checks the structural invariants: one source feeding stage 0, at most
    /// one sink fed by the last stage, every stage fed exactly once by its
    /// predecessor, and edges pointing strictly forward.
    pub fn validate(&self) -> Result<(), CompositionError> {
        let invalid = |msg: String| Err(CompositionError::InvalidGraph(msg));
        let count = self.stages.len();

        if count == 0 {
            return invalid("graph has no stages".to_string());
        }

        let mut sources = 0;
        let mut sinks = 0;
        let mut fed = vec![0usize; count];

        for edge in &self.edges {
            match (&edge.from, &edge.to) {
                (Endpoint::Source(_), Endpoint::Stage(0)) => {
                    sources += 1;
                    fed[0] += 1;
                }
                (Endpoint::Stage(from), Endpoint::Stage(to)) if *to == from + 1 && *to < count => {
                    fed[*to] += 1;
                }
                (Endpoint::Stage(from), Endpoint::Sink(_)) if *from + 1 == count => sinks += 1,
                _ => return invalid(format!("unexpected edge {edge:?}")),
            }
        }

        if sources != 1 {
            return invalid(format!("expected 1 source edge, found {sources}"));
        }
        if sinks > 1 {
            return invalid(format!("expected at most 1 sink edge, found {sinks}"));
        }
        if let Some(orphan) = fed.iter().position(|n| *n != 1) {
            return invalid(format!("stage {orphan} is not fed exactly once"));
        }

        for (position, stage) in self.stages.iter().enumerate() {
            if stage.index() != position {
                return invalid(format!(
                    "stage at position {position} carries index {}",
                    stage.index()
                ));
            }
        }

        Ok(())
    }

    /// Renders the graph in Graphviz DOT format.
    pub fn to_dot(&self) -> String {
        let mut dot = String::new();
        let _ = writeln!(dot, "digraph \"{}\" {{", self.name);
        let _ = writeln!(dot, "  rankdir=LR;");
        let _ = writeln!(dot, "  \"input\" [shape=box];");
        for stage in &self.stages {
            let _ = writeln!(
                dot,
                "  \"{}\" [label=\"{}\\n{}\"];",
                stage.label(),
                stage.step(),
                stage.algorithm()
            );
        }
        if self.sink().is_some() {
            let _ = writeln!(dot, "  \"export\" [shape=box];");
        }

        for edge in &self.edges {
            let _ = writeln!(
                dot,
                "  \"{}\" -> \"{}\";",
                self.node_name(&edge.from),
                self.node_name(&edge.to)
            );
        }
        dot.push_str("}\n");
        dot
    }

    fn node_name(&self, endpoint: &Endpoint) -> String {
        match endpoint {
            Endpoint::Source(_) => "input".to_string(),
            Endpoint::Sink(_) => "export".to_string(),
            Endpoint::Stage(i) => self
                .stages
                .get(*i)
                .map(Stage::label)
                .unwrap_or_else(|| format!("stage_{i}")),
        }
    }
}
