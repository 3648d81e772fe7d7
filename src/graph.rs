//! The processing graph: a validated DAG of artifact kinds
//!
//! Each node ("processing step") names one kind of derived artifact and
//! carries the scope of its input (dataset, config or split), the version
//! of the runner that computes it, its scheduling difficulty and the set of
//! parent steps that trigger it. The graph is built once per process from a
//! declarative specification, validated eagerly, and shared read-only.

use crate::config::{DEFAULT_DIFFICULTY, DEFAULT_MIN_BYTES_FOR_BONUS_DIFFICULTY};
use crate::error::GraphError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;

/// Scope of a step's input, from least to most specific
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    Dataset,
    Config,
    Split,
}

impl fmt::Display for InputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputType::Dataset => write!(f, "dataset"),
            InputType::Config => write!(f, "config"),
            InputType::Split => write!(f, "split"),
        }
    }
}

/// `triggered_by` accepts either a single parent name or a list
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn to_vec(&self) -> Vec<String> {
        match self {
            OneOrMany::One(name) => vec![name.clone()],
            OneOrMany::Many(names) => names.clone(),
        }
    }
}

/// Declarative description of one step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepSpecification {
    pub input_type: InputType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_by: Option<OneOrMany>,
    #[serde(default = "default_job_runner_version")]
    pub job_runner_version: u32,
    #[serde(default = "default_difficulty")]
    pub difficulty: u32,
    #[serde(default)]
    pub bonus_difficulty_if_dataset_is_big: u32,
}

fn default_job_runner_version() -> u32 {
    1
}

fn default_difficulty() -> u32 {
    DEFAULT_DIFFICULTY
}

impl StepSpecification {
    pub fn new(input_type: InputType) -> Self {
        Self {
            input_type,
            triggered_by: None,
            job_runner_version: default_job_runner_version(),
            difficulty: default_difficulty(),
            bonus_difficulty_if_dataset_is_big: 0,
        }
    }

    pub fn triggered_by(mut self, parents: &[&str]) -> Self {
        self.triggered_by = Some(OneOrMany::Many(
            parents.iter().map(|name| name.to_string()).collect(),
        ));
        self
    }

    pub fn job_runner_version(mut self, version: u32) -> Self {
        self.job_runner_version = version;
        self
    }

    pub fn difficulty(mut self, difficulty: u32) -> Self {
        self.difficulty = difficulty;
        self
    }

    pub fn bonus_difficulty(mut self, bonus: u32) -> Self {
        self.bonus_difficulty_if_dataset_is_big = bonus;
        self
    }
}

fn default_min_bytes() -> u64 {
    DEFAULT_MIN_BYTES_FOR_BONUS_DIFFICULTY
}

/// Full graph specification, deserializable from TOML
///
/// ```toml
/// min_bytes_for_bonus_difficulty = 3000000000
///
/// [steps.dataset-config-names]
/// input_type = "dataset"
///
/// [steps.config-size]
/// input_type = "config"
/// triggered_by = "dataset-config-names"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphSpecification {
    #[serde(default = "default_min_bytes")]
    pub min_bytes_for_bonus_difficulty: u64,
    pub steps: BTreeMap<String, StepSpecification>,
}

impl GraphSpecification {
    /// An empty specification, to be populated with [`with_step`](Self::with_step)
    pub fn new() -> Self {
        Self {
            min_bytes_for_bonus_difficulty: default_min_bytes(),
            steps: BTreeMap::new(),
        }
    }

    pub fn with_step(mut self, name: &str, step: StepSpecification) -> Self {
        self.steps.insert(name.to_string(), step);
        self
    }

    pub fn with_min_bytes_for_bonus_difficulty(mut self, min_bytes: u64) -> Self {
        self.min_bytes_for_bonus_difficulty = min_bytes;
        self
    }

    /// Parse a specification from its TOML form
    pub fn from_toml(input: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(input)
    }
}

impl Default for GraphSpecification {
    /// The production graph: config/split discovery, parquet conversion and
    /// metadata, info and size aggregates, validity flags, opt-in/out URL
    /// counts, search indices and descriptive statistics.
    fn default() -> Self {
        let spec = |input_type: InputType| StepSpecification::new(input_type);
        Self::new()
            .with_step("dataset-config-names", spec(InputType::Dataset))
            .with_step(
                "config-split-names-from-streaming",
                spec(InputType::Config)
                    .triggered_by(&["dataset-config-names"])
                    .difficulty(60),
            )
            .with_step(
                "config-split-names-from-info",
                spec(InputType::Config).triggered_by(&["config-info"]).difficulty(20),
            )
            .with_step(
                "config-parquet-and-info",
                spec(InputType::Config)
                    .triggered_by(&["dataset-config-names"])
                    .difficulty(70),
            )
            .with_step(
                "config-parquet",
                spec(InputType::Config).triggered_by(&["config-parquet-and-info"]).difficulty(20),
            )
            .with_step(
                "config-parquet-metadata",
                spec(InputType::Config).triggered_by(&["config-parquet"]),
            )
            .with_step(
                "config-info",
                spec(InputType::Config).triggered_by(&["config-parquet-and-info"]).difficulty(20),
            )
            .with_step(
                "config-size",
                spec(InputType::Config).triggered_by(&["config-parquet-and-info"]).difficulty(20),
            )
            .with_step(
                "dataset-split-names",
                spec(InputType::Dataset)
                    .triggered_by(&[
                        "dataset-config-names",
                        "config-split-names-from-info",
                        "config-split-names-from-streaming",
                    ])
                    .difficulty(60),
            )
            .with_step(
                "dataset-parquet",
                spec(InputType::Dataset)
                    .triggered_by(&["dataset-config-names", "config-parquet"])
                    .difficulty(20),
            )
            .with_step(
                "dataset-info",
                spec(InputType::Dataset)
                    .triggered_by(&["dataset-config-names", "config-info"])
                    .difficulty(20),
            )
            .with_step(
                "dataset-size",
                spec(InputType::Dataset)
                    .triggered_by(&["dataset-config-names", "config-size"])
                    .difficulty(20),
            )
            .with_step(
                "split-first-rows-from-parquet",
                spec(InputType::Split).triggered_by(&["config-parquet-metadata"]).difficulty(40),
            )
            .with_step(
                "split-first-rows-from-streaming",
                spec(InputType::Split)
                    .triggered_by(&[
                        "config-split-names-from-streaming",
                        "config-split-names-from-info",
                    ])
                    .difficulty(70),
            )
            .with_step(
                "split-image-url-columns",
                spec(InputType::Split)
                    .triggered_by(&[
                        "split-first-rows-from-streaming",
                        "split-first-rows-from-parquet",
                    ])
                    .difficulty(40),
            )
            .with_step(
                "split-opt-in-out-urls-scan",
                spec(InputType::Split).triggered_by(&["split-image-url-columns"]).difficulty(70),
            )
            .with_step(
                "split-opt-in-out-urls-count",
                spec(InputType::Split)
                    .triggered_by(&["split-opt-in-out-urls-scan"])
                    .difficulty(20),
            )
            .with_step(
                "config-opt-in-out-urls-count",
                spec(InputType::Config)
                    .triggered_by(&[
                        "split-opt-in-out-urls-count",
                        "config-split-names-from-info",
                        "config-split-names-from-streaming",
                    ])
                    .difficulty(20),
            )
            .with_step(
                "dataset-opt-in-out-urls-count",
                spec(InputType::Dataset)
                    .triggered_by(&["config-opt-in-out-urls-count", "dataset-config-names"])
                    .difficulty(20),
            )
            .with_step(
                "split-duckdb-index",
                spec(InputType::Split)
                    .triggered_by(&[
                        "config-split-names-from-info",
                        "config-split-names-from-streaming",
                        "config-parquet-metadata",
                    ])
                    .difficulty(70)
                    .bonus_difficulty(20),
            )
            .with_step(
                "config-duckdb-index-size",
                spec(InputType::Config).triggered_by(&["split-duckdb-index"]).difficulty(35),
            )
            .with_step(
                "dataset-duckdb-index-size",
                spec(InputType::Dataset)
                    .triggered_by(&["config-duckdb-index-size"])
                    .difficulty(20),
            )
            .with_step(
                "split-descriptive-statistics",
                spec(InputType::Split)
                    .triggered_by(&[
                        "config-split-names-from-info",
                        "config-split-names-from-streaming",
                    ])
                    .difficulty(70)
                    .bonus_difficulty(20),
            )
            .with_step(
                "split-is-valid",
                spec(InputType::Split)
                    .triggered_by(&[
                        "config-size",
                        "split-first-rows-from-parquet",
                        "split-first-rows-from-streaming",
                        "split-duckdb-index",
                    ])
                    .difficulty(20),
            )
            .with_step(
                "config-is-valid",
                spec(InputType::Config)
                    .triggered_by(&[
                        "split-is-valid",
                        "config-split-names-from-info",
                        "config-split-names-from-streaming",
                    ])
                    .difficulty(20),
            )
            .with_step(
                "dataset-is-valid",
                spec(InputType::Dataset)
                    .triggered_by(&["config-is-valid", "dataset-config-names"])
                    .difficulty(20),
            )
            .with_step(
                "dataset-hub-cache",
                spec(InputType::Dataset)
                    .triggered_by(&["dataset-is-valid", "dataset-size"])
                    .difficulty(20),
            )
    }
}

/// A validated node of the graph
///
/// The step name doubles as the cache kind and the queue job type.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingStep {
    pub name: String,
    pub input_type: InputType,
    pub job_runner_version: u32,
    pub difficulty: u32,
    pub bonus_difficulty_if_dataset_is_big: u32,
    pub triggered_by: Vec<String>,
}

impl ProcessingStep {
    /// The queue job type of this step
    pub fn job_type(&self) -> &str {
        &self.name
    }

    /// The cache kind this step writes
    pub fn cache_kind(&self) -> &str {
        &self.name
    }
}

/// The validated DAG, with precomputed edges, ancestors and topology
#[derive(Debug, Clone)]
pub struct ProcessingGraph {
    steps: BTreeMap<String, ProcessingStep>,
    children: HashMap<String, Vec<String>>,
    ancestors: HashMap<String, BTreeSet<String>>,
    topological: Vec<String>,
    first_steps: Vec<String>,
    min_bytes_for_bonus_difficulty: u64,
}

impl ProcessingGraph {
    /// Validate a specification and materialize the graph
    ///
    /// Fails on an empty specification, an unresolved parent name, a cycle,
    /// a non-dataset root, or a dataset-scoped parent feeding a
    /// split-scoped child.
    pub fn new(specification: GraphSpecification) -> Result<Self, GraphError> {
        if specification.steps.is_empty() {
            return Err(GraphError::EmptySpecification);
        }

        let mut steps: BTreeMap<String, ProcessingStep> = BTreeMap::new();
        for (name, spec) in &specification.steps {
            let triggered_by = spec
                .triggered_by
                .as_ref()
                .map(|parents| parents.to_vec())
                .unwrap_or_default();
            steps.insert(
                name.clone(),
                ProcessingStep {
                    name: name.clone(),
                    input_type: spec.input_type,
                    job_runner_version: spec.job_runner_version,
                    difficulty: spec.difficulty,
                    bonus_difficulty_if_dataset_is_big: spec.bonus_difficulty_if_dataset_is_big,
                    triggered_by,
                },
            );
        }

        let mut children: HashMap<String, Vec<String>> =
            steps.keys().map(|name| (name.clone(), Vec::new())).collect();
        for step in steps.values() {
            for parent in &step.triggered_by {
                let parent_step = steps.get(parent).ok_or_else(|| GraphError::UnknownParent {
                    step: step.name.clone(),
                    parent: parent.clone(),
                })?;
                if parent_step.input_type == InputType::Dataset
                    && step.input_type == InputType::Split
                {
                    return Err(GraphError::UnsupportedEdge {
                        child: step.name.clone(),
                        parent: parent.clone(),
                    });
                }
                children
                    .get_mut(parent)
                    .ok_or_else(|| GraphError::UnknownStep(parent.clone()))?
                    .push(step.name.clone());
            }
        }

        let topological = topological_order(&steps)?;

        // Ancestors in one pass: topological order guarantees every parent
        // is resolved before its children.
        let mut ancestors: HashMap<String, BTreeSet<String>> = HashMap::new();
        for name in &topological {
            let mut acc: BTreeSet<String> = BTreeSet::new();
            let step = &steps[name];
            for parent in &step.triggered_by {
                acc.insert(parent.clone());
                if let Some(parent_ancestors) = ancestors.get(parent) {
                    acc.extend(parent_ancestors.iter().cloned());
                }
            }
            ancestors.insert(name.clone(), acc);
        }

        let first_steps: Vec<String> = steps
            .values()
            .filter(|step| step.triggered_by.is_empty())
            .map(|step| step.name.clone())
            .collect();
        for name in &first_steps {
            if steps[name].input_type != InputType::Dataset {
                return Err(GraphError::RootNotDatasetScoped(name.clone()));
            }
        }

        Ok(Self {
            steps,
            children,
            ancestors,
            topological,
            first_steps,
            min_bytes_for_bonus_difficulty: specification.min_bytes_for_bonus_difficulty,
        })
    }

    /// Look up a step by name (or, equivalently, by job type or cache kind)
    pub fn step(&self, name: &str) -> Result<&ProcessingStep, GraphError> {
        self.steps
            .get(name)
            .ok_or_else(|| GraphError::UnknownStep(name.to_string()))
    }

    /// The steps triggered by the named step
    pub fn children(&self, name: &str) -> Result<Vec<&ProcessingStep>, GraphError> {
        let names = self
            .children
            .get(name)
            .ok_or_else(|| GraphError::UnknownStep(name.to_string()))?;
        Ok(names.iter().map(|child| &self.steps[child]).collect())
    }

    /// The direct parents of the named step
    pub fn parents(&self, name: &str) -> Result<Vec<&ProcessingStep>, GraphError> {
        let step = self.step(name)?;
        Ok(step.triggered_by.iter().map(|parent| &self.steps[parent]).collect())
    }

    /// Every transitive ancestor of the named step
    pub fn ancestors(&self, name: &str) -> Result<Vec<&ProcessingStep>, GraphError> {
        let names = self
            .ancestors
            .get(name)
            .ok_or_else(|| GraphError::UnknownStep(name.to_string()))?;
        Ok(names.iter().map(|ancestor| &self.steps[ancestor]).collect())
    }

    /// All steps in a valid linear extension of the triggered-by order
    pub fn topological_steps(&self) -> Vec<&ProcessingStep> {
        self.topological.iter().map(|name| &self.steps[name]).collect()
    }

    /// All steps with the given input scope, in name order
    pub fn steps_for_input_type(&self, input_type: InputType) -> Vec<&ProcessingStep> {
        self.steps.values().filter(|step| step.input_type == input_type).collect()
    }

    /// The roots of the graph, in name order. All take a dataset input.
    pub fn first_steps(&self) -> Vec<&ProcessingStep> {
        self.first_steps.iter().map(|name| &self.steps[name]).collect()
    }

    /// Deterministic tie-broken root, used when a single seed step is needed
    pub fn alphabetically_first_root(&self) -> &ProcessingStep {
        // first_steps inherits BTreeMap name order and validation rejects
        // empty graphs, so a root always exists
        &self.steps[&self.first_steps[0]]
    }

    /// Threshold over which the per-step bonus difficulty applies
    pub fn min_bytes_for_bonus_difficulty(&self) -> u64 {
        self.min_bytes_for_bonus_difficulty
    }
}

/// Kahn's algorithm; ties resolved alphabetically for determinism
fn topological_order(
    steps: &BTreeMap<String, ProcessingStep>,
) -> Result<Vec<String>, GraphError> {
    let mut in_degree: BTreeMap<&str, usize> = steps
        .values()
        .map(|step| (step.name.as_str(), step.triggered_by.len()))
        .collect();
    let mut ready: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut order = Vec::with_capacity(steps.len());

    while let Some(name) = ready.pop_front() {
        order.push(name.to_string());
        let mut unlocked: Vec<&str> = Vec::new();
        for step in steps.values() {
            if step.triggered_by.iter().any(|parent| parent == name) {
                let degree = in_degree
                    .get_mut(step.name.as_str())
                    .ok_or_else(|| GraphError::UnknownStep(step.name.clone()))?;
                *degree -= step.triggered_by.iter().filter(|parent| *parent == name).count();
                if *degree == 0 {
                    unlocked.push(&step.name);
                }
            }
        }
        unlocked.sort_unstable();
        ready.extend(unlocked);
    }

    if order.len() != steps.len() {
        let stuck = steps
            .keys()
            .find(|name| !order.contains(*name))
            .cloned()
            .unwrap_or_default();
        return Err(GraphError::Cycle(stuck));
    }
    Ok(order)
}

/// Canonical identity of one cached result
///
/// Serialized as `kind,dataset,revision[,config[,split]]`, with absent tail
/// components omitted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Artifact {
    pub kind: String,
    pub dataset: String,
    pub revision: String,
    pub config: Option<String>,
    pub split: Option<String>,
}

impl Artifact {
    pub fn new(
        kind: &str,
        dataset: &str,
        revision: &str,
        config: Option<&str>,
        split: Option<&str>,
    ) -> Self {
        Self {
            kind: kind.to_string(),
            dataset: dataset.to_string(),
            revision: revision.to_string(),
            config: config.map(|name| name.to_string()),
            split: split.map(|name| name.to_string()),
        }
    }

    /// Render the canonical id string
    pub fn id(&self) -> String {
        let mut parts = vec![self.kind.as_str(), self.dataset.as_str(), self.revision.as_str()];
        if let Some(config) = &self.config {
            parts.push(config);
            if let Some(split) = &self.split {
                parts.push(split);
            }
        }
        parts.join(",")
    }

    /// Parse a canonical id string back into its components
    pub fn parse(id: &str) -> anyhow::Result<Self> {
        let parts: Vec<&str> = id.split(',').collect();
        if !(3..=5).contains(&parts.len()) || parts.iter().any(|part| part.is_empty()) {
            anyhow::bail!("Invalid artifact id: {}", id);
        }
        Ok(Self {
            kind: parts[0].to_string(),
            dataset: parts[1].to_string(),
            revision: parts[2].to_string(),
            config: parts.get(3).map(|part| part.to_string()),
            split: parts.get(4).map(|part| part.to_string()),
        })
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_of(spec: GraphSpecification) -> ProcessingGraph {
        ProcessingGraph::new(spec).unwrap()
    }

    fn names(steps: Vec<&ProcessingStep>) -> Vec<String> {
        let mut list: Vec<String> = steps.iter().map(|step| step.name.clone()).collect();
        list.sort();
        list
    }

    fn assert_step(
        graph: &ProcessingGraph,
        name: &str,
        children: &[&str],
        parents: &[&str],
        ancestors: &[&str],
    ) {
        let sorted = |list: &[&str]| {
            let mut owned: Vec<String> = list.iter().map(|name| name.to_string()).collect();
            owned.sort();
            owned
        };
        assert_eq!(names(graph.children(name).unwrap()), sorted(children), "children of {name}");
        assert_eq!(names(graph.parents(name).unwrap()), sorted(parents), "parents of {name}");
        assert_eq!(names(graph.ancestors(name).unwrap()), sorted(ancestors), "ancestors of {name}");
    }

    fn six_step_specification() -> GraphSpecification {
        GraphSpecification::new()
            .with_step("step-a", StepSpecification::new(InputType::Dataset))
            .with_step("step-b", StepSpecification::new(InputType::Dataset))
            .with_step(
                "step-c",
                StepSpecification::new(InputType::Dataset).triggered_by(&["step-a"]),
            )
            .with_step(
                "step-d",
                StepSpecification::new(InputType::Dataset).triggered_by(&["step-a", "step-c"]),
            )
            .with_step(
                "step-e",
                StepSpecification::new(InputType::Dataset).triggered_by(&["step-c"]),
            )
            .with_step(
                "step-f",
                StepSpecification::new(InputType::Dataset).triggered_by(&["step-a", "step-b"]),
            )
    }

    #[test]
    fn test_genealogy() {
        let graph = graph_of(six_step_specification());
        assert_step(&graph, "step-a", &["step-c", "step-d", "step-f"], &[], &[]);
        assert_step(&graph, "step-b", &["step-f"], &[], &[]);
        assert_step(&graph, "step-c", &["step-d", "step-e"], &["step-a"], &["step-a"]);
        assert_step(&graph, "step-d", &[], &["step-a", "step-c"], &["step-a", "step-c"]);
        assert_step(&graph, "step-e", &[], &["step-c"], &["step-a", "step-c"]);
        assert_step(&graph, "step-f", &[], &["step-a", "step-b"], &["step-a", "step-b"]);
    }

    #[test]
    fn test_topological_order_is_a_linear_extension() {
        let graph = graph_of(six_step_specification());
        let order: Vec<&str> =
            graph.topological_steps().iter().map(|step| step.name.as_str()).collect();
        assert_eq!(order.len(), 6);
        for step in graph.topological_steps() {
            let position = order.iter().position(|name| *name == step.name).unwrap();
            for parent in &step.triggered_by {
                let parent_position = order.iter().position(|name| name == parent).unwrap();
                assert!(parent_position < position, "{parent} must precede {}", step.name);
            }
        }
    }

    #[test]
    fn test_empty_specification_is_fatal() {
        assert_eq!(
            ProcessingGraph::new(GraphSpecification::new()).unwrap_err(),
            GraphError::EmptySpecification
        );
    }

    #[test]
    fn test_unknown_parent_is_fatal() {
        let spec = GraphSpecification::new().with_step(
            "step-a",
            StepSpecification::new(InputType::Dataset).triggered_by(&["missing"]),
        );
        assert_eq!(
            ProcessingGraph::new(spec).unwrap_err(),
            GraphError::UnknownParent { step: "step-a".to_string(), parent: "missing".to_string() }
        );
    }

    #[test]
    fn test_cycle_is_fatal() {
        let spec = GraphSpecification::new()
            .with_step(
                "step-a",
                StepSpecification::new(InputType::Dataset).triggered_by(&["step-b"]),
            )
            .with_step(
                "step-b",
                StepSpecification::new(InputType::Dataset).triggered_by(&["step-a"]),
            );
        assert!(matches!(ProcessingGraph::new(spec).unwrap_err(), GraphError::Cycle(_)));
    }

    #[test]
    fn test_non_dataset_root_is_fatal() {
        let spec = GraphSpecification::new()
            .with_step("step-a", StepSpecification::new(InputType::Config));
        assert_eq!(
            ProcessingGraph::new(spec).unwrap_err(),
            GraphError::RootNotDatasetScoped("step-a".to_string())
        );
    }

    #[test]
    fn test_dataset_to_split_edge_is_fatal() {
        let spec = GraphSpecification::new()
            .with_step("step-a", StepSpecification::new(InputType::Dataset))
            .with_step(
                "step-b",
                StepSpecification::new(InputType::Split).triggered_by(&["step-a"]),
            );
        assert_eq!(
            ProcessingGraph::new(spec).unwrap_err(),
            GraphError::UnsupportedEdge { child: "step-b".to_string(), parent: "step-a".to_string() }
        );
    }

    #[test]
    fn test_unknown_step_lookup() {
        let graph = graph_of(six_step_specification());
        assert!(matches!(graph.step("nope"), Err(GraphError::UnknownStep(_))));
        assert!(matches!(graph.children("nope"), Err(GraphError::UnknownStep(_))));
    }

    #[test]
    fn test_alphabetically_first_root() {
        let graph = graph_of(six_step_specification());
        assert_eq!(graph.alphabetically_first_root().name, "step-a");
    }

    #[test]
    fn test_default_graph_roots_and_scope_counts() {
        let graph = graph_of(GraphSpecification::default());
        assert_eq!(names(graph.first_steps()), vec!["dataset-config-names"]);
        assert_eq!(graph.steps_for_input_type(InputType::Dataset).len(), 9);
        assert_eq!(graph.steps_for_input_type(InputType::Config).len(), 10);
        assert_eq!(graph.steps_for_input_type(InputType::Split).len(), 8);
    }

    #[test]
    fn test_default_graph_parquet_branch() {
        let graph = graph_of(GraphSpecification::default());
        assert_step(
            &graph,
            "config-parquet-and-info",
            &["config-parquet", "config-info", "config-size"],
            &["dataset-config-names"],
            &["dataset-config-names"],
        );
        assert_step(
            &graph,
            "config-parquet",
            &["config-parquet-metadata", "dataset-parquet"],
            &["config-parquet-and-info"],
            &["dataset-config-names", "config-parquet-and-info"],
        );
    }

    #[test]
    fn test_default_graph_split_names_fan_in() {
        let graph = graph_of(GraphSpecification::default());
        assert_step(
            &graph,
            "dataset-split-names",
            &[],
            &[
                "dataset-config-names",
                "config-split-names-from-info",
                "config-split-names-from-streaming",
            ],
            &[
                "dataset-config-names",
                "config-parquet-and-info",
                "config-info",
                "config-split-names-from-info",
                "config-split-names-from-streaming",
            ],
        );
    }

    #[test]
    fn test_specification_from_toml_with_single_parent() {
        let spec = GraphSpecification::from_toml(
            r#"
            [steps.dataset-config-names]
            input_type = "dataset"

            [steps.config-size]
            input_type = "config"
            triggered_by = "dataset-config-names"
            difficulty = 20

            [steps.config-is-valid]
            input_type = "config"
            triggered_by = ["config-size"]
            "#,
        )
        .unwrap();
        let graph = graph_of(spec);
        assert_eq!(graph.step("config-size").unwrap().difficulty, 20);
        assert_eq!(names(graph.parents("config-size").unwrap()), vec!["dataset-config-names"]);
        assert_eq!(names(graph.parents("config-is-valid").unwrap()), vec!["config-size"]);
    }

    #[test]
    fn test_artifact_id_round_trip() {
        for id in [
            "dataset-config-names,dataset,revision",
            "config-size,dataset,revision,config1",
            "split-first-rows-from-parquet,dataset,revision,config1,split1",
        ] {
            assert_eq!(Artifact::parse(id).unwrap().id(), id);
        }
    }

    #[test]
    fn test_artifact_parse_rejects_malformed_ids() {
        assert!(Artifact::parse("kind,dataset").is_err());
        assert!(Artifact::parse("kind,dataset,revision,config,split,extra").is_err());
        assert!(Artifact::parse("kind,,revision").is_err());
    }
}
