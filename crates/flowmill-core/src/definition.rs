//! Process definitions and the read-only graph view the engine walks.
//!
//! A definition is a directed graph of typed `Node`s joined by `Edge`s. The
//! node configuration is a tagged union keyed by the node's `type`, so every
//! dispatcher arm sees only the fields it consumes. Definitions are immutable
//! once published; instances pin the version they were started from.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};
use crate::types::Variables;

/// Publication state of a stored definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefinitionStatus {
    Draft,
    Published,
    Archived,
}

impl DefinitionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Published => "published",
            Self::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(Self::Draft),
            "published" => Some(Self::Published),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }
}

/// A versioned process definition as held by the definition store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub id: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_status")]
    pub status: DefinitionStatus,
    pub graph: ProcessGraph,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_version() -> u32 {
    1
}

fn default_status() -> DefinitionStatus {
    DefinitionStatus::Draft
}

impl ProcessDefinition {
    pub fn new(id: impl Into<String>, graph: ProcessGraph) -> Self {
        Self {
            id: id.into(),
            version: 1,
            name: String::new(),
            status: DefinitionStatus::Draft,
            graph,
            created_at: Utc::now(),
        }
    }

    pub fn published(mut self) -> Self {
        self.status = DefinitionStatus::Published;
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn is_published(&self) -> bool {
        self.status == DefinitionStatus::Published
    }
}

/// What a service handler failure does to the walk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ErrorHandling {
    /// Record the failure and keep walking.
    Ignore,
    /// Re-invoke with engine backoff, then propagate.
    Retry,
    /// Fail the instance.
    #[default]
    Propagate,
}

impl From<String> for ErrorHandling {
    fn from(s: String) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "ignore" => Self::Ignore,
            "retry" => Self::Retry,
            _ => Self::Propagate,
        }
    }
}

impl From<ErrorHandling> for String {
    fn from(e: ErrorHandling) -> Self {
        match e {
            ErrorHandling::Ignore => "ignore",
            ErrorHandling::Retry => "retry",
            ErrorHandling::Propagate => "propagate",
        }
        .to_string()
    }
}

/// Failure policy shared by service and script tasks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerPolicy {
    #[serde(default)]
    pub error_handling: ErrorHandling,
    #[serde(default)]
    pub retry_count: Option<u32>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserTaskConfig {
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub candidate_users: Vec<String>,
    #[serde(default)]
    pub candidate_groups: Vec<String>,
    #[serde(default)]
    pub form_key: Option<String>,
    #[serde(default)]
    pub form_data: Variables,
    #[serde(default)]
    pub task_variables: Variables,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub due_in_minutes: Option<i64>,
}

/// Upper bound on `dueInMinutes`, roughly one hundred years.
pub const MAX_DUE_IN_MINUTES: i64 = 100 * 365 * 24 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceTaskConfig {
    pub service_type: String,
    #[serde(default)]
    pub params: Variables,
    #[serde(default)]
    pub result_variable: Option<String>,
    #[serde(flatten)]
    pub policy: HandlerPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptTaskConfig {
    pub script: String,
    #[serde(default = "default_script_service")]
    pub service_type: String,
    #[serde(default)]
    pub result_variable: Option<String>,
    #[serde(flatten)]
    pub policy: HandlerPolicy,
}

fn default_script_service() -> String {
    "script".to_string()
}

/// Node type with the configuration its dispatcher consumes.
#[derive(Debug, Clone)]
pub enum NodeKind {
    Start,
    End,
    UserTask(UserTaskConfig),
    ServiceTask(ServiceTaskConfig),
    ScriptTask(ScriptTaskConfig),
    ExclusiveGateway,
    ParallelGateway,
    InclusiveGateway,
    /// Unrecognized type, kept so the walk can skip it.
    Unknown {
        type_name: String,
        config: serde_json::Value,
    },
}

impl NodeKind {
    pub fn type_name(&self) -> &str {
        match self {
            Self::Start => "start",
            Self::End => "end",
            Self::UserTask(_) => "userTask",
            Self::ServiceTask(_) => "serviceTask",
            Self::ScriptTask(_) => "scriptTask",
            Self::ExclusiveGateway => "exclusiveGateway",
            Self::ParallelGateway => "parallelGateway",
            Self::InclusiveGateway => "inclusiveGateway",
            Self::Unknown { type_name, .. } => type_name,
        }
    }

    pub fn is_gateway(&self) -> bool {
        matches!(
            self,
            Self::ExclusiveGateway | Self::ParallelGateway | Self::InclusiveGateway
        )
    }
}

/// A vertex of the process graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawNode", into = "RawNode")]
pub struct Node {
    pub id: String,
    pub name: String,
    pub kind: NodeKind,
}

/// Wire shape: `{id, type, name, config}`.
#[derive(Serialize, Deserialize)]
struct RawNode {
    id: String,
    #[serde(rename = "type")]
    node_type: String,
    #[serde(default)]
    name: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    config: serde_json::Value,
}

impl TryFrom<RawNode> for Node {
    type Error = String;

    fn try_from(raw: RawNode) -> std::result::Result<Self, Self::Error> {
        fn parse<T: serde::de::DeserializeOwned>(
            id: &str,
            config: serde_json::Value,
        ) -> std::result::Result<T, String> {
            let config = if config.is_null() {
                serde_json::Value::Object(Default::default())
            } else {
                config
            };
            serde_json::from_value(config).map_err(|e| format!("node '{}': {}", id, e))
        }

        let kind = match raw.node_type.as_str() {
            "start" => NodeKind::Start,
            "end" => NodeKind::End,
            "userTask" => NodeKind::UserTask(parse(&raw.id, raw.config)?),
            "serviceTask" => NodeKind::ServiceTask(parse(&raw.id, raw.config)?),
            "scriptTask" => NodeKind::ScriptTask(parse(&raw.id, raw.config)?),
            "exclusiveGateway" => NodeKind::ExclusiveGateway,
            "parallelGateway" => NodeKind::ParallelGateway,
            "inclusiveGateway" => NodeKind::InclusiveGateway,
            other => NodeKind::Unknown {
                type_name: other.to_string(),
                config: raw.config,
            },
        };

        Ok(Node {
            id: raw.id,
            name: raw.name,
            kind,
        })
    }
}

impl From<Node> for RawNode {
    fn from(node: Node) -> Self {
        let node_type = node.kind.type_name().to_string();
        let config = match node.kind {
            NodeKind::UserTask(c) => serde_json::to_value(c).unwrap_or_default(),
            NodeKind::ServiceTask(c) => serde_json::to_value(c).unwrap_or_default(),
            NodeKind::ScriptTask(c) => serde_json::to_value(c).unwrap_or_default(),
            NodeKind::Unknown { config, .. } => config,
            _ => serde_json::Value::Null,
        };
        RawNode {
            id: node.id,
            node_type,
            name: node.name,
            config,
        }
    }
}

impl Node {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn start(id: impl Into<String>) -> Self {
        Self::new(id, NodeKind::Start)
    }

    pub fn end(id: impl Into<String>) -> Self {
        Self::new(id, NodeKind::End)
    }

    pub fn user_task(id: impl Into<String>, config: UserTaskConfig) -> Self {
        Self::new(id, NodeKind::UserTask(config))
    }
}

/// A directed connection, optionally guarded by a condition expression.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: None,
            source: source.into(),
            target: target.into(),
            condition: None,
            label: None,
        }
    }

    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    /// Identifier for logs: explicit id or `source->target`.
    pub fn display_id(&self) -> String {
        self.id
            .clone()
            .unwrap_or_else(|| format!("{}->{}", self.source, self.target))
    }

    /// Blank conditions count as unconditional.
    pub fn guard(&self) -> Option<&str> {
        self.condition
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
    }
}

/// Read-only view over a definition's nodes and edges.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessGraph {
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl ProcessGraph {
    pub fn new(nodes: Vec<Node>, edges: Vec<Edge>) -> Self {
        Self { nodes, edges }
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn require_node(&self, id: &str) -> Result<&Node> {
        self.node(id).ok_or_else(|| FlowError::not_found("node", id))
    }

    pub fn start_node(&self) -> Result<&Node> {
        self.nodes
            .iter()
            .find(|n| matches!(n.kind, NodeKind::Start))
            .ok_or_else(|| FlowError::not_found("start node", "<graph>"))
    }

    /// Outgoing edges in definition order.
    pub fn out_edges(&self, node_id: &str) -> Vec<&Edge> {
        self.edges.iter().filter(|e| e.source == node_id).collect()
    }

    /// Edge targets that resolve to a node; dangling targets are dropped.
    pub fn targets_of(&self, node_id: &str) -> Vec<&Node> {
        self.out_edges(node_id)
            .into_iter()
            .filter_map(|e| self.node(&e.target))
            .collect()
    }

    /// Check the structural invariants a runnable definition must hold.
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for node in &self.nodes {
            if !ids.insert(node.id.as_str()) {
                return Err(FlowError::Validation(format!(
                    "duplicate node id '{}'",
                    node.id
                )));
            }
            if let NodeKind::UserTask(cfg) = &node.kind {
                if let Some(minutes) = cfg.due_in_minutes {
                    if !(0..=MAX_DUE_IN_MINUTES).contains(&minutes) {
                        return Err(FlowError::Validation(format!(
                            "user task '{}' has dueInMinutes {} outside 0..={}",
                            node.id, minutes, MAX_DUE_IN_MINUTES
                        )));
                    }
                }
            }
        }

        let starts = self
            .nodes
            .iter()
            .filter(|n| matches!(n.kind, NodeKind::Start))
            .count();
        if starts != 1 {
            return Err(FlowError::Validation(format!(
                "expected exactly one start node, found {}",
                starts
            )));
        }
        if !self.nodes.iter().any(|n| matches!(n.kind, NodeKind::End)) {
            return Err(FlowError::Validation("no end node".into()));
        }

        for edge in &self.edges {
            let source = self.node(&edge.source).ok_or_else(|| {
                FlowError::Validation(format!(
                    "edge {} references unknown source '{}'",
                    edge.display_id(),
                    edge.source
                ))
            })?;
            let target = self.node(&edge.target).ok_or_else(|| {
                FlowError::Validation(format!(
                    "edge {} references unknown target '{}'",
                    edge.display_id(),
                    edge.target
                ))
            })?;
            if matches!(target.kind, NodeKind::Start) {
                return Err(FlowError::Validation(format!(
                    "start node '{}' has an incoming edge",
                    target.id
                )));
            }
            if matches!(source.kind, NodeKind::End) {
                return Err(FlowError::Validation(format!(
                    "end node '{}' has an outgoing edge",
                    source.id
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn approval_graph() -> ProcessGraph {
        serde_json::from_value(json!({
            "nodes": [
                {"id": "start", "type": "start", "name": "Start"},
                {"id": "review", "type": "userTask", "name": "Review",
                 "config": {"candidateGroups": ["finance"], "priority": 80}},
                {"id": "done", "type": "end", "name": "Done"}
            ],
            "edges": [
                {"source": "start", "target": "review"},
                {"source": "review", "target": "done"}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_parse_tagged_nodes() {
        let graph = approval_graph();
        assert_eq!(graph.nodes.len(), 3);
        match &graph.require_node("review").unwrap().kind {
            NodeKind::UserTask(cfg) => {
                assert_eq!(cfg.candidate_groups, vec!["finance"]);
                assert_eq!(cfg.priority, Some(80));
            }
            other => panic!("expected user task, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_is_preserved() {
        let node: Node = serde_json::from_value(json!({
            "id": "x", "type": "timerEvent", "config": {"after": "5m"}
        }))
        .unwrap();
        assert_eq!(node.kind.type_name(), "timerEvent");
    }

    #[test]
    fn test_service_task_policy() {
        let node: Node = serde_json::from_value(json!({
            "id": "call", "type": "serviceTask",
            "config": {"serviceType": "http", "errorHandling": "retry", "retryCount": 2}
        }))
        .unwrap();
        match node.kind {
            NodeKind::ServiceTask(cfg) => {
                assert_eq!(cfg.service_type, "http");
                assert_eq!(cfg.policy.error_handling, ErrorHandling::Retry);
                assert_eq!(cfg.policy.retry_count, Some(2));
            }
            _ => panic!("expected service task"),
        }
    }

    #[test]
    fn test_unrecognized_error_handling_propagates() {
        assert_eq!(
            ErrorHandling::from("explode".to_string()),
            ErrorHandling::Propagate
        );
    }

    #[test]
    fn test_start_node_and_targets() {
        let graph = approval_graph();
        assert_eq!(graph.start_node().unwrap().id, "start");
        let targets: Vec<_> = graph.targets_of("start").iter().map(|n| n.id.clone()).collect();
        assert_eq!(targets, vec!["review"]);
        assert!(graph.out_edges("done").is_empty());
    }

    #[test]
    fn test_targets_of_drops_dangling() {
        let mut graph = approval_graph();
        graph.edges.push(Edge::new("start", "ghost"));
        assert_eq!(graph.out_edges("start").len(), 2);
        assert_eq!(graph.targets_of("start").len(), 1);
    }

    #[test]
    fn test_validate_ok() {
        approval_graph().validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_edge_into_start() {
        let mut graph = approval_graph();
        graph.edges.push(Edge::new("review", "start"));
        assert!(matches!(graph.validate(), Err(FlowError::Validation(_))));
    }

    #[test]
    fn test_validate_rejects_duplicate_ids() {
        let mut graph = approval_graph();
        graph.nodes.push(Node::end("done"));
        assert!(graph.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_out_of_range_due_minutes() {
        for minutes in [i64::MAX, MAX_DUE_IN_MINUTES + 1, -5] {
            let mut graph = approval_graph();
            if let NodeKind::UserTask(cfg) = &mut graph.nodes[1].kind {
                cfg.due_in_minutes = Some(minutes);
            }
            let err = graph.validate().unwrap_err();
            assert!(matches!(err, FlowError::Validation(ref m) if m.contains("dueInMinutes")));
        }

        let mut graph = approval_graph();
        if let NodeKind::UserTask(cfg) = &mut graph.nodes[1].kind {
            cfg.due_in_minutes = Some(MAX_DUE_IN_MINUTES);
        }
        graph.validate().unwrap();
    }

    #[test]
    fn test_blank_condition_is_unconditional() {
        let edge = Edge::new("a", "b").when("   ");
        assert!(edge.guard().is_none());
        assert_eq!(edge.display_id(), "a->b");
    }
}
