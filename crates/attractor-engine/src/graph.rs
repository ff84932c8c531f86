use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
}

impl AttrValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(value) => Some(*value),
            Self::String(value) => match value.trim() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            Self::String(value) => value.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(value) => Some(*value),
            Self::Integer(value) => Some(*value as f64),
            Self::String(value) => value.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn to_string_value(&self) -> String {
        match self {
            Self::String(value) => value.clone(),
            Self::Integer(value) => value.to_string(),
            Self::Float(value) => value.to_string(),
            Self::Boolean(value) => value.to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Attributes {
    values: BTreeMap<String, AttrValue>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn values(&self) -> &BTreeMap<String, AttrValue> {
        &self.values
    }

    pub fn set(&mut self, key: impl Into<String>, value: AttrValue) {
        self.values.insert(key.into(), value);
    }

    pub fn merge_defaults(&mut self, defaults: &Attributes) {
        for (key, value) in &defaults.values {
            self.values
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
    }

    pub fn get(&self, key: &str) -> Option<&AttrValue> {
        self.values.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(AttrValue::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(AttrValue::as_bool)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(AttrValue::as_i64)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get_i64(key).and_then(|v| u64::try_from(v).ok())
    }
}

/// Handler type for a node, derived from the explicit `type` attribute when
/// present, otherwise from the Graphviz `shape`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Start,
    Exit,
    Tool,
    Codergen,
    Conditional,
    ParallelFanOut,
    ParallelFanIn,
}

impl NodeType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Exit => "exit",
            Self::Tool => "tool",
            Self::Codergen => "codergen",
            Self::Conditional => "conditional",
            Self::ParallelFanOut => "parallel_fanout",
            Self::ParallelFanIn => "parallel_fanin",
        }
    }

    pub fn from_type_name(name: &str) -> Option<Self> {
        match name.trim() {
            "start" => Some(Self::Start),
            "exit" => Some(Self::Exit),
            "tool" => Some(Self::Tool),
            "codergen" => Some(Self::Codergen),
            "conditional" => Some(Self::Conditional),
            "parallel_fanout" | "parallel-fanout" => Some(Self::ParallelFanOut),
            "parallel_fanin" | "parallel-fanin" => Some(Self::ParallelFanIn),
            _ => None,
        }
    }

    pub fn from_shape(shape: &str) -> Option<Self> {
        match shape.trim() {
            "Mdiamond" => Some(Self::Start),
            "Msquare" => Some(Self::Exit),
            "box" => Some(Self::Codergen),
            "diamond" => Some(Self::Conditional),
            "parallelogram" => Some(Self::Tool),
            "component" => Some(Self::ParallelFanOut),
            "tripleoctagon" => Some(Self::ParallelFanIn),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub attrs: Attributes,
}

impl Node {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attrs: Attributes::new(),
        }
    }

    pub fn node_type(&self) -> NodeType {
        if let Some(explicit) = self
            .attrs
            .get_str("type")
            .and_then(NodeType::from_type_name)
        {
            return explicit;
        }
        if let Some(by_shape) = self
            .attrs
            .get_str("shape")
            .and_then(NodeType::from_shape)
        {
            return by_shape;
        }
        match self.id.to_ascii_lowercase().as_str() {
            "start" => NodeType::Start,
            "exit" | "end" => NodeType::Exit,
            _ => NodeType::Codergen,
        }
    }

    pub fn classes(&self) -> Vec<String> {
        self.attrs
            .get_str("class")
            .unwrap_or_default()
            .split([',', ' '])
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn is_goal_gate(&self) -> bool {
        self.attrs.get_bool("goal_gate") == Some(true)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub attrs: Attributes,
}

impl Edge {
    pub fn condition(&self) -> Option<&str> {
        self.attrs
            .get_str("condition")
            .map(str::trim)
            .filter(|c| !c.is_empty())
    }

    pub fn label(&self) -> Option<&str> {
        self.attrs
            .get_str("label")
            .map(str::trim)
            .filter(|l| !l.is_empty())
    }

    pub fn is_loop_restart(&self) -> bool {
        self.attrs.get_bool("loop_restart") == Some(true)
    }
}

/// Immutable directed multigraph parsed from DOT. Edges keep declaration
/// order, which routing relies on.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    pub id: String,
    pub attrs: Attributes,
    pub nodes: BTreeMap<String, Node>,
    pub edges: Vec<Edge>,
    #[serde(default, skip_serializing, skip_deserializing)]
    pub source_dot: Option<String>,
}

impl Graph {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attrs: Attributes::new(),
            nodes: BTreeMap::new(),
            edges: Vec::new(),
            source_dot: None,
        }
    }

    pub fn outgoing_edges<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |edge| edge.from == node_id)
    }

    pub fn incoming_edges<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |edge| edge.to == node_id)
    }

    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.get(node_id)
    }

    pub fn start_node(&self) -> Option<&Node> {
        self.nodes
            .values()
            .find(|node| node.node_type() == NodeType::Start)
    }

    pub fn exit_nodes(&self) -> Vec<&Node> {
        self.nodes
            .values()
            .filter(|node| node.node_type() == NodeType::Exit)
            .collect()
    }

    /// Providers referenced anywhere in the graph (node attributes), used by
    /// preflight.
    pub fn referenced_providers(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for node in self.nodes.values() {
            if let Some(provider) = node.attrs.get_str("llm_provider") {
                let provider = provider.trim().to_string();
                if !provider.is_empty() && !out.contains(&provider) {
                    out.push(provider);
                }
            }
        }
        out.sort();
        out
    }

    /// `(provider, model)` pairs referenced by nodes, used by the catalog
    /// preflight check.
    pub fn referenced_provider_models(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = Vec::new();
        for node in self.nodes.values() {
            let provider = node.attrs.get_str("llm_provider").unwrap_or_default().trim();
            let model = node.attrs.get_str("llm_model").unwrap_or_default().trim();
            if provider.is_empty() || model.is_empty() {
                continue;
            }
            let pair = (provider.to_string(), model.to_string());
            if !out.contains(&pair) {
                out.push(pair);
            }
        }
        out.sort();
        out
    }
}
