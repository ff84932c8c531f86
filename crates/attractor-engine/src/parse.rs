use crate::errors::AttractorError;
use crate::graph::{AttrValue, Attributes, Edge, Graph, Node};
use graphviz_rust::dot_structures::{
    Attribute, Edge as DotEdge, EdgeTy, Graph as DotGraph, GraphAttributes, Id, Node as DotNode,
    NodeId, Stmt, Subgraph, Vertex,
};

#[derive(Clone, Debug, Default)]
struct Scope {
    node_defaults: Attributes,
    edge_defaults: Attributes,
    classes: Vec<String>,
}

/// Parse DOT source into the engine's graph model.
///
/// Only directed, non-strict graphs are accepted. Node/edge attribute
/// defaults are inherited lexically, and subgraph labels become class tags
/// on the contained nodes.
pub fn parse_dot(source: &str) -> Result<Graph, AttractorError> {
    if source.contains(" -- ") {
        return Err(AttractorError::InvalidGraph(
            "undirected edge token '--' is not supported".to_string(),
        ));
    }

    let dot_graph = graphviz_rust::parse(source).map_err(AttractorError::DotParse)?;
    let mut graph = convert_graph(dot_graph)?;
    graph.source_dot = Some(source.to_string());
    Ok(graph)
}

fn convert_graph(graph: DotGraph) -> Result<Graph, AttractorError> {
    let (graph_id, strict, is_digraph, stmts) = match graph {
        DotGraph::DiGraph { id, strict, stmts } => (id_to_string(&id)?, strict, true, stmts),
        DotGraph::Graph { id, strict, stmts } => (id_to_string(&id)?, strict, false, stmts),
    };

    if !is_digraph {
        return Err(AttractorError::InvalidGraph(
            "only 'digraph' is supported".to_string(),
        ));
    }
    if strict {
        return Err(AttractorError::InvalidGraph(
            "'strict' graphs are not supported".to_string(),
        ));
    }

    let mut out = Graph::new(graph_id);
    process_statements(&mut out, &stmts, &Scope::default(), true)?;
    Ok(out)
}

fn process_statements(
    graph: &mut Graph,
    stmts: &[Stmt],
    parent_scope: &Scope,
    top_level: bool,
) -> Result<(), AttractorError> {
    let mut scope = parent_scope.clone();

    for stmt in stmts {
        match stmt {
            Stmt::GAttribute(graph_attrs) => match graph_attrs {
                GraphAttributes::Node(attrs) => {
                    merge_parsed(&mut scope.node_defaults, attrs)?;
                }
                GraphAttributes::Edge(attrs) => {
                    merge_parsed(&mut scope.edge_defaults, attrs)?;
                }
                GraphAttributes::Graph(attrs) => {
                    if top_level {
                        merge_parsed(&mut graph.attrs, attrs)?;
                    }
                }
            },
            Stmt::Attribute(attr) => {
                if top_level {
                    let (key, value) = parse_attribute(attr)?;
                    graph.attrs.set(key, value);
                }
            }
            Stmt::Node(node) => process_node_stmt(graph, node, &scope)?,
            Stmt::Edge(edge) => process_edge_stmt(graph, edge, &scope)?,
            Stmt::Subgraph(subgraph) => process_subgraph_stmt(graph, subgraph, &scope)?,
        }
    }

    Ok(())
}

fn merge_parsed(target: &mut Attributes, attrs: &[Attribute]) -> Result<(), AttractorError> {
    for attr in attrs {
        let (key, value) = parse_attribute(attr)?;
        target.set(key, value);
    }
    Ok(())
}

fn process_subgraph_stmt(
    graph: &mut Graph,
    subgraph: &Subgraph,
    parent_scope: &Scope,
) -> Result<(), AttractorError> {
    let mut scope = parent_scope.clone();
    if let Some(class_name) = derive_subgraph_class(subgraph)? {
        scope.classes.push(class_name);
    }
    process_statements(graph, &subgraph.stmts, &scope, false)
}

fn derive_subgraph_class(subgraph: &Subgraph) -> Result<Option<String>, AttractorError> {
    let mut label: Option<String> = None;

    for stmt in &subgraph.stmts {
        match stmt {
            Stmt::Attribute(Attribute(key, value)) => {
                if id_to_string(key)? == "label" {
                    label = Some(id_to_string(value)?);
                }
            }
            Stmt::GAttribute(GraphAttributes::Graph(attrs)) => {
                for attr in attrs {
                    let (key, value) = parse_attribute(attr)?;
                    if key == "label" {
                        label = Some(value.to_string_value());
                    }
                }
            }
            _ => {}
        }
    }

    Ok(label.and_then(|label| slugify(&label)))
}

fn slugify(label: &str) -> Option<String> {
    let mut out = String::new();
    let mut prev_dash = false;
    for ch in label.trim().to_ascii_lowercase().chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
            prev_dash = false;
        } else if (ch.is_ascii_whitespace() || ch == '-') && !prev_dash && !out.is_empty() {
            out.push('-');
            prev_dash = true;
        }
    }
    if out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() { None } else { Some(out) }
}

fn process_node_stmt(graph: &mut Graph, node: &DotNode, scope: &Scope) -> Result<(), AttractorError> {
    let node_id = parse_node_id(&node.id)?;

    let mut attrs = Attributes::new();
    for attr in &node.attributes {
        let (key, value) = parse_attribute(attr)?;
        attrs.set(key, value);
    }
    attrs.merge_defaults(&scope.node_defaults);

    if !scope.classes.is_empty() {
        let mut classes: Vec<String> = attrs
            .get_str("class")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect();
        for class_name in &scope.classes {
            if !classes.contains(class_name) {
                classes.push(class_name.clone());
            }
        }
        attrs.set("class", AttrValue::String(classes.join(",")));
    }

    let entry = graph
        .nodes
        .entry(node_id.clone())
        .or_insert_with(|| Node::new(node_id));
    for (key, value) in attrs.values() {
        entry.attrs.set(key.clone(), value.clone());
    }
    Ok(())
}

fn process_edge_stmt(graph: &mut Graph, edge: &DotEdge, scope: &Scope) -> Result<(), AttractorError> {
    let vertices = match &edge.ty {
        EdgeTy::Pair(from, to) => vec![parse_vertex(from)?, parse_vertex(to)?],
        EdgeTy::Chain(chain) => {
            let mut out = Vec::with_capacity(chain.len());
            for vertex in chain {
                out.push(parse_vertex(vertex)?);
            }
            out
        }
    };

    if vertices.len() < 2 {
        return Err(AttractorError::InvalidGraph(
            "edge chain must contain at least two vertices".to_string(),
        ));
    }

    let mut attrs = Attributes::new();
    for attr in &edge.attributes {
        let (key, value) = parse_attribute(attr)?;
        attrs.set(key, value);
    }
    attrs.merge_defaults(&scope.edge_defaults);

    for pair in vertices.windows(2) {
        // Referenced endpoints exist even without a standalone node statement.
        for id in pair {
            graph
                .nodes
                .entry(id.clone())
                .or_insert_with(|| Node::new(id.clone()));
        }
        graph.edges.push(Edge {
            from: pair[0].clone(),
            to: pair[1].clone(),
            attrs: attrs.clone(),
        });
    }

    Ok(())
}

fn parse_vertex(vertex: &Vertex) -> Result<String, AttractorError> {
    match vertex {
        Vertex::N(node_id) => parse_node_id(node_id),
        Vertex::S(_) => Err(AttractorError::InvalidGraph(
            "subgraph vertices in edge statements are not supported".to_string(),
        )),
    }
}

fn parse_node_id(node_id: &NodeId) -> Result<String, AttractorError> {
    if node_id.1.is_some() {
        return Err(AttractorError::InvalidGraph(
            "ports in node identifiers are not supported".to_string(),
        ));
    }
    let id = id_to_string(&node_id.0)?;
    if !is_valid_identifier(&id) {
        return Err(AttractorError::InvalidGraph(format!(
            "node id '{id}' is invalid; expected [A-Za-z_][A-Za-z0-9_]*"
        )));
    }
    Ok(id)
}

fn parse_attribute(attr: &Attribute) -> Result<(String, AttrValue), AttractorError> {
    let key = id_to_string(&attr.0)?;
    if !is_valid_attr_key(&key) {
        return Err(AttractorError::InvalidGraph(format!(
            "invalid attribute key '{key}'"
        )));
    }
    Ok((key, parse_attr_value(&attr.1)?))
}

fn parse_attr_value(id: &Id) -> Result<AttrValue, AttractorError> {
    match id {
        Id::Html(_) => Err(AttractorError::InvalidGraph(
            "HTML attribute values are not supported".to_string(),
        )),
        Id::Escaped(_) => Ok(AttrValue::String(id_to_string(id)?)),
        Id::Plain(raw) => {
            if raw == "true" {
                return Ok(AttrValue::Boolean(true));
            }
            if raw == "false" {
                return Ok(AttrValue::Boolean(false));
            }
            if let Ok(value) = raw.parse::<i64>() {
                return Ok(AttrValue::Integer(value));
            }
            if raw.contains('.') {
                if let Ok(value) = raw.parse::<f64>() {
                    return Ok(AttrValue::Float(value));
                }
            }
            Ok(AttrValue::String(raw.clone()))
        }
        Id::Anonymous(value) => Ok(AttrValue::String(value.clone())),
    }
}

fn id_to_string(id: &Id) -> Result<String, AttractorError> {
    match id {
        Id::Plain(value) => Ok(value.clone()),
        Id::Escaped(value) => {
            let unquoted = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .ok_or_else(|| {
                    AttractorError::InvalidGraph(format!(
                        "escaped string id '{value}' is missing quotes"
                    ))
                })?;
            Ok(unescape_dot_string(unquoted))
        }
        Id::Html(_) => Err(AttractorError::InvalidGraph(
            "HTML labels/IDs are not supported".to_string(),
        )),
        Id::Anonymous(value) => Ok(value.clone()),
    }
}

fn unescape_dot_string(input: &str) -> String {
    let mut output = String::new();
    let mut chars = input.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            match chars.next() {
                Some('n') => output.push('\n'),
                Some('t') => output.push('\t'),
                Some('"') => output.push('"'),
                Some('\\') => output.push('\\'),
                Some(other) => output.push(other),
                None => output.push('\\'),
            }
        } else {
            output.push(ch);
        }
    }
    output
}

fn is_valid_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

fn is_valid_attr_key(value: &str) -> bool {
    if value.is_empty() {
        return false;
    }
    value.split('.').all(|part| {
        let mut chars = part.chars();
        matches!(chars.next(), Some(first) if first.is_ascii_alphabetic() || first == '_')
            && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
    })
}

/// Parse a duration literal like `250ms`, `30s`, `5m`, `2h` into milliseconds.
/// A bare integer is taken as seconds, matching the `timeout` node attribute.
pub fn parse_duration_ms(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(secs.saturating_mul(1_000));
    }
    let (number_part, factor) = if let Some(n) = raw.strip_suffix("ms") {
        (n, 1)
    } else if let Some(n) = raw.strip_suffix('s') {
        (n, 1_000)
    } else if let Some(n) = raw.strip_suffix('m') {
        (n, 60_000)
    } else if let Some(n) = raw.strip_suffix('h') {
        (n, 3_600_000)
    } else {
        return None;
    };
    number_part
        .trim()
        .parse::<u64>()
        .ok()
        .map(|v| v.saturating_mul(factor))
}
