use crate::errors::AttractorError;
use crate::graph::{AttrValue, Graph};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Selector {
    Universal,
    NodeId(String),
    Class(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StylesheetRule {
    pub selector: Selector,
    pub declarations: Vec<(String, String)>,
    pub order: usize,
}

impl StylesheetRule {
    fn specificity(&self) -> usize {
        match self.selector {
            Selector::Universal => 0,
            Selector::Class(_) => 1,
            Selector::NodeId(_) => 2,
        }
    }

    fn matches_node(&self, node_id: &str, classes: &[String]) -> bool {
        match &self.selector {
            Selector::Universal => true,
            Selector::NodeId(id) => id == node_id,
            Selector::Class(class_name) => classes.iter().any(|class| class == class_name),
        }
    }
}

const RECOGNIZED_PROPERTIES: &[&str] = &["llm_model", "llm_provider"];

/// Resolve the graph's `model_stylesheet` attribute into per-node model
/// attributes. Explicit node attributes always win; among matching rules,
/// higher specificity wins (`#id` > `.class` > `*`), then later rules.
pub fn apply_model_stylesheet(graph: &mut Graph) -> Result<(), AttractorError> {
    let stylesheet = graph
        .attrs
        .get_str("model_stylesheet")
        .unwrap_or_default()
        .to_string();
    if stylesheet.trim().is_empty() {
        return Ok(());
    }

    let rules = parse_stylesheet(&stylesheet)?;

    for node in graph.nodes.values_mut() {
        let node_classes = node
            .attrs
            .get_str("class")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect::<Vec<_>>();

        for property in RECOGNIZED_PROPERTIES {
            if node.attrs.get(property).is_some() {
                continue;
            }

            let mut selected: Option<(usize, usize, String)> = None;
            for rule in &rules {
                if !rule.matches_node(&node.id, &node_classes) {
                    continue;
                }
                if let Some((_, value)) = rule
                    .declarations
                    .iter()
                    .find(|(rule_property, _)| rule_property == property)
                {
                    let candidate = (rule.specificity(), rule.order, value.clone());
                    match &selected {
                        Some((specificity, order, _))
                            if *specificity > candidate.0
                                || (*specificity == candidate.0 && *order > candidate.1) => {}
                        _ => selected = Some(candidate),
                    }
                }
            }

            if let Some((_, _, value)) = selected {
                node.attrs.set(*property, AttrValue::String(value));
            }
        }
    }

    Ok(())
}

pub fn parse_stylesheet(input: &str) -> Result<Vec<StylesheetRule>, AttractorError> {
    let mut rules = Vec::new();
    let mut rest = input.trim();

    while !rest.is_empty() {
        let Some(brace) = rest.find('{') else {
            return Err(AttractorError::InvalidGraph(
                "model_stylesheet: missing '{' after selector".to_string(),
            ));
        };
        let selector = parse_selector(rest[..brace].trim())?;
        rest = &rest[brace + 1..];

        let Some(close) = rest.find('}') else {
            return Err(AttractorError::InvalidGraph(
                "model_stylesheet: missing closing '}'".to_string(),
            ));
        };
        let declarations = parse_declarations(&rest[..close])?;
        rest = rest[close + 1..].trim_start();

        rules.push(StylesheetRule {
            selector,
            declarations,
            order: rules.len(),
        });
    }

    Ok(rules)
}

fn parse_selector(selector_raw: &str) -> Result<Selector, AttractorError> {
    if selector_raw == "*" {
        return Ok(Selector::Universal);
    }
    if let Some(rest) = selector_raw.strip_prefix('#') {
        if !rest.is_empty() {
            return Ok(Selector::NodeId(rest.to_string()));
        }
    }
    if let Some(rest) = selector_raw.strip_prefix('.') {
        if !rest.is_empty() {
            return Ok(Selector::Class(rest.to_string()));
        }
    }
    Err(AttractorError::InvalidGraph(format!(
        "model_stylesheet: unsupported selector '{selector_raw}'"
    )))
}

fn parse_declarations(block: &str) -> Result<Vec<(String, String)>, AttractorError> {
    let mut declarations = Vec::new();
    for declaration in block.split(';') {
        let declaration = declaration.trim();
        if declaration.is_empty() {
            continue;
        }
        let (property, value) = declaration.split_once(':').ok_or_else(|| {
            AttractorError::InvalidGraph(format!(
                "model_stylesheet: declaration '{declaration}' is missing ':'"
            ))
        })?;
        let property = property.trim();
        if !RECOGNIZED_PROPERTIES.contains(&property) {
            return Err(AttractorError::InvalidGraph(format!(
                "model_stylesheet: property '{property}' is not supported"
            )));
        }
        let value = value.trim().trim_matches('"').to_string();
        if value.is_empty() {
            return Err(AttractorError::InvalidGraph(format!(
                "model_stylesheet: property '{property}' must have a value"
            )));
        }
        declarations.push((property.to_string(), value));
    }
    if declarations.is_empty() {
        return Err(AttractorError::InvalidGraph(
            "model_stylesheet: rule must contain at least one declaration".to_string(),
        ));
    }
    Ok(declarations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse_dot;

    #[test]
    fn apply_model_stylesheet_specificity_expected_id_beats_class() {
        let mut graph = parse_dot(
            r#"
            digraph G {
                graph [model_stylesheet="
                    * { llm_model: base; llm_provider: openai; }
                    .code { llm_model: class_model; }
                    #critical_review { llm_model: id_model; }
                "]
                critical_review [class="code"]
                other [class="code"]
            }
            "#,
        )
        .expect("graph should parse");

        apply_model_stylesheet(&mut graph).expect("stylesheet should apply");

        assert_eq!(
            graph.node("critical_review").expect("node").attrs.get_str("llm_model"),
            Some("id_model")
        );
        assert_eq!(
            graph.node("other").expect("node").attrs.get_str("llm_model"),
            Some("class_model")
        );
        assert_eq!(
            graph.node("other").expect("node").attrs.get_str("llm_provider"),
            Some("openai")
        );
    }

    #[test]
    fn apply_model_stylesheet_explicit_attr_wins() {
        let mut graph = parse_dot(
            r#"
            digraph G {
                graph [model_stylesheet="* { llm_model: sheet_model; }"]
                n [llm_model="node_model"]
            }
            "#,
        )
        .expect("graph should parse");

        apply_model_stylesheet(&mut graph).expect("stylesheet should apply");
        assert_eq!(
            graph.node("n").expect("node").attrs.get_str("llm_model"),
            Some("node_model")
        );
    }

    #[test]
    fn parse_stylesheet_unknown_property_expected_err() {
        let error = parse_stylesheet(".x { color: red; }").expect_err("should fail");
        assert!(error.to_string().contains("not supported"));
    }
}
