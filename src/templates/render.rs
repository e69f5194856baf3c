use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;

use super::parser::Node;

/// Render-time nesting allowed for partials, counting from the root template.
pub(crate) const MAX_PARTIAL_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    #[error("partial `{partial}` nests deeper than {MAX_PARTIAL_DEPTH} levels")]
    TooDeep { partial: String },
    #[error("partial `{partial}` was not resolved when `{including}` was compiled")]
    Unresolved { partial: String, including: String },
}

/// One parsed template file and the keys its partial names resolved to.
#[derive(Debug)]
pub(crate) struct Unit {
    pub(crate) nodes: Vec<Node>,
    pub(crate) partials: HashMap<String, String>,
}

pub(crate) fn render(
    units: &HashMap<String, Unit>,
    root: &str,
    scope: &Value,
) -> Result<String, RenderError> {
    let mut out = String::new();
    let Some(unit) = units.get(root) else {
        return Ok(out);
    };
    let mut renderer = Renderer {
        units,
        stack: vec![scope],
        out: &mut out,
    };
    renderer.render_unit(root, unit, 0)?;
    Ok(out)
}

struct Renderer<'a, 'o> {
    units: &'a HashMap<String, Unit>,
    stack: Vec<&'a Value>,
    out: &'o mut String,
}

impl<'a> Renderer<'a, '_> {
    fn render_unit(&mut self, key: &str, unit: &Unit, depth: usize) -> Result<(), RenderError> {
        self.render_nodes(&unit.nodes, key, unit, depth)
    }

    fn render_nodes(
        &mut self,
        nodes: &[Node],
        key: &str,
        unit: &Unit,
        depth: usize,
    ) -> Result<(), RenderError> {
        for node in nodes {
            match node {
                Node::Text(text) => self.out.push_str(text),
                Node::Variable { name, escape } => {
                    if let Some(value) = lookup(&self.stack, name) {
                        let text = display(value);
                        if *escape {
                            escape_html(&text, self.out);
                        } else {
                            self.out.push_str(&text);
                        }
                    }
                }
                Node::Section {
                    name,
                    inverted: false,
                    children,
                } => match lookup(&self.stack, name) {
                    Some(Value::Array(items)) => {
                        for item in items {
                            self.stack.push(item);
                            let rendered = self.render_nodes(children, key, unit, depth);
                            self.stack.pop();
                            rendered?;
                        }
                    }
                    Some(value) if truthy(value) => {
                        self.stack.push(value);
                        let rendered = self.render_nodes(children, key, unit, depth);
                        self.stack.pop();
                        rendered?;
                    }
                    _ => {}
                },
                Node::Section {
                    name,
                    inverted: true,
                    children,
                } => {
                    if !lookup(&self.stack, name).is_some_and(truthy) {
                        self.render_nodes(children, key, unit, depth)?;
                    }
                }
                Node::Partial { name } => {
                    if depth >= MAX_PARTIAL_DEPTH {
                        return Err(RenderError::TooDeep {
                            partial: name.clone(),
                        });
                    }
                    let units = self.units;
                    let Some((target, included)) = unit
                        .partials
                        .get(name)
                        .and_then(|target| units.get_key_value(target))
                    else {
                        return Err(RenderError::Unresolved {
                            partial: name.clone(),
                            including: key.to_string(),
                        });
                    };
                    self.render_unit(target, included, depth + 1)?;
                }
            }
        }
        Ok(())
    }
}

/// Resolves `.` to the innermost scope; otherwise the first segment of a
/// dotted name is looked up from the innermost scope outwards and the rest
/// is followed from there.
fn lookup<'a>(stack: &[&'a Value], name: &str) -> Option<&'a Value> {
    if name == "." {
        return stack.last().copied();
    }
    let mut segments = name.split('.');
    let first = segments.next()?;
    let mut value = stack
        .iter()
        .rev()
        .find_map(|scope| scope.as_object().and_then(|map| map.get(first)))?;
    for segment in segments {
        value = match value {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(value)
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Number(_) | Value::Object(_) => true,
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn escape_html(text: &str, out: &mut String) {
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
}
