use crate::convert::{ConversionError, line_of};

const LANGUAGE: &str = "mustache";

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Node {
    Text(String),
    Variable {
        name: String,
        escape: bool,
    },
    Section {
        name: String,
        inverted: bool,
        children: Vec<Node>,
    },
    /// Expanded at render time from the compiled template's partial table.
    Partial { name: String },
}

struct OpenSection {
    name: String,
    inverted: bool,
    line: usize,
    outer: Vec<Node>,
}

/// Parse mustache source into a node tree. Partials are left unexpanded.
pub(crate) fn parse(source: &str) -> Result<Vec<Node>, ConversionError> {
    let mut nodes = Vec::new();
    let mut open: Vec<OpenSection> = Vec::new();
    let mut rest = 0;

    while let Some(found) = source[rest..].find("{{") {
        let tag_start = rest + found;
        if tag_start > rest {
            nodes.push(Node::Text(source[rest..tag_start].to_string()));
        }
        let line = line_of(source, tag_start);

        let triple = source[tag_start..].starts_with("{{{");
        let (inner_start, closer) = if triple {
            (tag_start + 3, "}}}")
        } else {
            (tag_start + 2, "}}")
        };
        let Some(length) = source[inner_start..].find(closer) else {
            return Err(ConversionError::syntax(LANGUAGE, line, "unclosed tag"));
        };
        let inner = source[inner_start..inner_start + length].trim();
        rest = inner_start + length + closer.len();

        if triple {
            nodes.push(Node::Variable {
                name: tag_name(inner, line)?,
                escape: false,
            });
            continue;
        }

        let mut chars = inner.chars();
        match chars.next() {
            Some('!') => {}
            Some('&') => nodes.push(Node::Variable {
                name: tag_name(chars.as_str(), line)?,
                escape: false,
            }),
            Some(sigil @ ('#' | '^')) => open.push(OpenSection {
                name: tag_name(chars.as_str(), line)?,
                inverted: sigil == '^',
                line,
                outer: std::mem::take(&mut nodes),
            }),
            Some('/') => {
                let name = tag_name(chars.as_str(), line)?;
                let Some(section) = open.pop() else {
                    return Err(ConversionError::syntax(
                        LANGUAGE,
                        line,
                        format!("closing tag `{name}` without an open section"),
                    ));
                };
                if section.name != name {
                    return Err(ConversionError::syntax(
                        LANGUAGE,
                        line,
                        format!("section `{}` closed by `{name}`", section.name),
                    ));
                }
                let children = std::mem::replace(&mut nodes, section.outer);
                nodes.push(Node::Section {
                    name,
                    inverted: section.inverted,
                    children,
                });
            }
            Some('>') => nodes.push(Node::Partial {
                name: tag_name(chars.as_str(), line)?,
            }),
            Some('=') => {
                return Err(ConversionError::syntax(
                    LANGUAGE,
                    line,
                    "delimiter changes are not supported",
                ));
            }
            _ => nodes.push(Node::Variable {
                name: tag_name(inner, line)?,
                escape: true,
            }),
        }
    }

    if let Some(section) = open.pop() {
        return Err(ConversionError::syntax(
            LANGUAGE,
            section.line,
            format!("section `{}` is never closed", section.name),
        ));
    }
    if rest < source.len() {
        nodes.push(Node::Text(source[rest..].to_string()));
    }
    Ok(nodes)
}

/// Distinct partial names referenced anywhere in `nodes`, in source order.
pub(crate) fn partial_names(nodes: &[Node]) -> Vec<&str> {
    fn collect<'a>(nodes: &'a [Node], names: &mut Vec<&'a str>) {
        for node in nodes {
            match node {
                Node::Partial { name } if !names.contains(&name.as_str()) => names.push(name),
                Node::Section { children, .. } => collect(children, names),
                _ => {}
            }
        }
    }
    let mut names = Vec::new();
    collect(nodes, &mut names);
    names
}

fn tag_name(raw: &str, line: usize) -> Result<String, ConversionError> {
    let name = raw.trim();
    if name.is_empty() || name.chars().any(char::is_whitespace) {
        return Err(ConversionError::syntax(
            LANGUAGE,
            line,
            format!("invalid tag name `{name}`"),
        ));
    }
    Ok(name.to_string())
}
