//! A LESS subset compiled to plain CSS.
//!
//! Supported: `//` and `/* */` comments, `@import` of other stylesheets
//! (resolved relative to the importing file through the include fetcher),
//! lexically scoped variables where the last definition in a scope wins,
//! nested rules with `&` parent references, `@media`/`@supports` bubbling
//! out of rules and argument-less mixins. Arithmetic, guards and functions
//! are passed through untouched.

use std::{
    collections::{HashMap, HashSet},
    fmt::{Display, Write as _},
    path::Path,
    sync::Arc,
};

use super::{ConversionError, ConvertOptions, Converter, IncludeFetcher, line_of, sibling_path};

const MAX_IMPORT_DEPTH: usize = 32;
const MAX_EXPANSION_DEPTH: usize = 32;

#[derive(Debug, Default, Clone, Copy)]
pub struct LessConverter;

impl Converter for LessConverter {
    fn convert(
        &self,
        source: &str,
        options: &ConvertOptions,
        includes: &mut dyn IncludeFetcher,
    ) -> Result<String, ConversionError> {
        let mut imports = Imports {
            fetcher: includes,
            seen: HashSet::from([options.source_key.clone()]),
            depth: 0,
        };
        let items = parse_file(source, &options.source_key, &mut imports)?;

        let mut flattener = Flattener::new(&items);
        let (_, blocks) = flattener.flatten_body(&items, &[], 0)?;
        Ok(render(&blocks, options.minify))
    }
}

#[derive(Debug, Clone)]
struct Span {
    file: Arc<str>,
    line: usize,
}

impl Span {
    fn error(&self, message: impl Display) -> ConversionError {
        ConversionError::syntax("less", self.line, format!("{}: {message}", self.file))
    }
}

#[derive(Debug)]
enum Item {
    Declaration {
        property: String,
        value: String,
        span: Span,
    },
    Variable {
        name: String,
        value: String,
        span: Span,
    },
    Rule {
        selectors: Vec<String>,
        body: Vec<Item>,
    },
    AtRule {
        prelude: String,
        body: Vec<Item>,
        span: Span,
    },
    MixinCall {
        name: String,
        span: Span,
    },
    Statement(String),
}

struct Imports<'a> {
    fetcher: &'a mut dyn IncludeFetcher,
    seen: HashSet<String>,
    depth: usize,
}

fn parse_file(
    source: &str,
    key: &str,
    imports: &mut Imports<'_>,
) -> Result<Vec<Item>, ConversionError> {
    let file: Arc<str> = Arc::from(key);
    let stripped = strip_comments(source, &file)?;
    let mut parser = Parser {
        source: &stripped,
        pos: 0,
        file,
    };
    parser.parse_block(imports, false)
}

/// Removes comments while keeping line numbering intact.
fn strip_comments(source: &str, file: &Arc<str>) -> Result<String, ConversionError> {
    let bytes = source.as_bytes();
    let mut out = String::with_capacity(source.len());
    let mut index = 0;
    let mut copied = 0;

    while index < bytes.len() {
        match bytes[index] {
            quote @ (b'"' | b'\'') => {
                index += 1;
                while index < bytes.len() && bytes[index] != quote && bytes[index] != b'\n' {
                    if bytes[index] == b'\\' {
                        index += 1;
                    }
                    index += 1;
                }
                index += 1;
            }
            b'u' if source[index..].starts_with("url(") => {
                index += 4;
                while index < bytes.len() && bytes[index] != b')' {
                    index += 1;
                }
            }
            b'/' if bytes.get(index + 1) == Some(&b'/') => {
                out.push_str(&source[copied..index]);
                while index < bytes.len() && bytes[index] != b'\n' {
                    index += 1;
                }
                copied = index;
            }
            b'/' if bytes.get(index + 1) == Some(&b'*') => {
                out.push_str(&source[copied..index]);
                let start = index;
                index += 2;
                while index + 1 < bytes.len() && !(bytes[index] == b'*' && bytes[index + 1] == b'/')
                {
                    index += 1;
                }
                if index + 1 >= bytes.len() {
                    let span = Span {
                        file: file.clone(),
                        line: line_of(source, start),
                    };
                    return Err(span.error("unterminated comment"));
                }
                index += 2;
                let newlines = source[start..index].matches('\n').count();
                out.push(' ');
                out.extend(std::iter::repeat_n('\n', newlines));
                copied = index;
            }
            _ => index += 1,
        }
    }

    out.push_str(&source[copied.min(source.len())..]);
    Ok(out)
}

enum Terminator {
    Open,
    Semicolon,
    Close,
    End,
}

struct Parser<'s> {
    source: &'s str,
    pos: usize,
    file: Arc<str>,
}

impl<'s> Parser<'s> {
    fn span(&self, at: usize) -> Span {
        Span {
            file: self.file.clone(),
            line: line_of(self.source, at),
        }
    }

    fn skip_whitespace(&mut self) {
        let bytes = self.source.as_bytes();
        while self.pos < bytes.len() && bytes[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    /// Reads up to the next top-level `{`, `;` or `}` without consuming it.
    fn read_head(&mut self) -> (&'s str, Terminator) {
        let source = self.source;
        let bytes = source.as_bytes();
        let start = self.pos;
        let mut depth = 0usize;
        while self.pos < bytes.len() {
            match bytes[self.pos] {
                quote @ (b'"' | b'\'') => {
                    self.pos += 1;
                    while self.pos < bytes.len() && bytes[self.pos] != quote {
                        if bytes[self.pos] == b'\\' {
                            self.pos += 1;
                        }
                        self.pos += 1;
                    }
                }
                b'(' => depth += 1,
                b')' => depth = depth.saturating_sub(1),
                b'{' if depth == 0 => return (&source[start..self.pos], Terminator::Open),
                b';' if depth == 0 => return (&source[start..self.pos], Terminator::Semicolon),
                b'}' if depth == 0 => return (&source[start..self.pos], Terminator::Close),
                _ => {}
            }
            self.pos += 1;
        }
        self.pos = bytes.len();
        (&source[start..], Terminator::End)
    }

    fn parse_block(
        &mut self,
        imports: &mut Imports<'_>,
        nested: bool,
    ) -> Result<Vec<Item>, ConversionError> {
        let mut items = Vec::new();
        loop {
            self.skip_whitespace();
            let start = self.pos;
            match self.source.as_bytes().get(self.pos).copied() {
                None if nested => return Err(self.span(start).error("unclosed block")),
                None => return Ok(items),
                Some(b'}') if !nested => return Err(self.span(start).error("unexpected `}`")),
                Some(b'}') => {
                    self.pos += 1;
                    return Ok(items);
                }
                Some(_) => {}
            }

            let (head, terminator) = self.read_head();
            let head = head.trim();
            match terminator {
                Terminator::Open => {
                    self.pos += 1;
                    if head.is_empty() {
                        return Err(self.span(start).error("missing selector"));
                    }
                    let span = self.span(start);
                    let body = self.parse_block(imports, true)?;
                    if head.starts_with('@') {
                        items.push(Item::AtRule {
                            prelude: collapse_whitespace(head),
                            body,
                            span,
                        });
                    } else {
                        items.push(Item::Rule {
                            selectors: split_selectors(head),
                            body,
                        });
                    }
                }
                Terminator::Semicolon => {
                    self.pos += 1;
                    self.statement(head, start, nested, imports, &mut items)?;
                }
                Terminator::Close | Terminator::End => {
                    self.statement(head, start, nested, imports, &mut items)?;
                }
            }
        }
    }

    fn statement(
        &self,
        head: &str,
        start: usize,
        nested: bool,
        imports: &mut Imports<'_>,
        items: &mut Vec<Item>,
    ) -> Result<(), ConversionError> {
        if head.is_empty() {
            return Ok(());
        }
        let span = self.span(start);

        if let Some(target) = head.strip_prefix("@import") {
            return self.import(head, target.trim(), span, imports, items);
        }

        if let Some(rest) = head.strip_prefix('@') {
            let name_len = rest.bytes().take_while(|b| is_ident(*b)).count();
            let after = rest[name_len..].trim_start();
            if name_len > 0 && after.starts_with(':') {
                items.push(Item::Variable {
                    name: rest[..name_len].to_string(),
                    value: collapse_whitespace(after[1..].trim()),
                    span,
                });
            } else {
                items.push(Item::Statement(collapse_whitespace(head)));
            }
            return Ok(());
        }

        if (head.starts_with('.') || head.starts_with('#')) && !head.contains(':') {
            items.push(Item::MixinCall {
                name: mixin_name(head),
                span,
            });
            return Ok(());
        }

        let Some((property, value)) = head.split_once(':') else {
            return Err(span.error(format_args!("expected a declaration, found `{head}`")));
        };
        if !nested {
            return Err(span.error("declaration outside of a rule"));
        }
        items.push(Item::Declaration {
            property: property.trim().to_string(),
            value: collapse_whitespace(value.trim()),
            span,
        });
        Ok(())
    }

    fn import(
        &self,
        head: &str,
        target: &str,
        span: Span,
        imports: &mut Imports<'_>,
        items: &mut Vec<Item>,
    ) -> Result<(), ConversionError> {
        // `@import (reference) "x";` style options are accepted and ignored.
        let target = match target.strip_prefix('(') {
            Some(rest) => rest.split_once(')').map_or("", |(_, tail)| tail.trim()),
            None => target,
        };

        let unquoted = target
            .strip_prefix('"')
            .and_then(|rest| rest.strip_suffix('"'))
            .or_else(|| {
                target
                    .strip_prefix('\'')
                    .and_then(|rest| rest.strip_suffix('\''))
            });

        let Some(name) = unquoted else {
            if target.starts_with("url(") {
                items.push(Item::Statement(collapse_whitespace(head)));
                return Ok(());
            }
            return Err(span.error(format_args!("malformed import `{head}`")));
        };

        let external = name.contains("://") || name.starts_with("//");
        let extension = Path::new(name).extension().and_then(|ext| ext.to_str());
        if external || extension == Some("css") {
            items.push(Item::Statement(collapse_whitespace(head)));
            return Ok(());
        }

        let name = match extension {
            Some(_) => name.to_string(),
            None => format!("{name}.less"),
        };
        if imports.depth >= MAX_IMPORT_DEPTH {
            return Err(span.error("imports nested too deeply"));
        }

        let fetched = imports.fetcher.fetch(&sibling_path(&self.file, &name))?;
        if !imports.seen.insert(fetched.key.clone()) {
            return Ok(());
        }

        imports.depth += 1;
        let parsed = parse_file(&fetched.content, &fetched.key, imports);
        imports.depth -= 1;
        items.extend(parsed?);
        Ok(())
    }
}

fn is_ident(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_'
}

fn mixin_name(selector: &str) -> String {
    let trimmed = selector.trim();
    trimmed
        .strip_suffix("()")
        .unwrap_or(trimmed)
        .trim()
        .to_string()
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn split_selectors(head: &str) -> Vec<String> {
    let mut selectors = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (offset, byte) in head.bytes().enumerate() {
        match byte {
            b'(' | b'[' => depth += 1,
            b')' | b']' => depth = depth.saturating_sub(1),
            b',' if depth == 0 => {
                selectors.push(collapse_whitespace(&head[start..offset]));
                start = offset + 1;
            }
            _ => {}
        }
    }
    selectors.push(collapse_whitespace(&head[start..]));
    selectors.retain(|selector| !selector.is_empty());
    selectors
}

fn combine_selectors(parents: &[String], children: &[String]) -> Vec<String> {
    if parents.is_empty() {
        return children
            .iter()
            .map(|child| child.replace('&', "").trim().to_string())
            .collect();
    }
    parents
        .iter()
        .flat_map(|parent| {
            children.iter().map(move |child| {
                if child.contains('&') {
                    child.replace('&', parent)
                } else {
                    format!("{parent} {child}")
                }
            })
        })
        .collect()
}

fn is_mixin_definition(selectors: &[String]) -> bool {
    !selectors.is_empty() && selectors.iter().all(|selector| selector.ends_with("()"))
}

fn bubbles(prelude: &str) -> bool {
    prelude.starts_with("@media") || prelude.starts_with("@supports")
}

#[derive(Debug, PartialEq)]
enum Block {
    Rule {
        selectors: Vec<String>,
        declarations: Vec<(String, String)>,
    },
    At {
        prelude: String,
        declarations: Vec<(String, String)>,
        blocks: Vec<Block>,
    },
    Statement(String),
}

type Declarations = Vec<(String, String)>;

struct Flattener<'a> {
    mixins: HashMap<String, &'a [Item]>,
    scopes: Vec<HashMap<&'a str, (&'a str, &'a Span)>>,
}

impl<'a> Flattener<'a> {
    fn new(items: &'a [Item]) -> Self {
        let mut mixins = HashMap::new();
        for item in items {
            if let Item::Rule { selectors, body } = item {
                for selector in selectors {
                    mixins.insert(mixin_name(selector), body.as_slice());
                }
            }
        }
        Self {
            mixins,
            scopes: Vec::new(),
        }
    }

    fn push_scope(&mut self, items: &'a [Item]) {
        let mut scope = HashMap::new();
        for item in items {
            if let Item::Variable { name, value, span } = item {
                scope.insert(name.as_str(), (value.as_str(), span));
            }
        }
        self.scopes.push(scope);
    }

    fn lookup(&self, name: &str) -> Option<(&'a str, &'a Span)> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(name).copied())
    }

    fn resolve(&self, value: &str, span: &Span, depth: usize) -> Result<String, ConversionError> {
        if depth > MAX_EXPANSION_DEPTH {
            return Err(span.error("variable references nest too deeply"));
        }
        let bytes = value.as_bytes();
        let mut out = String::with_capacity(value.len());
        let mut index = 0;
        let mut copied = 0;
        while index < bytes.len() {
            match bytes[index] {
                quote @ (b'"' | b'\'') => {
                    index += 1;
                    while index < bytes.len() && bytes[index] != quote {
                        index += 1;
                    }
                    index += 1;
                }
                b'@' => {
                    let start = index + 1;
                    let end = start + bytes[start..].iter().take_while(|b| is_ident(**b)).count();
                    if end == start {
                        index += 1;
                        continue;
                    }
                    let name = &value[start..end];
                    let (raw, defined_at) = self
                        .lookup(name)
                        .ok_or_else(|| span.error(format_args!("undefined variable @{name}")))?;
                    out.push_str(&value[copied..index]);
                    out.push_str(&self.resolve(raw, defined_at, depth + 1)?);
                    index = end;
                    copied = end;
                }
                _ => index += 1,
            }
        }
        out.push_str(&value[copied.min(value.len())..]);
        Ok(out)
    }

    /// Flattens a block body under `selectors`, returning the declarations
    /// that belong to the enclosing rule and every block nested beneath it.
    fn flatten_body(
        &mut self,
        items: &'a [Item],
        selectors: &[String],
        depth: usize,
    ) -> Result<(Declarations, Vec<Block>), ConversionError> {
        self.push_scope(items);
        let mut declarations = Vec::new();
        let mut children = Vec::new();

        for item in items {
            match item {
                Item::Declaration {
                    property,
                    value,
                    span,
                } => declarations.push((property.clone(), self.resolve(value, span, 0)?)),
                Item::Variable { .. } => {}
                Item::Rule {
                    selectors: inner,
                    body,
                } => {
                    if is_mixin_definition(inner) {
                        continue;
                    }
                    let combined = combine_selectors(selectors, inner);
                    let (nested, blocks) = self.flatten_body(body, &combined, depth)?;
                    if !nested.is_empty() {
                        children.push(Block::Rule {
                            selectors: combined,
                            declarations: nested,
                        });
                    }
                    children.extend(blocks);
                }
                Item::AtRule {
                    prelude,
                    body,
                    span,
                } => {
                    let prelude = self.resolve_prelude(prelude, span)?;
                    let bubbling = bubbles(&prelude) && !selectors.is_empty();
                    let scope: &[String] = if bubbling { selectors } else { &[] };
                    let (nested, mut blocks) = self.flatten_body(body, scope, depth)?;
                    let declarations = if bubbling {
                        if !nested.is_empty() {
                            blocks.insert(
                                0,
                                Block::Rule {
                                    selectors: selectors.to_vec(),
                                    declarations: nested,
                                },
                            );
                        }
                        Vec::new()
                    } else {
                        nested
                    };
                    children.push(Block::At {
                        prelude,
                        declarations,
                        blocks,
                    });
                }
                Item::MixinCall { name, span } => {
                    if depth >= MAX_EXPANSION_DEPTH {
                        return Err(span.error(format_args!("mixin {name} recurses too deeply")));
                    }
                    let body = self
                        .mixins
                        .get(name)
                        .copied()
                        .ok_or_else(|| span.error(format_args!("undefined mixin {name}")))?;
                    let (nested, blocks) = self.flatten_body(body, selectors, depth + 1)?;
                    declarations.extend(nested);
                    children.extend(blocks);
                }
                Item::Statement(text) => children.push(Block::Statement(text.clone())),
            }
        }

        self.scopes.pop();
        Ok((declarations, children))
    }

    /// Variables are substituted after the at-keyword only.
    fn resolve_prelude(&self, prelude: &str, span: &Span) -> Result<String, ConversionError> {
        match prelude.split_once(' ') {
            Some((keyword, rest)) => Ok(format!("{keyword} {}", self.resolve(rest, span, 0)?)),
            None => Ok(prelude.to_string()),
        }
    }
}

fn render(blocks: &[Block], compress: bool) -> String {
    // Imports and charsets must precede every other rule.
    let (hoisted, rest): (Vec<&Block>, Vec<&Block>) = blocks.iter().partition(|block| {
        matches!(block, Block::Statement(text) if text.starts_with("@import") || text.starts_with("@charset"))
    });

    let mut out = String::new();
    for block in hoisted.into_iter().chain(rest) {
        if compress {
            render_compressed(block, &mut out);
        } else {
            render_pretty(block, 0, &mut out);
        }
    }
    out
}

fn render_pretty(block: &Block, level: usize, out: &mut String) {
    let indent = "  ".repeat(level);
    match block {
        Block::Rule {
            selectors,
            declarations,
        } => {
            let _ = writeln!(
                out,
                "{indent}{} {{",
                selectors.join(format!(",\n{indent}").as_str())
            );
            for (property, value) in declarations {
                let _ = writeln!(out, "{indent}  {property}: {value};");
            }
            let _ = writeln!(out, "{indent}}}");
        }
        Block::At {
            prelude,
            declarations,
            blocks,
        } => {
            let _ = writeln!(out, "{indent}{prelude} {{");
            for (property, value) in declarations {
                let _ = writeln!(out, "{indent}  {property}: {value};");
            }
            for nested in blocks {
                render_pretty(nested, level + 1, out);
            }
            let _ = writeln!(out, "{indent}}}");
        }
        Block::Statement(text) => {
            let _ = writeln!(out, "{indent}{text};");
        }
    }
}

fn render_compressed(block: &Block, out: &mut String) {
    let declarations = |declarations: &[(String, String)]| {
        declarations
            .iter()
            .map(|(property, value)| format!("{property}:{}", compress_value(value)))
            .collect::<Vec<_>>()
            .join(";")
    };
    match block {
        Block::Rule {
            selectors,
            declarations: list,
        } => {
            let _ = write!(out, "{}{{{}}}", selectors.join(","), declarations(list));
        }
        Block::At {
            prelude,
            declarations: list,
            blocks,
        } => {
            let _ = write!(out, "{prelude}{{{}", declarations(list));
            for nested in blocks {
                render_compressed(nested, out);
            }
            out.push('}');
        }
        Block::Statement(text) => {
            let _ = write!(out, "{text};");
        }
    }
}

/// Drops the optional space after commas outside of strings.
fn compress_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut quote = None;
    let mut chars = value.chars().peekable();
    while let Some(current) = chars.next() {
        out.push(current);
        match (quote, current) {
            (None, '"' | '\'') => quote = Some(current),
            (Some(open), c) if c == open => quote = None,
            (None, ',') => {
                while chars.peek() == Some(&' ') {
                    chars.next();
                }
            }
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::testing::MapFetcher;
    use crate::resources::ResourceError;

    fn compile(source: &str, minify: bool) -> Result<String, ConversionError> {
        LessConverter.convert(
            source,
            &ConvertOptions::new("site.less", minify),
            &mut MapFetcher::default(),
        )
    }

    #[test]
    fn compresses_variables_into_declarations() {
        let out = compile("@w: 1px;\n.foo {\n  left: @w;\n}\n", true).expect("compiled");
        assert_eq!(out, ".foo{left:1px}");
    }

    #[test]
    fn pretty_prints_nested_rules() {
        let source = ".a { color: red; &:hover { color: blue; } .b { margin: 0 } }";
        let out = compile(source, false).expect("compiled");
        assert_eq!(
            out,
            ".a {\n  color: red;\n}\n.a:hover {\n  color: blue;\n}\n.a .b {\n  margin: 0;\n}\n"
        );
    }

    #[test]
    fn selector_lists_multiply() {
        let out = compile(".a, .b { .c, .d { top: 0 } }", true).expect("compiled");
        assert_eq!(out, ".a .c,.a .d,.b .c,.b .d{top:0}");
    }

    #[test]
    fn last_definition_wins_and_scopes_shadow() {
        let source = "@c: red;\n.a { color: @c; }\n.b { @c: green; color: @c; }\n@c: blue;\n";
        let out = compile(source, true).expect("compiled");
        assert_eq!(out, ".a{color:blue}.b{color:green}");
    }

    #[test]
    fn media_queries_bubble_out_of_rules() {
        let source = "@narrow: 10px;\n.a { @media (min-width: @narrow) { color: red; } }";
        let out = compile(source, true).expect("compiled");
        assert_eq!(out, "@media (min-width: 10px){.a{color:red}}");
    }

    #[test]
    fn mixins_expand_in_place_and_definitions_are_hidden() {
        let source = ".rounded() { border-radius: 2px; }\n.b { .rounded; color: red; }";
        let out = compile(source, true).expect("compiled");
        assert_eq!(out, ".b{border-radius:2px;color:red}");
    }

    #[test]
    fn comments_are_removed_but_urls_survive() {
        let source = "// heading\n/* block\n comment */ .a { background: url(http://x/y.png); }";
        let out = compile(source, true).expect("compiled");
        assert_eq!(out, ".a{background:url(http://x/y.png)}");
    }

    #[test]
    fn imports_resolve_relative_to_the_importing_file() {
        let mut fetcher = MapFetcher::default()
            .with("css/base.less", "@size: 10px;\n")
            .with("css/parts/box.less", ".box { width: @size; }");
        let source = "@import \"reset.css\";\n@import \"base\";\n@import 'parts/box.less';\n@import \"base\";\n";
        let out = LessConverter
            .convert(source, &ConvertOptions::new("css/main.less", true), &mut fetcher)
            .expect("compiled");

        assert_eq!(out, "@import \"reset.css\";.box{width:10px}");
        assert_eq!(fetcher.requested, vec!["css/base.less", "css/parts/box.less", "css/base.less"]);
    }

    #[test]
    fn missing_imports_surface_as_resource_errors() {
        let result = compile("@import \"absent\";", false);
        assert!(matches!(
            result,
            Err(ConversionError::Resource(ResourceError::NotFound(name))) if name == "absent.less"
        ));
    }

    #[test]
    fn undefined_variables_report_their_line() {
        let result = compile(".a {\n  color: @nope;\n}", false);
        match result {
            Err(ConversionError::Syntax { language, line, message }) => {
                assert_eq!(language, "less");
                assert_eq!(line, 2);
                assert!(message.contains("@nope"), "{message}");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn structural_errors_are_syntax_errors() {
        assert!(matches!(compile(".a { color: red;", false), Err(ConversionError::Syntax { .. })));
        assert!(matches!(compile(".a { } }", false), Err(ConversionError::Syntax { .. })));
        assert!(matches!(compile("color: red;", false), Err(ConversionError::Syntax { .. })));
        assert!(matches!(compile("/* open", false), Err(ConversionError::Syntax { .. })));
    }
}
