use super::{ConversionError, ConvertOptions, Converter, IncludeFetcher, line_of};

/// Conservative JavaScript minifier.
///
/// Strips comments (keeping `/*!` banners), drops blank lines and squeezes
/// whitespace that sits next to punctuation. Line breaks between statements
/// are kept so automatic semicolon insertion still sees them. Strings,
/// template literals and regular expression literals pass through verbatim.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScriptMinifier;

impl Converter for ScriptMinifier {
    fn convert(
        &self,
        source: &str,
        options: &ConvertOptions,
        _includes: &mut dyn IncludeFetcher,
    ) -> Result<String, ConversionError> {
        if !options.minify {
            return Ok(source.to_string());
        }
        minify(source)
    }
}

const PUNCTUATION: &[char] = &[
    '{', '}', '(', ')', '[', ']', ';', ',', ':', '=', '<', '>', '?', '&', '|', '!', '*', '%',
];

fn minify(source: &str) -> Result<String, ConversionError> {
    let chars: Vec<char> = source.chars().collect();
    let mut out = String::with_capacity(source.len());
    let mut pending_space = false;
    let mut pending_newline = false;
    let mut index = 0;

    // Offset tracking for error lines.
    let byte_offset = |at: usize| chars[..at].iter().map(|c| c.len_utf8()).sum::<usize>();

    while index < chars.len() {
        let current = chars[index];
        let next = chars.get(index + 1).copied();

        if current == '/' && next == Some('/') {
            while index < chars.len() && chars[index] != '\n' {
                index += 1;
            }
            continue;
        }

        if current == '/' && next == Some('*') {
            let start = index;
            let banner = chars.get(index + 2) == Some(&'!');
            index += 2;
            while index + 1 < chars.len() && !(chars[index] == '*' && chars[index + 1] == '/') {
                index += 1;
            }
            if index + 1 >= chars.len() {
                return Err(ConversionError::syntax(
                    "javascript",
                    line_of(source, byte_offset(start)),
                    "unterminated comment",
                ));
            }
            index += 2;
            if banner {
                flush_separator(&mut out, &mut pending_space, &mut pending_newline);
                out.extend(&chars[start..index]);
                pending_newline = true;
            } else {
                pending_space = true;
            }
            continue;
        }

        if current == '\n' || current == '\r' {
            pending_newline = true;
            index += 1;
            continue;
        }

        if current.is_whitespace() {
            pending_space = true;
            index += 1;
            continue;
        }

        if matches!(current, '"' | '\'' | '`') {
            flush_separator(&mut out, &mut pending_space, &mut pending_newline);
            let start = index;
            index = skip_quoted(&chars, index, current).ok_or_else(|| {
                ConversionError::syntax(
                    "javascript",
                    line_of(source, byte_offset(start)),
                    "unterminated string literal",
                )
            })?;
            out.extend(&chars[start..index]);
            continue;
        }

        if current == '/' && regex_allowed(&out) {
            flush_separator(&mut out, &mut pending_space, &mut pending_newline);
            let start = index;
            index = skip_regex(&chars, index).ok_or_else(|| {
                ConversionError::syntax(
                    "javascript",
                    line_of(source, byte_offset(start)),
                    "unterminated regular expression",
                )
            })?;
            out.extend(&chars[start..index]);
            continue;
        }

        if PUNCTUATION.contains(&current) {
            // Whitespace before punctuation is never significant; a newline
            // before a closing brace is not either.
            pending_space = false;
            if matches!(current, '}' | ')' | ']' | ';' | ',') {
                pending_newline = false;
            }
            flush_separator(&mut out, &mut pending_space, &mut pending_newline);
            out.push(current);
            index += 1;
            // Swallow whitespace after punctuation.
            while index < chars.len() && chars[index].is_whitespace() && chars[index] != '\n' {
                index += 1;
            }
            continue;
        }

        flush_separator(&mut out, &mut pending_space, &mut pending_newline);
        out.push(current);
        index += 1;
    }

    Ok(out.trim().to_string())
}

fn flush_separator(out: &mut String, pending_space: &mut bool, pending_newline: &mut bool) {
    if !out.is_empty() {
        let last = out.chars().last();
        // A break after an opening or infix token never terminates a statement.
        let continues = last.is_some_and(|c| {
            c == '\n' || (PUNCTUATION.contains(&c) && !matches!(c, '}' | ')' | ']'))
        });
        if *pending_newline && !continues {
            out.push('\n');
        } else if *pending_space && !last.is_some_and(|c| PUNCTUATION.contains(&c) || c == '\n') {
            out.push(' ');
        }
    }
    *pending_space = false;
    *pending_newline = false;
}

fn skip_quoted(chars: &[char], start: usize, quote: char) -> Option<usize> {
    let mut index = start + 1;
    while index < chars.len() {
        match chars[index] {
            '\\' => index += 2,
            c if c == quote => return Some(index + 1),
            '\n' if quote != '`' => return None,
            _ => index += 1,
        }
    }
    None
}

fn skip_regex(chars: &[char], start: usize) -> Option<usize> {
    let mut index = start + 1;
    let mut in_class = false;
    while index < chars.len() {
        match chars[index] {
            '\\' => index += 2,
            '[' => {
                in_class = true;
                index += 1;
            }
            ']' => {
                in_class = false;
                index += 1;
            }
            '/' if !in_class => {
                index += 1;
                while index < chars.len() && chars[index].is_ascii_alphabetic() {
                    index += 1;
                }
                return Some(index);
            }
            '\n' => return None,
            _ => index += 1,
        }
    }
    None
}

/// A `/` starts a regex literal when the previous token cannot end an expression.
fn regex_allowed(out: &str) -> bool {
    let trimmed = out.trim_end();
    match trimmed.chars().last() {
        None => true,
        Some(c) if "(,=:[!&|?{};+-*%<>~^\n".contains(c) => true,
        Some(c) if c.is_alphanumeric() || c == '_' || c == '$' => {
            let word: String = trimmed
                .chars()
                .rev()
                .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == '$')
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            matches!(
                word.as_str(),
                "return" | "typeof" | "instanceof" | "in" | "of" | "new" | "delete" | "void"
                    | "throw" | "case" | "do" | "else"
            )
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::testing::MapFetcher;

    fn run(source: &str, minify: bool) -> String {
        ScriptMinifier
            .convert(
                source,
                &ConvertOptions::new("app.js", minify),
                &mut MapFetcher::default(),
            )
            .expect("minified")
    }

    #[test]
    fn passthrough_without_minify() {
        let source = "var a = 1; // keep\n";
        assert_eq!(run(source, false), source);
    }

    #[test]
    fn squeezes_whitespace_around_punctuation() {
        assert_eq!(run("var a = 1;", true), "var a=1;");
        assert_eq!(
            run("function add ( a, b ) {\n  return a + b;\n}\n", true),
            "function add(a,b){return a + b;}"
        );
    }

    #[test]
    fn removes_comments_but_keeps_banners() {
        let source = "/*! license */\n// note\nvar a = 1; /* inline */ var b = 2;\n";
        assert_eq!(run(source, true), "/*! license */\nvar a=1;var b=2;");
    }

    #[test]
    fn keeps_line_breaks_between_statements() {
        assert_eq!(run("a = 1\nb = 2\n", true), "a=1\nb=2");
    }

    #[test]
    fn strings_and_regexes_are_verbatim() {
        let source = "var s = \"a  // b\";\nvar r = /a\\/ +b/g;\nvar t = `x  ${y}`;";
        assert_eq!(
            run(source, true),
            "var s=\"a  // b\";var r=/a\\/ +b/g;var t=`x  ${y}`;"
        );
    }

    #[test]
    fn division_is_not_mistaken_for_regex() {
        assert_eq!(run("var x = a / b / c;", true), "var x=a / b / c;");
    }

    #[test]
    fn unterminated_literals_fail() {
        let result = ScriptMinifier.convert(
            "var s = 'oops\n",
            &ConvertOptions::new("app.js", true),
            &mut MapFetcher::default(),
        );
        assert!(matches!(
            result,
            Err(ConversionError::Syntax { language: "javascript", line: 1, .. })
        ));
    }
}
