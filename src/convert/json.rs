use serde_json::Value;

use super::{ConversionError, ConvertOptions, Converter, IncludeFetcher, line_of};

const LANGUAGE: &str = "json";

/// Re-emits JSON documents in a canonical layout.
///
/// The source may use `//` and `/* */` comments, single-quoted strings and
/// unquoted field names. With `minify` the output is compact, otherwise
/// pretty-printed. Members keep their source order and numbers keep their
/// exact digits. A repeated member name keeps its first position and its
/// last value.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonNormalizer;

impl Converter for JsonNormalizer {
    fn convert(
        &self,
        source: &str,
        options: &ConvertOptions,
        _includes: &mut dyn IncludeFetcher,
    ) -> Result<String, ConversionError> {
        let strict = to_strict(source)?;
        let value: Value = serde_json::from_str(&strict)?;
        let rendered = if options.minify {
            serde_json::to_string(&value)?
        } else {
            serde_json::to_string_pretty(&value)?
        };
        Ok(rendered)
    }
}

/// Rewrites relaxed JSON into strict JSON: comments become whitespace,
/// single-quoted strings become double-quoted and bare member names get quoted.
fn to_strict(source: &str) -> Result<String, ConversionError> {
    let bytes = source.as_bytes();
    let mut out = String::with_capacity(source.len() + 16);
    let mut index = 0;
    let mut copied = 0;

    while index < bytes.len() {
        match bytes[index] {
            b'"' => {
                index = skip_string(source, index)?;
            }
            b'\'' => {
                out.push_str(&source[copied..index]);
                index = requote(source, index, &mut out)?;
                copied = index;
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
                loop {
                    if index + 1 >= bytes.len() {
                        return Err(ConversionError::syntax(
                            LANGUAGE,
                            line_of(source, start),
                            "unterminated comment",
                        ));
                    }
                    if bytes[index] == b'*' && bytes[index + 1] == b'/' {
                        index += 2;
                        break;
                    }
                    index += 1;
                }
                out.push(' ');
                copied = index;
            }
            b'0'..=b'9' | b'-' => {
                while index < bytes.len() && is_number_byte(bytes[index]) {
                    index += 1;
                }
            }
            byte if is_name_start(byte) => {
                let start = index;
                while index < bytes.len() && is_name_byte(bytes[index]) {
                    index += 1;
                }
                let word = &source[start..index];
                if !matches!(word, "true" | "false" | "null") && followed_by_colon(bytes, index) {
                    out.push_str(&source[copied..start]);
                    out.push('"');
                    out.push_str(word);
                    out.push('"');
                    copied = index;
                }
            }
            _ => index += 1,
        }
    }

    out.push_str(&source[copied.min(source.len())..]);
    Ok(out)
}

/// Returns the index just past the closing quote of the string at `start`.
fn skip_string(source: &str, start: usize) -> Result<usize, ConversionError> {
    let bytes = source.as_bytes();
    let mut index = start + 1;
    while index < bytes.len() {
        match bytes[index] {
            b'\\' => index += 2,
            b'"' => return Ok(index + 1),
            _ => index += 1,
        }
    }
    Err(ConversionError::syntax(
        LANGUAGE,
        line_of(source, start),
        "unterminated string",
    ))
}

/// Copies the single-quoted string at `start` into `out` as a double-quoted one.
fn requote(source: &str, start: usize, out: &mut String) -> Result<usize, ConversionError> {
    out.push('"');
    let mut chars = source[start + 1..].char_indices();
    while let Some((offset, ch)) = chars.next() {
        match ch {
            '\'' => {
                out.push('"');
                return Ok(start + 1 + offset + 1);
            }
            '"' => out.push_str("\\\""),
            '\\' => match chars.next() {
                Some((_, '\'')) => out.push('\''),
                Some((_, escaped)) => {
                    out.push('\\');
                    out.push(escaped);
                }
                None => break,
            },
            other => out.push(other),
        }
    }
    Err(ConversionError::syntax(
        LANGUAGE,
        line_of(source, start),
        "unterminated string",
    ))
}

fn followed_by_colon(bytes: &[u8], mut index: usize) -> bool {
    while index < bytes.len() && bytes[index].is_ascii_whitespace() {
        index += 1;
    }
    bytes.get(index) == Some(&b':')
}

fn is_number_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'+' | b'-')
}

fn is_name_start(byte: u8) -> bool {
    byte.is_ascii_alphabetic() || matches!(byte, b'_' | b'$')
}

fn is_name_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'_' | b'$')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::testing::MapFetcher;

    fn normalize(source: &str, minify: bool) -> Result<String, ConversionError> {
        JsonNormalizer.convert(
            source,
            &ConvertOptions::new("data.json", minify),
            &mut MapFetcher::default(),
        )
    }

    #[test]
    fn compacts_when_minifying() {
        let out = normalize("{ \"foo\" :\n  \"bar\" }", true).expect("valid json");
        assert_eq!(out, "{\"foo\":\"bar\"}");
    }

    #[test]
    fn pretty_prints_otherwise() {
        let out = normalize("{\"foo\":[1,2]}", false).expect("valid json");
        assert_eq!(out, "{\n  \"foo\": [\n    1,\n    2\n  ]\n}");
    }

    #[test]
    fn member_order_and_number_digits_survive() {
        let source =
            r#"{"zeta": 1, "alpha": 12345678901234567890123, "price": 0.10000000000000000001}"#;
        let out = normalize(source, true).expect("valid json");
        assert_eq!(
            out,
            r#"{"zeta":1,"alpha":12345678901234567890123,"price":0.10000000000000000001}"#
        );
    }

    #[test]
    fn repeated_members_keep_first_position_and_last_value() {
        let out = normalize(r#"{"a":1,"b":2,"a":3}"#, true).expect("valid json");
        assert_eq!(out, r#"{"a":3,"b":2}"#);
    }

    #[test]
    fn comments_are_stripped_but_strings_are_untouched() {
        let source = r#"{
            // line comment
            "url": "http://example.com/*not a comment*/", /* block */
            "n": 1
        }"#;
        let out = normalize(source, true).expect("valid json");
        assert_eq!(out, r#"{"url":"http://example.com/*not a comment*/","n":1}"#);
    }

    #[test]
    fn single_quotes_and_bare_names_are_accepted() {
        let source = r#"{name: 'it\'s "here"', $id: 'a//b', n_2 : -1.5e3, ok: true, none: null}"#;
        let out = normalize(source, true).expect("relaxed json");
        assert_eq!(
            out,
            r#"{"name":"it's \"here\"","$id":"a//b","n_2":-1.5e3,"ok":true,"none":null}"#
        );
    }

    #[test]
    fn malformed_documents_fail() {
        assert!(matches!(
            normalize("{\"foo\": }", true),
            Err(ConversionError::Json(_))
        ));
        assert!(matches!(
            normalize("{} /* open", true),
            Err(ConversionError::Syntax { language: "json", .. })
        ));
        assert!(matches!(
            normalize("{'open: 1}", true),
            Err(ConversionError::Syntax { language: "json", .. })
        ));
        assert!(matches!(
            normalize("[undefined]", true),
            Err(ConversionError::Json(_))
        ));
    }
}
