//! Path template compiler.
//!
//! Templates are slash-delimited and may contain:
//!
//! | Token      | Meaning                                      |
//! |------------|----------------------------------------------|
//! | `:name`    | required, one segment                        |
//! | `:name?`   | optional, one segment                        |
//! | `:name+`   | required, one or more segments               |
//! | `:name*`   | optional, any number of segments             |
//! | `*`        | unnamed wildcard within one segment          |
//! | `**`       | unnamed wildcard across segments             |
//! | `\:`       | literal colon (any `\x` is a literal `x`)    |
//!
//! Everything else is literal text and is regex-escaped, so arbitrary path
//! text stays matchable. Compiled patterns are anchored, case-sensitive and
//! ignore leading/trailing slashes on both the template and the path.
//!
//! Paths are matched in their percent-encoded form, exactly as received, so a
//! literal `a b` in a template never matches `/a%20b`. Captured parameter
//! values are percent-decoded; a capture that does not decode to UTF-8 is
//! kept encoded.

use crate::error::ValidationError;
use percent_encoding::percent_decode_str;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// How a named parameter consumes path segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// `:name`
    Required,
    /// `:name?`
    Optional,
    /// `:name+`
    Repeating,
    /// `:name*`, and any mix of `?` with `+`/`*` (repeating wins)
    OptionalRepeating,
}

impl ParamKind {
    fn is_optional(self) -> bool {
        matches!(self, ParamKind::Optional | ParamKind::OptionalRepeating)
    }

    fn capture(self) -> &'static str {
        match self {
            ParamKind::Required | ParamKind::Optional => "[^/]+",
            ParamKind::Repeating | ParamKind::OptionalRepeating => "[^/]+(?:/[^/]+)*",
        }
    }
}

/// A named parameter in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSpec {
    /// Parameter name without the leading colon
    pub name: String,
    /// Segment semantics
    pub kind: ParamKind,
}

/// Captured parameter values. Repeating captures keep their inner slashes;
/// absent optional parameters have no entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PathParams(BTreeMap<String, String>);

impl PathParams {
    /// Value of a captured parameter.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Number of captured parameters.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// `true` when nothing was captured.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over `(name, value)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[derive(Debug)]
enum Token {
    Literal(String),
    Param { index: usize, kind: ParamKind },
    Wildcard,
    DoubleWildcard,
}

/// A compiled path template.
#[derive(Debug, Clone)]
pub struct PathPattern {
    template: String,
    regex: Regex,
    params: Vec<ParamSpec>,
    group_names: Vec<String>,
}

impl PathPattern {
    /// Compile a template.
    ///
    /// # Errors
    ///
    /// [`ValidationError::DuplicateParameter`] when a parameter name repeats.
    pub fn compile(template: &str) -> Result<Self, ValidationError> {
        let mut params = Vec::new();
        let mut source = String::from("^");

        let trimmed = template.trim_matches('/');
        if !trimmed.is_empty() {
            for segment in trimmed.split('/') {
                let tokens = tokenize_segment(segment, template, &mut params)?;
                source.push_str(&segment_regex(&tokens));
            }
        }
        source.push_str("/?$");

        let regex = Regex::new(&source).map_err(|err| ValidationError::InvalidPattern {
            template: template.to_string(),
            details: err.to_string(),
        })?;
        let group_names = (0..params.len()).map(|i| format!("p{i}")).collect();

        Ok(Self {
            template: template.to_string(),
            regex,
            params,
            group_names,
        })
    }

    /// The template this pattern was compiled from.
    pub fn template(&self) -> &str {
        &self.template
    }

    /// Named parameters in declaration order.
    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    /// Match a request path, returning captured parameters on success.
    pub fn match_path(&self, path: &str) -> Option<PathParams> {
        let normalized;
        let path = if path.starts_with('/') {
            path
        } else {
            normalized = format!("/{path}");
            &normalized
        };

        let captures = self.regex.captures(path)?;
        let mut values = BTreeMap::new();
        for (spec, group) in self.params.iter().zip(&self.group_names) {
            if let Some(m) = captures.name(group) {
                if !m.as_str().is_empty() {
                    values.insert(spec.name.clone(), decode_capture(m.as_str()));
                }
            }
        }
        Some(PathParams(values))
    }

    /// `true` when the path matches.
    pub fn matches(&self, path: &str) -> bool {
        self.match_path(path).is_some()
    }
}

fn decode_capture(raw: &str) -> String {
    match percent_decode_str(raw).decode_utf8() {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => raw.to_string(),
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.template)
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn tokenize_segment(
    segment: &str,
    template: &str,
    params: &mut Vec<ParamSpec>,
) -> Result<Vec<Token>, ValidationError> {
    let mut tokens = Vec::new();
    let mut literal = String::new();
    let mut chars = segment.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' => literal.push(chars.next().unwrap_or('\\')),
            ':' if chars.peek().copied().is_some_and(is_name_char) => {
                let mut name = String::new();
                while let Some(&next) = chars.peek() {
                    if !is_name_char(next) {
                        break;
                    }
                    name.push(next);
                    chars.next();
                }

                let mut kind = match chars.peek() {
                    Some('?') => ParamKind::Optional,
                    Some('+') => ParamKind::Repeating,
                    Some('*') => ParamKind::OptionalRepeating,
                    _ => ParamKind::Required,
                };
                if kind != ParamKind::Required {
                    let first = chars.next();
                    // `?` next to `+`/`*` collapses into a greedy optional run.
                    let paired = matches!(
                        (first, chars.peek()),
                        (Some('?'), Some('+' | '*')) | (Some('+' | '*'), Some('?'))
                    );
                    if paired {
                        chars.next();
                        kind = ParamKind::OptionalRepeating;
                    }
                }

                if params.iter().any(|p: &ParamSpec| p.name == name) {
                    return Err(ValidationError::DuplicateParameter {
                        name,
                        template: template.to_string(),
                    });
                }
                if !literal.is_empty() {
                    tokens.push(Token::Literal(std::mem::take(&mut literal)));
                }
                tokens.push(Token::Param {
                    index: params.len(),
                    kind,
                });
                params.push(ParamSpec { name, kind });
            }
            '*' => {
                if !literal.is_empty() {
                    tokens.push(Token::Literal(std::mem::take(&mut literal)));
                }
                if chars.peek() == Some(&'*') {
                    chars.next();
                    tokens.push(Token::DoubleWildcard);
                } else {
                    tokens.push(Token::Wildcard);
                }
            }
            other => literal.push(other),
        }
    }
    if !literal.is_empty() {
        tokens.push(Token::Literal(literal));
    }
    Ok(tokens)
}

fn segment_regex(tokens: &[Token]) -> String {
    // A segment that is only an optional part makes its leading slash optional too.
    if let [token] = tokens {
        match token {
            Token::Param { index, kind } if kind.is_optional() => {
                return format!("(?:/(?P<p{index}>{}))?", kind.capture());
            }
            Token::DoubleWildcard => return "(?:/.*)?".to_string(),
            _ => {}
        }
    }

    let mut out = String::from("/");
    for token in tokens {
        match token {
            Token::Literal(text) => out.push_str(&regex::escape(text)),
            Token::Param { index, kind } => {
                let optional = if kind.is_optional() { "?" } else { "" };
                out.push_str(&format!("(?P<p{index}>{}){optional}", kind.capture()));
            }
            Token::Wildcard => out.push_str("[^/]*"),
            Token::DoubleWildcard => out.push_str(".*"),
        }
    }
    out
}
