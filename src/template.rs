//! Template compilation.
//!
//! A template is plain text whose `{...}` spans declare extracted fields.
//! Each span carries an expression, an optional `:type` or `:type:format`
//! qualifier, and an optional pipeline (`{Name:word | upper()}`). Compilation
//! turns each non-blank template line into a [`LineTemplate`]: its ordered
//! placeholders, an array-row flag when every placeholder belongs to one
//! repeating array, and a generated capture pattern for everything else.
//!
//! Malformed spans (an unmatched `{`) are not errors; the text is kept as
//! literal content and simply yields no placeholder.

use std::fmt;

use convert_case::{Case, Casing};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::expr::{is_simple_path, split_top_level, Term};

/// Compilation failure. The only fallible step is building a line's capture
/// pattern; everything else degrades locally.
#[derive(Debug)]
pub enum TemplateError {
    Pattern { line: String, source: regex::Error },
}

impl fmt::Display for TemplateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemplateError::Pattern { line, source } => {
                write!(f, "failed to build capture pattern for '{}': {}", line, source)
            }
        }
    }
}

impl std::error::Error for TemplateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TemplateError::Pattern { source, .. } => Some(source),
        }
    }
}

/// One `{...}` span of a template line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Placeholder {
    /// Text inside the braces, as written
    pub raw: String,
    /// Target path in the output tree
    pub path: String,
    /// Declared type keyword, if any
    pub value_type: Option<String>,
    /// Declared format string, if any
    pub format: Option<String>,
    /// Expression (with any pipeline steps reattached after the qualifier)
    pub expr: String,
}

/// A compiled template line.
#[derive(Debug, Clone, Serialize)]
pub struct LineTemplate {
    /// The trimmed template line as written
    pub raw: String,
    /// Ordered placeholders found on the line
    pub placeholders: Vec<Placeholder>,
    /// True when every placeholder targets one shared repeating array
    pub is_array_row: bool,
    /// Base path of the shared array for array rows
    pub array_name: Option<String>,
    /// Leading literal text (before the first placeholder), whitespace-collapsed
    pub literal: String,
    /// True when the line is exactly one placeholder with no literal text
    pub bare_placeholder: bool,
    /// Capture pattern for non-array lines with placeholders
    #[serde(skip)]
    pub pattern: Option<Regex>,
}

/// An ordered sequence of compiled line templates.
#[derive(Debug, Clone, Serialize)]
pub struct Template {
    pub lines: Vec<LineTemplate>,
}

impl Template {
    /// Compile template text into line templates, one per non-blank line.
    pub fn compile(text: &str) -> Result<Template, TemplateError> {
        let mut lines = Vec::new();
        for raw in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            lines.push(LineTemplate::compile(raw)?);
        }
        debug!(line_templates = lines.len(), "compiled template");
        Ok(Template { lines })
    }
}

enum Span {
    Literal(String),
    Placeholder(Placeholder),
}

impl LineTemplate {
    fn compile(raw: &str) -> Result<LineTemplate, TemplateError> {
        let spans = scan_spans(raw);

        let placeholders: Vec<Placeholder> = spans
            .iter()
            .filter_map(|s| match s {
                Span::Placeholder(p) => Some(p.clone()),
                Span::Literal(_) => None,
            })
            .collect();

        let literal = match spans.first() {
            Some(Span::Literal(text)) => collapse_ws(text),
            _ => String::new(),
        };

        let bare_placeholder = placeholders.len() == 1
            && spans.iter().all(|s| match s {
                Span::Literal(text) => text.trim().is_empty(),
                Span::Placeholder(_) => true,
            });

        let (is_array_row, array_name) = detect_array_row(&placeholders);

        let pattern = if !is_array_row && !placeholders.is_empty() {
            let source = capture_pattern(&spans);
            Some(Regex::new(&source).map_err(|source| TemplateError::Pattern {
                line: raw.to_string(),
                source,
            })?)
        } else {
            None
        };

        Ok(LineTemplate {
            raw: raw.to_string(),
            placeholders,
            is_array_row,
            array_name,
            literal,
            bare_placeholder,
            pattern,
        })
    }
}

/// Scan a line into literal and placeholder spans. An unmatched `{` turns the
/// remainder of the line into literal text.
fn scan_spans(line: &str) -> Vec<Span> {
    let chars: Vec<char> = line.chars().collect();
    let mut spans = Vec::new();
    let mut literal = String::new();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '{' {
            if let Some(end) = find_close(&chars, i + 1) {
                if !literal.is_empty() {
                    spans.push(Span::Literal(std::mem::take(&mut literal)));
                }
                let content: String = chars[i + 1..end].iter().collect();
                spans.push(Span::Placeholder(parse_placeholder(&content)));
                i = end + 1;
                continue;
            }
            literal.extend(chars[i..].iter());
            break;
        }
        literal.push(chars[i]);
        i += 1;
    }
    if !literal.is_empty() {
        spans.push(Span::Literal(literal));
    }
    spans
}

fn find_close(chars: &[char], from: usize) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (idx, &c) in chars.iter().enumerate().skip(from) {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' => quote = Some(c),
                '}' => return Some(idx),
                _ => {}
            },
        }
    }
    None
}

/// Parse the inside of a `{...}` span.
///
/// The `:type` / `:type:format` qualifier is found at paren-depth zero, so
/// colons inside function arguments or quotes are left alone. A pipe written
/// after the qualifier is reattached to the expression: the qualifier always
/// binds to the expression, and pipe steps stay part of the pipeline
/// wherever they appear lexically.
fn parse_placeholder(content: &str) -> Placeholder {
    let raw = content.trim().to_string();
    let parts = split_top_level(&raw, ':');
    let mut expr = parts[0].trim().to_string();
    let mut value_type = None;
    let mut format = None;

    if parts.len() > 1 {
        let qualifier = parts[1..].join(":");
        let mut pieces = split_top_level(&qualifier, '|');
        let head = pieces.remove(0);
        if !pieces.is_empty() {
            let steps: Vec<String> = pieces.iter().map(|p| p.trim().to_string()).collect();
            expr = format!("{} | {}", expr, steps.join(" | "));
        }
        let mut head_parts = split_top_level(&head, ':').into_iter();
        if let Some(ty) = head_parts.next() {
            let ty = ty.trim();
            if !ty.is_empty() {
                value_type = Some(ty.to_string());
            }
        }
        let rest: Vec<String> = head_parts.collect();
        if !rest.is_empty() {
            let fmt = rest.join(":").trim().to_string();
            if !fmt.is_empty() {
                format = Some(fmt);
            }
        }
    }

    let path = derive_path(&expr);
    Placeholder {
        raw,
        path,
        value_type,
        format,
        expr,
    }
}

/// Derive the target path for an expression: the pipeline seed when it is a
/// simple path, else the first simple-path argument of a function call, else
/// a sanitized uppercase key built from the expression text.
///
/// Arguments carrying an array marker are not taken as targets: an aggregate
/// like `count(Items[])` must not write its result back into the array it
/// reads, so it falls through to the sanitized key.
fn derive_path(expr: &str) -> String {
    let seed = split_top_level(expr, '|')[0].trim().to_string();
    if is_simple_path(&seed) {
        return seed;
    }
    if let Term::Call { args, .. } = Term::parse(&seed) {
        for arg in &args {
            if let Term::Path(p) = arg {
                if is_simple_path(p) && !p.contains('[') {
                    return p.clone();
                }
            }
        }
    }
    sanitized_key(expr)
}

fn sanitized_key(expr: &str) -> String {
    let cleaned: String = expr
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect();
    cleaned.to_case(Case::ScreamingSnake)
}

/// A line is an array row iff every placeholder path carries an array marker
/// and all markers share one base path, case-insensitively.
fn detect_array_row(placeholders: &[Placeholder]) -> (bool, Option<String>) {
    if placeholders.is_empty() {
        return (false, None);
    }
    let mut base: Option<String> = None;
    for ph in placeholders {
        let pos = match ph.path.find('[') {
            Some(pos) => pos,
            None => return (false, None),
        };
        let this = &ph.path[..pos];
        match &base {
            Some(b) if !b.eq_ignore_ascii_case(this) => return (false, None),
            Some(_) => {}
            None => base = Some(this.to_string()),
        }
    }
    (true, base)
}

/// Build the anchored, case-insensitive, whitespace-tolerant capture pattern
/// for a line: literal spans become escaped matches, placeholders become
/// non-greedy groups.
fn capture_pattern(spans: &[Span]) -> String {
    let mut pattern = String::from(r"(?i)^\s*");
    for span in spans {
        match span {
            Span::Literal(text) => pattern.push_str(&literal_pattern(text)),
            Span::Placeholder(_) => pattern.push_str("(.+?)"),
        }
    }
    pattern.push_str(r"\s*$");
    pattern
}

fn literal_pattern(text: &str) -> String {
    // Whitespace-only spans separate two placeholders and must consume
    // real whitespace, or adjacent groups would split a single word.
    if text.trim().is_empty() {
        return r"\s+".to_string();
    }
    let mut out = String::new();
    if text.starts_with(char::is_whitespace) {
        out.push_str(r"\s*");
    }
    let tokens: Vec<String> = text.split_whitespace().map(|t| regex::escape(t)).collect();
    out.push_str(&tokens.join(r"\s+"));
    if text.ends_with(char::is_whitespace) {
        out.push_str(r"\s*");
    }
    out
}

/// Collapse internal whitespace runs and trim, for case-insensitive literal
/// comparison between template and input lines.
pub(crate) fn collapse_ws(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(raw: &str) -> LineTemplate {
        LineTemplate::compile(raw).expect("compiles")
    }

    #[test]
    fn test_simple_placeholder() {
        let lt = line("Invoice No: {InvoiceNumber}");
        assert_eq!(lt.placeholders.len(), 1);
        let ph = &lt.placeholders[0];
        assert_eq!(ph.path, "InvoiceNumber");
        assert_eq!(ph.expr, "InvoiceNumber");
        assert_eq!(ph.value_type, None);
        assert_eq!(lt.literal, "Invoice No:");
        assert!(!lt.bare_placeholder);
    }

    #[test]
    fn test_type_and_format_qualifier() {
        let lt = line("{InvoiceDateTime:datetime:dd-MM-yyyy H:mm}");
        let ph = &lt.placeholders[0];
        assert_eq!(ph.expr, "InvoiceDateTime");
        assert_eq!(ph.value_type.as_deref(), Some("datetime"));
        assert_eq!(ph.format.as_deref(), Some("dd-MM-yyyy H:mm"));
        assert!(lt.bare_placeholder);
    }

    #[test]
    fn test_pipe_after_qualifier_reattaches() {
        let lt = line("{Name:word | upper() | prefix('X-')}");
        let ph = &lt.placeholders[0];
        assert_eq!(ph.value_type.as_deref(), Some("word"));
        assert_eq!(ph.expr, "Name | upper() | prefix('X-')");
        assert_eq!(ph.path, "Name");
    }

    #[test]
    fn test_colon_inside_call_not_a_qualifier() {
        let lt = line("{concat(A, ':')}");
        let ph = &lt.placeholders[0];
        assert_eq!(ph.value_type, None);
        assert_eq!(ph.expr, "concat(A, ':')");
        assert_eq!(ph.path, "A");
    }

    #[test]
    fn test_path_from_first_simple_argument() {
        let lt = line("{coalesce(TotalItem, RetailerName)}");
        assert_eq!(lt.placeholders[0].path, "TotalItem");
    }

    #[test]
    fn test_sanitized_key_fallback() {
        let lt = line("{concat('a', 'b')}");
        assert_eq!(lt.placeholders[0].path, "CONCAT_A_B");
    }

    #[test]
    fn test_aggregate_over_array_gets_sanitized_key() {
        let lt = line("{sum(Items[].Total)}");
        assert_eq!(lt.placeholders[0].path, "SUM_ITEMS_TOTAL");
        let lt = line("{count(Items[])}");
        assert_eq!(lt.placeholders[0].path, "COUNT_ITEMS");
    }

    #[test]
    fn test_array_row_detection() {
        let lt = line("{Items[].ItemName:word} {Items[].Rate:number}");
        assert!(lt.is_array_row);
        assert_eq!(lt.array_name.as_deref(), Some("Items"));
        assert!(lt.pattern.is_none());
    }

    #[test]
    fn test_mixed_bases_not_array_row() {
        let lt = line("{Items[].Name} {Others[].Name}");
        assert!(!lt.is_array_row);
        assert!(lt.pattern.is_some());
    }

    #[test]
    fn test_capture_pattern_matches_loosely() {
        let lt = line("Invoice No: {InvoiceNumber} dated {When}");
        let pattern = lt.pattern.as_ref().expect("pattern");
        let caps = pattern
            .captures("invoice  no:  INV-1001   dated  2025-09-15")
            .expect("matches");
        assert_eq!(caps.get(1).map(|m| m.as_str().trim()), Some("INV-1001"));
        assert_eq!(caps.get(2).map(|m| m.as_str().trim()), Some("2025-09-15"));
    }

    #[test]
    fn test_unmatched_brace_yields_no_placeholder() {
        let lt = line("Total: {Oops");
        assert!(lt.placeholders.is_empty());
        assert_eq!(lt.literal, "Total: {Oops");
    }

    #[test]
    fn test_compile_skips_blank_lines() {
        let template = Template::compile("A: {A}\n\n   \nB: {B}\n").expect("compiles");
        assert_eq!(template.lines.len(), 2);
    }
}
