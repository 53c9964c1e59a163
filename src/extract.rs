//! Extraction engine: walks input text against a compiled template.
//!
//! A single forward-only cursor moves over the trimmed, non-blank input
//! lines. Array-row templates consume as many rows as match, literal lines
//! are consumed only when present, and placeholder lines bind through a
//! chain of strategies (capture pattern, whole line, positional tokens).
//! Nothing here fails: a non-matching line degrades to fallback values and
//! running out of input returns the partial tree built so far.

use std::collections::HashSet;

use indexmap::IndexMap;
use serde_json::{Map, Value};
use tracing::{debug, trace};

use crate::coerce::coerce;
use crate::expr::{display_value, evaluate_pipeline, has_pipe, is_simple_path, Pipeline, Term};
use crate::template::{collapse_ws, LineTemplate, Placeholder, Template};
use crate::tree::{array_mut, ensure_array, set_value};

impl Template {
    /// Extract a tree from `input`.
    ///
    /// Line templates are applied in order against a forward-only cursor;
    /// after the per-line pass, a second pass evaluates every pipeline or
    /// function expression that was not already settled by a captured seed,
    /// so aggregates see final array contents regardless of where they
    /// appear in the template.
    pub fn extract(&self, input: &str) -> Value {
        let lines: Vec<&str> = input
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();

        let mut tree = Value::Object(Map::new());
        let mut resolved: HashSet<(usize, usize)> = HashSet::new();
        let mut cursor = 0usize;

        for (ti, lt) in self.lines.iter().enumerate() {
            if cursor >= lines.len() {
                debug!(template_line = %lt.raw, "input exhausted, stopping with partial tree");
                break;
            }
            if lt.is_array_row {
                cursor = self.extract_array_rows(&mut tree, lt, ti, &lines, cursor);
            } else if lt.placeholders.is_empty() {
                if starts_with_ci(lines[cursor], &lt.literal) {
                    trace!(line = lines[cursor], "consumed literal line");
                    cursor += 1;
                }
            } else {
                self.bind_line(&mut tree, lt, ti, lines[cursor], &mut resolved);
                cursor += 1;
            }
        }

        self.final_pass(&mut tree, &resolved);
        tree
    }

    /// Repeatedly bind whitespace-tokenized rows into the target array until
    /// end of input or the stop-literal of a later template line.
    fn extract_array_rows(
        &self,
        tree: &mut Value,
        lt: &LineTemplate,
        ti: usize,
        lines: &[&str],
        mut cursor: usize,
    ) -> usize {
        let base = match lt.array_name.as_deref() {
            Some(base) => base,
            None => return cursor,
        };
        ensure_array(tree, base);

        // A non-empty leading literal prefixing the current line is a column
        // header; consume it without emitting a row.
        if !lt.literal.is_empty()
            && cursor < lines.len()
            && starts_with_ci(lines[cursor], &lt.literal)
        {
            trace!(line = lines[cursor], "consumed array header");
            cursor += 1;
        }

        let stop = self.stop_literal(ti);

        while cursor < lines.len() {
            let line = lines[cursor];
            if let Some(stop) = &stop {
                if starts_with_ci(line, stop) {
                    break;
                }
            }
            let tokens: Vec<&str> = line.split_whitespace().collect();
            let mut row = Value::Object(Map::new());
            for (k, ph) in lt.placeholders.iter().enumerate() {
                let raw = tokens.get(k).copied().unwrap_or("");
                let value = coerce(raw, ph.value_type.as_deref(), ph.format.as_deref());
                let field = row_field(&ph.path);
                if field.is_empty() {
                    // A bare `{Items[]}` column: the row is the value itself.
                    if lt.placeholders.len() == 1 {
                        row = value;
                    }
                } else {
                    set_value(&mut row, &field, value);
                }
            }
            if let Some(items) = array_mut(tree, base) {
                items.push(row);
            }
            cursor += 1;
        }
        cursor
    }

    /// Bind one input line against a placeholder line, trying the capture
    /// pattern, then the whole line for a lone placeholder, then positional
    /// whitespace tokens. The line is always consumed.
    fn bind_line(
        &self,
        tree: &mut Value,
        lt: &LineTemplate,
        ti: usize,
        line: &str,
        resolved: &mut HashSet<(usize, usize)>,
    ) {
        if let Some(pattern) = &lt.pattern {
            if let Some(caps) = pattern.captures(line) {
                trace!(line, "bound via capture pattern");
                for (pi, ph) in lt.placeholders.iter().enumerate() {
                    let raw = caps.get(pi + 1).map(|m| m.as_str()).unwrap_or("");
                    bind_value(tree, ph, ti, pi, raw, resolved);
                }
                return;
            }
        }
        if lt.bare_placeholder {
            trace!(line, "bound whole line to lone placeholder");
            if let Some(ph) = lt.placeholders.first() {
                bind_value(tree, ph, ti, 0, line, resolved);
            }
            return;
        }
        trace!(line, "fallback positional token binding");
        let tokens: Vec<&str> = line.split_whitespace().collect();
        for (pi, ph) in lt.placeholders.iter().enumerate() {
            let raw = tokens.get(pi).copied().unwrap_or("");
            bind_value(tree, ph, ti, pi, raw, resolved);
        }
    }

    /// Leading literal of the next non-array line template that has one,
    /// used to stop array-row consumption.
    fn stop_literal(&self, from: usize) -> Option<String> {
        self.lines.iter().skip(from + 1).find_map(|lt| {
            if lt.is_array_row || lt.literal.is_empty() {
                None
            } else {
                Some(lt.literal.clone())
            }
        })
    }

    /// Evaluate every pipeline/function expression that was not settled by a
    /// captured seed, against the now-complete tree. Deduplicated by target
    /// path, in template order.
    fn final_pass(&self, tree: &mut Value, resolved: &HashSet<(usize, usize)>) {
        let mut pending: IndexMap<String, &Placeholder> = IndexMap::new();
        for (ti, lt) in self.lines.iter().enumerate() {
            for (pi, ph) in lt.placeholders.iter().enumerate() {
                if is_simple_path(&ph.expr) || resolved.contains(&(ti, pi)) {
                    continue;
                }
                pending.insert(ph.path.clone(), ph);
            }
        }
        for (path, ph) in pending {
            let value = evaluate_pipeline(&ph.expr, &*tree, None);
            let value = recoerce(value, ph);
            trace!(%path, "final pass wrote expression result");
            set_value(tree, &path, value);
        }
    }
}

fn bind_value(
    tree: &mut Value,
    ph: &Placeholder,
    ti: usize,
    pi: usize,
    raw: &str,
    resolved: &mut HashSet<(usize, usize)>,
) {
    let value = if has_pipe(&ph.expr) {
        // Only a bare-path seed is replaced by the captured text. A
        // function-seeded pipeline reads the tree instead, so it is left
        // unresolved for the final pass to re-evaluate once arrays are
        // complete.
        if matches!(Pipeline::parse(&ph.expr).seed, Term::Path(_)) {
            resolved.insert((ti, pi));
        }
        let piped = evaluate_pipeline(&ph.expr, &*tree, Some(raw.trim()));
        recoerce(piped, ph)
    } else {
        coerce(raw.trim(), ph.value_type.as_deref(), ph.format.as_deref())
    };
    set_value(tree, &ph.path, value);
}

/// Re-apply the declared type to a pipeline result. Without a declared type
/// the pipeline's own value stands.
fn recoerce(value: Value, ph: &Placeholder) -> Value {
    match ph.value_type.as_deref() {
        Some(ty) => coerce(&display_value(&value), Some(ty), ph.format.as_deref()),
        None => value,
    }
}

/// Path remainder after the array marker: `Items[].Total` -> `Total`.
fn row_field(path: &str) -> String {
    match path.find(']') {
        Some(pos) => path[pos + 1..].trim_start_matches('.').to_string(),
        None => path.to_string(),
    }
}

/// Case-insensitive, whitespace-collapsed prefix check. An empty prefix
/// never matches.
fn starts_with_ci(line: &str, prefix: &str) -> bool {
    if prefix.is_empty() {
        return false;
    }
    collapse_ws(line)
        .to_lowercase()
        .starts_with(&prefix.to_lowercase())
}
