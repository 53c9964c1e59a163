//! Path-addressed writes into the output tree.
//!
//! The tree under construction is a `serde_json::Value` whose root is always
//! an object. Writes address fields with dotted paths (`Invoice.Number`); a
//! segment may carry an array marker (`Items[]`). Missing structure is
//! materialized on the way down and unexpected shapes are repaired in place
//! rather than reported - the writer never fails.

use serde_json::{Map, Value};

/// A segment in a target path.
///
/// `Items[]` parses to `{ key: "Items", array: true }`. Bracket contents are
/// not interpreted: `Items[abc]` is the same marker as `Items[]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSegment {
    /// Field name without the marker
    pub key: String,
    /// Whether the segment carried an array marker
    pub array: bool,
}

/// Parse a dotted path into segments, dropping empty ones.
pub fn split_path(path: &str) -> Vec<PathSegment> {
    path.split('.')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| match s.find('[') {
            Some(pos) => PathSegment {
                key: s[..pos].to_string(),
                array: true,
            },
            None => PathSegment {
                key: s.to_string(),
                array: false,
            },
        })
        .collect()
}

/// Write `value` at `path`, creating intermediate structure as needed.
///
/// The walk keeps an explicit segment index: when the cursor lands on an
/// array, it descends into the array's newest element (pushing a fresh object
/// when the array is empty or its tail is not an object) and processes the
/// same segment again. One path can therefore both select an array and
/// address a field on its newest element, e.g. `Items[].Total`.
///
/// A terminal segment that itself carries the array marker appends to the
/// array instead: objects are pushed as-is, scalars are wrapped in a new
/// object keyed by the segment name.
pub fn set_value(tree: &mut Value, path: &str, value: Value) {
    let segments = split_path(path);
    if segments.is_empty() {
        return;
    }

    let mut cur = tree;
    let mut i = 0;
    while i < segments.len() {
        let terminal = i + 1 == segments.len();
        let seg = &segments[i];

        cur = match cur {
            // A cursor left on an array addresses the newest element; the
            // same segment index is processed again once the element exists.
            Value::Array(items) => {
                if items.last().map_or(true, |v| !v.is_object()) {
                    items.push(Value::Object(Map::new()));
                }
                let last = items.len() - 1;
                &mut items[last]
            }
            other => {
                if !other.is_object() {
                    // Scalar obstruction on an interior segment: repair.
                    *other = Value::Object(Map::new());
                }
                let map = match other {
                    Value::Object(map) => map,
                    _ => return,
                };
                if seg.array {
                    let slot = map
                        .entry(seg.key.clone())
                        .or_insert_with(|| Value::Array(Vec::new()));
                    if !slot.is_array() {
                        *slot = Value::Array(Vec::new());
                    }
                    if terminal {
                        if let Value::Array(items) = slot {
                            let element = if value.is_object() {
                                value
                            } else {
                                let mut wrapped = Map::new();
                                wrapped.insert(seg.key.clone(), value);
                                Value::Object(wrapped)
                            };
                            items.push(element);
                        }
                        return;
                    }
                    i += 1;
                    slot
                } else if terminal {
                    map.insert(seg.key.clone(), value);
                    return;
                } else {
                    let slot = map
                        .entry(seg.key.clone())
                        .or_insert_with(|| Value::Object(Map::new()));
                    if !slot.is_object() && !slot.is_array() {
                        *slot = Value::Object(Map::new());
                    }
                    i += 1;
                    slot
                }
            }
        };
    }
}

/// Get a mutable handle on the array at `base`, creating every missing
/// intermediate object and the array itself. A non-array value already
/// sitting at `base` is replaced by an empty array.
pub fn array_mut<'a>(tree: &'a mut Value, base: &str) -> Option<&'a mut Vec<Value>> {
    let segments = split_path(base);
    if segments.is_empty() {
        return None;
    }

    let mut cur = tree;
    for (i, seg) in segments.iter().enumerate() {
        let terminal = i + 1 == segments.len();
        if !cur.is_object() {
            *cur = Value::Object(Map::new());
        }
        let map = match cur {
            Value::Object(map) => map,
            _ => return None,
        };
        let slot = map.entry(seg.key.clone()).or_insert_with(|| {
            if terminal {
                Value::Array(Vec::new())
            } else {
                Value::Object(Map::new())
            }
        });
        if terminal {
            if !slot.is_array() {
                *slot = Value::Array(Vec::new());
            }
            return slot.as_array_mut();
        }
        cur = slot;
    }
    None
}

/// Ensure the array at `base` exists on the tree.
pub fn ensure_array(tree: &mut Value, base: &str) {
    let _ = array_mut(tree, base);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_split_path_markers() {
        let segs = split_path("Invoice.Items[].Total");
        assert_eq!(segs.len(), 3);
        assert!(!segs[0].array);
        assert_eq!(segs[1].key, "Items");
        assert!(segs[1].array);
        assert_eq!(segs[2].key, "Total");
    }

    #[test]
    fn test_split_path_bracket_contents_ignored() {
        let segs = split_path("Items[abc]");
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].key, "Items");
        assert!(segs[0].array);
    }

    #[test]
    fn test_set_value_creates_intermediates() {
        let mut tree = json!({});
        set_value(&mut tree, "Invoice.Customer.Name", json!("Alice"));
        assert_eq!(tree, json!({"Invoice": {"Customer": {"Name": "Alice"}}}));
    }

    #[test]
    fn test_set_value_targets_newest_array_element() {
        let mut tree = json!({});
        set_value(&mut tree, "Items[].Name", json!("first"));
        set_value(&mut tree, "Items[].Rate", json!(10));
        // Both writes land on the same (newest) element.
        assert_eq!(tree, json!({"Items": [{"Name": "first", "Rate": 10}]}));
    }

    #[test]
    fn test_set_value_pushes_object_when_tail_is_scalar() {
        let mut tree = json!({"Items": [1, 2]});
        set_value(&mut tree, "Items[].Name", json!("x"));
        assert_eq!(tree, json!({"Items": [1, 2, {"Name": "x"}]}));
    }

    #[test]
    fn test_set_value_terminal_array_marker_appends() {
        let mut tree = json!({});
        set_value(&mut tree, "Tags[]", json!("red"));
        set_value(&mut tree, "Tags[]", json!({"Name": "blue"}));
        assert_eq!(
            tree,
            json!({"Tags": [{"Tags": "red"}, {"Name": "blue"}]})
        );
    }

    #[test]
    fn test_set_value_repairs_scalar_obstruction() {
        let mut tree = json!({"Invoice": "oops"});
        set_value(&mut tree, "Invoice.Number", json!("42"));
        assert_eq!(tree, json!({"Invoice": {"Number": "42"}}));
    }

    #[test]
    fn test_array_mut_creates_and_reuses() {
        let mut tree = json!({});
        array_mut(&mut tree, "Order.Items")
            .expect("array slot")
            .push(json!({"n": 1}));
        array_mut(&mut tree, "Order.Items")
            .expect("array slot")
            .push(json!({"n": 2}));
        assert_eq!(tree, json!({"Order": {"Items": [{"n": 1}, {"n": 2}]}}));
    }

    #[test]
    fn test_ensure_array_replaces_non_array() {
        let mut tree = json!({"Items": "scalar"});
        ensure_array(&mut tree, "Items");
        assert_eq!(tree, json!({"Items": []}));
    }
}
