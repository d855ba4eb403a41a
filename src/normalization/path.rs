//! Field path resolution over raw JSON payloads.
//!
//! Paths are dotted segments (`total_money.amount`). A segment may carry a suffix:
//! `name[]` fans out over the array at `name`, `name[n]` indexes it. Only the first
//! `[]` in a path fans out; a later `[]` selects the first element. A missing node
//! anywhere along the way resolves to nothing.

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step<'a> {
    Field(&'a str),
    Index(usize),
    FanOut,
}

fn parse(path: &str) -> Vec<Step<'_>> {
    let mut steps = Vec::new();
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        let (name, mut rest) = match segment.find('[') {
            Some(pos) => (&segment[..pos], &segment[pos..]),
            None => (segment, ""),
        };
        if !name.is_empty() {
            steps.push(Step::Field(name));
        }
        while let Some(stripped) = rest.strip_prefix('[') {
            let Some(close) = stripped.find(']') else {
                break;
            };
            let inner = &stripped[..close];
            if inner.is_empty() {
                steps.push(Step::FanOut);
            } else if let Ok(index) = inner.trim().parse() {
                steps.push(Step::Index(index));
            } else {
                // Malformed index; treat as a field that cannot exist.
                steps.push(Step::Field("\u{0}"));
            }
            rest = &stripped[close + 1..];
        }
    }
    steps
}

/// Every value the path reaches, in document order.
pub fn resolve_all<'v>(root: &'v Value, path: &str) -> Vec<&'v Value> {
    let mut current = vec![root];
    let mut fanned_out = false;

    for step in parse(path) {
        let mut next = Vec::with_capacity(current.len());
        for value in current {
            match step {
                Step::Field(name) => {
                    if let Some(child) = value.get(name) {
                        next.push(child);
                    }
                }
                Step::Index(index) => {
                    if let Some(child) = value.get(index) {
                        next.push(child);
                    }
                }
                Step::FanOut if !fanned_out => {
                    if let Some(items) = value.as_array() {
                        next.extend(items.iter());
                    }
                }
                Step::FanOut => {
                    if let Some(first) = value.as_array().and_then(|items| items.first()) {
                        next.push(first);
                    }
                }
            }
        }
        if step == Step::FanOut {
            fanned_out = true;
        }
        current = next;
        if current.is_empty() {
            break;
        }
    }

    current.retain(|v| !v.is_null());
    current
}

/// First value the path reaches, ignoring JSON `null`.
pub fn resolve<'v>(root: &'v Value, path: &str) -> Option<&'v Value> {
    resolve_all(root, path).into_iter().next()
}

/// Resolve and render as a string (numbers are stringified, empty strings are absent).
pub fn resolve_string(root: &Value, path: &str) -> Option<String> {
    match resolve(root, path)? {
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
