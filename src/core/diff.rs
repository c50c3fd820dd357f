use serde_json::Value;
use similar::TextDiff;

pub const NO_DIFFERENCES: &str = "No differences found between the two audit runs.";

const DEFAULT_FROM: &str = "previous_run";
const DEFAULT_TO: &str = "latest_run";

/// Unified diff of two JSON documents, or [`NO_DIFFERENCES`].
///
/// Parse failures come back as descriptive text rather than an error so the
/// output can be dropped straight into a report.
pub fn diff_json(old: &str, new: &str) -> String {
    diff_json_labeled(old, new, DEFAULT_FROM, DEFAULT_TO)
}

pub fn diff_json_labeled(old: &str, new: &str, from_label: &str, to_label: &str) -> String {
    let parsed = serde_json::from_str::<Value>(old)
        .and_then(|a| serde_json::from_str::<Value>(new).map(|b| (a, b)));
    match parsed {
        Ok((a, b)) => diff_values(&a, &b, from_label, to_label),
        Err(e) => format!("Error decoding JSON: {}", e),
    }
}

/// Both sides are rendered with sorted keys and two-space indentation before
/// the line diff, so key order never shows up as a change.
pub fn diff_values(old: &Value, new: &Value, from_label: &str, to_label: &str) -> String {
    let (a, b) = match (normalize(old), normalize(new)) {
        (Ok(a), Ok(b)) => (a, b),
        (Err(e), _) | (_, Err(e)) => {
            return format!("An unexpected error occurred during diff generation: {}", e);
        }
    };

    if a == b {
        return NO_DIFFERENCES.to_string();
    }

    let diff = TextDiff::from_lines(&a, &b);
    let rendered = diff
        .unified_diff()
        .context_radius(3)
        .header(from_label, to_label)
        .to_string();
    let rendered = rendered.trim_end();
    if rendered.is_empty() {
        NO_DIFFERENCES.to_string()
    } else {
        rendered.to_string()
    }
}

pub fn is_unchanged(diff_text: &str) -> bool {
    diff_text.contains("No differences found")
}

fn normalize(value: &Value) -> serde_json::Result<String> {
    let mut text = serde_json::to_string_pretty(&sort_keys(value))?;
    text.push('\n');
    Ok(text)
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), sort_keys(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reordered_keys_are_not_a_change() {
        assert_eq!(diff_json(r#"{"a":1,"b":2}"#, r#"{"b":2,"a":1}"#), NO_DIFFERENCES);
        assert_eq!(
            diff_json(r#"{"x":{"b":[1,2],"a":null}}"#, r#"{"x":{"a":null,"b":[1,2]}}"#),
            NO_DIFFERENCES
        );
    }

    #[test]
    fn changed_value_produces_unified_diff() {
        let out = diff_json(r#"{"a":1,"b":2}"#, r#"{"a":1,"b":3}"#);
        assert!(out.starts_with("--- previous_run\n+++ latest_run\n@@"));
        assert!(out.contains("\n-  \"b\": 2\n"));
        assert!(out.contains("\n+  \"b\": 3"));
        assert!(!is_unchanged(&out));
    }

    #[test]
    fn labels_are_used_in_headers() {
        let out = diff_json_labeled("[1]", "[2]", "Previous Run (t0)", "Latest Run (t1)");
        assert!(out.starts_with("--- Previous Run (t0)\n+++ Latest Run (t1)"));
    }

    #[test]
    fn parse_failure_is_reported_as_text() {
        let out = diff_json("{not json", "{}");
        assert!(out.starts_with("Error decoding JSON:"));
        let out = diff_json("{}", "");
        assert!(out.starts_with("Error decoding JSON:"));
    }

    #[test]
    fn no_difference_marker_is_detected() {
        assert!(is_unchanged(NO_DIFFERENCES));
    }
}
