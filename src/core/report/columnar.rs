//! Pivots column-major dashboard query results into CSV rows.

use anyhow::Result;
use serde_json::Value;

const SCALAR_KEYS: &[&str] = &[
    "stringVal",
    "int64Val",
    "uint64Val",
    "doubleVal",
    "boolVal",
    "timestampVal",
    "bytesVal",
];

fn cell_text(union: &Value) -> String {
    for key in SCALAR_KEYS {
        if let Some(v) = union.get(*key) {
            return match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
        }
    }

    if let Some(date) = union.get("dateVal") {
        let part = |name: &str, missing: &str| {
            date.get(name)
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_else(|| missing.to_string())
        };
        return format!("{}-{}-{}", part("year", "YYYY"), part("month", "MM"), part("day", "DD"));
    }

    if let Some(proto) = union.get("protoVal") {
        return proto.to_string();
    }

    // nullVal and unknown unions
    String::new()
}

/// Pivot a `{"results": [{"column": .., "values": [{"value": {..}}]}]}`
/// response into CSV text. Rows stop at the shortest column. An empty or
/// missing `results` list gives an empty string.
pub fn columnar_to_csv(response: &Value) -> Result<String> {
    let Some(columns) = response
        .get("results")
        .and_then(Value::as_array)
        .filter(|c| !c.is_empty())
    else {
        return Ok(String::new());
    };

    let headers: Vec<String> = columns
        .iter()
        .map(|c| match c.get("column") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        })
        .collect();

    let cells: Vec<Vec<String>> = columns
        .iter()
        .map(|c| {
            c.get("values")
                .and_then(Value::as_array)
                .map(|values| {
                    values
                        .iter()
                        .map(|v| v.get("value").map(cell_text).unwrap_or_default())
                        .collect()
                })
                .unwrap_or_default()
        })
        .collect();
    let row_count = cells.iter().map(Vec::len).min().unwrap_or(0);

    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(&headers)?;
    for row in 0..row_count {
        writer.write_record(cells.iter().map(|column| column[row].as_str()))?;
    }
    let bytes = writer.into_inner().map_err(|e| anyhow::anyhow!("csv flush failed: {}", e))?;
    Ok(String::from_utf8(bytes)?)
}
