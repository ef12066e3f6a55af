//! TabSeparated rows: fields joined by TAB, one row per line, `\N` for NULL.

use crate::error::{Error, Result};
use crate::types::{DataType, RowBatch, Value};

/// Sentinel written for NULL fields.
pub const NULL_SENTINEL: &str = "\\N";

pub(super) fn encode_rows(batch: &RowBatch, out: &mut Vec<u8>) {
    let mut line = String::new();
    for row in batch.rows() {
        line.clear();
        for (index, value) in row.iter().enumerate() {
            if index > 0 {
                line.push('\t');
            }
            encode_value(value, &mut line);
        }
        line.push('\n');
        out.extend_from_slice(line.as_bytes());
    }
}

fn encode_value(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str(NULL_SENTINEL),
        Value::String(s) => escape(s, out),
        other => out.push_str(&other.to_string()),
    }
}

fn escape(text: &str, out: &mut String) {
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
}

fn unescape(field: &str) -> Result<String> {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some('\'') => out.push('\''),
            Some(other) => {
                return Err(Error::Format(format!(
                    "unknown escape sequence '\\{}' in {:?}",
                    other, field
                )));
            }
            None => {
                return Err(Error::Format(format!("dangling backslash in {:?}", field)));
            }
        }
    }
    Ok(out)
}

fn decode_field(field: &str, ty: &DataType) -> Result<Value> {
    if field == NULL_SENTINEL {
        return if ty.is_nullable() {
            Ok(Value::Null)
        } else {
            Err(Error::Format(format!("NULL returned for non-nullable {}", ty)))
        };
    }
    Value::from_text(ty, &unescape(field)?)
}

/// Decode newline-terminated rows whose columns have the given types.
pub(super) fn decode_rows(text: &str, types: &[&DataType]) -> Result<RowBatch> {
    let mut batch = RowBatch::new();
    for (line_no, line) in super::lines(text).enumerate() {
        if types.is_empty() {
            if !line.is_empty() {
                return Err(Error::Format(format!(
                    "row {}: expected no columns, got {:?}",
                    line_no + 1,
                    line
                )));
            }
            batch.push(Vec::new());
            continue;
        }

        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != types.len() {
            return Err(Error::Format(format!(
                "row {}: expected {} column(s), got {} in {:?}",
                line_no + 1,
                types.len(),
                fields.len(),
                line
            )));
        }
        let row = fields
            .iter()
            .zip(types)
            .map(|(field, ty)| decode_field(field, ty))
            .collect::<Result<Vec<_>>>()
            .map_err(|e| Error::Format(format!("row {}: {}", line_no + 1, strip_kind(e))))?;
        batch.push(row);
    }
    Ok(batch)
}

fn strip_kind(err: Error) -> String {
    match err {
        Error::Format(detail) => detail,
        other => other.to_string(),
    }
}
