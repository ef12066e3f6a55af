//! JSONEachRow rows: one JSON value per line.

use serde_json::{Map, Value as Json};

use crate::descriptor::ArgumentSpec;
use crate::error::{Error, Result};
use crate::types::{DataType, RowBatch, Value};

use super::Format;

/// Key of a positional argument in the partially named format.
fn positional_key(index: usize) -> String {
    format!("c{}", index + 1)
}

fn argument_key(arguments: &[ArgumentSpec], index: usize) -> Option<&str> {
    arguments.get(index).and_then(|a| a.name.as_deref())
}

pub(super) fn encode_rows(
    batch: &RowBatch,
    format: Format,
    arguments: &[ArgumentSpec],
    out: &mut Vec<u8>,
) -> Result<()> {
    for row in batch.rows() {
        let json = match format {
            Format::JsonEachRowUnnamed => Json::Array(row.iter().map(Value::to_json).collect()),
            Format::JsonEachRowPartiallyNamed => {
                let mut object = Map::new();
                for (index, value) in row.iter().enumerate() {
                    let key = argument_key(arguments, index)
                        .map(str::to_string)
                        .unwrap_or_else(|| positional_key(index));
                    object.insert(key, value.to_json());
                }
                Json::Object(object)
            }
            Format::JsonEachRowNamed => {
                let mut object = Map::new();
                for (index, value) in row.iter().enumerate() {
                    let key = argument_key(arguments, index).ok_or_else(|| {
                        Error::Format(format!("argument {} has no name", index + 1))
                    })?;
                    object.insert(key.to_string(), value.to_json());
                }
                Json::Object(object)
            }
            Format::TabSeparated => unreachable!("tab-separated rows are not encoded as JSON"),
        };
        serde_json::to_writer(&mut *out, &json)
            .map_err(|e| Error::Format(format!("failed to encode row: {}", e)))?;
        out.push(b'\n');
    }
    Ok(())
}

fn parse_line(line: &str, line_no: usize) -> Result<Json> {
    serde_json::from_str(line)
        .map_err(|e| Error::Format(format!("row {}: invalid JSON {:?}: {}", line_no + 1, line, e)))
}

/// Decode result rows: each line is a bare scalar or `{"<result_name>": value}`.
pub(super) fn decode_results(
    text: &str,
    result_type: &DataType,
    result_name: &str,
) -> Result<RowBatch> {
    let mut batch = RowBatch::new();
    for (line_no, line) in super::lines(text).enumerate() {
        if line.trim().is_empty() {
            return Err(Error::Format(format!("row {}: empty", line_no + 1)));
        }
        let json = parse_line(line, line_no)?;
        let scalar = match json {
            Json::Object(mut object) => {
                if let Some(unknown) = object.keys().find(|k| k.as_str() != result_name) {
                    return Err(Error::Format(format!(
                        "row {}: unknown key '{}', expected '{}'",
                        line_no + 1,
                        unknown,
                        result_name
                    )));
                }
                object.remove(result_name).ok_or_else(|| {
                    Error::Format(format!(
                        "row {}: missing key '{}'",
                        line_no + 1,
                        result_name
                    ))
                })?
            }
            Json::Array(_) => {
                return Err(Error::Format(format!(
                    "row {}: expected a scalar or a single-key object, got an array",
                    line_no + 1
                )));
            }
            scalar => scalar,
        };
        let value = Value::from_json(result_type, &scalar)
            .map_err(|e| Error::Format(format!("row {}: {}", line_no + 1, e)))?;
        batch.push(vec![value]);
    }
    Ok(batch)
}

/// Decode argument rows written in one of the JSON formats.
pub(super) fn decode_arguments(
    text: &str,
    format: Format,
    arguments: &[ArgumentSpec],
) -> Result<RowBatch> {
    let mut batch = RowBatch::new();
    for (line_no, line) in super::lines(text).enumerate() {
        if line.trim().is_empty() {
            return Err(Error::Format(format!("row {}: empty", line_no + 1)));
        }
        let row = match (format, parse_line(line, line_no)?) {
            (Format::JsonEachRowUnnamed, Json::Array(values)) => {
                if values.len() != arguments.len() {
                    return Err(Error::Format(format!(
                        "row {}: expected {} value(s), got {}",
                        line_no + 1,
                        arguments.len(),
                        values.len()
                    )));
                }
                arguments
                    .iter()
                    .zip(&values)
                    .map(|(spec, json)| Value::from_json(&spec.data_type, json))
                    .collect::<Result<Vec<_>>>()?
            }
            (Format::JsonEachRowPartiallyNamed | Format::JsonEachRowNamed, Json::Object(object)) => {
                if object.len() != arguments.len() {
                    return Err(Error::Format(format!(
                        "row {}: expected {} key(s), got {}",
                        line_no + 1,
                        arguments.len(),
                        object.len()
                    )));
                }
                arguments
                    .iter()
                    .enumerate()
                    .map(|(index, spec)| {
                        let key = spec
                            .name
                            .clone()
                            .unwrap_or_else(|| positional_key(index));
                        let json = object.get(&key).ok_or_else(|| {
                            Error::Format(format!("row {}: missing key '{}'", line_no + 1, key))
                        })?;
                        Value::from_json(&spec.data_type, json)
                    })
                    .collect::<Result<Vec<_>>>()?
            }
            (format, other) => {
                return Err(Error::Format(format!(
                    "row {}: {} does not match format {}",
                    line_no + 1,
                    other,
                    format
                )));
            }
        };
        batch.push(row);
    }
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arguments() -> Vec<ArgumentSpec> {
        vec![
            ArgumentSpec::named("lhs", DataType::UInt64),
            ArgumentSpec::new(DataType::UInt64),
        ]
    }

    fn encode(format: Format) -> String {
        let batch = RowBatch::from(vec![vec![Value::UInt64(1), Value::UInt64(2)]]);
        let mut out = Vec::new();
        encode_rows(&batch, format, &arguments(), &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_encode_unnamed() {
        assert_eq!(encode(Format::JsonEachRowUnnamed), "[1,2]\n");
    }

    #[test]
    fn test_encode_partially_named_uses_positional_fallback() {
        let line = encode(Format::JsonEachRowPartiallyNamed);
        let json: Json = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(json, serde_json::json!({"lhs": 1, "c2": 2}));
    }

    #[test]
    fn test_encode_named_requires_names() {
        let batch = RowBatch::from(vec![vec![Value::UInt64(1), Value::UInt64(2)]]);
        let mut out = Vec::new();
        let err = encode_rows(&batch, Format::JsonEachRowNamed, &arguments(), &mut out).unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }

    #[test]
    fn test_decode_scalar_and_object_results() {
        let batch = decode_results("0\n{\"result\":2}\n4\n", &DataType::UInt64, "result").unwrap();
        assert_eq!(
            batch.into_rows(),
            vec![
                vec![Value::UInt64(0)],
                vec![Value::UInt64(2)],
                vec![Value::UInt64(4)]
            ]
        );
    }

    #[test]
    fn test_decode_rejects_unknown_and_missing_keys() {
        let err = decode_results("{\"other\":1}\n", &DataType::UInt64, "result").unwrap_err();
        assert!(err.to_string().contains("unknown key 'other'"), "{}", err);

        let err = decode_results("{}\n", &DataType::UInt64, "result").unwrap_err();
        assert!(err.to_string().contains("missing key 'result'"), "{}", err);

        let err = decode_results("[1]\n", &DataType::UInt64, "result").unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }

    #[test]
    fn test_decode_rejects_blank_lines() {
        let err = decode_results("0\n\n4\n", &DataType::UInt64, "result").unwrap_err();
        assert_eq!(err.to_string(), "format error: row 2: empty");

        let err = decode_results("0\n\n", &DataType::UInt64, "result").unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }

    #[test]
    fn test_decode_null_result() {
        let nullable = DataType::Nullable(Box::new(DataType::String));
        let batch = decode_results("null\n", &nullable, "result").unwrap();
        assert_eq!(batch.rows()[0], vec![Value::Null]);
    }

    #[test]
    fn test_decode_partially_named_arguments() {
        let batch = decode_arguments(
            "{\"lhs\":1,\"c2\":2}\n",
            Format::JsonEachRowPartiallyNamed,
            &arguments(),
        )
        .unwrap();
        assert_eq!(batch.rows()[0], vec![Value::UInt64(1), Value::UInt64(2)]);
    }
}
