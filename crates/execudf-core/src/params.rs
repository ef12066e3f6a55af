//! Parameters of parametrized functions, `f(params)(args)`.
//!
//! Parameters are checked against the declared schema and substituted into
//! `{name:Type}` placeholders of the command before any process is started.

use crate::descriptor::FunctionDescriptor;
use crate::error::{Error, Result};
use crate::types::{DataType, Value};

/// A `{name:Type}` placeholder found in a command token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholder {
    pub name: String,
    pub data_type: DataType,
}

/// Collect every placeholder in `command`, in order of appearance.
pub fn placeholders(command: &[String]) -> Result<Vec<Placeholder>> {
    let mut found = Vec::new();
    for token in command {
        for piece in scan(token) {
            if let Piece::Placeholder { name, type_name } = piece {
                let data_type = type_name.parse().map_err(|_| {
                    Error::Config(format!(
                        "placeholder '{{{}:{}}}' has an unsupported type",
                        name, type_name
                    ))
                })?;
                found.push(Placeholder {
                    name: name.to_string(),
                    data_type,
                });
            }
        }
    }
    Ok(found)
}

/// Check `values` against the descriptor's declared parameters.
///
/// Returns the values converted to their declared types.
pub fn validate(descriptor: &FunctionDescriptor, values: &[Value]) -> Result<Vec<Value>> {
    let declared = &descriptor.parameters;
    if declared.len() != values.len() {
        return Err(Error::Parameter(format!(
            "function '{}' expects {} parameter(s), got {}",
            descriptor.name,
            declared.len(),
            values.len()
        )));
    }

    declared
        .iter()
        .zip(values)
        .map(|(spec, value)| {
            value.coerce(&spec.data_type).map_err(|_| {
                Error::Parameter(format!(
                    "parameter '{}' of function '{}' must be {}, got {}",
                    spec.name, descriptor.name, spec.data_type, value
                ))
            })
        })
        .collect()
}

/// Substitute validated parameter values into the command.
pub fn render_command(descriptor: &FunctionDescriptor, values: &[Value]) -> Result<Vec<String>> {
    if descriptor.parameters.is_empty() {
        return Ok(descriptor.command.clone());
    }

    let quote = !descriptor.execute_direct;
    descriptor
        .command
        .iter()
        .map(|token| {
            let mut rendered = String::with_capacity(token.len());
            for piece in scan(token) {
                match piece {
                    Piece::Literal(text) => rendered.push_str(text),
                    Piece::Placeholder { name, .. } => {
                        let index = descriptor
                            .parameters
                            .iter()
                            .position(|p| p.name == name)
                            .ok_or_else(|| {
                                Error::Parameter(format!("undeclared parameter '{}'", name))
                            })?;
                        let text = values
                            .get(index)
                            .ok_or_else(|| {
                                Error::Parameter(format!("no value for parameter '{}'", name))
                            })?
                            .to_string();
                        if quote {
                            rendered.push_str(&shell_quote(&text));
                        } else {
                            rendered.push_str(&text);
                        }
                    }
                }
            }
            Ok(rendered)
        })
        .collect()
}

fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

enum Piece<'a> {
    Literal(&'a str),
    Placeholder { name: &'a str, type_name: &'a str },
}

/// Split a token into literal text and placeholders.
///
/// Braces that do not look like `{identifier:TypeName}` stay literal, so
/// shell constructs such as `${x:-1}` pass through untouched.
fn scan(token: &str) -> Vec<Piece<'_>> {
    let mut pieces = Vec::new();
    let mut rest = token;
    while let Some(open) = rest.find('{') {
        let Some(close) = rest[open..].find('}').map(|c| open + c) else {
            break;
        };
        let inner = &rest[open + 1..close];
        match parse_placeholder(inner) {
            Some((name, type_name)) => {
                if open > 0 {
                    pieces.push(Piece::Literal(&rest[..open]));
                }
                pieces.push(Piece::Placeholder { name, type_name });
            }
            None => pieces.push(Piece::Literal(&rest[..=close])),
        }
        rest = &rest[close + 1..];
    }
    if !rest.is_empty() {
        pieces.push(Piece::Literal(rest));
    }
    pieces
}

fn parse_placeholder(inner: &str) -> Option<(&str, &str)> {
    let (name, type_name) = inner.split_once(':')?;
    let ident = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    let typed = type_name.starts_with(|c: char| c.is_ascii_uppercase());
    (ident && typed).then_some((name, type_name))
}
