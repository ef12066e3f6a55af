//! Row formats spoken over a worker's stdin and stdout.
//!
//! # Formats
//!
//! - **`TabSeparated`** - one row per line, fields joined by TAB, `\N` for NULL.
//! - **`JSONEachRow-Unnamed`** - one JSON array of positional values per line.
//! - **`JSONEachRow-PartiallyNamed`** - one JSON object per line, keyed by the
//!   declared argument name or by `c<N>` when the argument is unnamed.
//! - **`JSONEachRow-Named`** - one JSON object per line keyed by argument names.
//!
//! Result rows in the JSON formats are a bare scalar or a single-key object.
//! With chunk headers enabled every batch is framed by [`chunk::frame`].

pub mod chunk;
mod json;
mod tsv;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::descriptor::{ArgumentSpec, FunctionDescriptor};
use crate::error::{Error, Result};
use crate::types::{DataType, RowBatch};

pub use tsv::NULL_SENTINEL;

/// Data format of a function's pipes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Format {
    #[default]
    #[serde(rename = "TabSeparated")]
    TabSeparated,
    #[serde(rename = "JSONEachRow-Unnamed")]
    JsonEachRowUnnamed,
    #[serde(rename = "JSONEachRow-PartiallyNamed")]
    JsonEachRowPartiallyNamed,
    #[serde(rename = "JSONEachRow-Named")]
    JsonEachRowNamed,
}

impl Format {
    pub fn name(&self) -> &'static str {
        match self {
            Self::TabSeparated => "TabSeparated",
            Self::JsonEachRowUnnamed => "JSONEachRow-Unnamed",
            Self::JsonEachRowPartiallyNamed => "JSONEachRow-PartiallyNamed",
            Self::JsonEachRowNamed => "JSONEachRow-Named",
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Format {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        [
            Self::TabSeparated,
            Self::JsonEachRowUnnamed,
            Self::JsonEachRowPartiallyNamed,
            Self::JsonEachRowNamed,
        ]
        .into_iter()
        .find(|format| format.name().eq_ignore_ascii_case(s))
        .ok_or_else(|| Error::Config(format!("unknown format: {}", s)))
    }
}

/// Newline-terminated lines of a payload; a missing final newline is allowed.
fn lines(text: &str) -> impl Iterator<Item = &str> {
    let body = text.strip_suffix('\n').unwrap_or(text);
    (!text.is_empty()).then(|| body.split('\n')).into_iter().flatten()
}

fn utf8(bytes: &[u8]) -> Result<&str> {
    std::str::from_utf8(bytes)
        .map_err(|e| Error::Format(format!("output is not valid UTF-8: {}", e)))
}

/// Encoder/decoder for one function's argument and result rows.
#[derive(Debug, Clone, Copy)]
pub struct RowCodec<'a> {
    format: Format,
    arguments: &'a [ArgumentSpec],
    result_type: &'a DataType,
    result_name: &'a str,
}

impl<'a> RowCodec<'a> {
    pub fn new(descriptor: &'a FunctionDescriptor) -> Self {
        Self {
            format: descriptor.format,
            arguments: &descriptor.argument_types,
            result_type: &descriptor.result_type,
            result_name: &descriptor.result_name,
        }
    }

    pub fn format(&self) -> Format {
        self.format
    }

    /// Encode argument rows, optionally framed with a chunk header.
    pub fn encode(&self, batch: &RowBatch, send_chunk_header: bool) -> Result<Vec<u8>> {
        if let Some(row) = batch.rows().iter().find(|r| r.len() != self.arguments.len()) {
            return Err(Error::Format(format!(
                "input row has {} value(s), function takes {}",
                row.len(),
                self.arguments.len()
            )));
        }

        let mut payload = Vec::new();
        match self.format {
            Format::TabSeparated => tsv::encode_rows(batch, &mut payload),
            other => json::encode_rows(batch, other, self.arguments, &mut payload)?,
        }

        Ok(if send_chunk_header {
            chunk::frame(&payload)
        } else {
            payload
        })
    }

    /// Decode result rows from an unframed payload.
    pub fn decode(&self, bytes: &[u8]) -> Result<RowBatch> {
        let text = utf8(bytes)?;
        match self.format {
            Format::TabSeparated => tsv::decode_rows(text, &[self.result_type]),
            _ => json::decode_results(text, self.result_type, self.result_name),
        }
    }

    /// Decode result rows from a whole stream, stripping the chunk header
    /// when one is expected.
    pub fn decode_stream(&self, bytes: &[u8], chunk_header: bool) -> Result<RowBatch> {
        if chunk_header {
            self.decode(chunk::split_frame(bytes)?)
        } else {
            self.decode(bytes)
        }
    }

    /// Decode argument rows, as a worker would read them.
    pub fn decode_arguments(&self, bytes: &[u8]) -> Result<RowBatch> {
        let text = utf8(bytes)?;
        match self.format {
            Format::TabSeparated => {
                let types: Vec<&DataType> = self.arguments.iter().map(|a| &a.data_type).collect();
                tsv::decode_rows(text, &types)
            }
            other => json::decode_arguments(text, other, self.arguments),
        }
    }
}
