//! Formatted-string codec.
//!
//! A `Str`/`AStr` value is a sequence of runs. The store keeps the plain text
//! and an opaque format blob; the blob here is the `bincode` encoding of the
//! run boundaries, writing systems and raw run properties.

use crate::error::{LoadError, LoadResult};
use cmload_schema::WsId;
use serde::{Deserialize, Serialize};

/// One `<Run>` as parsed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Run {
    pub ws: Option<WsId>,
    pub text: String,
    /// Attributes other than `ws`, verbatim.
    pub props: Vec<(String, String)>,
}

impl Run {
    pub fn plain(ws: Option<WsId>, text: impl Into<String>) -> Self {
        Self {
            ws,
            text: text.into(),
            props: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFormat {
    /// Char offset of the run start in the plain text.
    pub start: u32,
    pub ws: Option<u32>,
    pub props: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct FormatBlob {
    version: u8,
    runs: Vec<RunFormat>,
}

const FORMAT_VERSION: u8 = 1;

/// Concatenate runs into `(text, format blob)`.
pub fn encode_runs(runs: &[Run]) -> LoadResult<(String, Vec<u8>)> {
    let mut text = String::new();
    let mut formats = Vec::with_capacity(runs.len());
    let mut offset = 0u32;
    for run in runs {
        formats.push(RunFormat {
            start: offset,
            ws: run.ws.map(|ws| ws.raw()),
            props: run.props.clone(),
        });
        offset += run.text.chars().count() as u32;
        text.push_str(&run.text);
    }
    let blob = FormatBlob {
        version: FORMAT_VERSION,
        runs: formats,
    };
    let bytes = bincode::serialize(&blob).map_err(|e| LoadError::Format(e.to_string()))?;
    Ok((text, bytes))
}

pub fn decode_format(bytes: &[u8]) -> LoadResult<Vec<RunFormat>> {
    let blob: FormatBlob =
        bincode::deserialize(bytes).map_err(|e| LoadError::Format(e.to_string()))?;
    if blob.version != FORMAT_VERSION {
        return Err(LoadError::Format(format!(
            "unsupported format version {}",
            blob.version
        )));
    }
    Ok(blob.runs)
}

/// Single-run formatted text, used for generated annotations.
pub fn plain_text(ws: Option<WsId>, text: &str) -> LoadResult<(String, Vec<u8>)> {
    encode_runs(&[Run::plain(ws, text)])
}
