//! Binary glTF (GLB v2) container handling.
//!
//! Layout: a 12-byte header (`magic`, `version`, `length`, all little-endian
//! u32) followed by chunks of `(length, type, data)`. The first chunk must be
//! JSON; an optional BIN chunk carries buffer 0.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;

pub const MAGIC: [u8; 4] = *b"glTF";
pub const VERSION: u32 = 2;
pub const HEADER_LEN: usize = 12;
pub const CHUNK_HEADER_LEN: usize = 8;
pub const CHUNK_JSON: u32 = 0x4E4F_534A;
pub const CHUNK_BIN: u32 = 0x004E_4942;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("file is {0} bytes, shorter than a GLB header")]
    Truncated(usize),
    #[error("bad magic {0:02x?}, expected \"glTF\"")]
    BadMagic([u8; 4]),
    #[error("unsupported GLB version {0}")]
    UnsupportedVersion(u32),
    #[error("declared length {declared} does not match actual length {actual}")]
    LengthMismatch { declared: u64, actual: u64 },
    #[error("chunk header at offset {offset} is truncated")]
    ChunkHeaderTruncated { offset: usize },
    #[error("chunk {index} at offset {offset} declares {length} bytes, past the end of the file")]
    ChunkOverflow {
        index: usize,
        offset: usize,
        length: u64,
    },
    #[error("first chunk must be JSON")]
    MissingJsonChunk,
    #[error("unexpected chunk {index} of type {kind:#010x}")]
    UnexpectedChunk { index: usize, kind: u32 },
    #[error("JSON chunk is malformed: {0}")]
    BadJson(String),
    #[error("JSON chunk has no 'asset' object")]
    MissingAsset,
    #[error("size {size} outside allowed bounds {min}..={max}")]
    OutOfBounds { size: u64, min: u64, max: u64 },
    #[error("bufferView {index} is invalid: {reason}")]
    BadBufferView { index: usize, reason: String },
    #[error("failed to read asset: {0}")]
    Io(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    Json,
    Bin,
    Unknown(u32),
}

impl ChunkKind {
    fn from_raw(raw: u32) -> Self {
        match raw {
            CHUNK_JSON => ChunkKind::Json,
            CHUNK_BIN => ChunkKind::Bin,
            other => ChunkKind::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChunkInfo {
    pub kind: ChunkKind,
    pub offset: usize,
    pub length: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct GlbSummary {
    pub version: u32,
    pub declared_length: u64,
    pub chunks: Vec<ChunkInfo>,
    pub mesh_count: usize,
    pub image_count: usize,
}

/// Sanity bounds for whole-file size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeBounds {
    pub min: u64,
    pub max: u64,
}

impl Default for SizeBounds {
    fn default() -> Self {
        Self {
            min: (HEADER_LEN + CHUNK_HEADER_LEN) as u64,
            max: 512 * 1024 * 1024,
        }
    }
}

impl SizeBounds {
    pub fn with_max(max: u64) -> Self {
        Self {
            max,
            ..Self::default()
        }
    }

    fn check(&self, size: u64) -> Result<(), FormatError> {
        if size < self.min || size > self.max {
            return Err(FormatError::OutOfBounds {
                size,
                min: self.min,
                max: self.max,
            });
        }
        Ok(())
    }
}

/// Full structural validation: header, chunk table, JSON chunk parse, size bounds.
pub fn validate(bytes: &[u8], bounds: SizeBounds) -> Result<GlbSummary, FormatError> {
    bounds.check(bytes.len() as u64)?;
    let (summary, _) = walk(bytes)?;
    Ok(summary)
}

/// Read at most `bounds.max + 1` bytes from `path` and validate them.
pub fn validate_file(path: &Path, bounds: SizeBounds) -> Result<GlbSummary, FormatError> {
    let bytes = read_bounded(path, bounds.max)?;
    validate(&bytes, bounds)
}

pub(crate) fn read_bounded(path: &Path, max: u64) -> Result<Vec<u8>, FormatError> {
    let file = File::open(path).map_err(|err| FormatError::Io(err.to_string()))?;
    let mut bytes = Vec::new();
    file.take(max.saturating_add(1))
        .read_to_end(&mut bytes)
        .map_err(|err| FormatError::Io(err.to_string()))?;
    Ok(bytes)
}

fn read_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    let raw: [u8; 4] = bytes.get(offset..offset + 4)?.try_into().ok()?;
    Some(u32::from_le_bytes(raw))
}

fn walk(bytes: &[u8]) -> Result<(GlbSummary, Value), FormatError> {
    if bytes.len() < HEADER_LEN {
        return Err(FormatError::Truncated(bytes.len()));
    }
    let mut magic = [0u8; 4];
    magic.copy_from_slice(&bytes[..4]);
    if magic != MAGIC {
        return Err(FormatError::BadMagic(magic));
    }
    let version = read_u32(bytes, 4).ok_or(FormatError::Truncated(bytes.len()))?;
    if version != VERSION {
        return Err(FormatError::UnsupportedVersion(version));
    }
    let declared = read_u32(bytes, 8).ok_or(FormatError::Truncated(bytes.len()))? as u64;
    if declared != bytes.len() as u64 {
        return Err(FormatError::LengthMismatch {
            declared,
            actual: bytes.len() as u64,
        });
    }

    let mut chunks = Vec::new();
    let mut offset = HEADER_LEN;
    while offset < bytes.len() {
        let (Some(length), Some(kind)) = (read_u32(bytes, offset), read_u32(bytes, offset + 4))
        else {
            return Err(FormatError::ChunkHeaderTruncated { offset });
        };
        let data_start = offset + CHUNK_HEADER_LEN;
        let end = data_start as u64 + length as u64;
        if end > declared {
            return Err(FormatError::ChunkOverflow {
                index: chunks.len(),
                offset,
                length: length as u64,
            });
        }
        let kind = ChunkKind::from_raw(kind);
        match (chunks.len(), kind) {
            (0, ChunkKind::Json) => {}
            (0, _) => return Err(FormatError::MissingJsonChunk),
            (index, ChunkKind::Json) => {
                return Err(FormatError::UnexpectedChunk {
                    index,
                    kind: CHUNK_JSON,
                });
            }
            (index, ChunkKind::Bin) if index != 1 => {
                return Err(FormatError::UnexpectedChunk {
                    index,
                    kind: CHUNK_BIN,
                });
            }
            _ => {}
        }
        chunks.push(ChunkInfo {
            kind,
            offset: data_start,
            length: length as usize,
        });
        offset = end as usize;
    }

    let Some(json_chunk) = chunks.first() else {
        return Err(FormatError::MissingJsonChunk);
    };
    let json_bytes = &bytes[json_chunk.offset..json_chunk.offset + json_chunk.length];
    let document: Value =
        serde_json::from_slice(json_bytes).map_err(|err| FormatError::BadJson(err.to_string()))?;
    if !document.get("asset").is_some_and(Value::is_object) {
        return Err(FormatError::MissingAsset);
    }

    let summary = GlbSummary {
        version,
        declared_length: declared,
        mesh_count: array_len(&document, "meshes"),
        image_count: array_len(&document, "images"),
        chunks,
    };
    Ok((summary, document))
}

fn array_len(document: &Value, key: &str) -> usize {
    document
        .get(key)
        .and_then(Value::as_array)
        .map_or(0, Vec::len)
}

/// An image stored inside the BIN chunk through a bufferView.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddedImage {
    pub image_index: usize,
    pub view_index: usize,
    pub mime_type: Option<String>,
}

/// Parsed JSON + BIN pair that can be edited and written back.
#[derive(Debug, Clone, PartialEq)]
pub struct GlbDocument {
    pub json: Value,
    pub bin: Option<Vec<u8>>,
}

impl GlbDocument {
    pub fn new(json: Value, bin: Option<Vec<u8>>) -> Self {
        Self { json, bin }
    }

    /// A minimal document with a single empty scene.
    pub fn minimal() -> Self {
        Self::new(
            json!({
                "asset": { "version": "2.0", "generator": "bunker-mesh" },
                "scenes": [{ "nodes": [] }],
                "scene": 0
            }),
            None,
        )
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, FormatError> {
        let (summary, json) = walk(bytes)?;
        let bin = summary
            .chunks
            .iter()
            .find(|chunk| chunk.kind == ChunkKind::Bin)
            .map(|chunk| bytes[chunk.offset..chunk.offset + chunk.length].to_vec());
        Ok(Self { json, bin })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, FormatError> {
        let mut json_bytes =
            serde_json::to_vec(&self.json).map_err(|err| FormatError::BadJson(err.to_string()))?;
        pad_to_four(&mut json_bytes, b' ');

        let mut total = HEADER_LEN + CHUNK_HEADER_LEN + json_bytes.len();
        let bin = self.bin.as_ref().map(|data| {
            let mut padded = data.clone();
            pad_to_four(&mut padded, 0);
            padded
        });
        if let Some(bin) = &bin {
            total += CHUNK_HEADER_LEN + bin.len();
        }
        let declared = u32::try_from(total).map_err(|_| FormatError::OutOfBounds {
            size: total as u64,
            min: 0,
            max: u32::MAX as u64,
        })?;

        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&VERSION.to_le_bytes());
        out.extend_from_slice(&declared.to_le_bytes());
        out.extend_from_slice(&(json_bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(&CHUNK_JSON.to_le_bytes());
        out.extend_from_slice(&json_bytes);
        if let Some(bin) = bin {
            out.extend_from_slice(&(bin.len() as u32).to_le_bytes());
            out.extend_from_slice(&CHUNK_BIN.to_le_bytes());
            out.extend_from_slice(&bin);
        }
        Ok(out)
    }

    /// Images whose bytes live in buffer 0 (the BIN chunk).
    pub fn embedded_images(&self) -> Vec<EmbeddedImage> {
        if !self.bin_is_buffer_zero() {
            return Vec::new();
        }
        let Some(images) = self.json.get("images").and_then(Value::as_array) else {
            return Vec::new();
        };
        images
            .iter()
            .enumerate()
            .filter_map(|(image_index, image)| {
                let view_index = usize::try_from(image.get("bufferView")?.as_u64()?).ok()?;
                let view = self.view(view_index)?;
                if view.get("buffer").and_then(Value::as_u64) != Some(0) {
                    return None;
                }
                Some(EmbeddedImage {
                    image_index,
                    view_index,
                    mime_type: image
                        .get("mimeType")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                })
            })
            .collect()
    }

    pub fn view_bytes(&self, view_index: usize) -> Result<&[u8], FormatError> {
        let bin = self.bin.as_deref().ok_or_else(|| FormatError::BadBufferView {
            index: view_index,
            reason: "document has no BIN chunk".into(),
        })?;
        let (offset, length) = self.view_range(view_index)?;
        let end = offset
            .checked_add(length)
            .ok_or_else(|| FormatError::BadBufferView {
                index: view_index,
                reason: format!("range {offset}+{length} overflows"),
            })?;
        bin.get(offset..end)
            .ok_or_else(|| FormatError::BadBufferView {
                index: view_index,
                reason: format!("range {offset}+{length} exceeds BIN length {}", bin.len()),
            })
    }

    /// Rebuild the BIN chunk with some bufferViews swapped for new bytes.
    ///
    /// Every view on buffer 0 is copied in order at a 4-byte aligned offset, so
    /// accessors (which address relative to their view) stay valid.
    pub fn replace_views(
        &mut self,
        replacements: &BTreeMap<usize, Vec<u8>>,
    ) -> Result<(), FormatError> {
        if replacements.is_empty() {
            return Ok(());
        }
        let view_count = array_len(&self.json, "bufferViews");
        let mut rebuilt = Vec::new();
        let mut placements = Vec::with_capacity(view_count);
        for index in 0..view_count {
            let on_bin = self
                .view(index)
                .and_then(|view| view.get("buffer"))
                .and_then(Value::as_u64)
                == Some(0);
            if !on_bin {
                placements.push(None);
                continue;
            }
            let data = match replacements.get(&index) {
                Some(data) => data.as_slice(),
                None => self.view_bytes(index)?,
            };
            pad_to_four(&mut rebuilt, 0);
            placements.push(Some((rebuilt.len(), data.len())));
            rebuilt.extend_from_slice(data);
        }

        let views = self
            .json
            .get_mut("bufferViews")
            .and_then(Value::as_array_mut)
            .ok_or_else(|| FormatError::BadBufferView {
                index: 0,
                reason: "document has no bufferViews".into(),
            })?;
        for (view, placement) in views.iter_mut().zip(placements) {
            if let (Some((offset, length)), Some(obj)) = (placement, view.as_object_mut()) {
                obj.insert("byteOffset".into(), json!(offset));
                obj.insert("byteLength".into(), json!(length));
            }
        }
        if let Some(buffer) = self
            .json
            .get_mut("buffers")
            .and_then(Value::as_array_mut)
            .and_then(|buffers| buffers.first_mut())
            .and_then(Value::as_object_mut)
        {
            buffer.insert("byteLength".into(), json!(rebuilt.len()));
        }
        self.bin = Some(rebuilt);
        Ok(())
    }

    fn bin_is_buffer_zero(&self) -> bool {
        self.bin.is_some()
            && self
                .json
                .get("buffers")
                .and_then(Value::as_array)
                .and_then(|buffers| buffers.first())
                .is_some_and(|buffer| buffer.get("uri").is_none())
    }

    fn view(&self, index: usize) -> Option<&Value> {
        self.json
            .get("bufferViews")
            .and_then(Value::as_array)
            .and_then(|views| views.get(index))
    }

    fn view_range(&self, index: usize) -> Result<(usize, usize), FormatError> {
        let view = self.view(index).ok_or_else(|| FormatError::BadBufferView {
            index,
            reason: "no such bufferView".into(),
        })?;
        let field = |name: &str, raw: u64| {
            usize::try_from(raw).map_err(|_| FormatError::BadBufferView {
                index,
                reason: format!("{name} {raw} does not fit in memory"),
            })
        };
        let offset = field(
            "byteOffset",
            view.get("byteOffset").and_then(Value::as_u64).unwrap_or(0),
        )?;
        let length = view
            .get("byteLength")
            .and_then(Value::as_u64)
            .ok_or_else(|| FormatError::BadBufferView {
                index,
                reason: "missing byteLength".into(),
            })?;
        let length = field("byteLength", length)?;
        Ok((offset, length))
    }
}

fn pad_to_four(bytes: &mut Vec<u8>, fill: u8) {
    while bytes.len() % 4 != 0 {
        bytes.push(fill);
    }
}
