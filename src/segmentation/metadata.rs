//! Model metadata: input normalization constants and class labels.
//!
//! The metadata block is a little-endian, table-based binary record (the
//! TFLite `ModelMetadata` layout). It is walked purely through stored offsets,
//! every read bounds-checked against the buffer, so no schema compiler or
//! generated code is needed.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// File identifier expected right after the root offset
const FILE_IDENTIFIER: &[u8; 4] = b"M001";

/// Union tag of `NormalizationOptions` in `ProcessUnitOptions`
const NORMALIZATION_OPTIONS: u8 = 1;

// vtable slots
const MODEL_VERSION: usize = 2;
const MODEL_SUBGRAPHS: usize = 3;
const SUBGRAPH_INPUT_TENSORS: usize = 2;
const TENSOR_PROCESS_UNITS: usize = 4;
const PROCESS_UNIT_OPTIONS_TYPE: usize = 0;
const PROCESS_UNIT_OPTIONS: usize = 1;
const NORMALIZATION_MEAN: usize = 0;
const NORMALIZATION_STD: usize = 1;

/// DeepLab v3 (Pascal VOC) classes, used when a model carries no label map
pub const DEFAULT_LABELS: [&str; 21] = [
    "background",
    "aeroplane",
    "bicycle",
    "bird",
    "boat",
    "bottle",
    "bus",
    "car",
    "cat",
    "chair",
    "cow",
    "dining table",
    "dog",
    "horse",
    "motorbike",
    "person",
    "potted plant",
    "sheep",
    "sofa",
    "train",
    "tv",
];

pub const DEFAULT_MEAN: f32 = 127.5;
pub const DEFAULT_STD: f32 = 127.5;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetadataError {
    #[error("file identifier is not M001")]
    Identifier,

    #[error("metadata version is not v1")]
    Version,

    #[error("expected exactly one subgraph, found {0}")]
    SubgraphCount(u32),

    #[error("expected exactly one input tensor, found {0}")]
    TensorCount(u32),

    #[error("expected exactly one process unit, found {0}")]
    ProcessUnitCount(u32),

    #[error("process unit options kind {0} is not normalization")]
    OptionsKind(u8),

    #[error("normalization options missing")]
    MissingOptions,

    #[error("expected exactly one mean value, found {0}")]
    MeanCount(u32),

    #[error("expected exactly one std value, found {0}")]
    StdCount(u32),

    #[error("read of {len} bytes at offset {offset} is out of bounds")]
    OutOfBounds { offset: usize, len: usize },
}

impl MetadataError {
    /// Numeric code, matching the numbering used by other deepseg-style tools
    pub fn code(&self) -> i32 {
        match self {
            Self::Identifier => 1,
            Self::Version => -1,
            Self::SubgraphCount(_) => -2,
            Self::TensorCount(_) => -3,
            Self::ProcessUnitCount(_) => -4,
            Self::OptionsKind(_) => -5,
            Self::MissingOptions => -6,
            Self::MeanCount(_) => -7,
            Self::StdCount(_) => -8,
            Self::OutOfBounds { .. } => -9,
        }
    }
}

/// Input normalization: `(pixel - mean) / std`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalization {
    pub mean: f32,
    pub std: f32,
}

impl Default for Normalization {
    fn default() -> Self {
        Self {
            mean: DEFAULT_MEAN,
            std: DEFAULT_STD,
        }
    }
}

/// Bounds-checked view over a metadata blob
struct TableReader<'a> {
    buf: &'a [u8],
}

impl<'a> TableReader<'a> {
    fn bytes(&self, offset: usize, len: usize) -> Result<&'a [u8], MetadataError> {
        offset
            .checked_add(len)
            .and_then(|end| self.buf.get(offset..end))
            .ok_or(MetadataError::OutOfBounds { offset, len })
    }

    fn u8(&self, offset: usize) -> Result<u8, MetadataError> {
        Ok(self.bytes(offset, 1)?[0])
    }

    fn u16(&self, offset: usize) -> Result<u16, MetadataError> {
        let b = self.bytes(offset, 2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&self, offset: usize) -> Result<u32, MetadataError> {
        let b = self.bytes(offset, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&self, offset: usize) -> Result<i32, MetadataError> {
        Ok(self.u32(offset)? as i32)
    }

    fn f32(&self, offset: usize) -> Result<f32, MetadataError> {
        Ok(f32::from_bits(self.u32(offset)?))
    }

    /// Follow an unsigned offset stored at `offset`
    fn indirect(&self, offset: usize) -> Result<usize, MetadataError> {
        let rel = self.u32(offset)? as usize;
        offset
            .checked_add(rel)
            .filter(|target| *target < self.buf.len())
            .ok_or(MetadataError::OutOfBounds { offset, len: rel })
    }

    /// Absolute position of a table field, or `None` if the field is absent
    fn field(&self, table: usize, slot: usize) -> Result<Option<usize>, MetadataError> {
        let delta = self.i32(table)? as i64;
        let vtable = usize::try_from(table as i64 - delta)
            .map_err(|_| MetadataError::OutOfBounds { offset: table, len: 4 })?;
        let vtable_len = self.u16(vtable)? as usize;
        let entry = 4 + 2 * slot;
        if entry + 2 > vtable_len {
            return Ok(None);
        }
        match self.u16(vtable + entry)? {
            0 => Ok(None),
            rel => Ok(Some(table + rel as usize)),
        }
    }

    /// Table, string or vector referenced by a field
    fn field_target(&self, table: usize, slot: usize) -> Result<Option<usize>, MetadataError> {
        match self.field(table, slot)? {
            Some(pos) => self.indirect(pos).map(Some),
            None => Ok(None),
        }
    }

    /// (length, position of first element) of a vector
    fn vector(&self, vector: usize) -> Result<(u32, usize), MetadataError> {
        Ok((self.u32(vector)?, vector + 4))
    }

    fn string(&self, string: usize) -> Result<&'a [u8], MetadataError> {
        let len = self.u32(string)? as usize;
        self.bytes(string + 4, len)
    }

    /// The single table of a one-element vector of tables
    fn single_table(
        &self,
        table: usize,
        slot: usize,
        err: fn(u32) -> MetadataError,
    ) -> Result<usize, MetadataError> {
        let vector = self.field_target(table, slot)?.ok_or(err(0))?;
        let (len, first) = self.vector(vector)?;
        if len != 1 {
            return Err(err(len));
        }
        self.indirect(first)
    }

    /// The single value of a one-element float vector
    fn single_f32(
        &self,
        table: usize,
        slot: usize,
        err: fn(u32) -> MetadataError,
    ) -> Result<f32, MetadataError> {
        let vector = self.field_target(table, slot)?.ok_or(err(0))?;
        let (len, first) = self.vector(vector)?;
        if len != 1 {
            return Err(err(len));
        }
        self.f32(first)
    }
}

/// Extract input normalization constants from a model metadata block
pub fn parse_normalization(buf: &[u8]) -> Result<Normalization, MetadataError> {
    let reader = TableReader { buf };

    let root = reader.u32(0)? as usize;
    // Without "M001" the bytes after the root offset usually belong to a
    // vtable, so a foreign identifier only shows once the root fails to resolve
    let tagged = reader.bytes(4, 4).is_ok_and(|id| id == FILE_IDENTIFIER);
    if !tagged && root >= 8 && reader.field(root, MODEL_VERSION).is_err() {
        return Err(MetadataError::Identifier);
    }

    let version = reader
        .field_target(root, MODEL_VERSION)?
        .ok_or(MetadataError::Version)?;
    if reader.string(version)? != b"v1" {
        return Err(MetadataError::Version);
    }

    let subgraph = reader.single_table(root, MODEL_SUBGRAPHS, MetadataError::SubgraphCount)?;
    let tensor =
        reader.single_table(subgraph, SUBGRAPH_INPUT_TENSORS, MetadataError::TensorCount)?;
    let unit =
        reader.single_table(tensor, TENSOR_PROCESS_UNITS, MetadataError::ProcessUnitCount)?;

    let kind = match reader.field(unit, PROCESS_UNIT_OPTIONS_TYPE)? {
        Some(pos) => reader.u8(pos)?,
        None => 0,
    };
    if kind != NORMALIZATION_OPTIONS {
        return Err(MetadataError::OptionsKind(kind));
    }
    let options = reader
        .field_target(unit, PROCESS_UNIT_OPTIONS)?
        .ok_or(MetadataError::MissingOptions)?;

    let mean = reader.single_f32(options, NORMALIZATION_MEAN, MetadataError::MeanCount)?;
    let std = reader.single_f32(options, NORMALIZATION_STD, MetadataError::StdCount)?;

    Ok(Normalization { mean, std })
}

/// Parse a newline separated `labelmap.txt`
pub fn parse_label_map(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect()
}

/// Normalization and class labels of the loaded model
#[derive(Debug, Clone)]
pub struct ModelMetadata {
    pub normalization: Normalization,
    pub labels: Vec<String>,
}

impl Default for ModelMetadata {
    fn default() -> Self {
        Self {
            normalization: Normalization::default(),
            labels: DEFAULT_LABELS.iter().map(|l| l.to_string()).collect(),
        }
    }
}

impl ModelMetadata {
    /// Build from optional metadata block and label map files
    ///
    /// Anything missing or malformed falls back to the defaults with a warning.
    pub fn load(metadata: Option<&Path>, labels: Option<&Path>) -> Self {
        let mut meta = Self::default();

        if let Some(path) = metadata {
            match read_normalization(path) {
                Ok(normalization) => {
                    tracing::info!(
                        "Model normalization: mean={}, std={}",
                        normalization.mean,
                        normalization.std
                    );
                    meta.normalization = normalization;
                }
                Err(e) => tracing::warn!("Using default normalization: {:#}", e),
            }
        }

        if let Some(path) = labels {
            match fs::read_to_string(path) {
                Ok(text) => {
                    let parsed = parse_label_map(&text);
                    if parsed.is_empty() {
                        tracing::warn!("Label map {} is empty, using defaults", path.display());
                    } else {
                        tracing::info!("Loaded {} labels from {}", parsed.len(), path.display());
                        meta.labels = parsed;
                    }
                }
                Err(e) => tracing::warn!(
                    "Could not read label map {}: {}, using defaults",
                    path.display(),
                    e
                ),
            }
        }

        meta
    }

    /// Index of the "person" class, if the label list has one
    pub fn person_index(&self) -> Option<usize> {
        self.labels.iter().position(|l| l == "person")
    }
}

fn read_normalization(path: &Path) -> Result<Normalization> {
    let blob = fs::read(path)
        .with_context(|| format!("Failed to read metadata from {}", path.display()))?;
    parse_normalization(&blob).map_err(|e| {
        anyhow::anyhow!(
            "metadata in {} rejected (code {}): {}",
            path.display(),
            e.code(),
            e
        )
    })
}
