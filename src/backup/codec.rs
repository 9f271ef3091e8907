//! Envelope (de)serialization: JSON wrapped in gzip.

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::{Read, Write};

use crate::data::{normalize_records, Record};
use crate::errors::{BackupError, Result};
use crate::models::BackupType;

pub const SCHEMA_VERSION: u32 = 1;

/// Self-describing artifact payload. A restore needs nothing but this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub schema_version: u32,
    pub backup_id: String,
    pub backup_type: BackupType,
    pub timestamp: DateTime<Utc>,
    pub record_count: u64,
    pub data: Vec<Map<String, Value>>,
}

impl Envelope {
    /// Normalizes `records` and wraps them; `record_count` always equals `data.len()`.
    pub fn from_records(
        backup_id: impl Into<String>,
        backup_type: BackupType,
        timestamp: DateTime<Utc>,
        records: &[Record],
    ) -> Result<Self> {
        let data = normalize_records(records)?;
        Ok(Envelope {
            schema_version: SCHEMA_VERSION,
            backup_id: backup_id.into(),
            backup_type,
            timestamp,
            record_count: data.len() as u64,
            data,
        })
    }

    fn check(&self) -> Result<()> {
        if self.schema_version == 0 || self.schema_version > SCHEMA_VERSION {
            return Err(BackupError::SerializationFailure(format!(
                "unsupported envelope schema version {} (supported: {})",
                self.schema_version, SCHEMA_VERSION
            )));
        }
        if self.record_count != self.data.len() as u64 {
            return Err(BackupError::SerializationFailure(format!(
                "envelope {} declares {} records but carries {}",
                self.backup_id,
                self.record_count,
                self.data.len()
            )));
        }
        Ok(())
    }
}

pub fn encode(envelope: &Envelope) -> Result<Vec<u8>> {
    envelope.check()?;
    let json = serde_json::to_vec(envelope)?;
    let mut encoder = GzEncoder::new(Vec::with_capacity(json.len() / 4), Compression::default());
    encoder
        .write_all(&json)
        .map_err(|e| BackupError::SerializationFailure(format!("gzip encoding failed: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| BackupError::SerializationFailure(format!("gzip encoding failed: {}", e)))
}

pub fn decode(bytes: &[u8]) -> Result<Envelope> {
    let json = gunzip(bytes)?;
    let envelope: Envelope = serde_json::from_slice(&json)?;
    envelope.check()?;
    Ok(envelope)
}

/// Fully decompresses a gzip stream; truncation or corruption is an error.
pub fn gunzip(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| BackupError::SerializationFailure(format!("gzip decoding failed: {}", e)))?;
    Ok(out)
}
