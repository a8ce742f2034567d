//! Persistent calibration cache.
//!
//! One file per instrument, `<dir>/<type>-<serial>.cal`:
//!
//! ```text
//! "CCAL" | version u16 LE | layout u32 LE | payload_len u32 LE | payload | SHA-256
//! ```
//!
//! The payload is a bincode [`PersistedCalibration`]. The SHA-256 covers every
//! preceding byte and is verified before any header field is trusted. Writes go
//! to a temporary file in the same directory which is then renamed over the
//! target, so a reader never sees a half-written file.
//!
//! A corrupt, foreign or stale file is treated as absent: loading logs why and
//! returns `None`, and the instrument simply asks for a fresh calibration.

use chrono::{DateTime, Utc};
use colorcal_core::calibration::{CalibrationData, CalibrationType};
use colorcal_core::data::InstrumentType;
use colorcal_core::error::CacheError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

const MAGIC: &[u8; 4] = b"CCAL";
/// On-disk format version.
pub const FORMAT_VERSION: u16 = 1;
const HEADER_LEN: usize = 4 + 2 + 4 + 4;
const DIGEST_LEN: usize = 32;
const EXTENSION: &str = "cal";

/// Layout tag; changes whenever the persisted struct changes shape.
fn layout_tag() -> u32 {
    u32::try_from(std::mem::size_of::<PersistedCalibration>()).unwrap_or(u32::MAX)
}

/// When one calibration type was last completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionStamp {
    /// Calibration type.
    pub kind: CalibrationType,
    /// Completion time.
    pub at: DateTime<Utc>,
}

/// Everything remembered about one instrument between sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedCalibration {
    /// Instrument family.
    pub instrument: InstrumentType,
    /// Serial number.
    pub serial: String,
    /// Black level, white reference, temperatures.
    pub data: CalibrationData,
    /// Per-type completion times.
    pub completed: Vec<CompletionStamp>,
    /// Most recent calibration.
    pub calibrated_at: DateTime<Utc>,
    /// Most recent session that used this calibration.
    pub last_used: DateTime<Utc>,
}

impl PersistedCalibration {
    /// New record, calibrated and used now.
    pub fn new(instrument: InstrumentType, serial: impl Into<String>, data: CalibrationData) -> Self {
        let now = Utc::now();
        Self {
            instrument,
            serial: serial.into(),
            data,
            completed: Vec::new(),
            calibrated_at: now,
            last_used: now,
        }
    }

    /// Record completion of `kinds` at `at`, one stamp per type.
    pub fn stamp(&mut self, kinds: CalibrationType, at: DateTime<Utc>) {
        for kind in kinds.iter() {
            self.completed.retain(|s| s.kind != kind);
            self.completed.push(CompletionStamp { kind, at });
        }
        self.calibrated_at = at;
    }

    /// Completion time of `kind`.
    pub fn completed_at(&self, kind: CalibrationType) -> Option<DateTime<Utc>> {
        self.completed.iter().find(|s| s.kind == kind).map(|s| s.at)
    }

    /// Types completed no longer ago than `timeout(kind)` allows.
    pub fn valid_types<F>(&self, now: DateTime<Utc>, timeout: F) -> CalibrationType
    where
        F: Fn(CalibrationType) -> Option<Duration>,
    {
        self.completed
            .iter()
            .filter(|s| match timeout(s.kind) {
                Some(limit) => !older_than(s.at, now, limit),
                None => true,
            })
            .fold(CalibrationType::empty(), |acc, s| acc | s.kind)
    }

    /// Encode to the on-disk format.
    pub fn encode(&self) -> Result<Vec<u8>, CacheError> {
        let payload = bincode::serialize(self).map_err(|e| CacheError::Decode(e.to_string()))?;
        let payload_len =
            u32::try_from(payload.len()).map_err(|_| CacheError::Decode("payload too large".into()))?;
        let mut out = Vec::with_capacity(HEADER_LEN + payload.len() + DIGEST_LEN);
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        out.extend_from_slice(&layout_tag().to_le_bytes());
        out.extend_from_slice(&payload_len.to_le_bytes());
        out.extend_from_slice(&payload);
        let digest = Sha256::digest(&out);
        out.extend_from_slice(&digest);
        Ok(out)
    }

    /// Decode and verify the on-disk format.
    ///
    /// # Errors
    ///
    /// The checksum is checked first; header fields are only looked at once
    /// it verifies.
    pub fn decode(bytes: &[u8]) -> Result<Self, CacheError> {
        if bytes.len() < HEADER_LEN + DIGEST_LEN {
            return Err(CacheError::Truncated(bytes.len()));
        }
        let (body, digest) = bytes.split_at(bytes.len() - DIGEST_LEN);
        if Sha256::digest(body).as_slice() != digest {
            return Err(CacheError::ChecksumMismatch);
        }
        if &body[..4] != MAGIC {
            return Err(CacheError::BadMagic);
        }
        let version = u16::from_le_bytes([body[4], body[5]]);
        if version != FORMAT_VERSION {
            return Err(CacheError::VersionMismatch {
                found: version,
                expected: FORMAT_VERSION,
            });
        }
        let layout = u32::from_le_bytes([body[6], body[7], body[8], body[9]]);
        if layout != layout_tag() {
            return Err(CacheError::LayoutMismatch {
                found: layout,
                expected: layout_tag(),
            });
        }
        let payload_len = u32::from_le_bytes([body[10], body[11], body[12], body[13]]) as usize;
        let payload = &body[HEADER_LEN..];
        if payload.len() != payload_len {
            return Err(CacheError::Truncated(bytes.len()));
        }
        bincode::deserialize(payload).map_err(|e| CacheError::Decode(e.to_string()))
    }
}

fn older_than(then: DateTime<Utc>, now: DateTime<Utc>, limit: Duration) -> bool {
    match (now - then).to_std() {
        Ok(age) => age > limit,
        // In the future: clock went backwards, treat as fresh.
        Err(_) => false,
    }
}

fn io_error(path: &Path, err: std::io::Error) -> CacheError {
    CacheError::Io(format!("{}: {err}", path.display()))
}

/// Directory of calibration files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalibrationCache {
    dir: PathBuf,
}

impl CalibrationCache {
    /// Cache rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The platform cache directory, e.g. `~/.cache/colorcal` on Linux.
    pub fn default_dir() -> Option<PathBuf> {
        dirs::cache_dir().map(|d| d.join("colorcal"))
    }

    /// Cache at `dir`, or the platform default.
    pub fn at_or_default(dir: Option<&Path>) -> Option<Self> {
        match dir {
            Some(dir) => Some(Self::new(dir)),
            None => Self::default_dir().map(Self::new),
        }
    }

    /// Root directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File for one instrument.
    pub fn path_for(&self, instrument: InstrumentType, serial: &str) -> PathBuf {
        let safe: String = serial
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{instrument}-{safe}.{EXTENSION}"))
    }

    /// Write `record` atomically.
    pub async fn save(&self, record: &PersistedCalibration) -> Result<PathBuf, CacheError> {
        let path = self.path_for(record.instrument, &record.serial);
        let bytes = record.encode()?;
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| io_error(&self.dir, e))?;
        let tmp = path.with_extension(format!("{EXTENSION}.tmp"));
        fs::write(&tmp, &bytes).await.map_err(|e| io_error(&tmp, e))?;
        fs::rename(&tmp, &path).await.map_err(|e| io_error(&path, e))?;
        tracing::debug!(target: "colorcal::cache", path = %path.display(), bytes = bytes.len(), "Saved calibration");
        Ok(path)
    }

    /// Read and verify the record for one instrument.
    pub async fn read(
        &self,
        instrument: InstrumentType,
        serial: &str,
    ) -> Result<PersistedCalibration, CacheError> {
        let path = self.path_for(instrument, serial);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(CacheError::Missing),
            Err(e) => return Err(io_error(&path, e)),
        };
        let record = PersistedCalibration::decode(&bytes)?;
        if record.instrument != instrument || record.serial != serial {
            return Err(CacheError::Decode(format!(
                "file holds {}-{}",
                record.instrument, record.serial
            )));
        }
        Ok(record)
    }

    /// Load the record if present, intact and used within `idle_timeout`.
    pub async fn load(
        &self,
        instrument: InstrumentType,
        serial: &str,
        idle_timeout: Option<Duration>,
    ) -> Option<PersistedCalibration> {
        let result = self.read(instrument, serial).await.and_then(|record| {
            match idle_timeout {
                Some(limit) if older_than(record.last_used, Utc::now(), limit) => {
                    let age = (Utc::now() - record.last_used).num_seconds().max(0);
                    Err(CacheError::Stale {
                        age_secs: u64::try_from(age).unwrap_or(0),
                        limit_secs: limit.as_secs(),
                    })
                }
                _ => Ok(record),
            }
        });
        match result {
            Ok(record) => {
                tracing::info!(target: "colorcal::cache", %instrument, serial, "Loaded cached calibration");
                Some(record)
            }
            Err(CacheError::Missing) => {
                tracing::debug!(target: "colorcal::cache", %instrument, serial, "No cached calibration");
                None
            }
            Err(e) => {
                tracing::warn!(target: "colorcal::cache", %instrument, serial, error = %e, "Ignoring cached calibration");
                None
            }
        }
    }

    /// Mark the record as used now.
    pub async fn touch(&self, instrument: InstrumentType, serial: &str) -> Result<(), CacheError> {
        let mut record = self.read(instrument, serial).await?;
        record.last_used = Utc::now();
        self.save(&record).await?;
        Ok(())
    }

    /// Delete the record for one instrument. Missing files are not an error.
    pub async fn remove(&self, instrument: InstrumentType, serial: &str) -> Result<(), CacheError> {
        let path = self.path_for(instrument, serial);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&path, e)),
        }
    }

    /// Delete every calibration file. Returns how many were removed.
    pub async fn clear(&self) -> Result<usize, CacheError> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(io_error(&self.dir, e)),
        };
        let mut removed = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error(&self.dir, e))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == EXTENSION) {
                fs::remove_file(&path).await.map_err(|e| io_error(&path, e))?;
                removed += 1;
            }
        }
        tracing::info!(target: "colorcal::cache", dir = %self.dir.display(), removed, "Cleared calibration cache");
        Ok(removed)
    }
}
