//! Record storage: an opaque payload per identifier, written atomically.

use crate::error::{AnalysisError, Result};
use log::debug;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Separator between a record prefix and its identifier in record names.
const ID_MARKER: &str = "_ID-";
const EXTENSION: &str = "bin";

/// A fresh 128-bit random identifier, as 32 lowercase hex digits.
pub fn new_identifier() -> String {
    format!("{:032x}", rand::thread_rng().gen::<u128>())
}

/// Name of the record `<prefix>_ID-<id>`.
pub fn record_name(prefix: &str, id: &str) -> String {
    format!("{}{}{}", prefix, ID_MARKER, id)
}

/// Splits a record name into its prefix and identifier.
pub fn parse_record_name(name: &str) -> Option<(&str, &str)> {
    let at = name.rfind(ID_MARKER)?;
    let id = &name[at + ID_MARKER.len()..];
    if id.is_empty() {
        return None;
    }
    Some((&name[..at], id))
}

/// Bincode encoding of a record payload.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| AnalysisError::Encoding(format!("failed to encode record: {}", e)))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let (value, read) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| AnalysisError::Encoding(format!("failed to decode record: {}", e)))?;
    if read != bytes.len() {
        return Err(AnalysisError::Encoding(format!(
            "record has {} trailing bytes",
            bytes.len() - read
        )));
    }
    Ok(value)
}

/// Where records live. Writers never read-modify-write a record they did not create.
pub trait RecordStore: Send + Sync {
    /// Stores `payload` under `name`, replacing any previous payload as a whole.
    fn write_record(&self, name: &str, payload: &[u8]) -> Result<()>;

    fn read_record(&self, name: &str) -> Result<Vec<u8>>;

    /// Names of all records whose prefix is `prefix`, sorted.
    fn list_records(&self, prefix: &str) -> Result<Vec<String>>;
}

/// One file per record in a directory.
#[derive(Clone, Debug)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    /// Opens `root`, creating it if needed.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_of(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.{}", name, EXTENSION))
    }
}

impl RecordStore for DirectoryStore {
    fn write_record(&self, name: &str, payload: &[u8]) -> Result<()> {
        let persistence_error = |reason: String| AnalysisError::Persistence {
            record: name.to_string(),
            reason,
        };
        // Written to a temporary file in the same directory and renamed into place, so readers
        // see either the complete record or none.
        let mut file = NamedTempFile::new_in(&self.root)?;
        file.write_all(payload)?;
        file.as_file().sync_all()?;
        let path = self.path_of(name);
        file.persist(&path)
            .map_err(|e| persistence_error(format!("cannot move record into {:?}: {}", path, e.error)))?;
        debug!("Wrote record {} ({} bytes)", name, payload.len());
        Ok(())
    }

    fn read_record(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.path_of(name);
        fs::read(&path).map_err(|e| AnalysisError::Persistence {
            record: name.to_string(),
            reason: format!("cannot read {:?}: {}", path, e),
        })
    }

    fn list_records(&self, prefix: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if matches!(parse_record_name(stem), Some((p, _)) if p == prefix) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}
