//! I define [`ClosureStatus`], the state machine tracking how the materialized closure
//! relates to the explicit statements of a store,
//! and [`ClosureMetadata`], its persisted form.
use std::{
    fmt,
    fs,
    io,
    path::{Path, PathBuf},
    str::FromStr,
};

use log::debug;

use crate::InferenceError;

/// The state of the materialized closure with respect to the explicit statements.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ClosureStatus {
    /// Some inferred statements may no longer be entailed
    Stale,
    /// The closure is complete and sound
    Current,
    /// The closure is sound, but some entailed statements may be missing
    PossiblyIncomplete,
}

impl ClosureStatus {
    /// The status after explicit statements have been added.
    pub fn after_added(self) -> Self {
        match self {
            ClosureStatus::Current => ClosureStatus::PossiblyIncomplete,
            other => other,
        }
    }

    /// The status after explicit statements have been removed.
    pub fn after_removed(self) -> Self {
        ClosureStatus::Stale
    }

    fn as_str(self) -> &'static str {
        match self {
            ClosureStatus::Stale => "STALE",
            ClosureStatus::Current => "CURRENT",
            ClosureStatus::PossiblyIncomplete => "POSSIBLY_INCOMPLETE",
        }
    }
}

impl fmt::Display for ClosureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClosureStatus {
    type Err = InferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STALE" => Ok(ClosureStatus::Stale),
            "CURRENT" => Ok(ClosureStatus::Current),
            "POSSIBLY_INCOMPLETE" => Ok(ClosureStatus::PossiblyIncomplete),
            _ => Err(InferenceError::Metadata(format!("unknown closure status {s:?}"))),
        }
    }
}

/// What is persisted about the closure of a store between transactions.
///
/// The on-disk form is a single line: `<STATUS> <configuration digest> <was empty>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClosureMetadata {
    /// Status of the closure
    pub status: ClosureStatus,
    /// Configuration digest of the inferencer that computed the closure
    pub digest: String,
    /// Whether the store was empty when this record was written
    pub was_empty: bool,
}

impl ClosureMetadata {
    /// Read the record stored in `path`, if any.
    pub fn read(path: &Path) -> Result<Option<Self>, InferenceError> {
        match fs::read_to_string(path) {
            Ok(txt) => txt.parse().map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write this record to `path`, creating parent directories as needed.
    ///
    /// The record is written to a sibling file first, then renamed over `path`,
    /// so that readers never see a partial record.
    pub fn write(&self, path: &Path) -> Result<(), InferenceError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, format!("{self}\n"))?;
        if let Err(e) = fs::rename(&tmp, path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        debug!("closure metadata written to {}: {self}", path.display());
        Ok(())
    }

    /// The status to assume for a store, given this record (if any),
    /// the live configuration digest and the live emptiness of the store.
    pub fn initial_status(record: Option<&Self>, digest: &str, is_empty: bool) -> ClosureStatus {
        match record {
            Some(m) if m.digest == digest && m.was_empty == is_empty => m.status,
            _ => ClosureStatus::Stale,
        }
    }
}

impl fmt::Display for ClosureMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.status, self.digest, self.was_empty)
    }
}

impl FromStr for ClosureMetadata {
    type Err = InferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split_whitespace().collect();
        let [status, digest, was_empty] = fields.as_slice() else {
            return Err(InferenceError::Metadata(format!(
                "expected 3 fields, found {}",
                fields.len()
            )));
        };
        let was_empty = was_empty.parse().map_err(|_| {
            InferenceError::Metadata(format!("invalid emptiness flag {was_empty:?}"))
        })?;
        Ok(ClosureMetadata {
            status: status.parse()?,
            digest: digest.to_string(),
            was_empty,
        })
    }
}
