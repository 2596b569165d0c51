use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum MirrorError {
    #[error("invalid GEO series accession: {0}")]
    InvalidEntityId(String),

    #[error("invalid GEO sample accession: {0}")]
    InvalidMemberId(String),

    #[error("not a versioned file name: {0}")]
    InvalidDurableName(String),

    #[error("validity map line {line}: {message}")]
    ValidityParse { line: usize, message: String },

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("archive connection failed after {attempts} attempts: {message}")]
    Connection { attempts: u32, message: String },

    #[error("no remote files for {entity} at {address}")]
    Listing { entity: String, address: String },

    #[error("could not read modification time of {address}: {message}")]
    Stat { address: String, message: String },

    #[error("transfer of {address} failed: {message}")]
    Fetch { address: String, message: String },

    #[error("remote files {names:?} all map to {identity}")]
    IdentityCollision { identity: String, names: Vec<String> },

    #[error("content comparison failed for {identity}: {message}")]
    Validation { identity: String, message: String },

    #[error("archive request failed: {0}")]
    ArchiveHttp(String),

    #[error("archive returned status {status}: {message}")]
    ArchiveStatus { status: u16, message: String },

    #[error("several files share the latest version of {identity}: {candidates:?}")]
    AmbiguousLatest {
        identity: String,
        candidates: Vec<String>,
    },

    #[error("no stored file for {0}")]
    NotFound(String),

    #[error("series {0} is already being synchronized")]
    EntityBusy(String),

    #[error("task for {0} exceeded its time budget")]
    TaskTimeout(String),

    #[error("network clock unavailable: {0}")]
    Clock(String),

    #[error("ledger error: {0}")]
    Ledger(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("conversion failed: {0}")]
    Conversion(String),
}

impl MirrorError {
    pub fn is_transient(&self) -> bool {
        match self {
            MirrorError::ArchiveHttp(_) => true,
            MirrorError::ArchiveStatus { status, .. } => {
                matches!(status, 421 | 425 | 429 | 500 | 502 | 503 | 504)
            }
            _ => false,
        }
    }
}
