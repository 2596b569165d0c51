//! Versioned file names: `<identityKey>.<versionToken>.<originalSuffix>`.
//!
//! Every component that needs "the current file for X" goes through
//! [`latest`], so the position of the key and the token in the name must not
//! change.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};

use crate::domain::{FileTag, Identity, VersionToken};
use crate::error::MirrorError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurableName {
    pub key: String,
    pub token: VersionToken,
    pub suffix: String,
}

impl DurableName {
    pub fn new(identity: &Identity, token: VersionToken, original_suffix: &str) -> Self {
        Self {
            key: identity.key.clone(),
            token,
            suffix: original_suffix.to_string(),
        }
    }

    pub fn parse(file_name: &str) -> Result<Self, MirrorError> {
        let invalid = || MirrorError::InvalidDurableName(file_name.to_string());
        let mut parts = file_name.splitn(3, '.');
        let key = parts.next().filter(|key| !key.is_empty()).ok_or_else(invalid)?;
        let token = parts
            .next()
            .and_then(|token| token.parse::<u64>().ok())
            .ok_or_else(invalid)?;
        let suffix = parts.next().filter(|rest| !rest.is_empty()).ok_or_else(invalid)?;
        Ok(Self {
            key: key.to_string(),
            token: VersionToken(token),
            suffix: suffix.to_string(),
        })
    }

    pub fn tag(&self) -> FileTag {
        FileTag::classify(&self.suffix)
    }

    pub fn matches(&self, identity: &Identity) -> bool {
        self.key == identity.key && self.tag() == identity.tag
    }

    pub fn file_name(&self) -> String {
        format!("{}.{}.{}", self.key, self.token, self.suffix)
    }
}

pub fn name(identity: &Identity, token: VersionToken, original_suffix: &str) -> String {
    DurableName::new(identity, token, original_suffix).file_name()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Latest {
    NotFound,
    Found(Utf8PathBuf),
    FoundMultiple(Vec<Utf8PathBuf>),
}

impl Latest {
    pub fn single(self, identity: &Identity) -> Result<Option<Utf8PathBuf>, MirrorError> {
        match self {
            Latest::NotFound => Ok(None),
            Latest::Found(path) => Ok(Some(path)),
            Latest::FoundMultiple(paths) => Err(MirrorError::AmbiguousLatest {
                identity: identity.to_string(),
                candidates: paths.into_iter().map(|path| path.into_string()).collect(),
            }),
        }
    }
}

pub fn versions(
    dir: &Utf8Path,
    identity: &Identity,
) -> Result<Vec<(VersionToken, Utf8PathBuf)>, MirrorError> {
    if !dir.as_std_path().exists() {
        return Ok(Vec::new());
    }
    let entries = fs::read_dir(dir.as_std_path())
        .map_err(|err| MirrorError::Filesystem(format!("list {dir}: {err}")))?;
    let mut found = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| MirrorError::Filesystem(err.to_string()))?;
        let Some(file_name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        let Ok(parsed) = DurableName::parse(&file_name) else {
            continue;
        };
        if parsed.matches(identity) && entry.path().is_file() {
            found.push((parsed.token, dir.join(&file_name)));
        }
    }
    found.sort();
    Ok(found)
}

pub fn latest(dir: &Utf8Path, identity: &Identity) -> Result<Latest, MirrorError> {
    let found = versions(dir, identity)?;
    let Some(max) = found.last().map(|(token, _)| *token) else {
        return Ok(Latest::NotFound);
    };
    let mut top = found
        .into_iter()
        .filter(|(token, _)| *token == max)
        .map(|(_, path)| path)
        .collect::<Vec<_>>();
    if top.len() == 1 {
        return Ok(Latest::Found(top.remove(0)));
    }
    Ok(Latest::FoundMultiple(top))
}
