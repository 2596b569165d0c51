use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::MirrorError;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityId(String);

impl EntityId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntityId {
    type Err = MirrorError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_uppercase();
        if !is_accession(&normalized, "GSE") {
            return Err(MirrorError::InvalidEntityId(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

impl TryFrom<String> for EntityId {
    type Error = MirrorError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EntityId> for String {
    fn from(value: EntityId) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MemberId(String);

impl MemberId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MemberId {
    type Err = MirrorError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_uppercase();
        if !is_accession(&normalized, "GSM") {
            return Err(MirrorError::InvalidMemberId(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

impl TryFrom<String> for MemberId {
    type Error = MirrorError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MemberId> for String {
    fn from(value: MemberId) -> Self {
        value.0
    }
}

fn is_accession(value: &str, prefix: &str) -> bool {
    value
        .strip_prefix(prefix)
        .map(|digits| !digits.is_empty() && digits.chars().all(|ch| ch.is_ascii_digit()))
        .unwrap_or(false)
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileTag {
    Soft,
    Red,
    Green,
    Other(String),
}

impl FileTag {
    pub fn classify(file_name: &str) -> Self {
        let lower = file_name.to_ascii_lowercase();
        if lower.contains(".soft") {
            FileTag::Soft
        } else if has_channel_suffix(&lower, "_red") {
            FileTag::Red
        } else if has_channel_suffix(&lower, "_grn") || has_channel_suffix(&lower, "_green") {
            FileTag::Green
        } else {
            FileTag::Other(file_name.to_string())
        }
    }

    pub fn label(&self) -> &str {
        match self {
            FileTag::Soft => "soft",
            FileTag::Red => "red",
            FileTag::Green => "green",
            FileTag::Other(name) => name.as_str(),
        }
    }
}

impl fmt::Display for FileTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl FromStr for FileTag {
    type Err = MirrorError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        Ok(match value.to_ascii_lowercase().as_str() {
            "soft" => FileTag::Soft,
            "red" => FileTag::Red,
            "green" | "grn" => FileTag::Green,
            _ => FileTag::Other(value.to_string()),
        })
    }
}

// `_Red.idat`, `_Red.idat.gz` or a bare trailing `_red`.
fn has_channel_suffix(lower: &str, marker: &str) -> bool {
    lower.ends_with(marker) || lower.contains(&format!("{marker}."))
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub key: String,
    pub tag: FileTag,
}

impl Identity {
    pub fn new(key: impl Into<String>, tag: FileTag) -> Self {
        Self {
            key: key.into(),
            tag,
        }
    }

    pub fn series_soft(entity: &EntityId) -> Self {
        Self::new(entity.as_str(), FileTag::Soft)
    }

    pub fn sample_file(member: &MemberId, file_name: &str) -> Self {
        Self::new(member.as_str(), FileTag::classify(file_name))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.key, self.tag)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VersionToken(pub u64);

impl VersionToken {
    pub fn get(self) -> u64 {
        self.0
    }

    pub fn successor_of(self, current: Option<VersionToken>) -> VersionToken {
        match current {
            Some(current) if current.0 >= self.0 => VersionToken(current.0 + 1),
            _ => self,
        }
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteFile {
    pub address: String,
    pub name: String,
}

impl RemoteFile {
    pub fn new(directory: &str, name: &str) -> Self {
        let directory = directory.trim_matches('/');
        Self {
            address: format!("{directory}/{name}"),
            name: name.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_entity_id_valid() {
        let id: EntityId = "gse1234".parse().unwrap();
        assert_eq!(id.as_str(), "GSE1234");
    }

    #[test]
    fn parse_entity_id_invalid() {
        let err = "GSM1234".parse::<EntityId>().unwrap_err();
        assert_matches!(err, MirrorError::InvalidEntityId(_));
        let err = "GSE".parse::<EntityId>().unwrap_err();
        assert_matches!(err, MirrorError::InvalidEntityId(_));
    }

    #[test]
    fn parse_member_id_invalid() {
        let err = "GSM12a".parse::<MemberId>().unwrap_err();
        assert_matches!(err, MirrorError::InvalidMemberId(_));
    }

    #[test]
    fn classify_tags() {
        assert_eq!(FileTag::classify("GSE1_family.soft.gz"), FileTag::Soft);
        assert_eq!(FileTag::classify("GSM9_200_R01C01_Red.idat.gz"), FileTag::Red);
        assert_eq!(FileTag::classify("GSM9_200_R01C01_Grn.idat.gz"), FileTag::Green);
        assert_eq!(
            FileTag::classify("GSM9_beta.txt.gz"),
            FileTag::Other("GSM9_beta.txt.gz".to_string())
        );
    }

    #[test]
    fn tag_labels_parse_in_any_case() {
        assert_eq!("Soft".parse::<FileTag>().unwrap(), FileTag::Soft);
        assert_eq!(" RED ".parse::<FileTag>().unwrap(), FileTag::Red);
        assert_eq!("Grn".parse::<FileTag>().unwrap(), FileTag::Green);
        assert_eq!(
            "GSM9_Beta.txt".parse::<FileTag>().unwrap(),
            FileTag::Other("GSM9_Beta.txt".to_string())
        );
    }

    #[test]
    fn successor_is_strictly_greater() {
        let run = VersionToken(100);
        assert_eq!(run.successor_of(None), VersionToken(100));
        assert_eq!(run.successor_of(Some(VersionToken(40))), VersionToken(100));
        assert_eq!(run.successor_of(Some(VersionToken(100))), VersionToken(101));
        assert_eq!(run.successor_of(Some(VersionToken(250))), VersionToken(251));
    }

    #[test]
    fn remote_file_address() {
        let file = RemoteFile::new("/geo/series/GSE1nnn/GSE1234/soft/", "GSE1234_family.soft.gz");
        assert_eq!(file.address, "geo/series/GSE1nnn/GSE1234/soft/GSE1234_family.soft.gz");
    }
}
