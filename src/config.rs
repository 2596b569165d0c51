use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::ProjectDirs;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::error::MirrorError;
use crate::retry::RetryPolicy;

pub const CONFIG_FILE: &str = "geo-mirror.json";
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub root: Option<String>,
    #[serde(default)]
    pub archive_url: Option<String>,
    #[serde(default)]
    pub ntp_server: Option<String>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub connection: Option<RetryEntry>,
    #[serde(default)]
    pub file: Option<RetryEntry>,
    #[serde(default)]
    pub task_timeout_secs: Option<u64>,
    #[serde(default)]
    pub http_timeout_secs: Option<u64>,
    #[serde(default)]
    pub metadata_pattern: Option<String>,
    #[serde(default)]
    pub member_patterns: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RetryEntry {
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub interval_ms: Option<u64>,
}

impl RetryEntry {
    fn resolve(entry: Option<RetryEntry>, default: RetryPolicy) -> RetryPolicy {
        let Some(entry) = entry else {
            return default;
        };
        RetryPolicy {
            retries: entry.retries.unwrap_or(default.retries),
            interval: entry
                .interval_ms
                .map(Duration::from_millis)
                .unwrap_or(default.interval),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MirrorConfig {
    pub root: Utf8PathBuf,
    pub archive_url: String,
    pub ntp_server: String,
    pub workers: usize,
    pub connection_retry: RetryPolicy,
    pub file_retry: RetryPolicy,
    pub task_timeout: Duration,
    pub http_timeout: Duration,
    pub metadata_pattern: Regex,
    pub member_patterns: Vec<Regex>,
}

impl MirrorConfig {
    pub fn is_metadata_file(&self, name: &str) -> bool {
        self.metadata_pattern.is_match(name)
    }

    pub fn is_member_file(&self, name: &str) -> bool {
        self.member_patterns.is_empty()
            || self
                .member_patterns
                .iter()
                .any(|pattern| pattern.is_match(name))
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<MirrorConfig, MirrorError> {
        let config_path = match path {
            Some(path) => Some(PathBuf::from(path)),
            None => default_locations().into_iter().find(|path| path.exists()),
        };
        let Some(config_path) = config_path else {
            tracing::debug!("no config file found, using defaults");
            return Self::resolve_config(Config::default());
        };

        let content = fs::read_to_string(&config_path)
            .map_err(|_| MirrorError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| MirrorError::ConfigParse(err.to_string()))?;
        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<MirrorConfig, MirrorError> {
        if let Some(version) = config.schema_version.filter(|version| *version > SCHEMA_VERSION) {
            return Err(MirrorError::ConfigParse(format!(
                "schema_version {version} is newer than supported {SCHEMA_VERSION}"
            )));
        }
        let metadata_pattern = compile(
            config
                .metadata_pattern
                .as_deref()
                .unwrap_or(DEFAULT_METADATA_PATTERN),
        )?;
        let member_patterns = config
            .member_patterns
            .unwrap_or_else(default_member_patterns)
            .iter()
            .map(|pattern| compile(pattern))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(MirrorConfig {
            root: Utf8PathBuf::from(
                config
                    .root
                    .unwrap_or_else(|| "recount-methylation-files".to_string()),
            ),
            archive_url: config
                .archive_url
                .unwrap_or_else(|| "https://ftp.ncbi.nlm.nih.gov".to_string()),
            ntp_server: config
                .ntp_server
                .unwrap_or_else(|| "time.nist.gov:123".to_string()),
            workers: config.workers.unwrap_or(4).max(1),
            connection_retry: RetryEntry::resolve(
                config.connection,
                RetryPolicy::new(3, Duration::from_millis(100)),
            ),
            file_retry: RetryEntry::resolve(
                config.file,
                RetryPolicy::new(3, Duration::from_millis(10)),
            ),
            task_timeout: Duration::from_secs(config.task_timeout_secs.unwrap_or(30 * 60)),
            http_timeout: Duration::from_secs(config.http_timeout_secs.unwrap_or(60)),
            metadata_pattern,
            member_patterns,
        })
    }
}

const DEFAULT_METADATA_PATTERN: &str = r"family\.soft";

pub fn default_member_patterns() -> Vec<String> {
    vec![r"_Grn\.idat".to_string(), r"_Red\.idat".to_string()]
}

fn compile(pattern: &str) -> Result<Regex, MirrorError> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|err| MirrorError::ConfigParse(format!("pattern {pattern:?}: {err}")))
}

fn default_locations() -> Vec<PathBuf> {
    let mut locations = vec![PathBuf::from(CONFIG_FILE)];
    if let Some(dirs) = ProjectDirs::from("", "", "geo-mirror") {
        locations.push(dirs.config_dir().join(CONFIG_FILE));
    }
    locations
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_archive_layout() {
        let resolved = ConfigLoader::resolve_config(Config::default()).unwrap();
        assert_eq!(resolved.connection_retry.retries, 3);
        assert_eq!(resolved.file_retry.interval, Duration::from_millis(10));
        assert!(resolved.is_metadata_file("GSE1234_family.soft.gz"));
        assert!(resolved.is_member_file("GSM1_9976_R01C01_Red.idat.gz"));
        assert!(resolved.is_member_file("gsm1_9976_r01c01_grn.idat.gz"));
        assert!(!resolved.is_member_file("GSM1_processed.txt.gz"));
    }

    #[test]
    fn partial_retry_entry_keeps_other_default() {
        let config: Config =
            serde_json::from_str(r#"{"file": {"retries": 7}, "workers": 0}"#).unwrap();
        let resolved = ConfigLoader::resolve_config(config).unwrap();
        assert_eq!(resolved.file_retry.retries, 7);
        assert_eq!(resolved.file_retry.interval, Duration::from_millis(10));
        assert_eq!(resolved.workers, 1);
    }
}
