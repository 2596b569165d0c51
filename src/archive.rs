use std::fs::File;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, LAST_MODIFIED, USER_AGENT};
use serde::Serialize;

use crate::domain::{EntityId, MemberId, RemoteFile};
use crate::error::MirrorError;
use crate::retry::{Deadline, RetryPolicy, retry};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transfer {
    pub bytes: u64,
    pub status: String,
}

pub trait ArchiveClient: Send + Sync {
    type Session: ArchiveSession;

    fn connect(&self) -> Result<Self::Session, MirrorError>;
}

pub trait ArchiveSession {
    fn list(&mut self, directory: &str) -> Result<Vec<RemoteFile>, MirrorError>;
    fn modified_time(&mut self, file: &RemoteFile) -> Result<DateTime<Utc>, MirrorError>;
    fn retrieve(&mut self, file: &RemoteFile, destination: &Path)
    -> Result<Transfer, MirrorError>;
}

pub fn connect<A: ArchiveClient>(
    client: &A,
    policy: &RetryPolicy,
    deadline: &Deadline,
) -> Result<A::Session, MirrorError> {
    retry(policy, deadline, |_| true, |attempt| {
        tracing::debug!(attempt, "connecting to archive");
        client.connect()
    })
    .map_err(|exhausted| MirrorError::Connection {
        attempts: exhausted.attempts,
        message: exhausted.error.to_string(),
    })
}

pub fn list_files<S: ArchiveSession>(
    session: &mut S,
    entity: &EntityId,
    directory: &str,
    policy: &RetryPolicy,
    deadline: &Deadline,
) -> Result<Vec<RemoteFile>, MirrorError> {
    let listing = retry(policy, deadline, MirrorError::is_transient, |_| {
        session.list(directory)
    });
    match listing {
        Ok(files) if !files.is_empty() => Ok(files),
        Ok(_) => Err(MirrorError::Listing {
            entity: entity.to_string(),
            address: directory.to_string(),
        }),
        Err(exhausted) => {
            tracing::debug!(error = %exhausted.error, "listing failed");
            Err(MirrorError::Listing {
                entity: entity.to_string(),
                address: directory.to_string(),
            })
        }
    }
}

pub fn stat_time<S: ArchiveSession>(
    session: &mut S,
    file: &RemoteFile,
    policy: &RetryPolicy,
    deadline: &Deadline,
) -> Result<DateTime<Utc>, MirrorError> {
    retry(policy, deadline, MirrorError::is_transient, |_| {
        session.modified_time(file)
    })
    .map_err(|exhausted| MirrorError::Stat {
        address: file.address.clone(),
        message: exhausted.error.to_string(),
    })
}

pub fn fetch<S: ArchiveSession>(
    session: &mut S,
    file: &RemoteFile,
    destination: &Path,
    policy: &RetryPolicy,
    deadline: &Deadline,
) -> Result<Transfer, MirrorError> {
    retry(policy, deadline, MirrorError::is_transient, |attempt| {
        tracing::debug!(address = %file.address, attempt, "retrieving");
        session.retrieve(file, destination)
    })
    .map_err(|exhausted| MirrorError::Fetch {
        address: file.address.clone(),
        message: exhausted.error.to_string(),
    })
}

pub fn bucket(accession: &str, prefix: &str) -> String {
    let digits = accession.trim_start_matches(prefix);
    if digits.len() <= 3 {
        return format!("{prefix}nnn");
    }
    let head = &digits[..digits.len() - 3];
    format!("{prefix}{head}nnn")
}

pub fn series_soft_dir(entity: &EntityId) -> String {
    format!(
        "geo/series/{}/{}/soft",
        bucket(entity.as_str(), "GSE"),
        entity.as_str()
    )
}

pub fn sample_suppl_dir(member: &MemberId) -> String {
    format!(
        "geo/samples/{}/{}/suppl",
        bucket(member.as_str(), "GSM"),
        member.as_str()
    )
}

#[derive(Clone)]
pub struct GeoHttpArchive {
    client: Client,
    base_url: String,
}

impl GeoHttpArchive {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, MirrorError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("geo-mirror/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| MirrorError::ArchiveHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| MirrorError::ArchiveHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: normalize_base(base_url),
        })
    }
}

impl ArchiveClient for GeoHttpArchive {
    type Session = GeoHttpSession;

    fn connect(&self) -> Result<Self::Session, MirrorError> {
        let url = format!("{}/geo/", self.base_url);
        let response = self
            .client
            .head(&url)
            .send()
            .map_err(|err| MirrorError::ArchiveHttp(err.to_string()))?;
        check_status(response)?;
        Ok(GeoHttpSession {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
        })
    }
}

pub struct GeoHttpSession {
    client: Client,
    base_url: String,
}

impl GeoHttpSession {
    fn url(&self, address: &str) -> String {
        format!("{}/{}", self.base_url, address.trim_start_matches('/'))
    }
}

impl ArchiveSession for GeoHttpSession {
    fn list(&mut self, directory: &str) -> Result<Vec<RemoteFile>, MirrorError> {
        let url = format!("{}/", self.url(directory.trim_end_matches('/')));
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| MirrorError::ArchiveHttp(err.to_string()))?;
        let body = check_status(response)?
            .text()
            .map_err(|err| MirrorError::ArchiveHttp(err.to_string()))?;
        Ok(parse_index(&body)
            .into_iter()
            .map(|name| RemoteFile::new(directory, &name))
            .collect())
    }

    fn modified_time(&mut self, file: &RemoteFile) -> Result<DateTime<Utc>, MirrorError> {
        let response = self
            .client
            .head(self.url(&file.address))
            .send()
            .map_err(|err| MirrorError::ArchiveHttp(err.to_string()))?;
        let response = check_status(response)?;
        let header = response
            .headers()
            .get(LAST_MODIFIED)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| MirrorError::ArchiveStatus {
                status: response.status().as_u16(),
                message: format!("no Last-Modified for {}", file.address),
            })?;
        parse_http_date(header)
    }

    fn retrieve(
        &mut self,
        file: &RemoteFile,
        destination: &Path,
    ) -> Result<Transfer, MirrorError> {
        let response = self
            .client
            .get(self.url(&file.address))
            .send()
            .map_err(|err| MirrorError::ArchiveHttp(err.to_string()))?;
        let mut response = check_status(response)?;
        let status = response.status().to_string();
        let mut out =
            File::create(destination).map_err(|err| MirrorError::Filesystem(err.to_string()))?;
        // Body read errors surface as io errors mid-stream; treat them as transport failures.
        let bytes = std::io::copy(&mut response, &mut out)
            .map_err(|err| MirrorError::ArchiveHttp(err.to_string()))?;
        out.sync_all()
            .map_err(|err| MirrorError::Filesystem(err.to_string()))?;
        Ok(Transfer { bytes, status })
    }
}

fn check_status(
    response: reqwest::blocking::Response,
) -> Result<reqwest::blocking::Response, MirrorError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let message = response
        .text()
        .ok()
        .filter(|text| !text.trim().is_empty())
        .unwrap_or_else(|| "archive request failed".to_string());
    Err(MirrorError::ArchiveStatus { status, message })
}

fn normalize_base(url: &str) -> String {
    let url = url.trim_end_matches('/');
    if let Some(rest) = url.strip_prefix("ftp://") {
        return format!("https://{rest}");
    }
    url.to_string()
}

pub fn parse_index(html: &str) -> Vec<String> {
    static HREF: OnceLock<Regex> = OnceLock::new();
    let href = HREF.get_or_init(|| {
        Regex::new(r#"(?i)<a\s+[^>]*href="([^"]+)""#).expect("static regex")
    });
    let mut names = Vec::new();
    for capture in href.captures_iter(html) {
        let target = &capture[1];
        if target.starts_with('?')
            || target.starts_with('/')
            || target.starts_with("..")
            || target.ends_with('/')
            || target.contains("://")
        {
            continue;
        }
        if !names.iter().any(|name| name == target) {
            names.push(target.to_string());
        }
    }
    names
}

pub fn parse_http_date(value: &str) -> Result<DateTime<Utc>, MirrorError> {
    DateTime::parse_from_rfc2822(value.trim())
        .map(|date| date.with_timezone(&Utc))
        .map_err(|err| MirrorError::ArchiveStatus {
            status: 0,
            message: format!("bad Last-Modified {value:?}: {err}"),
        })
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn bucket_paths() {
        let entity: EntityId = "GSE102902".parse().unwrap();
        assert_eq!(series_soft_dir(&entity), "geo/series/GSE102nnn/GSE102902/soft");
        let small: EntityId = "GSE12".parse().unwrap();
        assert_eq!(series_soft_dir(&small), "geo/series/GSEnnn/GSE12/soft");
        let member: MemberId = "GSM1234567".parse().unwrap();
        assert_eq!(
            sample_suppl_dir(&member),
            "geo/samples/GSM1234nnn/GSM1234567/suppl"
        );
    }

    #[test]
    fn index_parsing_keeps_files_only() {
        let html = r#"<html><body><pre>
<a href="?C=N;O=D">Name</a>
<a href="/geo/samples/GSM1nnn/GSM1234/">Parent Directory</a>
<a href="GSM1234_9976_R01C01_Grn.idat.gz">GSM1234_9976_R01C01_Grn.idat.gz</a> 2014-03-01 10:00  4.1M
<a href="GSM1234_9976_R01C01_Red.idat.gz">GSM1234_9976_R01C01_Red.idat.gz</a> 2014-03-01 10:00  4.1M
<a href="filelist.txt">filelist.txt</a>
<a href="old/">old/</a>
</pre></body></html>"#;
        assert_eq!(
            parse_index(html),
            vec![
                "GSM1234_9976_R01C01_Grn.idat.gz",
                "GSM1234_9976_R01C01_Red.idat.gz",
                "filelist.txt",
            ]
        );
    }

    #[test]
    fn http_dates_parse_to_utc() {
        let parsed = parse_http_date("Tue, 15 Nov 1994 08:12:31 GMT").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(1994, 11, 15, 8, 12, 31).unwrap());
    }

    #[test]
    fn ftp_base_is_mapped_to_https() {
        assert_eq!(
            normalize_base("ftp://ftp.ncbi.nlm.nih.gov/"),
            "https://ftp.ncbi.nlm.nih.gov"
        );
    }
}
