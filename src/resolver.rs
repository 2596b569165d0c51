use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::Identity;
use crate::error::MirrorError;
use crate::ledger::Ledger;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Unchanged,
    New,
    Unknown,
}

impl Resolution {
    pub fn needs_fetch(self) -> bool {
        !matches!(self, Resolution::Unchanged)
    }
}

pub fn resolve(
    identity: &Identity,
    remote_modified: DateTime<Utc>,
    ledger: &Ledger,
) -> Result<Resolution, MirrorError> {
    Ok(match ledger.latest(identity)? {
        None => Resolution::Unknown,
        Some(record) if record.remote_modified == remote_modified => Resolution::Unchanged,
        Some(_) => Resolution::New,
    })
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;
    use chrono::TimeZone;

    use super::*;
    use crate::domain::{FileTag, VersionToken};
    use crate::ledger::{LedgerRecord, RecordKind};

    #[test]
    fn resolves_against_most_recent_record() {
        let temp = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let ledger = Ledger::open(&dir).unwrap();
        let identity = Identity::new("GSE5", FileTag::Soft);
        let t1 = Utc.with_ymd_and_hms(2020, 5, 1, 12, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2021, 5, 1, 12, 0, 0).unwrap();

        assert_eq!(resolve(&identity, t1, &ledger).unwrap(), Resolution::Unknown);

        ledger
            .append(LedgerRecord {
                kind: RecordKind::Entity,
                entity: "GSE5".parse().unwrap(),
                identity: identity.clone(),
                remote_address: "geo/series/GSEnnn/GSE5/soft/GSE5_family.soft.gz".to_string(),
                durable_path: "gse_soft/GSE5.1.GSE5_family.soft.gz".to_string(),
                status: "complete".to_string(),
                remote_modified: t1,
                version: VersionToken(1),
                recorded_at: Utc::now(),
            })
            .unwrap();

        assert_eq!(resolve(&identity, t1, &ledger).unwrap(), Resolution::Unchanged);
        assert_eq!(resolve(&identity, t2, &ledger).unwrap(), Resolution::New);
        assert!(!Resolution::Unchanged.needs_fetch());
        assert!(Resolution::Unknown.needs_fetch());
    }
}
