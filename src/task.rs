use std::collections::BTreeMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::app::{ProgressEvent, ProgressSink};
use crate::archive::{self, ArchiveClient};
use crate::config::MirrorConfig;
use crate::dedup::{self, Verdict};
use crate::domain::{EntityId, Identity, MemberId, RemoteFile, VersionToken};
use crate::error::MirrorError;
use crate::ledger::{Ledger, LedgerRecord, RecordKind};
use crate::naming;
use crate::resolver::{self, Resolution};
use crate::retry::Deadline;
use crate::store::{IdentityLocks, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Connecting,
    Listing,
    Stating,
    Fetching,
    Validating,
    Persisting,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FileStatus {
    Skipped,
    Persisted {
        durable_path: String,
        version: VersionToken,
    },
    DuplicateDiscarded,
    Failed {
        stage: Stage,
        error: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub identity: Identity,
    pub member: Option<MemberId>,
    pub remote_address: String,
    pub remote_modified: Option<DateTime<Utc>>,
    pub resolution: Option<Resolution>,
    pub bytes: Option<u64>,
    #[serde(flatten)]
    pub status: FileStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemberFailure {
    pub member: MemberId,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EntityOutcome {
    Completed,
    ConnectionFailed { error: String },
    ListingFailed { error: String },
    TimedOut,
    NotStarted { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct EntityReport {
    pub entity: EntityId,
    #[serde(flatten)]
    pub outcome: EntityOutcome,
    pub files: Vec<FileReport>,
    pub member_failures: Vec<MemberFailure>,
}

impl EntityReport {
    pub fn empty(entity: EntityId) -> Self {
        Self {
            entity,
            outcome: EntityOutcome::Completed,
            files: Vec::new(),
            member_failures: Vec::new(),
        }
    }

    pub fn persisted(&self) -> impl Iterator<Item = &FileReport> {
        self.files
            .iter()
            .filter(|file| matches!(file.status, FileStatus::Persisted { .. }))
    }

    pub fn failed(&self) -> impl Iterator<Item = &FileReport> {
        self.files
            .iter()
            .filter(|file| matches!(file.status, FileStatus::Failed { .. }))
    }

    pub fn is_clean(&self) -> bool {
        self.outcome == EntityOutcome::Completed
            && self.member_failures.is_empty()
            && self.failed().next().is_none()
    }
}

pub struct TaskContext<'a, A: ArchiveClient> {
    pub archive: &'a A,
    pub config: &'a MirrorConfig,
    pub store: &'a Store,
    pub ledger: &'a Ledger,
    pub locks: &'a IdentityLocks,
    pub token: VersionToken,
    pub sink: &'a dyn ProgressSink,
}

struct Target<'t> {
    entity: &'t EntityId,
    member: Option<&'t MemberId>,
    kind: RecordKind,
    identity: Identity,
    remote: RemoteFile,
}

pub fn run_entity<A: ArchiveClient>(
    ctx: &TaskContext<'_, A>,
    entity: &EntityId,
    members: &[MemberId],
    scratch: &Utf8Path,
    deadline: &Deadline,
) -> EntityReport {
    let mut report = EntityReport::empty(entity.clone());
    if deadline.expired() {
        report.outcome = EntityOutcome::TimedOut;
        return report;
    }
    emit(ctx.sink, format!("phase=Connect; {entity}"));

    let mut session = match archive::connect(ctx.archive, &ctx.config.connection_retry, deadline)
    {
        Ok(session) => session,
        Err(err) => {
            tracing::warn!(%entity, error = %err, "connection failed, abandoning series");
            report.outcome = EntityOutcome::ConnectionFailed {
                error: err.to_string(),
            };
            return report;
        }
    };

    let soft_dir = archive::series_soft_dir(entity);
    emit(ctx.sink, format!("phase=List; {soft_dir}"));
    let listing = archive::list_files(
        &mut session,
        entity,
        &soft_dir,
        &ctx.config.file_retry,
        deadline,
    )
    .and_then(|files| {
        files
            .into_iter()
            .filter(|file| ctx.config.is_metadata_file(&file.name))
            .min_by(|left, right| left.name.cmp(&right.name))
            .ok_or_else(|| MirrorError::Listing {
                entity: entity.to_string(),
                address: soft_dir.clone(),
            })
    });
    let metadata = match listing {
        Ok(file) => file,
        Err(err) => {
            tracing::warn!(%entity, error = %err, "series listing failed");
            report.outcome = EntityOutcome::ListingFailed {
                error: err.to_string(),
            };
            return report;
        }
    };

    let target = Target {
        entity,
        member: None,
        kind: RecordKind::Entity,
        identity: Identity::series_soft(entity),
        remote: metadata,
    };
    report
        .files
        .push(sync_file(ctx, &mut session, target, scratch, deadline));

    for member in members {
        if deadline.expired() {
            report.member_failures.push(MemberFailure {
                member: member.clone(),
                error: MirrorError::TaskTimeout(entity.to_string()).to_string(),
            });
            continue;
        }
        let suppl_dir = archive::sample_suppl_dir(member);
        emit(ctx.sink, format!("phase=List; {suppl_dir}"));
        let files = match archive::list_files(
            &mut session,
            entity,
            &suppl_dir,
            &ctx.config.file_retry,
            deadline,
        ) {
            Ok(files) => files,
            Err(err) => {
                tracing::warn!(%entity, %member, error = %err, "sample listing failed");
                report.member_failures.push(MemberFailure {
                    member: member.clone(),
                    error: err.to_string(),
                });
                continue;
            }
        };
        let in_scope = files
            .into_iter()
            .filter(|file| {
                let keep = belongs_to(member, &file.name) && ctx.config.is_member_file(&file.name);
                if !keep {
                    tracing::debug!(%member, name = %file.name, "skipping out-of-scope file");
                }
                keep
            })
            .map(|file| (Identity::sample_file(member, &file.name), file))
            .collect::<Vec<_>>();
        let collisions = colliding_names(&in_scope);
        for (identity, file) in in_scope {
            if let Some(names) = collisions.get(&identity) {
                tracing::warn!(%member, %identity, ?names, "several remote files share one identity");
                report.files.push(FileReport {
                    identity: identity.clone(),
                    member: Some(member.clone()),
                    remote_address: file.address,
                    remote_modified: None,
                    resolution: None,
                    bytes: None,
                    status: FileStatus::Failed {
                        stage: Stage::Listing,
                        error: MirrorError::IdentityCollision {
                            identity: identity.to_string(),
                            names: names.clone(),
                        }
                        .to_string(),
                    },
                });
                continue;
            }
            let target = Target {
                entity,
                member: Some(member),
                kind: RecordKind::Member,
                identity,
                remote: file,
            };
            report
                .files
                .push(sync_file(ctx, &mut session, target, scratch, deadline));
        }
    }

    if deadline.expired() {
        report.outcome = EntityOutcome::TimedOut;
    }
    report
}

// Identities claimed by more than one listed file, with the clashing names.
fn colliding_names(files: &[(Identity, RemoteFile)]) -> BTreeMap<Identity, Vec<String>> {
    let mut names: BTreeMap<Identity, Vec<String>> = BTreeMap::new();
    for (identity, file) in files {
        names
            .entry(identity.clone())
            .or_default()
            .push(file.name.clone());
    }
    names.retain(|_, names| names.len() > 1);
    names
}

fn belongs_to(member: &MemberId, file_name: &str) -> bool {
    file_name
        .to_ascii_uppercase()
        .strip_prefix(member.as_str())
        .map(|rest| !rest.starts_with(|ch: char| ch.is_ascii_digit()))
        .unwrap_or(false)
}

fn sync_file<A: ArchiveClient>(
    ctx: &TaskContext<'_, A>,
    session: &mut A::Session,
    target: Target<'_>,
    scratch: &Utf8Path,
    deadline: &Deadline,
) -> FileReport {
    let mut report = FileReport {
        identity: target.identity.clone(),
        member: target.member.cloned(),
        remote_address: target.remote.address.clone(),
        remote_modified: None,
        resolution: None,
        bytes: None,
        status: FileStatus::Skipped,
    };
    let fail = |stage: Stage, err: MirrorError| FileStatus::Failed {
        stage,
        error: err.to_string(),
    };

    if deadline.expired() {
        report.status = fail(
            Stage::Stating,
            MirrorError::TaskTimeout(target.entity.to_string()),
        );
        return report;
    }

    emit(ctx.sink, format!("phase=Stat; {}", target.remote.address));
    let remote_modified =
        match archive::stat_time(session, &target.remote, &ctx.config.file_retry, deadline) {
            Ok(time) => time,
            Err(err) => {
                report.status = fail(Stage::Stating, err);
                return report;
            }
        };
    report.remote_modified = Some(remote_modified);

    let resolution = match resolver::resolve(&target.identity, remote_modified, ctx.ledger) {
        Ok(resolution) => resolution,
        Err(err) => {
            report.status = fail(Stage::Stating, err);
            return report;
        }
    };
    report.resolution = Some(resolution);
    if !resolution.needs_fetch() {
        tracing::debug!(identity = %target.identity, "unchanged, skipping transfer");
        report.status = FileStatus::Skipped;
        return report;
    }

    if deadline.expired() {
        report.status = fail(
            Stage::Fetching,
            MirrorError::TaskTimeout(target.entity.to_string()),
        );
        return report;
    }

    emit(ctx.sink, format!("phase=Fetch; {}", target.remote.address));
    let temp_path = scratch.join(&target.remote.name);
    let transfer = match archive::fetch(
        session,
        &target.remote,
        temp_path.as_std_path(),
        &ctx.config.file_retry,
        deadline,
    ) {
        Ok(transfer) => transfer,
        Err(err) => {
            let _ = fs::remove_file(temp_path.as_std_path());
            report.status = fail(Stage::Fetching, err);
            return report;
        }
    };
    report.bytes = Some(transfer.bytes);

    emit(ctx.sink, format!("phase=Verify; {}", target.identity));
    report.status = match persist(ctx, &target, &temp_path, remote_modified, &transfer.status) {
        Ok(status) => status,
        Err((stage, err)) => {
            let _ = fs::remove_file(temp_path.as_std_path());
            fail(stage, err)
        }
    };
    report
}

fn persist<A: ArchiveClient>(
    ctx: &TaskContext<'_, A>,
    target: &Target<'_>,
    fresh: &Utf8Path,
    remote_modified: DateTime<Utc>,
    transfer_status: &str,
) -> Result<FileStatus, (Stage, MirrorError)> {
    let durable_dir = ctx.store.durable_dir_for(&target.identity);
    let handle = ctx
        .locks
        .handle(&target.identity)
        .map_err(|err| (Stage::Validating, err))?;
    let _guard = handle.lock().map_err(|_| {
        (
            Stage::Validating,
            MirrorError::Validation {
                identity: target.identity.to_string(),
                message: "identity lock poisoned".to_string(),
            },
        )
    })?;

    match dedup::dedupe(&target.identity, fresh, &durable_dir) {
        Ok(Verdict::Discard) => {
            tracing::info!(identity = %target.identity, "identical to stored version, discarded");
            return Ok(FileStatus::DuplicateDiscarded);
        }
        Ok(Verdict::Persist) => {}
        Err(err) => return Err((Stage::Validating, err)),
    }

    let current = naming::versions(&durable_dir, &target.identity)
        .map_err(|err| (Stage::Persisting, err))?
        .last()
        .map(|(token, _)| *token);
    let version = ctx.token.successor_of(current);
    let file_name = naming::name(&target.identity, version, &target.remote.name);
    let durable = Store::promote(fresh, &durable_dir, &file_name)
        .map_err(|err| (Stage::Persisting, err))?;

    let record = LedgerRecord {
        kind: target.kind,
        entity: target.entity.clone(),
        identity: target.identity.clone(),
        remote_address: target.remote.address.clone(),
        durable_path: durable.to_string(),
        status: transfer_status.to_string(),
        remote_modified,
        version,
        recorded_at: Utc::now(),
    };
    if let Err(err) = ctx.ledger.append(record) {
        // A durable file without a ledger record must not survive.
        remove_orphan(&durable);
        return Err((Stage::Persisting, err));
    }
    tracing::info!(identity = %target.identity, %version, path = %durable, "persisted");
    Ok(FileStatus::Persisted {
        durable_path: durable.to_string(),
        version,
    })
}

fn remove_orphan(path: &Utf8PathBuf) {
    if let Err(err) = fs::remove_file(path.as_std_path()) {
        tracing::warn!(%path, error = %err, "could not remove unrecorded durable file");
    }
}

fn emit(sink: &dyn ProgressSink, message: String) {
    sink.event(ProgressEvent {
        message,
        elapsed: None,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_ownership_requires_exact_accession() {
        let member: MemberId = "GSM12".parse().unwrap();
        assert!(belongs_to(&member, "GSM12_R01C01_Red.idat.gz"));
        assert!(belongs_to(&member, "gsm12_R01C01_Red.idat.gz"));
        assert!(!belongs_to(&member, "GSM123_R01C01_Red.idat.gz"));
        assert!(!belongs_to(&member, "GSM1_R01C01_Red.idat.gz"));
    }

    #[test]
    fn two_arrays_of_one_channel_collide() {
        let member: MemberId = "GSM21".parse().unwrap();
        let files = [
            "GSM21_R01C01_Red.idat.gz",
            "GSM21_R01C01_Grn.idat.gz",
            "GSM21_R02C01_Red.idat.gz",
        ]
        .iter()
        .map(|name| {
            let file = RemoteFile::new("geo/samples/GSMnnn/GSM21/suppl", name);
            (Identity::sample_file(&member, name), file)
        })
        .collect::<Vec<_>>();

        let collisions = colliding_names(&files);
        assert_eq!(collisions.len(), 1);
        assert_eq!(
            collisions[&Identity::sample_file(&member, "GSM21_R01C01_Red.idat.gz")],
            vec!["GSM21_R01C01_Red.idat.gz", "GSM21_R02C01_Red.idat.gz"]
        );
    }
}
