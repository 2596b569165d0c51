use std::collections::{BTreeSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use rand::seq::SliceRandom;
use serde::Serialize;

use crate::archive::ArchiveClient;
use crate::clock::Clock;
use crate::config::MirrorConfig;
use crate::convert::{self, Converter};
use crate::domain::{EntityId, Identity, VersionToken};
use crate::error::MirrorError;
use crate::ledger::Ledger;
use crate::naming;
use crate::retry::Deadline;
use crate::store::{IdentityLocks, RunScratch, Store};
use crate::task::{self, EntityOutcome, EntityReport, TaskContext};
use crate::validity::{self, ValidityMap};

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink: Send + Sync {
    fn event(&self, event: ProgressEvent);
}

pub struct LogSink;

impl ProgressSink for LogSink {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => {
                tracing::info!(elapsed_ms = elapsed.as_millis() as u64, "{}", event.message)
            }
            None => tracing::debug!("{}", event.message),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    pub force: bool,
    pub only: Option<BTreeSet<EntityId>>,
    pub workers: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub token: VersionToken,
    pub backlog: usize,
    pub entities: Vec<EntityReport>,
}

impl RunReport {
    pub fn persisted_files(&self) -> usize {
        self.entities.iter().map(|entity| entity.persisted().count()).sum()
    }

    pub fn failed_files(&self) -> usize {
        self.entities.iter().map(|entity| entity.failed().count()).sum()
    }

    pub fn failed_entities(&self) -> Vec<&EntityReport> {
        self.entities
            .iter()
            .filter(|entity| entity.outcome != EntityOutcome::Completed)
            .collect()
    }

    pub fn connection_error(&self) -> Option<&str> {
        self.entities.iter().find_map(|entity| match &entity.outcome {
            EntityOutcome::ConnectionFailed { error } => Some(error.as_str()),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConvertResult {
    pub entity: EntityId,
    pub input: String,
    pub outputs: Vec<String>,
}

pub struct App<A: ArchiveClient, C: Clock> {
    config: MirrorConfig,
    store: Store,
    ledger: Ledger,
    archive: A,
    clock: C,
    locks: IdentityLocks,
    in_flight: Mutex<BTreeSet<EntityId>>,
}

impl<A: ArchiveClient, C: Clock> App<A, C> {
    pub fn open(config: MirrorConfig, archive: A, clock: C) -> Result<Self, MirrorError> {
        let store = Store::new(config.root.clone());
        store.ensure_layout()?;
        let ledger = Ledger::open(&store.ledger_dir())?;
        Ok(Self {
            config,
            store,
            ledger,
            archive,
            clock,
            locks: IdentityLocks::new(),
            in_flight: Mutex::new(BTreeSet::new()),
        })
    }

    pub fn config(&self) -> &MirrorConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn backlog(
        &self,
        current: &ValidityMap,
        previous: Option<&ValidityMap>,
        force: bool,
    ) -> Result<Vec<EntityId>, MirrorError> {
        let seen = self.ledger.entities_seen()?;
        Ok(validity::backlog(current, previous, &seen, force))
    }

    pub fn run(
        &self,
        current: &ValidityMap,
        previous: Option<&ValidityMap>,
        options: &SyncOptions,
        sink: &dyn ProgressSink,
    ) -> Result<RunReport, MirrorError> {
        let start = Instant::now();
        let mut backlog = self.backlog(current, previous, options.force)?;
        if let Some(only) = &options.only {
            backlog.retain(|entity| only.contains(entity));
        }
        backlog.shuffle(&mut rand::thread_rng());
        sink.event(ProgressEvent {
            message: format!("phase=Resolve; {} series in backlog", backlog.len()),
            elapsed: None,
        });

        let token = self.clock.version_token()?;
        tracing::info!(%token, backlog = backlog.len(), "starting sync run");
        let scratch = self.store.scratch()?;
        let workers = options
            .workers
            .unwrap_or(self.config.workers)
            .max(1)
            .min(backlog.len().max(1));
        let total = backlog.len();
        let mut entities = self.dispatch(current, backlog, token, &scratch, workers, sink);
        entities.sort_by(|left, right| left.entity.cmp(&right.entity));

        sink.event(ProgressEvent {
            message: format!("phase=Done; {total} series"),
            elapsed: Some(start.elapsed()),
        });
        Ok(RunReport {
            token,
            backlog: total,
            entities,
        })
    }

    fn dispatch(
        &self,
        current: &ValidityMap,
        backlog: Vec<EntityId>,
        token: VersionToken,
        scratch: &RunScratch,
        workers: usize,
        sink: &dyn ProgressSink,
    ) -> Vec<EntityReport> {
        let queue = Mutex::new(backlog.into_iter().collect::<VecDeque<_>>());
        let (tx, rx) = mpsc::channel();

        thread::scope(|scope| {
            for _ in 0..workers {
                let tx = tx.clone();
                let queue = &queue;
                scope.spawn(move || {
                    loop {
                        let next = match queue.lock() {
                            Ok(mut queue) => queue.pop_front(),
                            Err(_) => None,
                        };
                        let Some(entity) = next else {
                            break;
                        };
                        let report = match self.sync_entity(current, &entity, token, scratch, sink)
                        {
                            Ok(report) => report,
                            Err(err) => {
                                tracing::warn!(%entity, error = %err, "series task not started");
                                let mut report = EntityReport::empty(entity);
                                report.outcome = EntityOutcome::NotStarted {
                                    error: err.to_string(),
                                };
                                report
                            }
                        };
                        if tx.send(report).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        drop(tx);
        rx.into_iter().collect()
    }

    pub fn sync_entity(
        &self,
        current: &ValidityMap,
        entity: &EntityId,
        token: VersionToken,
        scratch: &RunScratch,
        sink: &dyn ProgressSink,
    ) -> Result<EntityReport, MirrorError> {
        let members = current
            .members(entity)
            .ok_or_else(|| MirrorError::NotFound(entity.to_string()))?;
        let _guard = InFlight::enter(&self.in_flight, entity)?;
        let task_dir = scratch.task_dir(entity)?;
        let task_path = Utf8PathBuf::from_path_buf(task_dir.path().to_path_buf())
            .map_err(|path| MirrorError::Filesystem(format!("non UTF-8 path {}", path.display())))?;

        let context = TaskContext {
            archive: &self.archive,
            config: &self.config,
            store: &self.store,
            ledger: &self.ledger,
            locks: &self.locks,
            token,
            sink,
        };
        let deadline = Deadline::after(self.config.task_timeout);
        let start = Instant::now();
        let report = task::run_entity(&context, entity, members, &task_path, &deadline);
        sink.event(ProgressEvent {
            message: format!(
                "phase=Entity; {entity}: {} persisted, {} failed",
                report.persisted().count(),
                report.failed().count()
            ),
            elapsed: Some(start.elapsed()),
        });
        Ok(report)
    }

    pub fn latest(&self, identity: &Identity) -> Result<Utf8PathBuf, MirrorError> {
        naming::latest(&self.store.durable_dir_for(identity), identity)?
            .single(identity)?
            .ok_or_else(|| MirrorError::NotFound(identity.to_string()))
    }

    pub fn convert_entity(
        &self,
        entity: &EntityId,
        converter: &dyn Converter,
        sink: &dyn ProgressSink,
    ) -> Result<ConvertResult, MirrorError> {
        let identity = Identity::series_soft(entity);
        let source = self.latest(&identity)?;
        let scratch = self.store.scratch()?;
        sink.event(ProgressEvent {
            message: format!("phase=Expand; {source}"),
            elapsed: None,
        });
        let input = convert::expand_gzip(&source, scratch.path())?;
        let out_dir = self.store.converted_dir();
        sink.event(ProgressEvent {
            message: format!("phase=Convert; {input}"),
            elapsed: None,
        });
        let outputs =
            converter.convert(&[PathBuf::from(input.as_std_path())], out_dir.as_std_path())?;
        tracing::info!(%entity, outputs = outputs.len(), "conversion finished");
        Ok(ConvertResult {
            entity: entity.clone(),
            input: source.to_string(),
            outputs: outputs
                .iter()
                .map(|path| path.display().to_string())
                .collect(),
        })
    }
}

struct InFlight<'a> {
    set: &'a Mutex<BTreeSet<EntityId>>,
    entity: EntityId,
}

impl<'a> InFlight<'a> {
    fn enter(set: &'a Mutex<BTreeSet<EntityId>>, entity: &EntityId) -> Result<Self, MirrorError> {
        let mut guard = set
            .lock()
            .map_err(|_| MirrorError::EntityBusy(entity.to_string()))?;
        if !guard.insert(entity.clone()) {
            return Err(MirrorError::EntityBusy(entity.to_string()));
        }
        Ok(Self {
            set,
            entity: entity.clone(),
        })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.set.lock() {
            guard.remove(&self.entity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_flight_guard_rejects_reentry_and_releases() {
        let set = Mutex::new(BTreeSet::new());
        let entity: EntityId = "GSE1".parse().unwrap();
        let guard = InFlight::enter(&set, &entity).unwrap();
        assert!(matches!(
            InFlight::enter(&set, &entity),
            Err(MirrorError::EntityBusy(_))
        ));
        drop(guard);
        assert!(InFlight::enter(&set, &entity).is_ok());
    }
}
