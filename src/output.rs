use std::io::{self, Write};

use serde::Serialize;

use crate::app::{ConvertResult, ProgressEvent, ProgressSink, RunReport};
use crate::domain::EntityId;
use crate::task::{EntityOutcome, FileStatus};

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize)]
pub struct BacklogResult {
    pub force: bool,
    pub entities: Vec<EntityId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LatestResult {
    pub identity: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiffResult {
    pub changed: Vec<EntityId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FilterResult {
    pub path: String,
    pub entities: usize,
    pub members: usize,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_run(result: &RunReport) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_backlog(result: &BacklogResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_latest(result: &LatestResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_diff(result: &DiffResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_filter(result: &FilterResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_convert(result: &ConvertResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

pub fn print_run_summary(result: &RunReport) {
    println!("geo-mirror run {}", result.token);
    println!(
        "series: {}  persisted files: {}  failed files: {}",
        result.backlog,
        result.persisted_files(),
        result.failed_files()
    );
    let incomplete = result.failed_entities();
    if !incomplete.is_empty() {
        println!("incomplete series: {}", incomplete.len());
    }

    for entity in &result.entities {
        match &entity.outcome {
            EntityOutcome::Completed if entity.is_clean() => {}
            EntityOutcome::Completed => println!("{}: partial", entity.entity),
            EntityOutcome::ConnectionFailed { error }
            | EntityOutcome::ListingFailed { error }
            | EntityOutcome::NotStarted { error } => {
                println!("{}: {error}", entity.entity);
            }
            EntityOutcome::TimedOut => println!("{}: timed out", entity.entity),
        }
        for member in &entity.member_failures {
            println!("  {}: {}", member.member, member.error);
        }
        for file in &entity.files {
            match &file.status {
                FileStatus::Persisted { durable_path, .. } => {
                    println!("  + {durable_path}");
                }
                FileStatus::Failed { stage, error } => {
                    println!("  ! {} ({stage:?}): {error}", file.identity);
                }
                FileStatus::Skipped | FileStatus::DuplicateDiscarded => {}
            }
        }
    }
}
