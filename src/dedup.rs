use std::fs::{self, File};
use std::io::{BufReader, Read};

use camino::Utf8Path;
use serde::Serialize;

use crate::domain::Identity;
use crate::error::MirrorError;
use crate::naming;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Persist,
    Discard,
}

pub fn dedupe(
    identity: &Identity,
    fresh: &Utf8Path,
    durable_dir: &Utf8Path,
) -> Result<Verdict, MirrorError> {
    let Some(current) = naming::latest(durable_dir, identity)?.single(identity)? else {
        return Ok(Verdict::Persist);
    };
    let identical = files_identical(fresh, &current).map_err(|err| MirrorError::Validation {
        identity: identity.to_string(),
        message: err.to_string(),
    })?;
    if !identical {
        return Ok(Verdict::Persist);
    }
    fs::remove_file(fresh.as_std_path()).map_err(|err| MirrorError::Validation {
        identity: identity.to_string(),
        message: format!("remove duplicate {fresh}: {err}"),
    })?;
    Ok(Verdict::Discard)
}

pub fn files_identical(left: &Utf8Path, right: &Utf8Path) -> std::io::Result<bool> {
    let left_len = fs::metadata(left.as_std_path())?.len();
    let right_len = fs::metadata(right.as_std_path())?.len();
    if left_len != right_len {
        return Ok(false);
    }

    let mut left = BufReader::new(File::open(left.as_std_path())?);
    let mut right = BufReader::new(File::open(right.as_std_path())?);
    let mut left_buf = [0u8; 64 * 1024];
    let mut right_buf = [0u8; 64 * 1024];
    loop {
        let read = left.read(&mut left_buf)?;
        if read == 0 {
            // Lengths matched, so the right side must be exhausted too.
            return Ok(right.read(&mut right_buf[..1])? == 0);
        }
        right.read_exact(&mut right_buf[..read])?;
        if left_buf[..read] != right_buf[..read] {
            return Ok(false);
        }
    }
}
