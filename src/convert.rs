use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};
use flate2::read::GzDecoder;

use crate::error::MirrorError;

pub trait Converter: Send + Sync {
    fn convert(&self, inputs: &[PathBuf], out_dir: &Path) -> Result<Vec<PathBuf>, MirrorError>;
}

#[derive(Debug, Clone)]
pub struct CommandConverter {
    program: String,
    args: Vec<String>,
}

impl CommandConverter {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn locate(&self) -> Result<PathBuf, MirrorError> {
        let candidate = Path::new(&self.program);
        if candidate.components().count() > 1 {
            if candidate.exists() {
                return Ok(candidate.to_path_buf());
            }
            return Err(MirrorError::MissingTool(self.program.clone()));
        }
        find_in_path(&self.program).ok_or_else(|| MirrorError::MissingTool(self.program.clone()))
    }
}

impl Converter for CommandConverter {
    fn convert(&self, inputs: &[PathBuf], out_dir: &Path) -> Result<Vec<PathBuf>, MirrorError> {
        let program = self.locate()?;
        fs::create_dir_all(out_dir).map_err(|err| MirrorError::Filesystem(err.to_string()))?;
        let before = list_files(out_dir)?;

        let mut cmd = Command::new(&program);
        cmd.args(&self.args).arg("--out").arg(out_dir).args(inputs);
        tracing::debug!(program = %program.display(), inputs = inputs.len(), "running converter");
        let output = cmd
            .output()
            .map_err(|err| MirrorError::Conversion(err.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let message = if stderr.is_empty() {
                format!("command failed: {}", program.display())
            } else {
                stderr
            };
            return Err(MirrorError::Conversion(message));
        }

        let after = list_files(out_dir)?;
        Ok(after.difference(&before).cloned().collect())
    }
}

pub fn expand_gzip(path: &Utf8Path, out_dir: &Utf8Path) -> Result<Utf8PathBuf, MirrorError> {
    let Some(file_name) = path.file_name() else {
        return Err(MirrorError::Filesystem(format!("not a file: {path}")));
    };
    let Some(stem) = file_name.strip_suffix(".gz") else {
        return Ok(path.to_path_buf());
    };

    fs::create_dir_all(out_dir.as_std_path())
        .map_err(|err| MirrorError::Filesystem(err.to_string()))?;
    let target = out_dir.join(stem);
    let source =
        File::open(path.as_std_path()).map_err(|err| MirrorError::Filesystem(err.to_string()))?;
    let mut decoder = GzDecoder::new(BufReader::new(source));
    let mut out = File::create(target.as_std_path())
        .map_err(|err| MirrorError::Filesystem(err.to_string()))?;
    io::copy(&mut decoder, &mut out)
        .map_err(|err| MirrorError::Conversion(format!("expand {path}: {err}")))?;
    Ok(target)
}

fn list_files(dir: &Path) -> Result<BTreeSet<PathBuf>, MirrorError> {
    let entries = fs::read_dir(dir).map_err(|err| MirrorError::Filesystem(err.to_string()))?;
    Ok(entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect())
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.exists() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.exists() {
            return Some(plain);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use assert_matches::assert_matches;
    use flate2::Compression;
    use flate2::write::GzEncoder;

    use super::*;

    #[test]
    fn expands_gzip_keeping_version_prefix() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let source = root.join("GSE1.100.GSE1_family.soft.gz");
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"^SERIES = GSE1\n").unwrap();
        fs::write(source.as_std_path(), encoder.finish().unwrap()).unwrap();

        let expanded = expand_gzip(&source, &root.join("out")).unwrap();
        assert_eq!(expanded.file_name(), Some("GSE1.100.GSE1_family.soft"));
        assert_eq!(
            fs::read_to_string(expanded.as_std_path()).unwrap(),
            "^SERIES = GSE1\n"
        );
    }

    #[test]
    fn plain_files_pass_through() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let source = root.join("GSE1.100.GSE1_family.soft");
        fs::write(source.as_std_path(), b"x").unwrap();
        assert_eq!(expand_gzip(&source, &root.join("out")).unwrap(), source);
    }

    #[test]
    fn missing_program_is_reported() {
        let temp = tempfile::tempdir().unwrap();
        let converter = CommandConverter::new("definitely-not-a-real-converter-xyz", Vec::new());
        assert_matches!(
            converter.convert(&[], temp.path()),
            Err(MirrorError::MissingTool(_))
        );
    }

    #[cfg(unix)]
    #[test]
    fn reports_new_outputs_and_stderr() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::tempdir().unwrap();
        let script = temp.path().join("to-json.sh");
        fs::write(
            &script,
            "#!/bin/sh\nif [ \"$1\" = \"--fail\" ]; then echo boom >&2; exit 1; fi\n\
             shift\nout=\"$1\"\nshift\nfor f in \"$@\"; do touch \"$out/$(basename \"$f\").json\"; done\n",
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        let out_dir = temp.path().join("converted");
        fs::create_dir_all(&out_dir).unwrap();
        fs::write(out_dir.join("existing.json"), b"{}").unwrap();
        let input = temp.path().join("GSE1.100.GSE1_family.soft");
        fs::write(&input, b"x").unwrap();

        let converter = CommandConverter::new(script.display().to_string(), Vec::new());
        let outputs = converter.convert(&[input.clone()], &out_dir).unwrap();
        assert_eq!(
            outputs,
            vec![out_dir.join("GSE1.100.GSE1_family.soft.json")]
        );

        let failing = CommandConverter::new(script.display().to_string(), vec!["--fail".into()]);
        assert_matches!(
            failing.convert(&[input], &out_dir),
            Err(MirrorError::Conversion(message)) if message == "boom"
        );
    }
}
