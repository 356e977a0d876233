//! JSONL export artifact: one serialized [`ChunkRecord`] per line.
//!
//! The artifact is written under a `.partial` name and renamed into place
//! by [`ExportWriter::finish`], so a reader never observes a half-written
//! file.
//!
//! Record ids pruned from the warehouse during the run (chunks of a
//! document that shrank) go to a sidecar, `documents_<ts>.removed.txt`,
//! one id per line. The sidecar is only written when there is something to
//! remove, and always before the artifact itself is renamed into place.

use chrono::{DateTime, Utc};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::{PipelineError, Result};
use crate::models::ChunkRecord;

/// A finalized export file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportArtifact {
    pub path: PathBuf,
    pub records: usize,
    /// Record ids listed in the removal sidecar.
    pub removed: usize,
}

/// `documents_<YYYYmmdd_HHMMSS>.jsonl`
pub fn artifact_name(at: DateTime<Utc>) -> String {
    format!("documents_{}.jsonl", at.format("%Y%m%d_%H%M%S"))
}

/// The removal sidecar belonging to `artifact`.
pub fn removed_ids_path(artifact: &Path) -> PathBuf {
    artifact.with_extension("removed.txt")
}

pub struct ExportWriter {
    final_path: PathBuf,
    partial_path: PathBuf,
    writer: BufWriter<File>,
    records: usize,
    removed: Vec<String>,
}

impl ExportWriter {
    pub fn create(dir: &Path, at: DateTime<Utc>) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let final_path = dir.join(artifact_name(at));
        let partial_path = final_path.with_extension("jsonl.partial");
        let file = File::create(&partial_path)?;
        Ok(Self {
            final_path,
            partial_path,
            writer: BufWriter::new(file),
            records: 0,
            removed: Vec::new(),
        })
    }

    pub fn write(&mut self, record: &ChunkRecord) -> Result<()> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n")?;
        self.records += 1;
        Ok(())
    }

    pub fn write_all<'a>(&mut self, records: impl IntoIterator<Item = &'a ChunkRecord>) -> Result<()> {
        for record in records {
            self.write(record)?;
        }
        Ok(())
    }

    /// Note record ids that no longer exist and must leave the index.
    pub fn record_removed(&mut self, ids: impl IntoIterator<Item = String>) {
        self.removed.extend(ids);
    }

    pub fn finish(mut self) -> Result<ExportArtifact> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        let sidecar_path = removed_ids_path(&self.final_path);
        if self.removed.is_empty() {
            // A same-second rerun must not inherit an earlier run's removals.
            match std::fs::remove_file(&sidecar_path) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
        } else {
            let mut sidecar = BufWriter::new(File::create(&sidecar_path)?);
            for id in &self.removed {
                writeln!(sidecar, "{}", id)?;
            }
            sidecar.flush()?;
            sidecar.get_ref().sync_all()?;
        }
        std::fs::rename(&self.partial_path, &self.final_path)?;
        Ok(ExportArtifact {
            path: self.final_path,
            records: self.records,
            removed: self.removed.len(),
        })
    }
}

/// Read every record of an artifact. Blank lines are ignored.
pub fn read_artifact(path: &Path) -> Result<Vec<ChunkRecord>> {
    let file = File::open(path)?;
    let mut records = Vec::new();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line).map_err(|e| {
            PipelineError::Config(format!("{} line {}: {}", path.display(), n + 1, e))
        })?;
        records.push(record);
    }
    Ok(records)
}

/// Record ids the run behind `artifact` removed; empty without a sidecar.
pub fn read_removed_ids(artifact: &Path) -> Result<Vec<String>> {
    let path = removed_ids_path(artifact);
    let file = match File::open(&path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut ids = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let id = line.trim();
        if !id.is_empty() {
            ids.push(id.to_string());
        }
    }
    Ok(ids)
}
