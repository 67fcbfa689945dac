//! Per-Epoch Checkpoint Writing
//!
//! After every epoch the orchestrator hands the coupling matrix and the
//! frozen exercise index map to a [`CheckpointSink`]. The file sink writes a
//! JSON snapshot (machine-readable, enough to restart a run by hand) and a
//! companion CSV table for eyeballing: one line per exercise with its bias
//! and per-dimension couplings, sorted by bias ascending.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;

use serde::{Deserialize, Serialize};

use crate::error::TrainError;
use crate::ingest::ExerciseIndexer;
use crate::types::CouplingMatrix;

/// Destination for per-epoch snapshots.
pub trait CheckpointSink {
    fn write(
        &self,
        epoch: usize,
        couplings: &CouplingMatrix,
        indexer: &ExerciseIndexer,
    ) -> Result<(), TrainError>;
}

/// Discards checkpoints; used in tests and dry runs.
pub struct NoopCheckpoint;

impl CheckpointSink for NoopCheckpoint {
    fn write(&self, _: usize, _: &CouplingMatrix, _: &ExerciseIndexer) -> Result<(), TrainError> {
        Ok(())
    }
}

/// One serialized checkpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub epoch: usize,
    pub couplings: CouplingMatrix,
    pub exercise_index: BTreeMap<String, usize>,
}

/// Writes `{prefix}_epoch={n}.json` and `{prefix}_epoch={n}.csv`.
pub struct FileCheckpoint {
    prefix: String,
}

impl FileCheckpoint {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn write_snapshot(
        &self,
        epoch: usize,
        couplings: &CouplingMatrix,
        indexer: &ExerciseIndexer,
    ) -> Result<(), TrainError> {
        let snapshot = Snapshot {
            epoch,
            couplings: couplings.clone(),
            exercise_index: indexer.entries().into_iter().collect(),
        };
        let path = format!("{}_epoch={epoch}.json", self.prefix);
        let json = serde_json::to_string(&snapshot)
            .map_err(|e| TrainError::Checkpoint(e.to_string()))?;
        fs::write(&path, json).map_err(|e| TrainError::Checkpoint(format!("{path}: {e}")))?;
        Ok(())
    }

    fn write_report(
        &self,
        epoch: usize,
        couplings: &CouplingMatrix,
        indexer: &ExerciseIndexer,
    ) -> Result<(), TrainError> {
        let path = format!("{}_epoch={epoch}.csv", self.prefix);
        let mut rows: Vec<(f64, usize, String)> = indexer
            .entries()
            .into_iter()
            .map(|(name, ind)| (couplings.bias(ind), ind, name))
            .collect();
        rows.sort_by(|a, b| a.0.total_cmp(&b.0));

        let num_dims = couplings.cols() - 1;
        let mut out = String::new();
        out.push_str("bias");
        for dim in 0..num_dims {
            out.push_str(&format!(",coupling_{dim}"));
        }
        out.push_str(",exercise\n");
        for (bias, ind, name) in rows {
            let mut line = format!("{bias}");
            for &w in &couplings.row(ind)[..num_dims] {
                line.push_str(&format!(",{w}"));
            }
            out.push_str(&format!("{line},{name}\n"));
        }

        let mut file =
            fs::File::create(&path).map_err(|e| TrainError::Checkpoint(format!("{path}: {e}")))?;
        file.write_all(out.as_bytes())
            .map_err(|e| TrainError::Checkpoint(format!("{path}: {e}")))?;
        Ok(())
    }
}

impl CheckpointSink for FileCheckpoint {
    fn write(
        &self,
        epoch: usize,
        couplings: &CouplingMatrix,
        indexer: &ExerciseIndexer,
    ) -> Result<(), TrainError> {
        self.write_snapshot(epoch, couplings, indexer)?;
        self.write_report(epoch, couplings, indexer)
    }
}
