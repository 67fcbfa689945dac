//! Data Ingestion and Exercise Indexing
//!
//! Parses line-oriented attempt logs into per-user training state and assigns
//! dense integer indices to exercise identifiers in first-seen order.
//!
//! Record format: fields separated by tab or `\x01` (so the same code works
//! whether the log arrives via Hive export or a plain pipe). Field positions
//! are fixed: user, rowtype, exercise, correct, eventually_correct,
//! problem_number, number_attempts, number_hints, time_taken. Only rows whose
//! rowtype is `problemlog` are retained; every retained field must parse, and
//! a malformed row aborts the run.
//!
//! Precondition: all records for a given user are contiguous in the input.
//! Grouping closes a user's state the moment a different user id appears, so
//! non-contiguous records for one user silently produce multiple disjoint
//! states for that user.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::error::TrainError;
use crate::sampler::randn;
use crate::types::{CouplingMatrix, TrainConfig, UserState};

/// Rowtype discriminator for problem-attempt records
pub const ROWTYPE_PROBLEM_LOG: &str = "problemlog";

const FIELD_USER: usize = 0;
const FIELD_ROWTYPE: usize = 1;
const FIELD_EXERCISE: usize = 2;
const FIELD_CORRECT: usize = 3;
const FIELD_EVENTUALLY_CORRECT: usize = 4;
const FIELD_PROBLEM_NUMBER: usize = 5;
const FIELD_NUMBER_ATTEMPTS: usize = 6;
const FIELD_NUMBER_HINTS: usize = 7;
const FIELD_TIME_TAKEN: usize = 8;

/// Field count required of a `problemlog` row
const NUM_PROBLEM_LOG_FIELDS: usize = 9;

// ==================== Exercise Indexer ====================

/// Registry assigning dense indices to exercise identifiers.
///
/// Indices are handed out in first-sighting order and are monotonically
/// increasing. Once ingestion completes the registry is frozen; the index map
/// then sizes the coupling matrix and never changes for the rest of the run.
#[derive(Clone, Debug, Default)]
pub struct ExerciseIndexer {
    map: HashMap<String, usize>,
    frozen: bool,
}

impl ExerciseIndexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the index for `name`, assigning the next free index on first
    /// sighting.
    ///
    /// # Panics
    ///
    /// Panics if a new identifier appears after the registry was frozen.
    pub fn assign(&mut self, name: &str) -> usize {
        if let Some(&ind) = self.map.get(name) {
            return ind;
        }
        assert!(
            !self.frozen,
            "exercise indexer is frozen; new identifier {name:?} cannot be assigned"
        );
        let ind = self.map.len();
        self.map.insert(name.to_string(), ind);
        ind
    }

    /// Looks up an identifier without assigning.
    pub fn get(&self, name: &str) -> Option<usize> {
        self.map.get(name).copied()
    }

    /// Number of distinct exercises seen so far.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Marks the registry immutable.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// (identifier, index) pairs sorted by index.
    pub fn entries(&self) -> Vec<(String, usize)> {
        let mut entries: Vec<(String, usize)> =
            self.map.iter().map(|(k, &v)| (k.clone(), v)).collect();
        entries.sort_by_key(|&(_, ind)| ind);
        entries
    }
}

// ==================== Record parsing ====================

/// One parsed `problemlog` row.
#[derive(Clone, Debug, PartialEq)]
pub struct ProblemLog {
    pub user: String,
    pub exercise: String,
    pub correct: bool,
    pub eventually_correct: bool,
    pub problem_number: u32,
    pub number_attempts: u32,
    pub number_hints: u32,
    pub time_taken: f64,
}

fn split_fields(line: &str) -> Vec<&str> {
    line.trim_end_matches(['\r', '\n'])
        .split(['\t', '\x01'])
        .collect()
}

fn parse_bool(raw: &str, line_no: usize, field: &str) -> Result<bool, TrainError> {
    match raw {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(TrainError::ingest(
            line_no,
            format!("field {field} is not a boolean: {raw:?}"),
        )),
    }
}

fn parse_u32(raw: &str, line_no: usize, field: &str) -> Result<u32, TrainError> {
    raw.parse().map_err(|_| {
        TrainError::ingest(line_no, format!("field {field} is not an integer: {raw:?}"))
    })
}

fn parse_f64(raw: &str, line_no: usize, field: &str) -> Result<f64, TrainError> {
    raw.parse().map_err(|_| {
        TrainError::ingest(line_no, format!("field {field} is not a number: {raw:?}"))
    })
}

/// Parses one input line.
///
/// Returns the user id for grouping plus the parsed attempt when the row is a
/// `problemlog`; other rowtypes yield `None` for the attempt and are skipped.
fn parse_line(line: &str, line_no: usize) -> Result<(String, Option<ProblemLog>), TrainError> {
    let fields = split_fields(line);
    if fields.len() <= FIELD_ROWTYPE {
        return Err(TrainError::ingest(
            line_no,
            format!("expected at least 2 fields, got {}", fields.len()),
        ));
    }
    let user = fields[FIELD_USER].to_string();
    if fields[FIELD_ROWTYPE] != ROWTYPE_PROBLEM_LOG {
        return Ok((user, None));
    }
    if fields.len() < NUM_PROBLEM_LOG_FIELDS {
        return Err(TrainError::ingest(
            line_no,
            format!(
                "problemlog row has {} fields, expected {}",
                fields.len(),
                NUM_PROBLEM_LOG_FIELDS
            ),
        ));
    }
    let log = ProblemLog {
        user: user.clone(),
        exercise: fields[FIELD_EXERCISE].to_string(),
        correct: parse_bool(fields[FIELD_CORRECT], line_no, "correct")?,
        eventually_correct: parse_bool(
            fields[FIELD_EVENTUALLY_CORRECT],
            line_no,
            "eventually_correct",
        )?,
        problem_number: parse_u32(fields[FIELD_PROBLEM_NUMBER], line_no, "problem_number")?,
        number_attempts: parse_u32(fields[FIELD_NUMBER_ATTEMPTS], line_no, "number_attempts")?,
        number_hints: parse_u32(fields[FIELD_NUMBER_HINTS], line_no, "number_hints")?,
        time_taken: parse_f64(fields[FIELD_TIME_TAKEN], line_no, "time_taken")?,
    };
    Ok((user, Some(log)))
}

// ==================== Ingestion ====================

fn flush_user(
    attempts: &mut Vec<(bool, usize)>,
    num_abilities: usize,
    rng: &mut ChaCha8Rng,
    states: &mut Vec<UserState>,
) {
    if attempts.is_empty() {
        return;
    }
    let (correct, exercise_ind): (Vec<bool>, Vec<usize>) = attempts.drain(..).unzip();
    let abilities = (0..num_abilities).map(|_| randn(rng)).collect();
    states.push(UserState::new(correct, exercise_ind, abilities));
}

fn ingest_pass(
    raw: &str,
    num_abilities: usize,
    indexer: &mut ExerciseIndexer,
    rng: &mut ChaCha8Rng,
    states: &mut Vec<UserState>,
) -> Result<(), TrainError> {
    let mut prev_user: Option<String> = None;
    let mut attempts: Vec<(bool, usize)> = Vec::new();

    for (ind, line) in raw.lines().enumerate() {
        if line.is_empty() {
            continue;
        }
        let line_no = ind + 1;
        let (user, log) = parse_line(line, line_no)?;
        if prev_user.as_deref() != Some(user.as_str()) {
            flush_user(&mut attempts, num_abilities, rng, states);
        }
        prev_user = Some(user);
        if let Some(log) = log {
            let exercise_ind = indexer.assign(&log.exercise);
            attempts.push((log.correct, exercise_ind));
        }
    }
    flush_user(&mut attempts, num_abilities, rng, states);
    Ok(())
}

/// Loads the full training set from `path`.
///
/// The input is replayed `num_replicas` times, inflating the effective sample
/// count when data is scarce (each replica contributes its own user states,
/// while exercise indices stay identical across replicas). Returns the user
/// states, the frozen index registry, and a zero coupling matrix sized to
/// exactly the distinct exercises observed.
pub fn load_training_data(
    path: &Path,
    config: &TrainConfig,
    indexer: &mut ExerciseIndexer,
) -> Result<(Vec<UserState>, CouplingMatrix), TrainError> {
    let raw = fs::read_to_string(path)?;
    let states = ingest_replicas(&raw, config, indexer)?;
    let couplings = CouplingMatrix::zeros(indexer.len(), config.num_couplings());
    Ok((states, couplings))
}

/// Ingests already-loaded input text; see [`load_training_data`].
pub fn ingest_replicas(
    raw: &str,
    config: &TrainConfig,
    indexer: &mut ExerciseIndexer,
) -> Result<Vec<UserState>, TrainError> {
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let mut states = Vec::new();
    for _ in 0..config.num_replicas {
        ingest_pass(raw, config.num_abilities, indexer, &mut rng, &mut states)?;
    }
    indexer.freeze();
    Ok(states)
}
