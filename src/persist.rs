//! Saving trial and questionnaire data.
//!
//! The local CSV write is the durable save and its errors reach the caller.
//! The remote sink is a secondary copy: rows are queued after the local
//! write succeeds and never affect the result.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::ExperimentConfig;
use crate::design::{Phase, ProbSnapshot};
use crate::engine::PhaseExport;
use crate::logging;
use crate::record::{
    csv_line, split_csv_line, DebriefResponses, ParticipantId, QuestionnaireError, QuestionnaireResponses, TrialRecord,
    DEBRIEF_COLUMNS, QUESTIONNAIRE_COLUMNS, RESULT_COLUMNS,
};
use crate::remote::{RemoteHandle, RowBatch, Sheet};

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("no trial data provided for saving")]
    NoData,
    #[error("no participant id provided for saving")]
    MissingParticipant,
    #[error("no phase provided for questionnaire")]
    MissingPhase,
    #[error("no questionnaire responses provided")]
    NoResponses,
    #[error("record for participant {found} saved under participant {expected}")]
    ParticipantMismatch { expected: ParticipantId, found: ParticipantId },
    #[error(transparent)]
    Questionnaire(#[from] QuestionnaireError),
    #[error("{path}:{line}: {reason}")]
    BadRow { path: String, line: usize, reason: String },
    #[error("cannot access {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl PersistError {
    /// The file system refused the write; the same rows can be saved again.
    /// Every other variant is a rejected call that would fail identically.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PersistError::Io { .. })
    }
}

/// Append-only CSV file; the header goes in only when the file is new or
/// empty.
#[derive(Debug, Clone)]
pub struct CsvSink {
    path: PathBuf,
}

impl CsvSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, header: &[&str], rows: &[Vec<String>]) -> Result<usize, PersistError> {
        let io_err = |source| PersistError::Io {
            path: self.path.to_string_lossy().to_string(),
            source,
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err)?;
        let write_header = file.metadata().map_err(io_err)?.len() == 0;

        // One buffer, one write: a failed save leaves no partial rows.
        let mut out = String::new();
        if write_header {
            out.push_str(&csv_line(header));
            out.push('\n');
        }
        for row in rows {
            out.push_str(&csv_line(row.as_slice()));
            out.push('\n');
        }
        file.write_all(out.as_bytes()).map_err(io_err)?;
        file.flush().map_err(io_err)?;
        Ok(rows.len())
    }
}

pub struct Recorder {
    results: CsvSink,
    questionnaires: CsvSink,
    debrief_dir: PathBuf,
    remote: Option<RemoteHandle>,
}

impl Recorder {
    pub fn new(cfg: &ExperimentConfig) -> Self {
        Self {
            results: CsvSink::new(&cfg.results_csv),
            questionnaires: CsvSink::new(&cfg.questionnaire_csv),
            debrief_dir: PathBuf::from(&cfg.debrief_dir),
            remote: None,
        }
    }

    pub fn with_remote(mut self, remote: RemoteHandle) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Append trial rows, each with the initial snapshot of its own phase.
    pub fn save_round_data(
        &self,
        participant_id: Option<&ParticipantId>,
        records: &[TrialRecord],
        initial_probs: Option<&BTreeMap<Phase, ProbSnapshot>>,
    ) -> Result<usize, PersistError> {
        let participant_id = participant_id.ok_or_else(|| reject("results", PersistError::MissingParticipant))?;
        if records.is_empty() {
            return Err(reject("results", PersistError::NoData));
        }
        if let Some(other) = records.iter().find(|r| &r.participant_id != participant_id) {
            return Err(reject(
                "results",
                PersistError::ParticipantMismatch {
                    expected: participant_id.clone(),
                    found: other.participant_id.clone(),
                },
            ));
        }

        let rows: Vec<Vec<String>> = records
            .iter()
            .map(|r| r.to_row(initial_probs.and_then(|m| m.get(&r.phase))))
            .collect();
        let written = self.results.append(&RESULT_COLUMNS, &rows)?;
        logging::log_persist("results", &self.results.path.to_string_lossy(), written);

        self.forward(Sheet::Results, &RESULT_COLUMNS, rows);
        Ok(written)
    }

    pub fn save_phase(&self, export: &PhaseExport) -> Result<usize, PersistError> {
        let mut initial = BTreeMap::new();
        initial.insert(export.phase, export.initial);
        self.save_round_data(Some(&export.participant_id), &export.records, Some(&initial))
    }

    pub fn save_questionnaire(
        &self,
        participant_id: Option<&ParticipantId>,
        phase: Option<Phase>,
        responses: &QuestionnaireResponses,
    ) -> Result<(), PersistError> {
        let participant_id = participant_id.ok_or_else(|| reject("questionnaire", PersistError::MissingParticipant))?;
        let phase = phase.ok_or_else(|| reject("questionnaire", PersistError::MissingPhase))?;
        if responses.is_empty() {
            return Err(reject("questionnaire", PersistError::NoResponses));
        }
        responses
            .validate(phase)
            .map_err(|e| reject("questionnaire", e.into()))?;

        let rows = vec![responses.to_row(participant_id, phase)];
        self.questionnaires.append(&QUESTIONNAIRE_COLUMNS, &rows)?;
        logging::log_persist("questionnaire", &self.questionnaires.path.to_string_lossy(), 1);

        self.forward(Sheet::Questionnaires, &QUESTIONNAIRE_COLUMNS, rows);
        Ok(())
    }

    /// Debriefs go to their own file per participant:
    /// `debrief_pid{id}_{YYYYmmdd_HHMMSS}.csv`.
    pub fn save_debrief(&self, participant_id: &ParticipantId, debrief: &DebriefResponses) -> Result<PathBuf, PersistError> {
        debrief.validate().map_err(|e| reject("debrief", e.into()))?;
        let path = self.debrief_dir.join(unique_filename("debrief", participant_id));
        let sink = CsvSink::new(&path);
        sink.append(&DEBRIEF_COLUMNS, &[debrief.to_row(participant_id)])?;
        logging::log_persist("debrief", &path.to_string_lossy(), 1);
        Ok(path)
    }

    /// Write one phase to its own file next to the debriefs, for when the
    /// shared results file cannot be appended to. Same columns, so
    /// `load_results` reads it back.
    pub fn export_fallback(&self, export: &PhaseExport) -> Result<PathBuf, PersistError> {
        if export.records.is_empty() {
            return Err(reject("results_fallback", PersistError::NoData));
        }
        let base = format!("results_phase{}", export.phase);
        let path = self.debrief_dir.join(unique_filename(&base, &export.participant_id));
        let rows: Vec<Vec<String>> = export
            .records
            .iter()
            .map(|r| r.to_row(Some(&export.initial)))
            .collect();
        let written = CsvSink::new(&path).append(&RESULT_COLUMNS, &rows)?;
        logging::log_persist("results_fallback", &path.to_string_lossy(), written);
        Ok(path)
    }

    pub fn results_path(&self) -> &Path {
        self.results.path()
    }

    /// Drain queued remote batches.
    pub async fn close(self) {
        if let Some(remote) = self.remote {
            remote.shutdown().await;
        }
    }

    fn forward(&self, sheet: Sheet, header: &[&str], rows: Vec<Vec<String>>) {
        if let Some(remote) = &self.remote {
            remote.sink.submit(RowBatch {
                sheet,
                header: header.iter().map(|h| h.to_string()).collect(),
                rows,
            });
        }
    }
}

pub fn unique_filename(base: &str, participant_id: &ParticipantId) -> String {
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    format!("{}_pid{}_{}.csv", base, participant_id, stamp)
}

/// Every results row for `participant_id`, in file order, with the initial
/// snapshot its row carried.
pub fn load_results(
    path: &Path,
    participant_id: &ParticipantId,
) -> Result<Vec<(TrialRecord, Option<ProbSnapshot>)>, PersistError> {
    let display = path.to_string_lossy().to_string();
    let text = std::fs::read_to_string(path).map_err(|source| PersistError::Io {
        path: display.clone(),
        source,
    })?;
    let mut out = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        if idx == 0 || line.trim().is_empty() {
            continue;
        }
        let fields = split_csv_line(line);
        if fields.first().map(|f| f.as_str()) != Some(participant_id.as_str()) {
            continue;
        }
        let row = TrialRecord::from_row(&fields).map_err(|reason| PersistError::BadRow {
            path: display.clone(),
            line: idx + 1,
            reason,
        })?;
        out.push(row);
    }
    Ok(out)
}

fn reject(target: &str, err: PersistError) -> PersistError {
    logging::log_persist_rejected(target, &err.to_string());
    err
}
