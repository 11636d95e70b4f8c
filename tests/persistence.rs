//! Local saves, rejected saves, and the remote sink failing underneath.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;

use ellsberg::config::ExperimentConfig;
use ellsberg::design::{BoxChoice, ExperimentDesign, Phase};
use ellsberg::engine::{RoundAdvance, Session};
use ellsberg::persist::{load_results, PersistError, Recorder};
use ellsberg::record::{
    DebriefResponses, ParticipantId, QuestionField, QuestionnaireResponses, QUESTIONNAIRE_COLUMNS, RESULT_COLUMNS,
};
use ellsberg::remote::{RemoteConfig, RemoteError, RemoteHandle, RowBatch, RowTransport};
use ellsberg::retry::RetryConfig;

fn config(dir: &TempDir) -> ExperimentConfig {
    let path = |name: &str| dir.path().join(name).to_string_lossy().to_string();
    ExperimentConfig {
        results_csv: path("results.csv"),
        questionnaire_csv: path("questionnaires.csv"),
        debrief_dir: path(""),
        archive_path: path("archive.sqlite"),
        ..Default::default()
    }
}

fn pid(s: &str) -> ParticipantId {
    ParticipantId::parse(s).unwrap()
}

fn played_phase(participant: &str, phase: Phase) -> Session {
    let mut s = Session::create(pid(participant), ExperimentDesign::default(), 77).unwrap();
    s.reset_for_phase(phase).unwrap();
    loop {
        s.play_round(BoxChoice::B, 0.8).unwrap();
        if s.next_round().unwrap() == RoundAdvance::PhaseComplete {
            break;
        }
    }
    s
}

#[test]
fn saving_nothing_is_rejected_and_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let cfg = config(&dir);
    let recorder = Recorder::new(&cfg);

    assert!(matches!(
        recorder.save_round_data(Some(&pid("1")), &[], None),
        Err(PersistError::NoData)
    ));
    let s = played_phase("1", Phase::One);
    assert!(matches!(
        recorder.save_round_data(None, s.trial_log(), Some(s.initial_probs())),
        Err(PersistError::MissingParticipant)
    ));
    assert!(matches!(
        recorder.save_round_data(Some(&pid("2")), s.trial_log(), None),
        Err(PersistError::ParticipantMismatch { .. })
    ));
    assert!(!dir.path().join("results.csv").exists());
}

#[test]
fn phases_append_under_a_single_header() {
    let dir = TempDir::new().unwrap();
    let cfg = config(&dir);
    let recorder = Recorder::new(&cfg);

    let mut s = played_phase("12", Phase::Two);
    recorder.save_phase(&s.phase_export(Phase::Two).unwrap()).unwrap();
    s.reset_for_phase(Phase::Three).unwrap();
    s.play_round(BoxChoice::A, 1.5).unwrap();
    recorder.save_phase(&s.phase_export(Phase::Three).unwrap()).unwrap();

    let text = std::fs::read_to_string(&cfg.results_csv).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines[0], RESULT_COLUMNS.join(","));
    assert_eq!(lines.len(), 1 + 25 + 1);
    assert_eq!(text.matches("participant_id").count(), 1);

    let rows = load_results(recorder.results_path(), &pid("12")).unwrap();
    assert_eq!(rows.len(), 26);
    // each row carries its own phase's starting snapshot
    let init_two = s.initial_probs()[&Phase::Two];
    let init_three = s.initial_probs()[&Phase::Three];
    assert_eq!(rows[0].1, Some(init_two));
    assert_eq!(rows[25].1, Some(init_three));
    assert_eq!(rows[25].0.phase, Phase::Three);
}

#[test]
fn questionnaire_blanks_and_bad_answers() {
    let dir = TempDir::new().unwrap();
    let cfg = config(&dir);
    let recorder = Recorder::new(&cfg);

    let empty = QuestionnaireResponses::new();
    assert!(matches!(
        recorder.save_questionnaire(Some(&pid("4")), Some(Phase::One), &empty),
        Err(PersistError::NoResponses)
    ));
    let partial = QuestionnaireResponses::new().with(QuestionField::Stress, "3");
    assert!(matches!(
        recorder.save_questionnaire(Some(&pid("4")), None, &partial),
        Err(PersistError::MissingPhase)
    ));
    let bad = QuestionnaireResponses::new().with(QuestionField::Confidence, "9");
    assert!(matches!(
        recorder.save_questionnaire(Some(&pid("4")), Some(Phase::One), &bad),
        Err(PersistError::Questionnaire(_))
    ));
    let off_phase = QuestionnaireResponses::new().with(QuestionField::Mechanism, "none");
    assert!(recorder
        .save_questionnaire(Some(&pid("4")), Some(Phase::One), &off_phase)
        .is_err());

    recorder
        .save_questionnaire(Some(&pid("4")), Some(Phase::One), &partial)
        .unwrap();
    let text = std::fs::read_to_string(&cfg.questionnaire_csv).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0], QUESTIONNAIRE_COLUMNS.join(","));
    // unanswered columns stay blank
    let fields: Vec<&str> = lines[1].split(',').collect();
    assert_eq!(fields.len(), QUESTIONNAIRE_COLUMNS.len());
    assert_eq!(fields.iter().filter(|f| !f.is_empty()).count(), 3);
}

#[test]
fn debrief_gets_its_own_file() {
    let dir = TempDir::new().unwrap();
    let recorder = Recorder::new(&config(&dir));
    let debrief = DebriefResponses {
        overall_stress: 2,
        overall_confidence: 5,
        phase_preference: "1".into(),
        final_strategy: "mostly A, then \"gambled\"".into(),
        comments: String::new(),
    };
    let path = recorder.save_debrief(&pid("31"), &debrief).unwrap();
    assert!(path.file_name().unwrap().to_string_lossy().starts_with("debrief_pid31_"));
    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains("\"mostly A, then \"\"gambled\"\"\""));

    let bad = DebriefResponses {
        overall_stress: 0,
        ..debrief
    };
    assert!(recorder.save_debrief(&pid("31"), &bad).is_err());
}

struct Down {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl RowTransport for Down {
    async fn append_rows(&self, _batch: &RowBatch) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(RemoteError::Unavailable("connection refused".into()).into())
    }
}

#[tokio::test]
async fn remote_failure_never_touches_the_local_save() {
    let dir = TempDir::new().unwrap();
    let cfg = config(&dir);
    let calls = Arc::new(AtomicUsize::new(0));
    let (handle, mut status) = RemoteHandle::spawn(
        Down { calls: calls.clone() },
        RemoteConfig {
            retry: RetryConfig {
                max_retries: 2,
                base_delay_ms: 1,
                max_delay_ms: 2,
                jitter_factor: 0.0,
            },
            breaker_threshold: 5,
            breaker_cooldown: 1,
        },
    );
    let recorder = Recorder::new(&cfg).with_remote(handle);

    let s = played_phase("9", Phase::Three);
    let mut init = BTreeMap::new();
    init.insert(Phase::Three, s.initial_probs()[&Phase::Three]);
    let written = recorder.save_round_data(Some(&pid("9")), s.trial_log(), Some(&init)).unwrap();
    assert_eq!(written, 25);
    recorder.close().await;

    assert!(status.recv().await.is_some());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let rows = load_results(std::path::Path::new(&cfg.results_csv), &pid("9")).unwrap();
    assert_eq!(rows.len(), 25);
}

#[test]
fn unwritable_results_file_keeps_phase_for_retry_and_fallback() {
    let dir = TempDir::new().unwrap();
    let mut cfg = config(&dir);
    // a directory where the results file should be: every append fails
    let blocked = dir.path().join("blocked.csv");
    std::fs::create_dir(&blocked).unwrap();
    cfg.results_csv = blocked.to_string_lossy().to_string();
    let recorder = Recorder::new(&cfg);

    let s = played_phase("21", Phase::Two);
    let export = s.phase_export(Phase::Two).unwrap();
    let err = recorder.save_phase(&export).unwrap_err();
    assert!(matches!(err, PersistError::Io { .. }));
    assert!(err.is_retryable());
    assert!(!PersistError::NoData.is_retryable());

    // nothing in memory was lost; the same export saves again
    assert_eq!(s.phase_export(Phase::Two).unwrap(), export);
    assert!(recorder.save_phase(&export).unwrap_err().is_retryable());

    let path = recorder.export_fallback(&export).unwrap();
    assert!(path
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("results_phase2_pid21_"));
    let rows = load_results(&path, &pid("21")).unwrap();
    assert_eq!(rows.len(), 25);
    assert_eq!(rows[0].1, Some(export.initial));
    assert_eq!(rows[24].0.cumulative_earnings, s.cumulative_earnings());

    // once the file is writable again the retry goes through
    cfg.results_csv = dir.path().join("results.csv").to_string_lossy().to_string();
    assert_eq!(Recorder::new(&cfg).save_phase(&export).unwrap(), 25);
}
