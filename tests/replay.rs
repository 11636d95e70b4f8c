//! A saved and archived session can be rebuilt from seed plus choices.

use tempfile::TempDir;

use ellsberg::analysis::{choices_from_log, replay, session_digest, verify_replay, ReplayError};
use ellsberg::config::ExperimentConfig;
use ellsberg::design::{BoxChoice, ExperimentDesign};
use ellsberg::engine::{RoundAdvance, Session};
use ellsberg::persist::{load_results, Recorder};
use ellsberg::record::{ParticipantId, TrialRecord};
use ellsberg::storage::SessionArchive;

fn run_and_save(cfg: &ExperimentConfig, recorder: &Recorder, participant: &ParticipantId) -> Session {
    let seed = cfg.session_seed(participant);
    let mut s = Session::create(participant.clone(), cfg.design.clone(), seed).unwrap();
    for phase in s.phase_order() {
        s.reset_for_phase(phase).unwrap();
        let mut n = 0u32;
        loop {
            n += 1;
            let choice = if n % 3 == 0 { BoxChoice::A } else { BoxChoice::B };
            s.play_round(choice, 0.25 * n as f64 + 0.0004).unwrap();
            if s.next_round().unwrap() == RoundAdvance::PhaseComplete {
                break;
            }
        }
        recorder.save_phase(&s.phase_export(phase).unwrap()).unwrap();
    }
    s
}

#[test]
fn archived_session_replays_from_the_results_file() {
    let dir = TempDir::new().unwrap();
    let cfg = ExperimentConfig {
        base_seed: Some(31337),
        results_csv: dir.path().join("results.csv").to_string_lossy().to_string(),
        archive_path: dir.path().join("archive.sqlite").to_string_lossy().to_string(),
        ..Default::default()
    };
    let recorder = Recorder::new(&cfg);
    let mut archive = SessionArchive::new(&cfg.archive_path).unwrap();
    archive.init().unwrap();

    let participant = ParticipantId::parse("1001").unwrap();
    let other = ParticipantId::parse("1002").unwrap();
    let session = run_and_save(&cfg, &recorder, &participant);
    run_and_save(&cfg, &recorder, &other);
    let digest = session_digest(session.trial_log(), session.initial_probs());
    archive.archive_session(&session.archive_record(digest.clone())).unwrap();

    let stored = archive.latest_session(&participant).unwrap().unwrap();
    assert_eq!(stored.seed, session.seed());
    assert_eq!(stored.rounds_played, 75);

    let recorded: Vec<TrialRecord> = load_results(recorder.results_path(), &participant)
        .unwrap()
        .into_iter()
        .map(|(r, _)| r)
        .collect();
    assert_eq!(recorded.len(), 75);

    let rebuilt = replay(
        &cfg.design,
        &participant,
        stored.seed,
        Some(stored.phase_order),
        &choices_from_log(&recorded),
    )
    .unwrap();
    verify_replay(&recorded, rebuilt.trial_log()).unwrap();
    assert_eq!(rebuilt.cumulative_earnings(), stored.cumulative_earnings);
    assert_eq!(session_digest(rebuilt.trial_log(), rebuilt.initial_probs()), stored.digest);
}

#[test]
fn pinned_seed_gives_the_same_session_twice() {
    let cfg = ExperimentConfig {
        base_seed: Some(7),
        ..Default::default()
    };
    let p = ParticipantId::parse("55").unwrap();
    let a = Session::create(p.clone(), ExperimentDesign::default(), cfg.session_seed(&p)).unwrap();
    let b = Session::create(p.clone(), ExperimentDesign::default(), cfg.session_seed(&p)).unwrap();
    assert_eq!(a.seed(), b.seed());
    assert_eq!(a.phase_order(), b.phase_order());
}

#[test]
fn wrong_phase_order_is_refused() {
    let p = ParticipantId::parse("8").unwrap();
    let order = Session::create(p.clone(), ExperimentDesign::default(), 12).unwrap().phase_order();
    let wrong = [order[1], order[0], order[2]];
    let result = replay(&ExperimentDesign::default(), &p, 12, Some(wrong), &Default::default());
    assert!(matches!(result, Err(ReplayError::PhaseOrder { .. })));
}

#[test]
fn partial_session_replays_up_to_where_it_stopped() {
    let p = ParticipantId::parse("9").unwrap();
    let mut s = Session::create(p.clone(), ExperimentDesign::default(), 4).unwrap();
    let first = s.phase_order()[0];
    s.reset_for_phase(first).unwrap();
    for _ in 0..7 {
        s.play_round(BoxChoice::B, 1.0).unwrap();
        s.next_round().unwrap();
    }
    assert_eq!(s.phase_records(first).count(), 7);
    let again = replay(&ExperimentDesign::default(), &p, 4, None, &choices_from_log(s.trial_log())).unwrap();
    assert_eq!(again.trial_log(), s.trial_log());
    assert!(!again.is_finished());
}
