//! Per-phase summaries and deterministic replay of logged sessions.
//!
//! A session is fully determined by (design, participant, seed, choices):
//! the seed fixes the phase order and each phase's draw stream. `replay`
//! rebuilds the log from those inputs and `verify_replay` compares it with
//! what was persisted.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::design::{BoxChoice, ExperimentDesign, Outcome, Phase, ProbSnapshot, PHASE_COUNT};
use crate::engine::{EngineError, RoundAdvance, Session};
use crate::record::{csv_line, round3, ParticipantId, TrialRecord};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseSummary {
    pub phase: Phase,
    pub rounds: usize,
    pub picks_a: usize,
    pub picks_b: usize,
    /// Share of rounds on Box B; above 0.5 reads as ambiguity seeking.
    pub share_b: f64,
    pub earnings: i64,
    pub reds: usize,
    pub blacks: usize,
    pub golds: usize,
    pub silvers: usize,
    /// Times the participant changed box from one round to the next.
    pub switches: usize,
    pub mean_decision_time: f64,
    pub initial: ProbSnapshot,
    /// Probabilities at the last draw of the phase.
    pub last: ProbSnapshot,
}

impl PhaseSummary {
    pub fn drift(&self) -> ProbSnapshot {
        ProbSnapshot {
            p_safe: self.last.p_safe - self.initial.p_safe,
            p_uncertain: self.last.p_uncertain - self.initial.p_uncertain,
        }
    }
}

/// Summary of one phase's records; `None` when the phase has none.
pub fn summarize_phase(phase: Phase, records: &[TrialRecord], initial: ProbSnapshot) -> Option<PhaseSummary> {
    let rows: Vec<&TrialRecord> = records.iter().filter(|r| r.phase == phase).collect();
    let last = rows.last()?;

    let count = |pred: &dyn Fn(&TrialRecord) -> bool| rows.iter().filter(|r| pred(r)).count();
    let picks_b = count(&|r| r.box_chosen == BoxChoice::B);
    let switches = rows
        .windows(2)
        .filter(|w| w[0].box_chosen != w[1].box_chosen)
        .count();
    let total_time: f64 = rows.iter().map(|r| r.decision_time).sum();

    Some(PhaseSummary {
        phase,
        rounds: rows.len(),
        picks_a: rows.len() - picks_b,
        picks_b,
        share_b: picks_b as f64 / rows.len() as f64,
        earnings: rows.iter().map(|r| r.reward).sum(),
        reds: count(&|r| r.outcome == Outcome::Red),
        blacks: count(&|r| r.outcome == Outcome::Black),
        golds: count(&|r| r.outcome == Outcome::Gold),
        silvers: count(&|r| r.outcome == Outcome::Silver),
        switches,
        mean_decision_time: total_time / rows.len() as f64,
        initial,
        last: ProbSnapshot {
            p_safe: last.p_safe,
            p_uncertain: last.p_uncertain,
        },
    })
}

/// Summaries in the order the phases were played.
pub fn summarize_session<R>(session: &Session<R>) -> Vec<PhaseSummary>
where
    R: crate::rng::RandomSource,
{
    session
        .phase_order()
        .iter()
        .filter_map(|phase| {
            let initial = *session.initial_probs().get(phase)?;
            summarize_phase(*phase, session.trial_log(), initial)
        })
        .collect()
}

/// Hex SHA-256 over the persisted rows of a log, in order.
pub fn session_digest(records: &[TrialRecord], initial_probs: &BTreeMap<Phase, ProbSnapshot>) -> String {
    let mut hasher = Sha256::new();
    for r in records {
        hasher.update(csv_line(r.to_row(initial_probs.get(&r.phase)).as_slice()).as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

// =============================================================================
// Replay
// =============================================================================

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReplayError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("phase order {recorded:?} does not follow from the seed (got {replayed:?})")]
    PhaseOrder {
        recorded: [Phase; PHASE_COUNT],
        replayed: [Phase; PHASE_COUNT],
    },
    #[error("phase {phase} has {got} choices, expected {expected}")]
    ChoiceCount { phase: Phase, expected: usize, got: usize },
    #[error("log length differs: recorded {recorded}, replayed {replayed}")]
    Length { recorded: usize, replayed: usize },
    #[error("row {index}: {field} differs (recorded {recorded}, replayed {replayed})")]
    Mismatch {
        index: usize,
        field: &'static str,
        recorded: String,
        replayed: String,
    },
}

/// One round's input as the participant gave it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Choice {
    pub box_chosen: BoxChoice,
    pub decision_time: f64,
}

/// Choices per phase, recovered from a persisted log.
pub fn choices_from_log(records: &[TrialRecord]) -> BTreeMap<Phase, Vec<Choice>> {
    let mut out: BTreeMap<Phase, Vec<Choice>> = BTreeMap::new();
    for r in records {
        out.entry(r.phase).or_default().push(Choice {
            box_chosen: r.box_chosen,
            decision_time: r.decision_time,
        });
    }
    out
}

/// Re-run a session from its inputs. Phases run in the order the seed
/// produces; when `expected_order` is given it must match.
pub fn replay(
    design: &ExperimentDesign,
    participant_id: &ParticipantId,
    seed: u64,
    expected_order: Option<[Phase; PHASE_COUNT]>,
    choices: &BTreeMap<Phase, Vec<Choice>>,
) -> Result<Session, ReplayError> {
    let mut session = Session::create(participant_id.clone(), design.clone(), seed)?;
    if let Some(recorded) = expected_order {
        if recorded != session.phase_order() {
            return Err(ReplayError::PhaseOrder {
                recorded,
                replayed: session.phase_order(),
            });
        }
    }
    let rounds = design.rounds_per_phase as usize;
    for phase in session.phase_order() {
        let Some(phase_choices) = choices.get(&phase) else {
            // unplayed tail of an abandoned session
            break;
        };
        if phase_choices.len() > rounds {
            return Err(ReplayError::ChoiceCount {
                phase,
                expected: rounds,
                got: phase_choices.len(),
            });
        }
        session.reset_for_phase(phase)?;
        for choice in phase_choices {
            session.play_round(choice.box_chosen, choice.decision_time)?;
            if session.next_round()? == RoundAdvance::PhaseComplete {
                break;
            }
        }
    }
    Ok(session)
}

/// Compare a recorded log with a replayed one at persisted precision.
pub fn verify_replay(recorded: &[TrialRecord], replayed: &[TrialRecord]) -> Result<(), ReplayError> {
    if recorded.len() != replayed.len() {
        return Err(ReplayError::Length {
            recorded: recorded.len(),
            replayed: replayed.len(),
        });
    }
    for (index, (a, b)) in recorded.iter().zip(replayed).enumerate() {
        let checks: [(&'static str, String, String); 7] = [
            ("phase", a.phase.to_string(), b.phase.to_string()),
            ("round", a.round.to_string(), b.round.to_string()),
            ("box_chosen", a.box_chosen.to_string(), b.box_chosen.to_string()),
            ("result", a.outcome.to_string(), b.outcome.to_string()),
            ("reward", a.reward.to_string(), b.reward.to_string()),
            ("p_safe", round3(a.p_safe).to_string(), round3(b.p_safe).to_string()),
            ("p_uncertain", round3(a.p_uncertain).to_string(), round3(b.p_uncertain).to_string()),
        ];
        for (field, x, y) in checks {
            if x != y {
                return Err(ReplayError::Mismatch {
                    index,
                    field,
                    recorded: x,
                    replayed: y,
                });
            }
        }
        if a.cumulative_earnings != b.cumulative_earnings {
            return Err(ReplayError::Mismatch {
                index,
                field: "cumulative_earnings",
                recorded: a.cumulative_earnings.to_string(),
                replayed: b.cumulative_earnings.to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid() -> ParticipantId {
        ParticipantId::parse("314").unwrap()
    }

    fn played(seed: u64) -> Session {
        let mut s = Session::create(pid(), ExperimentDesign::default(), seed).unwrap();
        for phase in s.phase_order() {
            s.reset_for_phase(phase).unwrap();
            for i in 0..s.design().rounds_per_phase {
                let choice = if i % 2 == 0 { BoxChoice::B } else { BoxChoice::A };
                s.play_round(choice, 0.5 + i as f64 * 0.01).unwrap();
                s.next_round().unwrap();
            }
        }
        s
    }

    #[test]
    fn test_summary_counts_add_up() {
        let s = played(9);
        let summaries = summarize_session(&s);
        assert_eq!(summaries.len(), 3);
        for sum in &summaries {
            assert_eq!(sum.rounds, 25);
            assert_eq!(sum.picks_a + sum.picks_b, 25);
            assert_eq!(sum.picks_b, 13);
            assert_eq!(sum.switches, 24);
            assert_eq!(sum.reds + sum.blacks + sum.golds + sum.silvers, 25);
        }
        let total: i64 = summaries.iter().map(|s| s.earnings).sum();
        assert_eq!(total, s.cumulative_earnings());
        let phase_one = summaries.iter().find(|s| s.phase == Phase::One).unwrap();
        assert_eq!(phase_one.golds + phase_one.silvers, 0);
    }

    #[test]
    fn test_summary_of_missing_phase_is_none() {
        let init = ProbSnapshot { p_safe: 0.5, p_uncertain: 0.5 };
        assert!(summarize_phase(Phase::Two, &[], init).is_none());
    }

    #[test]
    fn test_replay_reproduces_log_and_digest() {
        let original = played(1234);
        let choices = choices_from_log(original.trial_log());
        let again = replay(
            &ExperimentDesign::default(),
            &pid(),
            1234,
            Some(original.phase_order()),
            &choices,
        )
        .unwrap();
        assert_eq!(again.trial_log(), original.trial_log());
        assert!(verify_replay(original.trial_log(), again.trial_log()).is_ok());
        assert_eq!(
            session_digest(original.trial_log(), original.initial_probs()),
            session_digest(again.trial_log(), again.initial_probs())
        );
    }

    #[test]
    fn test_replay_with_wrong_seed_is_caught() {
        let original = played(1234);
        let choices = choices_from_log(original.trial_log());
        let other = replay(&ExperimentDesign::default(), &pid(), 4321, None, &choices).unwrap();
        assert!(verify_replay(original.trial_log(), other.trial_log()).is_err());
    }

    #[test]
    fn test_replay_rejects_too_many_choices() {
        let mut choices = BTreeMap::new();
        let c = Choice {
            box_chosen: BoxChoice::A,
            decision_time: 1.0,
        };
        let order = Session::create(pid(), ExperimentDesign::default(), 5).unwrap().phase_order();
        choices.insert(order[0], vec![c; 26]);
        assert!(matches!(
            replay(&ExperimentDesign::default(), &pid(), 5, None, &choices),
            Err(ReplayError::ChoiceCount { got: 26, .. })
        ));
    }

    #[test]
    fn test_verify_reports_first_difference() {
        let s = played(3);
        let mut tampered = s.trial_log().to_vec();
        tampered[4].reward += 1;
        match verify_replay(&tampered, s.trial_log()) {
            Err(ReplayError::Mismatch { index, field, .. }) => {
                assert_eq!(index, 4);
                assert_eq!(field, "reward");
            }
            other => panic!("expected mismatch, got {:?}", other),
        }
    }
}
