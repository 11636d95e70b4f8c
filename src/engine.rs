//! Experiment engine: one `Session` per participant.
//!
//! Round lifecycle:
//! ```text
//! reset_for_phase ──► play_round ──► next_round ──► play_round ... ──► PhaseComplete
//!                     (draw → record → adjust)
//! ```
//! `draw_ball` and `adjust_probabilities` stay public for callers that keep
//! their own log; `play_round` folds draw, bookkeeping and adjustment in
//! the required order.

use std::collections::BTreeMap;

use rand::{rngs::StdRng, SeedableRng};
use thiserror::Error;

use crate::design::{BoxChoice, DesignError, ExperimentDesign, Outcome, Phase, ProbSnapshot, PHASE_COUNT};
use crate::logging;
use crate::record::{ParticipantId, SessionRecord, TrialRecord};
use crate::rng::{phase_seed, shuffle_phases, RandomSource};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("invalid design: {0}")]
    Design(#[from] DesignError),
    #[error("no phase is active; reset_for_phase must run first")]
    NoActivePhase,
    #[error("phase {phase} has no rounds left (round {round}, limit {limit})")]
    RoundsExhausted { phase: Phase, round: u32, limit: u32 },
    #[error("round {round} of phase {phase} was already played")]
    RoundAlreadyPlayed { phase: Phase, round: u32 },
    #[error("round {round} of phase {phase} has not been played")]
    RoundNotPlayed { phase: Phase, round: u32 },
    #[error("phase {0} was already started in this session")]
    PhaseAlreadyStarted(Phase),
    #[error("phase {0} has not been started")]
    PhaseNotStarted(Phase),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Draw {
    pub outcome: Outcome,
    pub reward: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundAdvance {
    Next(u32),
    PhaseComplete,
}

/// Everything persistence needs for one finished phase.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseExport {
    pub participant_id: ParticipantId,
    pub phase: Phase,
    pub records: Vec<TrialRecord>,
    pub initial: ProbSnapshot,
}

#[derive(Debug, Clone)]
pub struct Session<R = StdRng> {
    participant_id: ParticipantId,
    design: ExperimentDesign,
    seed: u64,
    rng: R,
    phase_order: [Phase; PHASE_COUNT],
    current_phase: Option<Phase>,
    round: u32,
    played: bool,
    cumulative_earnings: i64,
    p_safe: f64,
    p_uncertain: f64,
    initial_probs: BTreeMap<Phase, ProbSnapshot>,
    phase_seeds: BTreeMap<Phase, u64>,
    trial_log: Vec<TrialRecord>,
}

impl Session<StdRng> {
    /// New session whose phase order and draws all follow from `seed`.
    pub fn create(participant_id: ParticipantId, design: ExperimentDesign, seed: u64) -> Result<Self, EngineError> {
        Self::with_source(participant_id, design, seed, StdRng::seed_from_u64(seed))
    }
}

impl<R: RandomSource> Session<R> {
    /// Refuses a design that fails `ExperimentDesign::validate`, before any
    /// variate is consumed.
    pub fn with_source(
        participant_id: ParticipantId,
        design: ExperimentDesign,
        seed: u64,
        mut rng: R,
    ) -> Result<Self, EngineError> {
        design.validate()?;
        let phase_order = shuffle_phases(&mut rng);
        let ids: Vec<u8> = phase_order.iter().map(|p| p.id()).collect();
        logging::log_session_created(participant_id.as_str(), seed, &ids);
        Ok(Self {
            participant_id,
            design,
            seed,
            rng,
            phase_order,
            current_phase: None,
            round: 0,
            played: false,
            cumulative_earnings: 0,
            p_safe: 0.0,
            p_uncertain: 0.0,
            initial_probs: BTreeMap::new(),
            phase_seeds: BTreeMap::new(),
            trial_log: Vec::new(),
        })
    }

    /// Start `phase` at round 1 with its design probabilities and snapshot
    /// them. A phase runs once per session.
    pub fn reset_for_phase(&mut self, phase: Phase) -> Result<(), EngineError> {
        if self.initial_probs.contains_key(&phase) {
            return Err(EngineError::PhaseAlreadyStarted(phase));
        }
        let start = self.design.phase(phase).start();
        self.current_phase = Some(phase);
        self.round = 1;
        self.played = false;
        self.p_safe = start.p_safe;
        self.p_uncertain = start.p_uncertain;
        self.initial_probs.insert(phase, start);

        let seed = phase_seed(self.seed, phase);
        self.phase_seeds.insert(phase, seed);
        self.rng.reseed(seed);

        logging::log_phase_start(self.participant_id.as_str(), phase.id(), seed, start.p_safe, start.p_uncertain);
        Ok(())
    }

    /// Resolve one ball from `choice` at the live probabilities. Only
    /// advances the random source.
    pub fn draw_ball(&mut self, choice: BoxChoice) -> Result<Draw, EngineError> {
        let phase = self.active_phase()?;
        let limit = self.design.rounds_per_phase;
        if self.round > limit {
            return Err(EngineError::RoundsExhausted {
                phase,
                round: self.round,
                limit,
            });
        }
        let pd = *self.design.phase(phase);
        let rewards = self.design.rewards;

        if choice == BoxChoice::B && pd.has_surprise() {
            let u = self.rng.uniform();
            let surprise = if u < pd.gold_odds {
                Some(Outcome::Gold)
            } else if u < pd.gold_odds + pd.silver_odds {
                Some(Outcome::Silver)
            } else {
                None
            };
            if let Some(outcome) = surprise {
                return Ok(Draw {
                    outcome,
                    reward: rewards.for_outcome(outcome),
                });
            }
        }

        let p_red = self.live().get(choice);
        let outcome = if self.rng.uniform() < p_red {
            Outcome::Red
        } else {
            Outcome::Black
        };
        Ok(Draw {
            outcome,
            reward: rewards.for_outcome(outcome),
        })
    }

    /// Apply the active phase's drift rule for a choice of `choice`.
    pub fn adjust_probabilities(&mut self, choice: BoxChoice) -> Result<(), EngineError> {
        let phase = self.active_phase()?;
        let anchor = self
            .initial_probs
            .get(&phase)
            .copied()
            .ok_or(EngineError::PhaseNotStarted(phase))?;
        let before = self.live();
        let after = self.design.phase(phase).drift.apply(choice, before, anchor);
        self.p_safe = after.p_safe;
        self.p_uncertain = after.p_uncertain;
        logging::log_adjustment(
            phase.id(),
            choice.as_str(),
            (before.p_safe, before.p_uncertain),
            (after.p_safe, after.p_uncertain),
        );
        Ok(())
    }

    /// Draw, book the reward, append the record, then adjust.
    pub fn play_round(&mut self, choice: BoxChoice, decision_time: f64) -> Result<TrialRecord, EngineError> {
        let phase = self.active_phase()?;
        if self.played {
            return Err(EngineError::RoundAlreadyPlayed { phase, round: self.round });
        }
        let at_draw = self.live();
        let draw = self.draw_ball(choice)?;
        self.cumulative_earnings += draw.reward;

        let record = TrialRecord {
            participant_id: self.participant_id.clone(),
            phase,
            round: self.round,
            box_chosen: choice,
            decision_time,
            outcome: draw.outcome,
            reward: draw.reward,
            cumulative_earnings: self.cumulative_earnings,
            p_safe: at_draw.p_safe,
            p_uncertain: at_draw.p_uncertain,
        };
        self.trial_log.push(record.clone());
        self.played = true;
        logging::log_draw(
            self.participant_id.as_str(),
            phase.id(),
            self.round,
            choice.as_str(),
            draw.outcome.as_str(),
            draw.reward,
            self.cumulative_earnings,
        );

        self.adjust_probabilities(choice)?;
        Ok(record)
    }

    /// Move past a played round.
    pub fn next_round(&mut self) -> Result<RoundAdvance, EngineError> {
        let phase = self.active_phase()?;
        if !self.played {
            return Err(EngineError::RoundNotPlayed { phase, round: self.round });
        }
        self.played = false;
        self.round += 1;
        if self.round > self.design.rounds_per_phase {
            logging::log_phase_complete(self.participant_id.as_str(), phase.id(), self.cumulative_earnings);
            Ok(RoundAdvance::PhaseComplete)
        } else {
            Ok(RoundAdvance::Next(self.round))
        }
    }

    pub fn phase_export(&self, phase: Phase) -> Result<PhaseExport, EngineError> {
        let initial = self
            .initial_probs
            .get(&phase)
            .copied()
            .ok_or(EngineError::PhaseNotStarted(phase))?;
        Ok(PhaseExport {
            participant_id: self.participant_id.clone(),
            phase,
            records: self.phase_records(phase).cloned().collect(),
            initial,
        })
    }

    pub fn phase_records(&self, phase: Phase) -> impl Iterator<Item = &TrialRecord> {
        self.trial_log.iter().filter(move |r| r.phase == phase)
    }

    /// Archive entry for this session; `digest` comes from the analysis layer.
    pub fn archive_record(&self, digest: String) -> SessionRecord {
        SessionRecord {
            participant_id: self.participant_id.clone(),
            seed: self.seed,
            phase_order: self.phase_order,
            rounds_played: self.trial_log.len() as u32,
            cumulative_earnings: self.cumulative_earnings,
            digest,
            completed_at: logging::ts_now(),
        }
    }

    fn active_phase(&self) -> Result<Phase, EngineError> {
        self.current_phase.ok_or(EngineError::NoActivePhase)
    }

    fn live(&self) -> ProbSnapshot {
        ProbSnapshot {
            p_safe: self.p_safe,
            p_uncertain: self.p_uncertain,
        }
    }

    pub fn participant_id(&self) -> &ParticipantId {
        &self.participant_id
    }

    pub fn design(&self) -> &ExperimentDesign {
        &self.design
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn phase_order(&self) -> [Phase; PHASE_COUNT] {
        self.phase_order
    }

    pub fn current_phase(&self) -> Option<Phase> {
        self.current_phase
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn is_phase_complete(&self) -> bool {
        self.current_phase.is_some() && self.round > self.design.rounds_per_phase
    }

    /// Every phase started and the last one played out.
    pub fn is_finished(&self) -> bool {
        self.initial_probs.len() == PHASE_COUNT && self.is_phase_complete()
    }

    pub fn cumulative_earnings(&self) -> i64 {
        self.cumulative_earnings
    }

    pub fn p_safe(&self) -> f64 {
        self.p_safe
    }

    pub fn p_uncertain(&self) -> f64 {
        self.p_uncertain
    }

    pub fn initial_probs(&self) -> &BTreeMap<Phase, ProbSnapshot> {
        &self.initial_probs
    }

    pub fn phase_seeds(&self) -> &BTreeMap<Phase, u64> {
        &self.phase_seeds
    }

    pub fn trial_log(&self) -> &[TrialRecord] {
        &self.trial_log
    }
}
