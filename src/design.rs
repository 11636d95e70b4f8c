//! Experiment design table: phases, boxes, outcomes and the per-phase
//! constants the engine runs on.
//!
//! Phase layout:
//! ```text
//! phase │ Box A            │ Box B
//! ──────┼──────────────────┼──────────────────────────────
//!   1   │ known risk       │ ambiguity
//!   2   │ known risk       │ ambiguity + rare gold
//!   3   │ ambiguity        │ ambiguity + rare gold/silver
//! ```
//!
//! Every number here is a design parameter supplied by the experimenter.
//! `Default` carries the values the study was piloted with.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of phases in a session.
pub const PHASE_COUNT: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Phase {
    One,
    Two,
    Three,
}

impl Phase {
    pub const ALL: [Phase; PHASE_COUNT] = [Phase::One, Phase::Two, Phase::Three];

    pub fn id(&self) -> u8 {
        match self {
            Phase::One => 1,
            Phase::Two => 2,
            Phase::Three => 3,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(Phase::One),
            2 => Some(Phase::Two),
            3 => Some(Phase::Three),
            _ => None,
        }
    }

    fn index(&self) -> usize {
        self.id() as usize - 1
    }

    /// How much the participant is told about a box's composition.
    pub fn disclosure(&self, choice: BoxChoice) -> Disclosure {
        match (self, choice) {
            (Phase::One | Phase::Two, BoxChoice::A) => Disclosure::Known,
            (Phase::Three, BoxChoice::A) => Disclosure::Ambiguous,
            (Phase::One, BoxChoice::B) => Disclosure::Ambiguous,
            (Phase::Two | Phase::Three, BoxChoice::B) => Disclosure::AmbiguousWithSurprise,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}

impl TryFrom<u8> for Phase {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Phase::from_id(value).ok_or_else(|| format!("invalid phase id: {}", value))
    }
}

impl From<Phase> for u8 {
    fn from(phase: Phase) -> u8 {
        phase.id()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BoxChoice {
    A,
    B,
}

impl BoxChoice {
    pub fn as_str(&self) -> &'static str {
        match self {
            BoxChoice::A => "A",
            BoxChoice::B => "B",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "A" | "a" => Some(BoxChoice::A),
            "B" | "b" => Some(BoxChoice::B),
            _ => None,
        }
    }

    pub fn other(&self) -> Self {
        match self {
            BoxChoice::A => BoxChoice::B,
            BoxChoice::B => BoxChoice::A,
        }
    }
}

impl fmt::Display for BoxChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Red,
    Black,
    Gold,
    Silver,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Red => "red",
            Outcome::Black => "black",
            Outcome::Gold => "gold",
            Outcome::Silver => "silver",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "red" => Some(Outcome::Red),
            "black" => Some(Outcome::Black),
            "gold" => Some(Outcome::Gold),
            "silver" => Some(Outcome::Silver),
            _ => None,
        }
    }

    pub fn is_surprise(&self) -> bool {
        matches!(self, Outcome::Gold | Outcome::Silver)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disclosure {
    /// Composition shown to the participant (risk).
    Known,
    /// Composition hidden (ambiguity).
    Ambiguous,
    /// Hidden, and the box may yield a surprise ball.
    AmbiguousWithSurprise,
}

/// Red-ball probabilities of both boxes at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProbSnapshot {
    pub p_safe: f64,
    pub p_uncertain: f64,
}

impl ProbSnapshot {
    pub fn get(&self, choice: BoxChoice) -> f64 {
        match choice {
            BoxChoice::A => self.p_safe,
            BoxChoice::B => self.p_uncertain,
        }
    }
}

/// Reward per outcome, in whole currency units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardTable {
    pub red: i64,
    pub black: i64,
    pub gold: i64,
    pub silver: i64,
}

impl Default for RewardTable {
    fn default() -> Self {
        Self {
            red: 5,
            black: -2,
            gold: 15,
            silver: -10,
        }
    }
}

impl RewardTable {
    pub fn for_outcome(&self, outcome: Outcome) -> i64 {
        match outcome {
            Outcome::Red => self.red,
            Outcome::Black => self.black,
            Outcome::Gold => self.gold,
            Outcome::Silver => self.silver,
        }
    }
}

/// How live probabilities move after a box is chosen.
///
/// Each step: add `chosen_step` to the chosen box and `other_step` to the
/// other, pull both toward their phase-start value by `reversion`, then
/// clamp into `[floor, ceiling]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DriftRule {
    pub chosen_step: f64,
    pub other_step: f64,
    #[serde(default)]
    pub reversion: f64,
    pub floor: f64,
    pub ceiling: f64,
}

impl DriftRule {
    /// Rule that never moves anything.
    pub fn frozen() -> Self {
        Self {
            chosen_step: 0.0,
            other_step: 0.0,
            reversion: 0.0,
            floor: 0.0,
            ceiling: 1.0,
        }
    }

    pub fn apply(&self, chosen: BoxChoice, live: ProbSnapshot, anchor: ProbSnapshot) -> ProbSnapshot {
        let (d_safe, d_uncertain) = match chosen {
            BoxChoice::A => (self.chosen_step, self.other_step),
            BoxChoice::B => (self.other_step, self.chosen_step),
        };
        ProbSnapshot {
            p_safe: self.step(live.p_safe, d_safe, anchor.p_safe),
            p_uncertain: self.step(live.p_uncertain, d_uncertain, anchor.p_uncertain),
        }
    }

    fn step(&self, p: f64, delta: f64, anchor: f64) -> f64 {
        let moved = p + delta;
        let reverted = moved + self.reversion * (anchor - moved);
        reverted.clamp(self.floor, self.ceiling).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhaseDesign {
    /// Box A starting p(red).
    pub p_safe: f64,
    /// Box B starting p(red), never shown to the participant.
    pub p_uncertain: f64,
    /// Box B chance of a gold ball, resolved before red/black.
    #[serde(default)]
    pub gold_odds: f64,
    /// Box B chance of a silver ball, disjoint from gold.
    #[serde(default)]
    pub silver_odds: f64,
    pub drift: DriftRule,
}

impl PhaseDesign {
    pub fn start(&self) -> ProbSnapshot {
        ProbSnapshot {
            p_safe: self.p_safe,
            p_uncertain: self.p_uncertain,
        }
    }

    pub fn has_surprise(&self) -> bool {
        self.gold_odds > 0.0 || self.silver_odds > 0.0
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DesignError {
    #[error("rounds_per_phase must be at least 1")]
    NoRounds,
    #[error("phase {phase}: {field}={value} is outside [0, 1]")]
    OutOfRange { phase: Phase, field: &'static str, value: f64 },
    #[error("phase {phase}: drift floor {floor} exceeds ceiling {ceiling}")]
    InvertedBounds { phase: Phase, floor: f64, ceiling: f64 },
    #[error("phase {phase}: gold+silver odds {total} exceed 1")]
    SurpriseOddsTooLarge { phase: Phase, total: f64 },
    #[error("phase {phase}: {outcome} balls are not part of this phase")]
    SurpriseNotAllowed { phase: Phase, outcome: Outcome },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentDesign {
    pub rounds_per_phase: u32,
    pub rewards: RewardTable,
    /// Indexed by phase id - 1.
    pub phases: [PhaseDesign; PHASE_COUNT],
}

impl Default for ExperimentDesign {
    fn default() -> Self {
        let bounds = |chosen_step: f64, other_step: f64, reversion: f64| DriftRule {
            chosen_step,
            other_step,
            reversion,
            floor: 0.05,
            ceiling: 0.95,
        };
        Self {
            rounds_per_phase: 25,
            rewards: RewardTable::default(),
            phases: [
                PhaseDesign {
                    p_safe: 0.5,
                    p_uncertain: 0.5,
                    gold_odds: 0.0,
                    silver_odds: 0.0,
                    drift: bounds(-0.02, 0.01, 0.0),
                },
                PhaseDesign {
                    p_safe: 0.5,
                    p_uncertain: 0.5,
                    gold_odds: 0.1,
                    silver_odds: 0.0,
                    drift: bounds(-0.03, 0.015, 0.05),
                },
                PhaseDesign {
                    p_safe: 0.5,
                    p_uncertain: 0.5,
                    gold_odds: 0.1,
                    silver_odds: 0.1,
                    drift: bounds(-0.04, 0.02, 0.05),
                },
            ],
        }
    }
}

impl ExperimentDesign {
    pub fn phase(&self, phase: Phase) -> &PhaseDesign {
        &self.phases[phase.index()]
    }

    pub fn phase_mut(&mut self, phase: Phase) -> &mut PhaseDesign {
        &mut self.phases[phase.index()]
    }

    pub fn validate(&self) -> Result<(), DesignError> {
        if self.rounds_per_phase == 0 {
            return Err(DesignError::NoRounds);
        }
        for phase in Phase::ALL {
            let pd = self.phase(phase);
            for (field, value) in [
                ("p_safe", pd.p_safe),
                ("p_uncertain", pd.p_uncertain),
                ("gold_odds", pd.gold_odds),
                ("silver_odds", pd.silver_odds),
                ("reversion", pd.drift.reversion),
                ("floor", pd.drift.floor),
                ("ceiling", pd.drift.ceiling),
            ] {
                if !(0.0..=1.0).contains(&value) {
                    return Err(DesignError::OutOfRange { phase, field, value });
                }
            }
            for (field, value) in [("chosen_step", pd.drift.chosen_step), ("other_step", pd.drift.other_step)] {
                if !(-1.0..=1.0).contains(&value) {
                    return Err(DesignError::OutOfRange { phase, field, value });
                }
            }
            if pd.drift.floor > pd.drift.ceiling {
                return Err(DesignError::InvertedBounds {
                    phase,
                    floor: pd.drift.floor,
                    ceiling: pd.drift.ceiling,
                });
            }
            let total = pd.gold_odds + pd.silver_odds;
            if total > 1.0 {
                return Err(DesignError::SurpriseOddsTooLarge { phase, total });
            }
            // Gold belongs to phases 2 and 3, silver to phase 3 only.
            if phase == Phase::One && pd.gold_odds > 0.0 {
                return Err(DesignError::SurpriseNotAllowed { phase, outcome: Outcome::Gold });
            }
            if phase != Phase::Three && pd.silver_odds > 0.0 {
                return Err(DesignError::SurpriseNotAllowed { phase, outcome: Outcome::Silver });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_design_is_valid() {
        assert_eq!(ExperimentDesign::default().validate(), Ok(()));
    }

    #[test]
    fn test_phase_ids_roundtrip() {
        for phase in Phase::ALL {
            assert_eq!(Phase::from_id(phase.id()), Some(phase));
        }
        assert_eq!(Phase::from_id(0), None);
        assert_eq!(Phase::from_id(4), None);
    }

    #[test]
    fn test_disclosure_table() {
        assert_eq!(Phase::One.disclosure(BoxChoice::A), Disclosure::Known);
        assert_eq!(Phase::Two.disclosure(BoxChoice::A), Disclosure::Known);
        assert_eq!(Phase::Three.disclosure(BoxChoice::A), Disclosure::Ambiguous);
        assert_eq!(Phase::One.disclosure(BoxChoice::B), Disclosure::Ambiguous);
        assert_eq!(Phase::Three.disclosure(BoxChoice::B), Disclosure::AmbiguousWithSurprise);
    }

    #[test]
    fn test_drift_moves_chosen_and_other() {
        let rule = DriftRule {
            chosen_step: -0.1,
            other_step: 0.05,
            reversion: 0.0,
            floor: 0.0,
            ceiling: 1.0,
        };
        let start = ProbSnapshot { p_safe: 0.5, p_uncertain: 0.5 };
        let next = rule.apply(BoxChoice::B, start, start);
        assert!((next.p_safe - 0.55).abs() < 1e-12);
        assert!((next.p_uncertain - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_drift_clamps_to_bounds() {
        let rule = DriftRule {
            chosen_step: 0.5,
            other_step: -0.5,
            reversion: 0.0,
            floor: 0.1,
            ceiling: 0.9,
        };
        let start = ProbSnapshot { p_safe: 0.8, p_uncertain: 0.2 };
        let next = rule.apply(BoxChoice::A, start, start);
        assert_eq!(next.p_safe, 0.9);
        assert_eq!(next.p_uncertain, 0.1);
    }

    #[test]
    fn test_drift_reversion_pulls_toward_anchor() {
        let rule = DriftRule {
            chosen_step: 0.0,
            other_step: 0.0,
            reversion: 0.5,
            floor: 0.0,
            ceiling: 1.0,
        };
        let anchor = ProbSnapshot { p_safe: 0.5, p_uncertain: 0.5 };
        let live = ProbSnapshot { p_safe: 0.9, p_uncertain: 0.1 };
        let next = rule.apply(BoxChoice::A, live, anchor);
        assert!((next.p_safe - 0.7).abs() < 1e-12);
        assert!((next.p_uncertain - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_validate_rejects_bad_tables() {
        let mut design = ExperimentDesign::default();
        design.phase_mut(Phase::One).gold_odds = 0.1;
        assert!(matches!(design.validate(), Err(DesignError::SurpriseNotAllowed { .. })));

        let mut design = ExperimentDesign::default();
        design.phase_mut(Phase::Two).p_uncertain = 1.5;
        assert!(matches!(design.validate(), Err(DesignError::OutOfRange { .. })));

        let mut design = ExperimentDesign::default();
        design.phase_mut(Phase::Three).drift.floor = 0.99;
        assert!(matches!(design.validate(), Err(DesignError::InvertedBounds { .. })));

        let mut design = ExperimentDesign::default();
        design.phase_mut(Phase::Three).p_safe = f64::NAN;
        assert!(matches!(design.validate(), Err(DesignError::OutOfRange { .. })));
    }

    #[test]
    fn test_design_json_roundtrip_uses_numeric_phases() {
        let json = serde_json::to_string(&Phase::Two).unwrap();
        assert_eq!(json, "2");
        let phase: Phase = serde_json::from_str("3").unwrap();
        assert_eq!(phase, Phase::Three);
        assert!(serde_json::from_str::<Phase>("7").is_err());
    }
}
