//! Participant ids, per-round trial records, questionnaire/debrief rows and
//! the column layouts downstream analysis depends on.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::design::{BoxChoice, Outcome, Phase, ProbSnapshot, PHASE_COUNT};

/// Results file columns. Order is significant.
pub const RESULT_COLUMNS: [&str; 12] = [
    "participant_id",
    "phase",
    "round",
    "box_chosen",
    "decision_time",
    "result",
    "reward",
    "cumulative_earnings",
    "p_safe",
    "p_uncertain",
    "init_p_safe",
    "init_p_uncertain",
];

pub const QUESTIONNAIRE_COLUMNS: [&str; 12] = [
    "participant_id",
    "phase",
    "reason",
    "pattern",
    "stress",
    "confidence",
    "perceived_control",
    "strategy",
    "avoided",
    "motive",
    "risk",
    "mechanism",
];

pub const DEBRIEF_COLUMNS: [&str; 6] = [
    "participant_id",
    "overall_stress",
    "overall_confidence",
    "phase_preference",
    "final_strategy",
    "comments",
];

/// Persisted precision for times and probabilities.
pub fn round3(x: f64) -> f64 {
    (x * 1000.0).round() / 1000.0
}

// =============================================================================
// Participant id
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParticipantIdError {
    #[error("participant id is empty")]
    Empty,
    #[error("participant id must be numeric, got {0:?}")]
    NotNumeric(String),
}

/// Numeric participant id, kept as text so leading zeros survive.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn parse(input: &str) -> Result<Self, ParticipantIdError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(ParticipantIdError::Empty);
        }
        if !trimmed.chars().all(|c| c.is_ascii_digit()) {
            return Err(ParticipantIdError::NotNumeric(trimmed.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Trial record
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub participant_id: ParticipantId,
    pub phase: Phase,
    pub round: u32,
    pub box_chosen: BoxChoice,
    /// Seconds from round start to choice.
    pub decision_time: f64,
    pub outcome: Outcome,
    pub reward: i64,
    pub cumulative_earnings: i64,
    /// Probabilities the draw used, before the adjustment that followed it.
    pub p_safe: f64,
    pub p_uncertain: f64,
}

impl TrialRecord {
    /// One results row in `RESULT_COLUMNS` order; init columns blank when
    /// no snapshot is known.
    pub fn to_row(&self, init: Option<&ProbSnapshot>) -> Vec<String> {
        let (init_safe, init_uncertain) = match init {
            Some(s) => (fmt_f64(round3(s.p_safe)), fmt_f64(round3(s.p_uncertain))),
            None => (String::new(), String::new()),
        };
        vec![
            self.participant_id.to_string(),
            self.phase.id().to_string(),
            self.round.to_string(),
            self.box_chosen.to_string(),
            fmt_f64(round3(self.decision_time)),
            self.outcome.to_string(),
            self.reward.to_string(),
            self.cumulative_earnings.to_string(),
            fmt_f64(round3(self.p_safe)),
            fmt_f64(round3(self.p_uncertain)),
            init_safe,
            init_uncertain,
        ]
    }

    /// Parse a results row back. Probabilities and times come back at
    /// persisted precision.
    pub fn from_row(fields: &[String]) -> Result<(Self, Option<ProbSnapshot>), String> {
        if fields.len() != RESULT_COLUMNS.len() {
            return Err(format!(
                "expected {} columns, got {}",
                RESULT_COLUMNS.len(),
                fields.len()
            ));
        }
        let participant_id = ParticipantId::parse(&fields[0]).map_err(|e| e.to_string())?;
        let phase = fields[1]
            .trim()
            .parse::<u8>()
            .ok()
            .and_then(Phase::from_id)
            .ok_or_else(|| format!("bad phase: {}", fields[1]))?;
        let round = parse_field::<u32>("round", &fields[2])?;
        let box_chosen = BoxChoice::parse(&fields[3]).ok_or_else(|| format!("bad box: {}", fields[3]))?;
        let decision_time = parse_field::<f64>("decision_time", &fields[4])?;
        let outcome = Outcome::parse(&fields[5]).ok_or_else(|| format!("bad result: {}", fields[5]))?;
        let reward = parse_field::<i64>("reward", &fields[6])?;
        let cumulative_earnings = parse_field::<i64>("cumulative_earnings", &fields[7])?;
        let p_safe = parse_field::<f64>("p_safe", &fields[8])?;
        let p_uncertain = parse_field::<f64>("p_uncertain", &fields[9])?;
        let init = if fields[10].trim().is_empty() || fields[11].trim().is_empty() {
            None
        } else {
            Some(ProbSnapshot {
                p_safe: parse_field::<f64>("init_p_safe", &fields[10])?,
                p_uncertain: parse_field::<f64>("init_p_uncertain", &fields[11])?,
            })
        };
        Ok((
            Self {
                participant_id,
                phase,
                round,
                box_chosen,
                decision_time,
                outcome,
                reward,
                cumulative_earnings,
                p_safe,
                p_uncertain,
            },
            init,
        ))
    }
}

fn parse_field<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T, String> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| format!("bad {}: {}", name, raw))
}

fn fmt_f64(x: f64) -> String {
    format!("{}", x)
}

// =============================================================================
// Questionnaire
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionField {
    Reason,
    Pattern,
    Stress,
    Confidence,
    PerceivedControl,
    Strategy,
    Avoided,
    Motive,
    Risk,
    Mechanism,
}

impl QuestionField {
    pub fn column(&self) -> &'static str {
        match self {
            QuestionField::Reason => "reason",
            QuestionField::Pattern => "pattern",
            QuestionField::Stress => "stress",
            QuestionField::Confidence => "confidence",
            QuestionField::PerceivedControl => "perceived_control",
            QuestionField::Strategy => "strategy",
            QuestionField::Avoided => "avoided",
            QuestionField::Motive => "motive",
            QuestionField::Risk => "risk",
            QuestionField::Mechanism => "mechanism",
        }
    }

    /// Answered on a 1..=5 slider.
    pub fn is_scale(&self) -> bool {
        matches!(
            self,
            QuestionField::Stress | QuestionField::Confidence | QuestionField::PerceivedControl
        )
    }

    /// Fields asked after each phase.
    pub fn for_phase(phase: Phase) -> &'static [QuestionField] {
        use QuestionField::*;
        match phase {
            Phase::One => &[Reason, Pattern, Stress, Confidence, PerceivedControl, Strategy],
            Phase::Two => &[Avoided, Pattern, Motive, Stress, Confidence, PerceivedControl, Strategy],
            Phase::Three => &[Reason, Risk, Mechanism, Stress, Confidence, PerceivedControl, Strategy],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuestionnaireError {
    #[error("field {field} is not asked in phase {phase}")]
    NotAsked { field: &'static str, phase: Phase },
    #[error("field {field} must be an integer in 1..=5, got {value:?}")]
    BadScale { field: &'static str, value: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuestionnaireResponses {
    answers: BTreeMap<QuestionField, String>,
}

impl QuestionnaireResponses {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: QuestionField, value: impl Into<String>) -> Self {
        self.set(field, value);
        self
    }

    pub fn set(&mut self, field: QuestionField, value: impl Into<String>) {
        self.answers.insert(field, value.into());
    }

    pub fn get(&self, field: QuestionField) -> Option<&str> {
        self.answers.get(&field).map(|s| s.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.answers.is_empty()
    }

    pub fn validate(&self, phase: Phase) -> Result<(), QuestionnaireError> {
        let allowed = QuestionField::for_phase(phase);
        for (field, value) in &self.answers {
            if !allowed.contains(field) {
                return Err(QuestionnaireError::NotAsked {
                    field: field.column(),
                    phase,
                });
            }
            if field.is_scale() && !matches!(value.trim().parse::<u8>(), Ok(1..=5)) {
                return Err(QuestionnaireError::BadScale {
                    field: field.column(),
                    value: value.clone(),
                });
            }
        }
        Ok(())
    }

    /// Full `QUESTIONNAIRE_COLUMNS` row, blanks for fields not answered.
    pub fn to_row(&self, participant_id: &ParticipantId, phase: Phase) -> Vec<String> {
        let mut row = vec![participant_id.to_string(), phase.id().to_string()];
        for column in &QUESTIONNAIRE_COLUMNS[2..] {
            let value = self
                .answers
                .iter()
                .find(|(field, _)| field.column() == *column)
                .map(|(_, v)| v.clone())
                .unwrap_or_default();
            row.push(value);
        }
        row
    }
}

// =============================================================================
// Debrief
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebriefResponses {
    pub overall_stress: u8,
    pub overall_confidence: u8,
    pub phase_preference: String,
    pub final_strategy: String,
    pub comments: String,
}

impl DebriefResponses {
    pub fn validate(&self) -> Result<(), QuestionnaireError> {
        for (field, value) in [
            ("overall_stress", self.overall_stress),
            ("overall_confidence", self.overall_confidence),
        ] {
            if !(1..=5).contains(&value) {
                return Err(QuestionnaireError::BadScale {
                    field,
                    value: value.to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn to_row(&self, participant_id: &ParticipantId) -> Vec<String> {
        vec![
            participant_id.to_string(),
            self.overall_stress.to_string(),
            self.overall_confidence.to_string(),
            self.phase_preference.clone(),
            self.final_strategy.clone(),
            self.comments.clone(),
        ]
    }
}

// =============================================================================
// Session archive record
// =============================================================================

/// What the archive keeps per finished session: enough to replay it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub participant_id: ParticipantId,
    pub seed: u64,
    pub phase_order: [Phase; PHASE_COUNT],
    pub rounds_played: u32,
    pub cumulative_earnings: i64,
    pub digest: String,
    pub completed_at: String,
}

// =============================================================================
// CSV line helpers
// =============================================================================

/// Quote a field when it carries a separator, quote or line break.
pub fn csv_escape(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

pub fn csv_line<S: AsRef<str>>(fields: &[S]) -> String {
    fields
        .iter()
        .map(|f| csv_escape(f.as_ref()))
        .collect::<Vec<_>>()
        .join(",")
}

/// Split one CSV line, honouring double-quoted fields.
pub fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut cur = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match (c, in_quotes) {
            ('"', true) if chars.peek() == Some(&'"') => {
                cur.push('"');
                chars.next();
            }
            ('"', true) => in_quotes = false,
            ('"', false) if cur.is_empty() => in_quotes = true,
            (',', false) => fields.push(std::mem::take(&mut cur)),
            _ => cur.push(c),
        }
    }
    fields.push(cur);
    fields
}
