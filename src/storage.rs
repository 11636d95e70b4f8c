use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::design::{Phase, PHASE_COUNT};
use crate::record::{DebriefResponses, ParticipantId, SessionRecord};

/// SQLite archive of finished sessions and debriefs.
pub struct SessionArchive {
    conn: Connection,
}

impl SessionArchive {
    pub fn new(path: &str) -> Result<Self> {
        Ok(Self { conn: Connection::open(path)? })
    }

    pub fn init(&mut self) -> Result<()> {
        self.conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                participant_id TEXT NOT NULL,
                seed TEXT NOT NULL,
                phase_order TEXT NOT NULL,
                rounds_played INTEGER NOT NULL,
                cumulative_earnings INTEGER NOT NULL,
                digest TEXT NOT NULL,
                completed_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS sessions_participant ON sessions (participant_id);
            CREATE TABLE IF NOT EXISTS debriefs (
                participant_id TEXT NOT NULL,
                overall_stress INTEGER NOT NULL,
                overall_confidence INTEGER NOT NULL,
                phase_preference TEXT NOT NULL,
                final_strategy TEXT NOT NULL,
                comments TEXT NOT NULL,
                ts TEXT NOT NULL
            );
            COMMIT;",
        )?;
        Ok(())
    }

    pub fn archive_session(&mut self, record: &SessionRecord) -> Result<()> {
        let order = record
            .phase_order
            .iter()
            .map(|p| p.id().to_string())
            .collect::<Vec<_>>()
            .join(",");
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO sessions (participant_id, seed, phase_order, rounds_played, cumulative_earnings, digest, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.participant_id.as_str(),
                // u64 does not fit INTEGER; keep it exact as text
                record.seed.to_string(),
                order,
                record.rounds_played as i64,
                record.cumulative_earnings,
                record.digest,
                record.completed_at
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Most recent archived session for a participant.
    pub fn latest_session(&self, participant_id: &ParticipantId) -> Result<Option<SessionRecord>> {
        let row = self
            .conn
            .query_row(
                "SELECT seed, phase_order, rounds_played, cumulative_earnings, digest, completed_at
                 FROM sessions WHERE participant_id = ?1 ORDER BY id DESC LIMIT 1",
                params![participant_id.as_str()],
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, i64>(2)?,
                        r.get::<_, i64>(3)?,
                        r.get::<_, String>(4)?,
                        r.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((seed, order, rounds, earnings, digest, completed_at)) = row else {
            return Ok(None);
        };
        Ok(Some(SessionRecord {
            participant_id: participant_id.clone(),
            seed: seed.parse().map_err(|_| anyhow!("corrupt seed in archive: {}", seed))?,
            phase_order: parse_phase_order(&order)?,
            rounds_played: rounds as u32,
            cumulative_earnings: earnings,
            digest,
            completed_at,
        }))
    }

    pub fn archive_debrief(&mut self, participant_id: &ParticipantId, debrief: &DebriefResponses, ts: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO debriefs (participant_id, overall_stress, overall_confidence, phase_preference, final_strategy, comments, ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                participant_id.as_str(),
                debrief.overall_stress as i64,
                debrief.overall_confidence as i64,
                debrief.phase_preference,
                debrief.final_strategy,
                debrief.comments,
                ts
            ],
        )?;
        Ok(())
    }

    pub fn session_count(&self) -> Result<u64> {
        let n: i64 = self.conn.query_row("SELECT COUNT(*) FROM sessions", [], |r| r.get(0))?;
        Ok(n as u64)
    }
}

fn parse_phase_order(raw: &str) -> Result<[Phase; PHASE_COUNT]> {
    let phases = raw
        .split(',')
        .map(|p| p.trim().parse::<u8>().ok().and_then(Phase::from_id))
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| anyhow!("corrupt phase order in archive: {}", raw))?;
    phases
        .try_into()
        .map_err(|_| anyhow!("phase order must list {} phases: {}", PHASE_COUNT, raw))
}
