//! Rebuild a participant's archived session from its seed and logged
//! choices, and check it against the results file.
//!
//!   cargo run --bin replay -- <participant_id>

use anyhow::{anyhow, bail, Context, Result};
use std::path::Path;

use ellsberg::analysis::{choices_from_log, replay, session_digest, verify_replay};
use ellsberg::config::ExperimentConfig;
use ellsberg::logging::{self, obj, v_num, v_str, Domain, Level};
use ellsberg::persist::load_results;
use ellsberg::record::{ParticipantId, TrialRecord};
use ellsberg::storage::SessionArchive;

fn main() -> Result<()> {
    let raw = std::env::args().nth(1).ok_or_else(|| anyhow!("usage: replay <participant_id>"))?;
    let participant_id = ParticipantId::parse(&raw)?;
    let cfg = ExperimentConfig::from_env()?;

    let archive = SessionArchive::new(&cfg.archive_path)?;
    let session = archive
        .latest_session(&participant_id)?
        .ok_or_else(|| anyhow!("no archived session for participant {}", participant_id))?;

    let rows = load_results(Path::new(&cfg.results_csv), &participant_id)
        .with_context(|| format!("reading {}", cfg.results_csv))?;
    let played = session.rounds_played as usize;
    if rows.len() < played {
        bail!(
            "results file has {} rows for participant {}, archive expects {}",
            rows.len(),
            participant_id,
            played
        );
    }
    // earlier sessions of the same participant come first in the file
    let recorded: Vec<TrialRecord> = rows[rows.len() - played..].iter().map(|(r, _)| r.clone()).collect();

    let rebuilt = replay(
        &cfg.design,
        &participant_id,
        session.seed,
        Some(session.phase_order),
        &choices_from_log(&recorded),
    )?;
    verify_replay(&recorded, rebuilt.trial_log())?;

    let digest = session_digest(rebuilt.trial_log(), rebuilt.initial_probs());
    let digest_ok = digest == session.digest;
    logging::log(
        if digest_ok { Level::Info } else { Level::Warn },
        Domain::Session,
        "replay_verified",
        obj(&[
            ("participant_id", v_str(participant_id.as_str())),
            ("rounds", v_num(played as f64)),
            ("digest_match", serde_json::Value::Bool(digest_ok)),
        ]),
    );
    if !digest_ok {
        bail!("digest mismatch: archived {}, replayed {}", session.digest, digest);
    }
    println!(
        "participant {}: {} rounds replayed, earnings {}, digest {}",
        participant_id,
        played,
        rebuilt.cumulative_earnings(),
        digest
    );
    Ok(())
}
