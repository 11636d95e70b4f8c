//! Console run of one participant: choices and questionnaire answers come
//! from stdin, prompts go to stdout.

use std::io::{self, BufRead, Lines, StdinLock, Write};
use std::time::Instant;

use anyhow::{Context, Result};
use ellsberg::analysis::{session_digest, summarize_session};
use ellsberg::config::ExperimentConfig;
use ellsberg::design::{BoxChoice, Disclosure, Phase};
use ellsberg::engine::{PhaseExport, RoundAdvance, Session};
use ellsberg::logging::{self, obj, v_num, v_str, Domain, Level};
use ellsberg::persist::Recorder;
use ellsberg::record::{DebriefResponses, ParticipantId, QuestionField, QuestionnaireResponses};
use ellsberg::remote::{HttpTransport, RemoteConfig, RemoteHandle};
use ellsberg::storage::SessionArchive;

struct Console {
    lines: Lines<StdinLock<'static>>,
}

impl Console {
    fn new() -> Self {
        Self {
            lines: io::stdin().lock().lines(),
        }
    }

    /// `None` on end of input.
    fn ask(&mut self, prompt: &str) -> Result<Option<String>> {
        print!("{} ", prompt);
        io::stdout().flush()?;
        match self.lines.next() {
            Some(line) => Ok(Some(line?.trim().to_string())),
            None => Ok(None),
        }
    }

    fn ask_until<T>(&mut self, prompt: &str, parse: impl Fn(&str) -> Option<T>) -> Result<Option<T>> {
        loop {
            let Some(answer) = self.ask(prompt)? else {
                return Ok(None);
            };
            if let Some(v) = parse(&answer) {
                return Ok(Some(v));
            }
            println!("  not a valid answer, try again");
        }
    }
}

fn describe(disclosure: Disclosure, p_red: f64) -> String {
    match disclosure {
        Disclosure::Known => format!("{:.0}% red, {:.0}% black", p_red * 100.0, (1.0 - p_red) * 100.0),
        Disclosure::Ambiguous => "red and black in unknown proportion".to_string(),
        Disclosure::AmbiguousWithSurprise => "unknown proportion, may hold special balls".to_string(),
    }
}

fn scale(answer: &str) -> Option<String> {
    if answer.is_empty() {
        return Some(String::new());
    }
    match answer.parse::<u8>() {
        Ok(v) if (1..=5).contains(&v) => Some(v.to_string()),
        _ => None,
    }
}

fn questionnaire(console: &mut Console, phase: Phase) -> Result<QuestionnaireResponses> {
    println!("\nA few questions about phase {} (blank to skip).", phase);
    let mut responses = QuestionnaireResponses::new();
    for field in QuestionField::for_phase(phase) {
        let answer = if field.is_scale() {
            console.ask_until(&format!("  {} (1-5):", field.column()), scale)?
        } else {
            console.ask(&format!("  {}:", field.column()))?
        };
        match answer {
            Some(a) if !a.is_empty() => responses.set(*field, a),
            Some(_) => {}
            None => break,
        }
    }
    Ok(responses)
}

fn debrief(console: &mut Console) -> Result<Option<DebriefResponses>> {
    println!("\nLast questions about the whole experiment.");
    let to_scale = |a: &str| a.parse::<u8>().ok().filter(|v| (1..=5).contains(v));
    let Some(overall_stress) = console.ask_until("  overall stress (1-5):", to_scale)? else {
        return Ok(None);
    };
    let Some(overall_confidence) = console.ask_until("  overall confidence (1-5):", to_scale)? else {
        return Ok(None);
    };
    let phase_preference = console.ask("  which phase did you prefer?")?.unwrap_or_default();
    let final_strategy = console.ask("  describe your final strategy:")?.unwrap_or_default();
    let comments = console.ask("  any comments?")?.unwrap_or_default();
    Ok(Some(DebriefResponses {
        overall_stress,
        overall_confidence,
        phase_preference,
        final_strategy,
        comments,
    }))
}

/// Save a finished phase. A file system failure is offered for retry and
/// falls back to a per-phase export; the session stays in memory either way
/// and is archived at the end.
fn save_phase(console: &mut Console, recorder: &Recorder, export: &PhaseExport) -> Result<()> {
    loop {
        let err = match recorder.save_phase(export) {
            Ok(_) => return Ok(()),
            Err(e) if e.is_retryable() => e,
            Err(e) => return Err(e.into()),
        };
        eprintln!("results not saved: {}", err);
        let retry = console.ask("Retry saving? [Y/n]")?;
        if matches!(retry.as_deref(), Some(a) if !a.to_lowercase().starts_with('n')) {
            continue;
        }
        match recorder.export_fallback(export) {
            Ok(path) => eprintln!("phase {} rows written to {}", export.phase, path.display()),
            Err(e) => eprintln!("fallback export failed too: {}", e),
        }
        return Ok(());
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = ExperimentConfig::from_env().context("loading configuration")?;
    logging::log(
        Level::Info,
        Domain::System,
        "startup",
        obj(&[
            ("rounds_per_phase", v_num(cfg.design.rounds_per_phase as f64)),
            ("results_csv", v_str(&cfg.results_csv)),
            ("remote", v_str(if cfg.remote_url.is_some() { "on" } else { "off" })),
        ]),
    );

    let mut console = Console::new();
    let Some(participant_id) = console.ask_until("Participant number:", |a| ParticipantId::parse(a).ok())? else {
        return Ok(());
    };

    let mut recorder = Recorder::new(&cfg);
    if let Some(url) = &cfg.remote_url {
        let transport = HttpTransport::new(url.clone(), cfg.remote_secret.clone());
        let (handle, _status) = RemoteHandle::spawn(
            transport,
            RemoteConfig {
                retry: cfg.remote_retry.clone(),
                breaker_threshold: cfg.remote_breaker_threshold,
                breaker_cooldown: cfg.remote_breaker_cooldown,
            },
        );
        recorder = recorder.with_remote(handle);
    }
    let mut archive = SessionArchive::new(&cfg.archive_path)?;
    archive.init()?;

    let seed = cfg.session_seed(&participant_id);
    let mut session = Session::create(participant_id.clone(), cfg.design.clone(), seed)?;
    let rounds = cfg.design.rounds_per_phase;

    'phases: for (i, phase) in session.phase_order().into_iter().enumerate() {
        session.reset_for_phase(phase)?;
        println!("\n=== Part {} of {} ===", i + 1, session.phase_order().len());
        println!("Box A: {}", describe(phase.disclosure(BoxChoice::A), session.p_safe()));
        println!("Box B: {}", describe(phase.disclosure(BoxChoice::B), session.p_uncertain()));

        loop {
            let shown = Instant::now();
            let prompt = format!("Round {}/{}: draw from box A or B?", session.round(), rounds);
            let Some(choice) = console.ask_until(&prompt, BoxChoice::parse)? else {
                // abandoned mid-phase: keep what was played
                if let Ok(export) = session.phase_export(phase) {
                    if !export.records.is_empty() {
                        save_phase(&mut console, &recorder, &export)?;
                    }
                }
                break 'phases;
            };
            let record = session.play_round(choice, shown.elapsed().as_secs_f64())?;
            println!(
                "  {} ball: {:+} (total {})",
                record.outcome, record.reward, record.cumulative_earnings
            );
            if session.next_round()? == RoundAdvance::PhaseComplete {
                break;
            }
        }

        save_phase(&mut console, &recorder, &session.phase_export(phase)?)?;
        let responses = questionnaire(&mut console, phase)?;
        if !responses.is_empty() {
            if let Err(e) = recorder.save_questionnaire(Some(&participant_id), Some(phase), &responses) {
                eprintln!("questionnaire not saved: {}", e);
            }
        }
    }

    let digest = session_digest(session.trial_log(), session.initial_probs());
    archive.archive_session(&session.archive_record(digest.clone()))?;
    logging::log_session_summary(
        participant_id.as_str(),
        session.trial_log().len(),
        session.cumulative_earnings(),
        &digest,
    );
    for summary in summarize_session(&session) {
        logging::log(
            Level::Info,
            Domain::Session,
            "phase_summary",
            obj(&[
                ("phase", v_num(summary.phase.id() as f64)),
                ("share_b", v_num(summary.share_b)),
                ("earnings", v_num(summary.earnings as f64)),
                ("switches", v_num(summary.switches as f64)),
            ]),
        );
    }

    if session.is_finished() {
        println!("\nYou earned {} points in total.", session.cumulative_earnings());
        if let Some(answers) = debrief(&mut console)? {
            match recorder.save_debrief(&participant_id, &answers) {
                Ok(path) => archive.archive_debrief(&participant_id, &answers, &logging::ts_now())
                    .with_context(|| format!("archiving debrief saved to {}", path.display()))?,
                Err(e) => eprintln!("debrief not saved: {}", e),
            }
        }
    }

    recorder.close().await;
    Ok(())
}
