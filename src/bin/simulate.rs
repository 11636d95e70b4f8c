//! Synthetic participants under a fixed choice policy.
//!
//!   SIM_POLICY=win-stay-lose-shift SIM_PARTICIPANTS=50 cargo run --bin simulate
//!
//! Rows go to RESULTS_CSV like a console run; a per-phase summary is logged.

use anyhow::{anyhow, Result};
use rand::{rngs::StdRng, Rng, SeedableRng};

use ellsberg::analysis::{session_digest, summarize_session};
use ellsberg::config::ExperimentConfig;
use ellsberg::design::{BoxChoice, Phase};
use ellsberg::engine::{RoundAdvance, Session};
use ellsberg::logging::{self, obj, v_num, v_str, Domain, Level};
use ellsberg::persist::Recorder;
use ellsberg::record::{ParticipantId, TrialRecord};
use ellsberg::rng::derive_seed;

#[derive(Debug, Clone, Copy)]
enum Policy {
    Random,
    AlwaysA,
    AlwaysB,
    WinStayLoseShift,
}

impl Policy {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "random" => Some(Policy::Random),
            "always-a" => Some(Policy::AlwaysA),
            "always-b" => Some(Policy::AlwaysB),
            "win-stay-lose-shift" | "wsls" => Some(Policy::WinStayLoseShift),
            _ => None,
        }
    }

    fn choose(&self, last: Option<&TrialRecord>, rng: &mut StdRng) -> BoxChoice {
        match self {
            Policy::AlwaysA => BoxChoice::A,
            Policy::AlwaysB => BoxChoice::B,
            Policy::Random => {
                if rng.gen_bool(0.5) {
                    BoxChoice::A
                } else {
                    BoxChoice::B
                }
            }
            Policy::WinStayLoseShift => match last {
                Some(r) if r.reward > 0 => r.box_chosen,
                Some(r) => r.box_chosen.other(),
                None => BoxChoice::A,
            },
        }
    }
}

fn main() -> Result<()> {
    let cfg = ExperimentConfig::from_env()?;
    let policy_name = std::env::var("SIM_POLICY").unwrap_or_else(|_| "random".to_string());
    let policy = Policy::parse(&policy_name).ok_or_else(|| anyhow!("unknown SIM_POLICY: {}", policy_name))?;
    let participants: u32 = std::env::var("SIM_PARTICIPANTS").ok().and_then(|v| v.parse().ok()).unwrap_or(20);
    let base_seed = cfg.base_seed.unwrap_or(42);

    let recorder = Recorder::new(&cfg);
    let mut share_b = [0.0_f64; 3];
    let mut earnings = [0_i64; 3];

    for n in 1..=participants {
        let pid = ParticipantId::parse(&n.to_string())?;
        let mut session = Session::create(pid.clone(), cfg.design.clone(), cfg.session_seed(&pid))?;
        let mut choice_rng = StdRng::seed_from_u64(derive_seed(base_seed, &format!("policy:{}", pid)));

        for phase in session.phase_order() {
            session.reset_for_phase(phase)?;
            loop {
                let choice = policy.choose(session.phase_records(phase).last(), &mut choice_rng);
                let decision_time = choice_rng.gen_range(0.3..3.0);
                session.play_round(choice, decision_time)?;
                if session.next_round()? == RoundAdvance::PhaseComplete {
                    break;
                }
            }
            recorder.save_phase(&session.phase_export(phase)?)?;
        }

        for summary in summarize_session(&session) {
            let i = summary.phase.id() as usize - 1;
            share_b[i] += summary.share_b;
            earnings[i] += summary.earnings;
        }
        logging::log_session_summary(
            pid.as_str(),
            session.trial_log().len(),
            session.cumulative_earnings(),
            &session_digest(session.trial_log(), session.initial_probs()),
        );
    }

    println!("policy {} over {} participants", policy_name, participants);
    for phase in Phase::ALL {
        let i = phase.id() as usize - 1;
        let mean_share = share_b[i] / participants.max(1) as f64;
        let mean_earnings = earnings[i] as f64 / participants.max(1) as f64;
        println!("  phase {}: share B {:.3}, mean earnings {:.1}", phase, mean_share, mean_earnings);
        logging::log(
            Level::Info,
            Domain::System,
            "simulation_summary",
            obj(&[
                ("policy", v_str(&policy_name)),
                ("phase", v_num(phase.id() as f64)),
                ("mean_share_b", v_num(mean_share)),
                ("mean_earnings", v_num(mean_earnings)),
            ]),
        );
    }
    println!("rows written to {}", recorder.results_path().display());
    Ok(())
}
