use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use zenb_kernel::{
    FixedStepDriver, KernelConfig, KernelEvent, Observation, PatternRecommender, ProtocolTable,
    RuntimeKernel, TempoController,
};

const DEFAULT_CONFIG: &str = "config/kernel.toml";
/// Host frame rate used by `simulate`
const FRAME_SEC: f32 = 1.0 / 60.0;

#[derive(Parser)]
#[command(name = "zenb-cli", about = "Drive the ZenB runtime kernel from the terminal")]
struct Cli {
    /// Kernel config file; missing files fall back to built-in defaults
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List built-in breathing protocols
    Protocols,
    /// Print the effective configuration as TOML
    Config {
        /// Also write it to this file
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Run a synthetic session with a steady heart rate
    Simulate {
        #[arg(long, default_value = "4-7-8")]
        protocol: String,
        #[arg(long, default_value_t = 60.0)]
        seconds: f32,
        #[arg(long, default_value_t = 65.0)]
        hr: f32,
        /// Let the PID tempo loop steer the pace
        #[arg(long)]
        pid: bool,
        /// Print the session summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Suggest protocols for a local hour
    Recommend {
        /// Local hour, 0-23
        #[arg(long, value_parser = clap::value_parser!(u8).range(0..24))]
        hour: u8,
        #[arg(long, default_value_t = 3)]
        limit: usize,
        /// Protocols run recently, newest first
        #[arg(long, value_delimiter = ',')]
        recent: Vec<String>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    let config = KernelConfig::load_layered(Some(config_path.as_path()), None)?;

    match cli.cmd {
        Commands::Protocols => {
            let table = ProtocolTable::builtin();
            println!(
                "{:<12} {:<22} {:>16} {:>6} {:>7}",
                "id", "label", "in/hold/out/hold", "bpm", "impact"
            );
            for p in table.iter() {
                let t = &p.timings;
                println!(
                    "{:<12} {:<22} {:>16} {:>6.1} {:>7.2}",
                    p.id,
                    p.label,
                    format!("{}/{}/{}/{}", t.inhale, t.hold_in, t.exhale, t.hold_out),
                    p.breaths_per_minute(),
                    p.arousal_impact
                );
            }
        }
        Commands::Config { path } => {
            print!("{}", config.to_toml_string()?);
            if let Some(path) = path {
                config.save_to_file(&path)?;
                eprintln!("Wrote {}", path.display());
            }
        }
        Commands::Simulate {
            protocol,
            seconds,
            hr,
            pid,
            json,
        } => simulate(config, &protocol, seconds, hr, pid, json)?,
        Commands::Recommend {
            hour,
            limit,
            recent,
        } => {
            let mut recommender = PatternRecommender::new();
            for id in recent.iter().rev() {
                recommender.record(id.as_str());
            }
            for rec in recommender.recommend(&ProtocolTable::builtin(), hour, limit) {
                println!("{:<12} {:>6.1}  {}", rec.protocol_id, rec.score, rec.reason);
            }
        }
    }
    Ok(())
}

fn simulate(
    config: KernelConfig,
    protocol: &str,
    seconds: f32,
    hr: f32,
    pid: bool,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut kernel = RuntimeKernel::new(config)?;
    let mut driver = FixedStepDriver::new(&kernel.config().runtime);

    let outcome = kernel.dispatch(KernelEvent::load_protocol(0, protocol));
    if !outcome.is_applied() {
        return Err(format!("cannot load protocol {}: {:?}", protocol, outcome).into());
    }
    let outcome = kernel.dispatch(KernelEvent::start_session(0));
    if !outcome.is_applied() {
        return Err(format!("session refused: {:?}", outcome).into());
    }

    let frames = (seconds.max(0.0) / FRAME_SEC).round() as u64;
    let step = driver.step_sec();
    let mut controller = pid.then(TempoController::default);
    for _ in 0..frames {
        driver.drive(&mut kernel, FRAME_SEC, |k| {
            Some(Observation::new(k.get_state().now_ms, step).with_heart_rate(hr, 0.9))
        });
        if let Some(ctl) = controller.as_mut() {
            if let Some(request) = ctl.update(kernel.get_state()) {
                let outcome = kernel.dispatch(request);
                log::debug!("tempo request: {:?}", outcome);
            }
        }
    }

    let now = kernel.get_state().now_ms;
    kernel.dispatch(KernelEvent::halt(now, "simulation finished"));

    let summary = kernel
        .last_session()
        .ok_or("session ended without a summary")?;
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
    } else {
        let state = kernel.get_state();
        let b = &summary.final_belief;
        println!("protocol   {}", summary.protocol_id);
        println!("status     {:?}", state.status);
        println!(
            "session    {:.1}s, {} cycles, final tempo {:.2}",
            summary.duration_sec, summary.cycles, state.tempo_scale
        );
        if let Some(mean_hr) = summary.mean_heart_rate {
            println!("heart rate {:.1} bpm average", mean_hr);
        }
        println!(
            "belief     arousal {:.2} attention {:.2} rhythm {:.2} valence {:.2}",
            b.arousal, b.attention, b.rhythm_alignment, b.valence
        );
        println!(
            "           confidence {:.2} prediction error {:.3}",
            b.confidence, b.prediction_error
        );
        if let Some(resonance) = summary.mean_resonance {
            println!("resonance  {:.2}", resonance);
        }
        let diag = kernel.estimator_diagnostics();
        println!(
            "estimator  {} channels accepted, {} rejected, {} covariance resets",
            diag.accepted_channels, diag.rejected_channels, diag.covariance_resets
        );
    }

    let violations = kernel.violations();
    if violations.is_empty() {
        log::info!("simulation finished without safety violations");
    }
    for v in violations {
        eprintln!(
            "[{:?}] t={}ms {}: {}",
            v.severity, v.timestamp_ms, v.property_name, v.description
        );
    }
    Ok(())
}
