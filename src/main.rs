use std::path::PathBuf;

use clap::{Parser, Subcommand};
use colored::{ColoredString, Colorize};

use a3s_warden::{
    HealthLevel, HealthReport, MonitorEvent, ProtectionCoordinator, ProtectionLevel, Result,
    Severity, Threat, WardenConfig, WardenError,
};

#[derive(Parser)]
#[command(
    name = "a3s-warden",
    about = "a3s-warden: build-environment health monitoring and resilient builds"
)]
struct Cli {
    /// Path to warden.hcl (defaults apply when the file is missing)
    #[arg(short, long, default_value = "warden.hcl")]
    file: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every threat detector once
    Scan {
        #[arg(long)]
        json: bool,
    },
    /// Full health assessment
    Health {
        #[arg(long)]
        json: bool,
    },
    /// Prepare the host, build with retries, then clean up
    Build {
        /// Build target (e.g. path to Cargo.toml)
        target: PathBuf,
        /// Maximum attempts (default: build.max_attempts)
        #[arg(short, long)]
        attempts: Option<u32>,
    },
    /// Monitor and mitigate until Ctrl-C
    Monitor {
        /// minimal | standard | aggressive | emergency
        #[arg(short, long)]
        level: Option<ProtectionLevel>,
    },
    /// Kill orphaned build processes and clear temp artifacts
    Cleanup,
    /// Validate warden.hcl without doing anything
    Validate,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match WardenConfig::from_file_or_default(&cli.file) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{} {e}", "[warden]".red().bold());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.warden.log_level)),
        )
        .without_time()
        .init();

    if let Err(e) = run(cli, config).await {
        eprintln!("{} {e}", "[warden]".red().bold());
        std::process::exit(1);
    }
}

async fn run(cli: Cli, config: WardenConfig) -> Result<()> {
    match cli.command {
        Commands::Validate => {
            config.validate()?;
            println!(
                "{} {} is valid",
                "✓".green(),
                cli.file.display().to_string().cyan()
            );
        }

        Commands::Scan { json } => {
            let warden = ProtectionCoordinator::with_system(config);
            let threats = warden.scanner().scan().await;
            if json {
                print_json(&threats)?;
            } else if threats.is_empty() {
                println!("{} no threats detected", "✓".green());
            } else {
                for t in &threats {
                    print_threat(t);
                }
            }
        }

        Commands::Health { json } => {
            let warden = ProtectionCoordinator::with_system(config);
            let report = warden.perform_health_check().await;
            if json {
                print_json(&report)?;
            } else {
                print_report(&report);
            }
        }

        Commands::Build { target, attempts } => {
            let attempts = attempts.unwrap_or(config.build.max_attempts);
            let warden = ProtectionCoordinator::with_system(config);
            let report = warden.run_protected_build(&target, attempts).await;
            for a in &report.attempts {
                println!(
                    "  attempt {}  {:?}  {}ms",
                    a.attempt,
                    a.outcome,
                    a.duration.as_millis()
                );
            }
            if report.refused {
                return Err(WardenError::BuildRefused {
                    target: target.display().to_string(),
                });
            }
            if !report.succeeded {
                return Err(WardenError::ExhaustedRetries {
                    target: target.display().to_string(),
                    attempts: report.attempts.len() as u32,
                });
            }
            println!("{} {} built", "✓".green(), target.display());
        }

        Commands::Monitor { level } => {
            let level = level.unwrap_or(config.warden.protection_level);
            let warden = ProtectionCoordinator::with_system(config);
            let mut events = warden.monitor().subscribe();
            warden.initialize(level).await;
            println!(
                "{} monitoring at {} (Ctrl-C to stop)",
                "→".cyan(),
                level.to_string().bold()
            );

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => match event {
                        Ok(e) => print_event(&e),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(skipped = n, "Monitor events lagged");
                        }
                        Err(_) => break,
                    },
                }
            }
            warden.shutdown().await;
        }

        Commands::Cleanup => {
            let warden = ProtectionCoordinator::with_system(config);
            let report = warden.perform_post_build_cleanup().await;
            println!(
                "{} killed {} process(es), removed {} item(s), {} failure(s)",
                "✓".green(),
                report.processes.killed.len(),
                report.files.removed,
                report.processes.failed.len() + report.files.failed
            );
        }
    }
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value)
        .map_err(|e| WardenError::Io(std::io::Error::other(e)))?;
    println!("{out}");
    Ok(())
}

fn severity_label(s: Severity) -> ColoredString {
    let label = format!("{:<8}", s.to_string());
    match s {
        Severity::Critical => label.red().bold(),
        Severity::High => label.red(),
        Severity::Medium => label.yellow(),
        Severity::Low => label.dimmed(),
        Severity::None => label.normal(),
    }
}

fn level_label(l: HealthLevel) -> ColoredString {
    let label = l.to_string();
    match l {
        HealthLevel::Critical => label.red().bold(),
        HealthLevel::Degraded => label.yellow(),
        HealthLevel::Optimal => label.green(),
        HealthLevel::Unknown => label.dimmed(),
    }
}

fn print_threat(t: &Threat) {
    println!(
        "{} {:<16} {}",
        severity_label(t.severity()),
        t.category().to_string().cyan(),
        t.description()
    );
    if !t.mitigation().is_empty() {
        println!("{:<26}{}", "", t.mitigation().dimmed());
    }
}

fn print_report(r: &HealthReport) {
    println!("{:<20} {}", "overall".bold(), level_label(r.overall));
    println!("{:<20} {} ({})", "score", r.score, level_label(r.score_level));
    println!("{:<20} {}", "threats", level_label(r.threat_level));
    println!("{:<20} {}", "build system", level_label(r.build_system));
    println!("{:<20} {}", "runtime stability", level_label(r.runtime_stability));
    if !r.threats.is_empty() {
        println!();
        for t in &r.threats {
            print_threat(t);
        }
    }
    if !r.recommendations.is_empty() {
        println!();
        for rec in &r.recommendations {
            println!("{} {rec}", "→".cyan());
        }
    }
}

fn print_event(e: &MonitorEvent) {
    match e {
        MonitorEvent::Started { interval } => {
            println!("{} started, every {}s", "[monitor]".cyan(), interval.as_secs())
        }
        MonitorEvent::TickCompleted {
            overall,
            threats,
            mitigations,
        } => println!(
            "{} {}  {threats} threat(s), {mitigations} mitigation(s)",
            "[monitor]".cyan(),
            level_label(*overall)
        ),
        MonitorEvent::EmergencyTriggered => {
            println!("{} {}", "[monitor]".cyan(), "emergency protections applied".red())
        }
        MonitorEvent::TickFailed { error } => {
            println!("{} tick failed: {error}", "[monitor]".cyan())
        }
        MonitorEvent::Stopped => println!("{} stopped", "[monitor]".cyan()),
    }
}
