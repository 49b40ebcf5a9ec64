#![forbid(unsafe_code)]

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, oneshot};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use trialchat::blueprint::Blueprint;
use trialchat::config::ExperimentConfig;
use trialchat::features::{FeatureFlag, FlagGroup, Variant};
use trialchat::gateway::{ChatModel, ProviderGateway, Role, TracingUsageSink};
use trialchat::host::{ChatHost, ChoiceOutcome, ChoiceRequest, Presentation, SurveyAnswers};
use trialchat::orchestrator::{SessionHandle, TurnOrchestrator};
use trialchat::script::load_script;
use trialchat::trial_log::{JsonlTrialLog, TrialLogSink};

#[derive(Parser)]
#[command(name = "trialchat", version, about = "Experimental chat session runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an interactive session in the terminal
    Chat {
        /// Experiment config JSON (features + settings)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Append trial events to this JSONL file
        #[arg(long)]
        log: Option<PathBuf>,
        /// Completion model id (overrides config and TRIALCHAT_MODEL)
        #[arg(long)]
        model: Option<String>,
        #[arg(long, short)]
        verbose: bool,
    },
    /// Check an experiment blueprint file
    ValidateBlueprint {
        #[arg(long)]
        path: PathBuf,
    },
    /// Check a scripted conversation file
    ValidateScript {
        #[arg(long)]
        path: PathBuf,
    },
    /// List feature flags by group
    Flags,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Chat {
            config,
            log,
            model,
            verbose,
        } => {
            let level = if verbose { Level::DEBUG } else { Level::INFO };
            FmtSubscriber::builder()
                .with_max_level(level)
                .with_target(false)
                .with_writer(io::stderr)
                .compact()
                .init();
            run_chat(config, log, model).await?;
        }
        Commands::ValidateBlueprint { path } => {
            let blueprint = Blueprint::load(&path)?;
            for (i, block) in blueprint.blocks().iter().enumerate() {
                println!(
                    "{:>2}. {} ({} messages, {} feature overrides, {} setting overrides)",
                    i + 1,
                    block.name,
                    block.duration_messages,
                    block.features.len(),
                    block.settings.len()
                );
            }
            let issues = blueprint.validate();
            for issue in &issues {
                println!("warning: {issue}");
            }
            println!("{} blocks, {} warnings", blueprint.len(), issues.len());
        }
        Commands::ValidateScript { path } => {
            let steps = load_script(&path)?;
            let mut warnings = 0;
            for (i, step) in steps.iter().enumerate() {
                if let Some(issue) = step.issue() {
                    warnings += 1;
                    println!("warning: step {}: {issue}", i + 1);
                }
            }
            println!("{} steps, {warnings} warnings", steps.len());
        }
        Commands::Flags => {
            for group in FlagGroup::ALL {
                println!("{}", group.title());
                for flag in group.flags() {
                    print_flag(flag);
                }
            }
            println!("Other");
            for flag in FeatureFlag::ALL.iter().filter(|f| f.group().is_none()) {
                print_flag(*flag);
            }
        }
    }

    Ok(())
}

fn print_flag(flag: FeatureFlag) {
    let excludes: Vec<&str> = flag.excludes().iter().map(FeatureFlag::name).collect();
    if excludes.is_empty() {
        println!("  {flag}");
    } else {
        println!("  {flag} (excludes {})", excludes.join(", "));
    }
}

async fn run_chat(
    config_path: Option<PathBuf>,
    log_path: Option<PathBuf>,
    model: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let experiment = match config_path {
        Some(path) => ExperimentConfig::load(path)?,
        None => ExperimentConfig::default(),
    };
    let model = model
        .or_else(|| experiment.model.clone())
        .or_else(|| std::env::var("TRIALCHAT_MODEL").ok())
        .map(ChatModel::openai)
        .unwrap_or_default();

    let gateway = Arc::new(ProviderGateway::from_env(Arc::new(TracingUsageSink))?);
    let host = Arc::new(TerminalHost::default());
    let (mut orchestrator, handle) =
        TurnOrchestrator::new(experiment.to_configuration(), gateway, host.clone());
    orchestrator = orchestrator
        .with_model(model)
        .with_base_dir(experiment.base_dir.clone());

    let mut log_worker = None;
    if let Some(path) = log_path {
        let (sink, worker) = JsonlTrialLog::open(&path)?;
        let sink: Arc<dyn TrialLogSink> = Arc::new(sink);
        orchestrator = orchestrator.with_trial_log(sink);
        log_worker = Some(worker);
    }

    spawn_stdin_reader(host, handle);
    let summary = orchestrator.run().await;
    println!(
        "-- session {} ended ({}), {} turns",
        summary.session_id, summary.end_reason, summary.turns
    );

    if let Some(worker) = log_worker {
        worker.join()?;
    }
    Ok(())
}

/// Reads stdin on a plain thread; a blocked read must not hold up runtime shutdown.
fn spawn_stdin_reader(host: Arc<TerminalHost>, handle: SessionHandle) {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    std::thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });

    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if host.answer(&line) {
                continue;
            }
            if route_line(&handle, line.trim()).is_err() {
                break;
            }
        }
        let _ = handle.end();
    });
}

fn route_line(handle: &SessionHandle, line: &str) -> Result<(), trialchat::SessionClosed> {
    if line == "/end" {
        return handle.end();
    }
    if let Some(query) = line.strip_prefix("/search ") {
        return handle.send_with_search(query);
    }
    if let Some(rest) = line.strip_prefix("/set ") {
        let mut parts = rest.split_whitespace();
        let (Some(name), Some(value)) = (parts.next(), parts.next()) else {
            eprintln!("usage: /set FLAG on|off");
            return Ok(());
        };
        let Ok(flag) = name.parse::<FeatureFlag>() else {
            eprintln!("unknown feature {name}");
            return Ok(());
        };
        return handle.change_features(vec![(flag, matches!(value, "on" | "true" | "1"))]);
    }
    handle.send_message(line)
}

/// Line-oriented host. Choices and surveys claim the next stdin line.
#[derive(Default)]
struct TerminalHost {
    pending: Mutex<Option<oneshot::Sender<String>>>,
}

impl TerminalHost {
    /// Hand a line to a waiting prompt. Returns false when nothing is waiting.
    fn answer(&self, line: &str) -> bool {
        let Ok(mut pending) = self.pending.lock() else {
            return false;
        };
        match pending.take() {
            Some(tx) => {
                let _ = tx.send(line.trim().to_string());
                true
            }
            None => false,
        }
    }

    async fn ask(&self) -> Option<String> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().ok()?;
            *pending = Some(tx);
        }
        rx.await.ok()
    }

    fn print(&self, line: &str) {
        let mut out = io::stdout().lock();
        let _ = writeln!(out, "{line}");
        let _ = out.flush();
    }
}

#[async_trait]
impl ChatHost for TerminalHost {
    fn show_message(&self, role: Role, text: &str, presentation: &Presentation) {
        match role {
            Role::User => {}
            _ if presentation.streamed => self.print(""),
            _ => self.print(&format!("assistant> {text}")),
        }
    }

    fn show_notice(&self, text: &str) {
        self.print(&format!("** {text}"));
    }

    fn set_input_enabled(&self, enabled: bool) {
        if enabled {
            let mut out = io::stdout().lock();
            let _ = write!(out, "you> ");
            let _ = out.flush();
        }
    }

    fn set_thinking(&self, active: bool) {
        if active {
            self.print("(thinking...)");
        }
    }

    fn stream_chunk(&self, text: &str) {
        let mut out = io::stdout().lock();
        let _ = write!(out, "{text}");
        let _ = out.flush();
    }

    fn set_title(&self, title: &str) {
        self.print(&format!("=== {title} ==="));
    }

    fn apply_text_size(&self, size: i64) {
        tracing::debug!(size, "text size ignored by terminal host");
    }

    fn clear_transcript(&self) {
        self.print("");
    }

    async fn present_choice(&self, request: ChoiceRequest) -> Option<ChoiceOutcome> {
        self.print(&format!("-- turn {}: pick a reply ({})", request.turn, request.kind.as_str()));
        for option in &request.options {
            self.print(&format!("[{}] {}", option.variant.label(), option.text));
        }
        let shown = Instant::now();
        loop {
            self.print("choose A or B:");
            let answer = self.ask().await?;
            let chosen = match answer.to_ascii_uppercase().as_str() {
                "A" => Variant::Primary,
                "B" => Variant::Alternate,
                _ => continue,
            };
            return Some(ChoiceOutcome {
                chosen,
                latency: shown.elapsed(),
            });
        }
    }

    async fn run_survey(&self, turn: u64) -> Option<SurveyAnswers> {
        self.print(&format!("-- survey after turn {turn}: rate the assistant 1-5 (blank to skip)"));
        let answer = self.ask().await?;
        let rating: u8 = answer.parse().ok().filter(|r| (1..=5).contains(r))?;
        let mut answers = SurveyAnswers::new();
        answers.insert("rating".to_string(), rating.into());
        Some(answers)
    }

    fn session_ended(&self, reason: &str) {
        self.print(&format!("** session ended: {reason}"));
    }
}
