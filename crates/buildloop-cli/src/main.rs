use anyhow::{Result, anyhow};
use buildloop_builder::{
    Collaborators, CommandAnalyzer, CommandTestRunner, FileArtifactSink, RecursiveBuilder,
    ScriptedAnswerSource, StdinAnswerSource,
};
use buildloop_core::{AppConfig, TaskReport, TaskState};
use buildloop_llm::ModelGateway;
use buildloop_observe::Observer;
use buildloop_store::ConversationStore;
use clap::Parser;
use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "buildloop")]
#[command(about = "Recursive, conversation-driven code generation", long_about = None)]
struct Cli {
    /// Top-level build prompt. Read from stdin when omitted.
    prompt: Option<String>,

    /// Workspace directory holding config, state and artifacts.
    #[arg(long, default_value = ".")]
    workspace: PathBuf,

    /// Override the configured recursion depth bound.
    #[arg(long)]
    max_depth: Option<u32>,

    /// Override the generation model for this invocation.
    #[arg(long)]
    model: Option<String>,

    /// Override the LLM provider (deepseek or openai).
    #[arg(long)]
    provider: Option<String>,

    /// Answer clarifying questions automatically instead of prompting.
    #[arg(long)]
    non_interactive: bool,

    /// Discard previously persisted conversation state before running.
    #[arg(long)]
    discard_state: bool,

    /// Mirror run events to stderr.
    #[arg(long)]
    verbose: bool,

    /// Print the task report as JSON.
    #[arg(long)]
    json: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("buildloop: {err:#}");
            ExitCode::from(2)
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let mut cfg = AppConfig::ensure(&cli.workspace)?;
    apply_cli_flags(&mut cfg, &cli);

    let mut observer = Observer::new(&cli.workspace)?;
    observer.set_verbose(cli.verbose);

    let mut store =
        ConversationStore::open(&cli.workspace, &cfg.store, &cfg.builder.system_prompt)?;
    if cli.discard_state {
        store.reset()?;
    }

    let gateway = ModelGateway::from_config(&cfg.llm)?;
    let collaborators = Collaborators {
        analyzer: Box::new(CommandAnalyzer::from_config(&cfg.builder)),
        tester: Box::new(CommandTestRunner::from_config(&cfg.builder)),
        artifacts: Box::new(FileArtifactSink::new(
            cli.workspace.join(&cfg.builder.artifacts_dir),
            cfg.builder.snippet_suffix.clone(),
        )),
        answers: if cli.non_interactive {
            Box::new(ScriptedAnswerSource::default())
        } else {
            Box::new(StdinAnswerSource)
        },
    };

    let prompt = read_prompt(&cli)?;
    let mut builder =
        RecursiveBuilder::new(gateway, store, observer, collaborators, cfg.builder.clone());
    let report = builder.run(&prompt)?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    Ok(if report.state == TaskState::Complete {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

fn apply_cli_flags(cfg: &mut AppConfig, cli: &Cli) {
    if let Some(depth) = cli.max_depth {
        cfg.builder.max_depth = depth;
    }
    if let Some(model) = &cli.model {
        cfg.llm.generate_model = model.clone();
    }
    if let Some(provider) = &cli.provider {
        cfg.llm.provider = provider.clone();
    }
}

fn read_prompt(cli: &Cli) -> Result<String> {
    if let Some(prompt) = &cli.prompt {
        return Ok(prompt.clone());
    }
    let mut buffer = String::new();
    std::io::stdin().read_to_string(&mut buffer)?;
    let prompt = buffer.trim().to_string();
    if prompt.is_empty() {
        return Err(anyhow!("no prompt given (pass one as an argument or on stdin)"));
    }
    Ok(prompt)
}

fn print_report(report: &TaskReport) {
    match report.state {
        TaskState::Complete => {
            println!(
                "Complete at depth {} (artifact {}).",
                report.depth,
                report.artifact_id.as_deref().unwrap_or("-")
            );
        }
        _ => {
            println!(
                "Abandoned at depth {}: {}.",
                report.depth,
                report
                    .reason
                    .as_ref()
                    .map(|r| r.as_str())
                    .unwrap_or("unknown")
            );
            if let Some(detail) = &report.detail {
                println!("  {detail}");
            }
        }
    }
    if let Some(verdict) = &report.verdict {
        if !verdict.test_result.passed {
            println!("Last test run failed:\n{}", verdict.test_result.details);
        }
        for finding in &verdict.lint_findings {
            match finding.line {
                Some(line) => println!("lint: line {line}: {}", finding.message),
                None => println!("lint: {}", finding.message),
            }
        }
        if !verdict.model_feedback.is_empty() {
            println!("Verifier: {}", verdict.model_feedback);
        }
    }
    if let Some(snippet) = &report.snippet {
        println!("\nLast candidate snippet:\n```\n{snippet}\n```");
    }
}
