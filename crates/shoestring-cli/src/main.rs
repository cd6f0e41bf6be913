//! `shoestring` binary: one-shot requests, a minimal REPL, and resume.

use anyhow::{Result, bail};
use clap::Parser;
use serde_json::json;
use shoestring_agent::{AgentEngine, RunReport};
use shoestring_core::{AppConfig, ExecutionStrategy, ToolCall};
use shoestring_llm::OpenAiCompatClient;
use std::io::{BufRead, Write as _};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "shoestring")]
#[command(about = "Plan-and-verify coding agent for small-context local models", long_about = None)]
struct Cli {
    /// Request to run non-interactively. Omit it for a REPL.
    request: Option<String>,

    /// Workspace root the agent operates in.
    #[arg(short = 'w', long, default_value = ".")]
    workspace: PathBuf,

    /// Override the configured model name.
    #[arg(short = 'm', long)]
    model: Option<String>,

    /// Override the configured endpoint URL.
    #[arg(short = 'u', long)]
    url: Option<String>,

    /// Override the model context window, in tokens.
    #[arg(short = 'c', long)]
    context: Option<u32>,

    /// Execution strategy: reason-then-write (default) or tool-loop.
    #[arg(long)]
    strategy: Option<String>,

    /// Resume the most recent checkpointed run instead of starting one.
    #[arg(long)]
    resume: bool,

    /// Suppress the per-subtask status table.
    #[arg(short = 'q', long)]
    quiet: bool,

    /// Log every stage and tool call to stderr.
    #[arg(short = 'v', long)]
    verbose: bool,
}

fn main() {
    if let Err(e) = run(Cli::parse()) {
        eprintln!("shoestring: {e:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let workspace = cli.workspace.canonicalize()?;
    let mut cfg = AppConfig::load(&workspace)?;
    apply_overrides(&mut cfg, &cli)?;

    let llm = Arc::new(OpenAiCompatClient::new(cfg.llm.clone())?);
    let mut engine = AgentEngine::new(&workspace, cfg, llm)?;

    if cli.resume {
        match engine.resume_latest()? {
            Some(report) => print_report(&report, cli.quiet),
            None => println!("Nothing to resume."),
        }
        return Ok(());
    }

    match cli.request {
        Some(request) => {
            let report = engine.run_request(&request)?;
            print_report(&report, cli.quiet);
            Ok(())
        }
        None => repl(&mut engine, cli.quiet),
    }
}

/// Precedence: flags over environment over config file over defaults.
fn apply_overrides(cfg: &mut AppConfig, cli: &Cli) -> Result<()> {
    if let Ok(model) = std::env::var("SHOESTRING_MODEL") {
        cfg.llm.model = model;
    }
    if let Ok(url) = std::env::var("SHOESTRING_URL") {
        cfg.llm.base_url = url;
    }
    if let Some(model) = &cli.model {
        cfg.llm.model = model.clone();
    }
    if let Some(url) = &cli.url {
        cfg.llm.base_url = url.clone();
    }
    if let Some(context) = cli.context {
        cfg.budgets.max_context_tokens = context;
    }
    if let Some(strategy) = &cli.strategy {
        cfg.agent.strategy = match strategy.as_str() {
            "reason-then-write" => ExecutionStrategy::ReasonThenWrite,
            "tool-loop" => ExecutionStrategy::ToolLoop,
            other => bail!("unknown strategy {other:?}; use reason-then-write or tool-loop"),
        };
    }
    if cli.verbose {
        cfg.verbose = true;
    }
    Ok(())
}

fn repl(engine: &mut AgentEngine, quiet: bool) -> Result<()> {
    println!(
        "shoestring in {} (model {}). Type a request, !ls, !cat <path>, or exit.",
        engine.workspace().display(),
        engine.config().llm.model
    );
    let stdin = std::io::stdin();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            return Ok(());
        }
        let line = line.trim();
        match line {
            "" => {}
            "exit" | "quit" => return Ok(()),
            _ if line.starts_with('!') => run_bang(engine, line),
            request => match engine.run_request(request) {
                Ok(report) => print_report(&report, quiet),
                Err(e) => eprintln!("shoestring: {e:#}"),
            },
        }
    }
}

/// `!ls [path]` and `!cat <path>` go straight through the capability
/// registry, same sandboxing as the agent's own calls.
fn run_bang(engine: &AgentEngine, line: &str) {
    let mut parts = line[1..].splitn(2, ' ');
    let cmd = parts.next().unwrap_or_default();
    let arg = parts.next().unwrap_or("").trim();
    let call = match cmd {
        "ls" => ToolCall {
            name: "list_directory".to_string(),
            args: json!({"path": if arg.is_empty() { "." } else { arg }}),
        },
        "cat" if !arg.is_empty() => ToolCall {
            name: "read_file".to_string(),
            args: json!({"path": arg}),
        },
        _ => {
            eprintln!("unknown command; try !ls [path] or !cat <path>");
            return;
        }
    };
    println!("{}", engine.registry().invoke(&call));
}

fn print_report(report: &RunReport, quiet: bool) {
    if !quiet {
        for task in &report.tasks {
            let mark = match task.verify_passed {
                Some(true) => "ok",
                Some(false) => "FAIL",
                None => "-",
            };
            println!(
                "  [{:>2}] {:<10} {:<4} {}  {}",
                task.id, task.status, mark, task.title, task.summary
            );
        }
        println!();
    }
    println!("{}", report.final_answer);
}
