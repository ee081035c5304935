use clap::{Parser, Subcommand, ValueEnum};
use drover_agent::{
    ExecuteOptions, ProcessTransport, Session, SessionEvent, SessionHandle, SessionMode,
};
use drover_loop::{BuildLoop, BuildLoopConfig, LoopOutcome};
use drover_workspace::{CommandGitRunner, WorktreeResolver};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(name = "drover")]
#[command(about = "Drives an interactive coding-agent subprocess through worktree-backed sessions")]
struct Cli {
    /// Agent command to spawn.
    #[arg(long, default_value = "agent")]
    agent: String,
    /// Extra argument passed to the agent command (repeatable).
    #[arg(long = "agent-arg")]
    agent_args: Vec<String>,
    /// Main repository root.
    #[arg(long, default_value = ".")]
    root: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one interactive session; events stream to stdout as JSON
    /// lines, answers and free text are read from stdin.
    Chat {
        prompt: String,
        #[arg(long, value_enum, default_value_t = ModeArg::None)]
        mode: ModeArg,
    },
    /// Run the autonomous build loop for one unit of work.
    Loop {
        unit_id: String,
        unit_label: String,
        #[arg(long, default_value_t = 5)]
        max_iterations: u32,
        #[arg(long, default_value_t = 2000)]
        delay_ms: u64,
    },
    /// List known worktrees for the main root.
    Worktrees,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    None,
    Plan,
    Build,
    Review,
}

impl From<ModeArg> for SessionMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::None => SessionMode::None,
            ModeArg::Plan => SessionMode::Plan,
            ModeArg::Build => SessionMode::Build,
            ModeArg::Review => SessionMode::Review,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let transport = Arc::new(ProcessTransport::new(
        cli.agent.clone(),
        cli.agent_args.clone(),
    ));

    let result = match cli.command {
        Commands::Chat { prompt, mode } => chat_command(transport, cli.root, prompt, mode).await,
        Commands::Loop {
            unit_id,
            unit_label,
            max_iterations,
            delay_ms,
        } => {
            loop_command(
                transport,
                cli.root,
                unit_id,
                unit_label,
                max_iterations,
                delay_ms,
            )
            .await
        }
        Commands::Worktrees => worktrees_command(cli.root).await,
    };

    match result {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::from(1)
        }
    }
}

async fn chat_command(
    transport: Arc<ProcessTransport>,
    root: PathBuf,
    prompt: String,
    mode: ModeArg,
) -> Result<ExitCode, String> {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut session = Session::new(transport, root, events_tx);
    let handle = session.handle();

    let stdin_task = tokio::spawn(forward_stdin(handle));
    let printer = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            let done = matches!(event, SessionEvent::Complete { .. });
            print_event(&event);
            if done {
                break;
            }
        }
    });

    session
        .execute(
            prompt,
            ExecuteOptions {
                mode: Some(mode.into()),
                resume: false,
            },
        )
        .await
        .map_err(|error| error.to_string())?;

    printer.await.map_err(|error| error.to_string())?;
    stdin_task.abort();
    Ok(ExitCode::SUCCESS)
}

async fn loop_command(
    transport: Arc<ProcessTransport>,
    root: PathBuf,
    unit_id: String,
    unit_label: String,
    max_iterations: u32,
    delay_ms: u64,
) -> Result<ExitCode, String> {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let session = Session::new(transport, root.clone(), events_tx);
    let resolver = WorktreeResolver::new(Arc::new(CommandGitRunner));
    let config = BuildLoopConfig {
        unit_id,
        unit_label,
        main_root: root,
        max_iterations,
        iteration_delay: Duration::from_millis(delay_ms),
    };
    let mut build_loop = BuildLoop::new(session, events_rx, resolver, config);

    let (display_tx, mut display_rx) = mpsc::unbounded_channel();
    build_loop.forward_events(display_tx);
    let printer = tokio::spawn(async move {
        while let Some(event) = display_rx.recv().await {
            print_event(&event);
        }
    });

    let cancel = build_loop.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let outcome = build_loop.run().await.map_err(|error| error.to_string())?;
    printer.abort();

    match serde_json::to_string(&outcome) {
        Ok(line) => println!("{line}"),
        Err(error) => eprintln!("error: {error}"),
    }
    Ok(match outcome {
        LoopOutcome::Finished { .. } => ExitCode::SUCCESS,
        LoopOutcome::Stopped { .. } => ExitCode::from(2),
    })
}

async fn worktrees_command(root: PathBuf) -> Result<ExitCode, String> {
    let resolver = WorktreeResolver::new(Arc::new(CommandGitRunner));
    let records = resolver
        .list(&root)
        .await
        .map_err(|error| error.to_string())?;
    for record in records {
        match serde_json::to_string(&record) {
            Ok(line) => println!("{line}"),
            Err(error) => eprintln!("error: {error}"),
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Stdin lines: `/answer <id> <text>` answers the pending question,
/// `/kill` terminates the subprocess, anything else is free text.
async fn forward_stdin(handle: SessionHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix("/answer ") {
            match rest.split_once(' ') {
                Some((id, content)) => handle.answer(id, content),
                None => eprintln!("usage: /answer <id> <text>"),
            }
        } else if line == "/kill" {
            handle.kill();
        } else {
            handle.free_text(line);
        }
    }
}

fn print_event(event: &SessionEvent) {
    match serde_json::to_string(event) {
        Ok(line) => println!("{line}"),
        Err(error) => eprintln!("error: {error}"),
    }
}
