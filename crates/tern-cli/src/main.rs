use std::path::PathBuf;

use anyhow::Result;
use bat::PrettyPrinter;
use clap::Parser;
use cliclack::{input, spinner};
use console::style;

use tern::agent::RunOutcome;
use tern::models::message::Message;

mod config;
mod session;

use session::Session;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// The task to run. Omit to start an interactive session.
    pub query: Option<String>,

    /// Model to use (defaults to gpt-4o-mini)
    #[arg(short, long)]
    pub model: Option<String>,

    /// OpenAI-compatible API host (can also be set via OPENAI_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// API key (can also be set via the OPENAI_API_KEY environment variable)
    #[arg(long)]
    pub api_key: Option<String>,

    /// Profile file listing remote tool servers
    /// (defaults to ~/.config/tern/profile.yaml when present)
    #[arg(short, long)]
    pub profile: Option<PathBuf>,

    /// Maximum number of model invocations per run
    #[arg(long, default_value_t = tern::agent::DEFAULT_MAX_ITERATIONS)]
    pub max_iterations: usize,

    /// Per-tool-call timeout in seconds
    #[arg(long)]
    pub tool_timeout: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let profile = config::load_profile(cli.profile.as_deref())?;

    let session = Session::build(&cli, profile).await?;
    let result = match &cli.query {
        Some(query) => run_once(&session, query).await,
        None => run_interactive(&session).await,
    };
    // The remote sessions are released however the run went; only then does
    // the run's error surface.
    session.close().await;
    result
}

async fn run_once(session: &Session, query: &str) -> Result<()> {
    let spin = spinner();
    spin.start("awaiting reply");
    let outcome = session.agent().run(query).await;
    spin.stop("");

    render_outcome(outcome?).await;
    Ok(())
}

async fn run_interactive(session: &Session) -> Result<()> {
    println!(
        "tern interactive session {}",
        style("- type \"exit\" to end the session").dim()
    );
    println!();

    let mut messages = vec![session.agent().system_message().await];

    loop {
        let message_text: String = input("Message:").placeholder("").multiline().interact()?;

        if message_text.trim().eq_ignore_ascii_case("exit") {
            break;
        }
        messages.push(Message::user().with_text(&message_text));

        let spin = spinner();
        spin.start("awaiting reply");
        let outcome = session.agent().reply(&mut messages).await;
        spin.stop("");

        render_outcome(outcome?).await;
        println!();
    }
    Ok(())
}

async fn render_outcome(outcome: RunOutcome) {
    if !outcome.is_complete() {
        println!(
            "{}",
            style("Reached the iteration limit; showing the last progress made.").yellow()
        );
    }
    render(outcome.content()).await;
}

async fn render(content: &str) {
    PrettyPrinter::new()
        .input_from_bytes(content.as_bytes())
        .language("markdown")
        .print()
        .unwrap();
}
