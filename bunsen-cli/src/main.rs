use anyhow::{anyhow, Context, Result};
use bunsen_core::{
    apply_event, evaluate, parse_trusted, sign, Delivery, ThreadState, TriggerConfig,
    DELIVERY_HEADER, EVENT_HEADER, SIGNATURE_HEADER,
};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};

/// Bunsen: tools for exercising the webhook intake locally
#[derive(Parser, Debug)]
#[command(name = "bunsen")]
#[command(about = "Sign, send and dry-run GitHub webhook deliveries", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the X-Hub-Signature-256 value for a payload file
    Sign(SignArgs),
    /// Sign a payload file and POST it to a running server
    Send(SendArgs),
    /// Show what the server would decide for a payload, without side effects
    Evaluate(EvaluateArgs),
}

#[derive(Parser, Debug)]
struct SignArgs {
    /// JSON payload file
    payload: PathBuf,

    /// Webhook secret (if not provided, will use GITHUB_WEBHOOK_SECRET environment variable)
    #[arg(long, env = "GITHUB_WEBHOOK_SECRET", hide_env_values = true)]
    secret: String,
}

#[derive(Parser, Debug)]
struct SendArgs {
    /// JSON payload file
    payload: PathBuf,

    /// GitHub event type, e.g. issues or issue_comment
    #[arg(long)]
    event: String,

    /// Delivery id; a random one is generated when omitted
    #[arg(long)]
    delivery_id: Option<String>,

    /// Webhook endpoint
    #[arg(long, default_value = "http://localhost:8000/webhook")]
    url: String,

    /// Webhook secret (if not provided, will use GITHUB_WEBHOOK_SECRET environment variable)
    #[arg(long, env = "GITHUB_WEBHOOK_SECRET", hide_env_values = true)]
    secret: String,
}

#[derive(Parser, Debug)]
struct EvaluateArgs {
    /// JSON payload file
    payload: PathBuf,

    /// GitHub event type, e.g. issues or issue_comment
    #[arg(long)]
    event: String,

    /// Delivery id to evaluate under
    #[arg(long, default_value = "local-delivery")]
    delivery_id: String,

    /// Thread state JSON, as stored in the `state_json` column of the `threads` table; a fresh thread when omitted
    #[arg(long)]
    state: Option<PathBuf>,

    /// Label that starts a dispatch
    #[arg(long, default_value = "ready-for-dev")]
    trigger_label: String,

    /// Handle that triggers a reply when mentioned
    #[arg(long, default_value = "bunsen")]
    agent_name: String,

    /// Login the agent posts as
    #[arg(long, default_value = "bunsen[bot]")]
    agent_login: String,

    /// Greet newly opened issues
    #[arg(long)]
    reply_to_new_threads: bool,

    /// Never re-arm a dispatched thread when the trigger label is removed
    #[arg(long)]
    no_retrigger: bool,
}

fn read_payload(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("Failed to read payload from {}", path.display()))
}

fn run_sign(args: SignArgs) -> Result<()> {
    let body = read_payload(&args.payload)?;
    println!("{}", sign(&args.secret, &body));
    Ok(())
}

async fn run_send(args: SendArgs) -> Result<()> {
    let body = read_payload(&args.payload)?;
    let signature = sign(&args.secret, &body);
    let delivery_id = args
        .delivery_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .context("Failed to create HTTP client")?;

    let response = client
        .post(&args.url)
        .header("Content-Type", "application/json")
        .header(EVENT_HEADER, &args.event)
        .header(DELIVERY_HEADER, &delivery_id)
        .header(SIGNATURE_HEADER, &signature)
        .body(body)
        .send()
        .await
        .with_context(|| format!("Failed to POST to {}", args.url))?;

    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    println!("delivery {}: {}", delivery_id, status);
    if !text.is_empty() {
        println!("{}", text);
    }

    if status.is_success() {
        Ok(())
    } else {
        Err(anyhow!("server rejected delivery with {}", status))
    }
}

fn load_state(path: &Path) -> Result<ThreadState> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read thread state from {}", path.display()))?;
    serde_json::from_str(&text).context("Failed to parse thread state")
}

fn run_evaluate(args: EvaluateArgs) -> Result<()> {
    let body = read_payload(&args.payload)?;
    let now = Utc::now();

    let event = match parse_trusted(&args.event, &args.delivery_id, &body, now)? {
        Delivery::Event(event) => event,
        Delivery::Ping { .. } => {
            println!("ping: acknowledged, no decision");
            return Ok(());
        }
        Delivery::Unsupported { event_type, action } => {
            println!(
                "unsupported: {} ({}) is acknowledged and ignored",
                event_type,
                action.as_deref().unwrap_or("no action")
            );
            return Ok(());
        }
    };

    let config = TriggerConfig {
        trigger_label: args.trigger_label,
        agent_name: args.agent_name,
        agent_login: args.agent_login,
        reply_to_new_threads: args.reply_to_new_threads,
        allow_retrigger: !args.no_retrigger,
        ..TriggerConfig::default()
    };

    let state = match &args.state {
        Some(path) => load_state(path)?,
        None => ThreadState::new(event.thread_id.clone(), now),
    };
    if state.thread_id != event.thread_id {
        return Err(anyhow!(
            "state is for {} but the payload is for {}",
            state.thread_id,
            event.thread_id
        ));
    }

    let decision = evaluate(&event, &state, &config, now);
    let next = apply_event(&state, &event, decision, &config, now);

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "thread": event.thread_id.to_string(),
            "decision": decision,
            "state": next,
        }))?
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Sign(args) => run_sign(args),
        Commands::Send(args) => run_send(args).await,
        Commands::Evaluate(args) => run_evaluate(args),
    }
}
