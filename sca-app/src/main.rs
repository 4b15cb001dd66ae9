//! `sca`: send one conversation to a chat-completion API and print the normalized events.

mod config;
mod render;

use clap::Parser;
use futures_util::StreamExt;
use render::{Outcome, OutputMode, Renderer};
use sca_llm::{ChatMessage, LlmClient};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

/// Used when `RUST_LOG` is unset or invalid.
const DEFAULT_LOG_FILTER: &str = "info,sca=debug,sca_llm=debug";

#[derive(Debug, Parser)]
#[command(name = "sca", version, about = "One-shot chat completion with normalized events")]
struct Cli {
    /// Prompt text. Multiple words are joined with spaces.
    #[arg(required = true)]
    prompt: Vec<String>,
    /// Config file (default: ~/.sca/config.toml if present).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Overrides the configured model.
    #[arg(long)]
    model: Option<String>,
    /// Optional system message placed before the prompt.
    #[arg(long)]
    system: Option<String>,
    /// Receive the response incrementally.
    #[arg(long)]
    stream: bool,
    /// Print every event as a JSON line.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let dotenv = dotenvy::dotenv().ok();
    init_tracing()?;
    install_panic_hook();
    if let Some(path) = dotenv {
        tracing::debug!(path = %path.display(), ".env loaded");
    }

    let cli = Cli::parse();
    let app_cfg = config::AppConfig::load(cli.config.clone()).await?;
    let mut llm_cfg = app_cfg.llm_config(|key| std::env::var(key).ok())?;
    if let Some(model) = cli.model.clone().filter(|m| !m.trim().is_empty()) {
        llm_cfg.model = model;
    }
    tracing::info!(config = ?llm_cfg, streaming = cli.stream, "starting completion");

    let client = LlmClient::new(llm_cfg);
    let conversation = build_conversation(cli.system.as_deref(), &cli.prompt.join(" "));
    let mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Text
    };

    let shutdown = CancellationToken::new();
    let signal_task = tokio::spawn(shutdown_signal(shutdown.clone()));

    let outcome = run(&client, &conversation, cli.stream, mode, shutdown).await;
    signal_task.abort();
    client.close().await;

    match outcome? {
        Outcome::Completed {
            finish_reason,
            usage,
        } => {
            tracing::info!(?finish_reason, ?usage, "completion finished");
            Ok(())
        }
        Outcome::Failed(error) => Err(anyhow::anyhow!("completion failed: {error}")),
        Outcome::Cancelled => Err(anyhow::anyhow!("completion cancelled")),
    }
}

fn build_conversation(system: Option<&str>, prompt: &str) -> Vec<ChatMessage> {
    let mut out = Vec::with_capacity(2);
    if let Some(system) = system.map(str::trim).filter(|s| !s.is_empty()) {
        out.push(ChatMessage::system(system));
    }
    out.push(ChatMessage::user(prompt));
    out
}

async fn run(
    client: &LlmClient,
    conversation: &[ChatMessage],
    streaming: bool,
    mode: OutputMode,
    shutdown: CancellationToken,
) -> anyhow::Result<Outcome> {
    let mut events = client.complete(conversation, streaming)?;
    let mut renderer = Renderer::new(std::io::stdout(), mode);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::warn!("completion abandoned");
                return Ok(Outcome::Cancelled);
            }
            next = events.next() => {
                let Some(event) = next else {
                    return Err(anyhow::anyhow!("event stream ended without a terminal event"));
                };
                if let Some(outcome) = renderer.render(&event)? {
                    return Ok(outcome);
                }
            }
        }
    }
}

fn init_tracing() -> anyhow::Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(v) => v,
        Err(_) => EnvFilter::new(DEFAULT_LOG_FILTER),
    };
    let log_format = std::env::var("SCA_LOG_FORMAT")
        .unwrap_or_else(|_| "compact".to_string())
        .to_ascii_lowercase();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_file(true)
        .with_line_number(true);

    match log_format.as_str() {
        "json" => builder
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(true)
            .init(),
        "pretty" => builder.pretty().init(),
        "compact" => builder.compact().init(),
        other => {
            return Err(anyhow::anyhow!(
                "unsupported SCA_LOG_FORMAT={other:?}; expected one of: json, pretty, compact"
            ));
        }
    }

    tracing::debug!(
        log_format = %log_format,
        env_filter = ?std::env::var("RUST_LOG").ok(),
        "tracing initialized"
    );
    Ok(())
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()))
            .unwrap_or_else(|| "unknown".to_string());
        let payload = panic_payload_to_string(panic_info.payload());
        tracing::error!(
            panic_location = %location,
            panic_payload = %payload,
            "panic captured"
        );
        default_hook(panic_info);
    }));
}

fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        return msg.to_string();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "non-string panic payload".to_string()
}

async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to await ctrl-c signal");
        return;
    }
    tracing::warn!("received ctrl-c; cancelling completion");
    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::{Cli, DEFAULT_LOG_FILTER, build_conversation};
    use clap::Parser;
    use tracing_subscriber::EnvFilter;
    use sca_llm::{ChatMessage, Role};

    #[test]
    fn conversation_puts_trimmed_system_message_first() {
        let conv = build_conversation(Some("  be brief "), "What's up?");
        assert_eq!(
            conv,
            vec![ChatMessage::system("be brief"), ChatMessage::user("What's up?")]
        );

        let conv = build_conversation(Some("   "), "hi");
        assert_eq!(conv.len(), 1);
        assert_eq!(conv[0].role, Role::User);
    }

    #[test]
    fn default_log_filter_parses_and_enables_crate_debug() {
        let filter = EnvFilter::try_new(DEFAULT_LOG_FILTER).expect("valid filter");
        let rendered = filter.to_string();
        assert!(rendered.contains("sca=debug"));
        assert!(rendered.contains("sca_llm=debug"));
    }

    #[test]
    fn cli_joins_prompt_words_and_reads_flags() {
        let cli = Cli::try_parse_from(["sca", "--stream", "--model", "gpt-4o", "what's", "up"])
            .expect("parse");
        assert!(cli.stream);
        assert!(!cli.json);
        assert_eq!(cli.model.as_deref(), Some("gpt-4o"));
        assert_eq!(cli.prompt.join(" "), "what's up");

        assert!(Cli::try_parse_from(["sca"]).is_err(), "prompt is required");
    }
}
