use sca_llm::{StreamEvent, TokenUsage};
use std::io::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Text as it arrives, then a one-line summary.
    Text,
    /// One JSON object per event.
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed {
        finish_reason: Option<String>,
        usage: Option<TokenUsage>,
    },
    Failed(String),
    Cancelled,
}

pub struct Renderer<W: Write> {
    out: W,
    mode: OutputMode,
}

impl<W: Write> Renderer<W> {
    pub fn new(out: W, mode: OutputMode) -> Self {
        Self { out, mode }
    }

    /// Writes one event; returns the outcome once a terminal event is seen.
    pub fn render(&mut self, event: &StreamEvent) -> anyhow::Result<Option<Outcome>> {
        if self.mode == OutputMode::Json {
            serde_json::to_writer(&mut self.out, event)?;
            writeln!(self.out)?;
        }

        let outcome = match event {
            StreamEvent::TextDelta { text_delta } => {
                if self.mode == OutputMode::Text {
                    write!(self.out, "{text_delta}")?;
                }
                None
            }
            StreamEvent::MessageComplete {
                text_delta,
                finish_reason,
                usage,
            } => {
                if self.mode == OutputMode::Text {
                    if let Some(text) = text_delta {
                        write!(self.out, "{text}")?;
                    }
                    writeln!(self.out)?;
                    writeln!(self.out, "{}", summary_line(finish_reason.as_deref(), usage.as_ref()))?;
                }
                Some(Outcome::Completed {
                    finish_reason: finish_reason.clone(),
                    usage: *usage,
                })
            }
            StreamEvent::Error { error } => Some(Outcome::Failed(error.clone())),
        };
        self.out.flush()?;
        Ok(outcome)
    }
}

fn summary_line(finish_reason: Option<&str>, usage: Option<&TokenUsage>) -> String {
    let reason = finish_reason.unwrap_or("unknown");
    match usage {
        Some(u) => format!(
            "[finish_reason={reason} prompt_tokens={} completion_tokens={} total_tokens={} cached_tokens={}]",
            u.prompt_tokens, u.completion_tokens, u.total_tokens, u.cached_tokens
        ),
        None => format!("[finish_reason={reason} usage=unreported]"),
    }
}
