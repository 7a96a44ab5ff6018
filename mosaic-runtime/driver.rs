//! The abstract collaborator consumed by `AgentSession`: turns one
//! user-facing text into a lazy, finite, cancellable stream of assistant
//! fragments. `ClaudeDriver` is the production adapter over the Claude
//! Agent SDK client; `ScriptedDriver` is a deterministic test double.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};

use crate::error::MosaicError;

#[derive(Debug, Clone)]
pub struct ToolUseFragment {
    pub name: String,
    pub input: serde_json::Value,
}

#[derive(Debug, Clone, Default)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct ResultFragment {
    pub text: String,
    pub total_cost_usd: f64,
    pub usage: Usage,
}

/// One item of the lazy sequence a Driver yields per turn. The sequence
/// always ends at the first `Result` fragment.
#[derive(Debug, Clone)]
pub enum Fragment {
    Text(String),
    Thinking(String),
    ToolUse(ToolUseFragment),
    Result(ResultFragment),
}

#[async_trait]
pub trait Driver: Send + Sync {
    async fn connect(&mut self, system_prompt: Option<String>) -> Result<(), MosaicError>;
    async fn disconnect(&mut self) -> Result<(), MosaicError>;
    /// Submit one user turn.
    async fn query(&mut self, text: &str) -> Result<(), MosaicError>;
    /// Produce the lazy fragment sequence for the turn just submitted.
    /// Shared receiver, matching the underlying SDK client: a caller can
    /// `interrupt` while a response is being streamed without waiting
    /// for an exclusive lock on the driver.
    fn receive_response(&self) -> BoxStream<'_, Result<Fragment, MosaicError>>;
    /// Cancel the in-flight sequence; takes effect no later than the next
    /// fragment boundary. Callable concurrently with `receive_response`.
    async fn interrupt(&self) -> Result<(), MosaicError>;
}

/// Thin adapter over `claude_agent_sdk_rust::ClaudeSDKClient`, the real
/// externally-supplied Driver this abstraction models.
pub struct ClaudeDriver {
    client: Option<claude_agent_sdk_rust::ClaudeSDKClient>,
    options: claude_agent_sdk_rust::ClaudeAgentOptions,
}

impl ClaudeDriver {
    pub fn new(options: claude_agent_sdk_rust::ClaudeAgentOptions) -> Self {
        Self {
            client: None,
            options,
        }
    }
}

fn sdk_err(e: claude_agent_sdk_rust::ClaudeSDKError) -> MosaicError {
    MosaicError::DriverFailed(e.to_string())
}

#[async_trait]
impl Driver for ClaudeDriver {
    async fn connect(&mut self, system_prompt: Option<String>) -> Result<(), MosaicError> {
        let mut options = self.options.clone();
        if let Some(preamble) = system_prompt {
            options.system_prompt = Some(claude_agent_sdk_rust::SystemPrompt::Text(preamble));
        }
        let mut client = claude_agent_sdk_rust::ClaudeSDKClient::new(options);
        client.connect(None).await.map_err(sdk_err)?;
        self.client = Some(client);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), MosaicError> {
        if let Some(client) = self.client.take() {
            client.disconnect().await.map_err(sdk_err)?;
        }
        Ok(())
    }

    async fn query(&mut self, text: &str) -> Result<(), MosaicError> {
        let client = self
            .client
            .as_mut()
            .ok_or_else(|| MosaicError::DriverFailed("not connected".to_string()))?;
        client.query(text).await.map_err(sdk_err)
    }

    fn receive_response(&self) -> BoxStream<'_, Result<Fragment, MosaicError>> {
        let Some(client) = self.client.as_ref() else {
            return stream::iter(vec![Err(MosaicError::DriverFailed(
                "not connected".to_string(),
            ))])
            .boxed();
        };
        let Ok(inner) = client.receive_response() else {
            return stream::iter(vec![Err(MosaicError::DriverFailed(
                "receive_response failed".to_string(),
            ))])
            .boxed();
        };
        inner
            .filter_map(|item| async move {
                let message = match item {
                    Ok(m) => m,
                    Err(e) => return Some(Err(sdk_err(e))),
                };
                sdk_message_to_fragment(message).map(Ok)
            })
            .boxed()
    }

    async fn interrupt(&self) -> Result<(), MosaicError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| MosaicError::DriverFailed("not connected".to_string()))?;
        client.interrupt().await.map_err(sdk_err)
    }
}

fn sdk_message_to_fragment(message: claude_agent_sdk_rust::Message) -> Option<Fragment> {
    use claude_agent_sdk_rust::{ContentBlock, Message};

    match message {
        Message::Assistant(assistant) => {
            // An assistant message may bundle multiple blocks; the core
            // loop wants one fragment per block. We only ever see one
            // non-empty block per SDK message in streaming mode, so take
            // the first content block that maps to a fragment.
            assistant.message.content.into_iter().find_map(|block| match block {
                ContentBlock::Text(t) => Some(Fragment::Text(t.text)),
                ContentBlock::Thinking(t) => Some(Fragment::Thinking(t.thinking)),
                ContentBlock::ToolUse(t) => Some(Fragment::ToolUse(ToolUseFragment {
                    name: t.name,
                    input: t.input,
                })),
                _ => None,
            })
        }
        Message::Result(result) => {
            let usage = result.usage.as_ref();
            Some(Fragment::Result(ResultFragment {
                text: result.result.clone().unwrap_or_default(),
                total_cost_usd: result.total_cost_usd.unwrap_or(0.0),
                usage: Usage {
                    input_tokens: usage
                        .and_then(|u| u.get("input_tokens"))
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0),
                    output_tokens: usage
                        .and_then(|u| u.get("output_tokens"))
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0),
                },
            }))
        }
        _ => None,
    }
}

/// Deterministic test double: replays a fixed fragment sequence per
/// `query`, ignoring the submitted text. Used by session tests and the
/// end-to-end scenarios in lieu of a real subprocess. `interrupted` is
/// an `AtomicBool` rather than a plain field so `interrupt`/
/// `receive_response` can stay `&self`, matching the real SDK client.
pub struct ScriptedDriver {
    script: Vec<Fragment>,
    connected: bool,
    interrupted: std::sync::atomic::AtomicBool,
    delay: std::time::Duration,
}

impl ScriptedDriver {
    pub fn new(script: Vec<Fragment>) -> Self {
        Self {
            script,
            connected: false,
            interrupted: std::sync::atomic::AtomicBool::new(false),
            delay: std::time::Duration::ZERO,
        }
    }

    pub fn echo(reply: impl Into<String>, cost_usd: f64) -> Self {
        Self::new(vec![
            Fragment::Text(reply.into()),
            Fragment::Result(ResultFragment {
                text: String::new(),
                total_cost_usd: cost_usd,
                usage: Usage {
                    input_tokens: 10,
                    output_tokens: 5,
                },
            }),
        ])
    }

    /// Waits `delay` before yielding each fragment, so tests can interrupt
    /// a turn while it is genuinely in flight.
    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl Driver for ScriptedDriver {
    async fn connect(&mut self, _system_prompt: Option<String>) -> Result<(), MosaicError> {
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), MosaicError> {
        self.connected = false;
        Ok(())
    }

    async fn query(&mut self, _text: &str) -> Result<(), MosaicError> {
        if !self.connected {
            return Err(MosaicError::DriverFailed("not connected".to_string()));
        }
        self.interrupted.store(false, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    fn receive_response(&self) -> BoxStream<'_, Result<Fragment, MosaicError>> {
        let delay = self.delay;
        stream::unfold(self.script.iter(), move |mut iter| async move {
            if delay > std::time::Duration::ZERO {
                tokio::time::sleep(delay).await;
            }
            if self.interrupted.load(std::sync::atomic::Ordering::SeqCst) {
                return None;
            }
            iter.next().cloned().map(Ok).map(|item| (item, iter))
        })
        .boxed()
    }

    async fn interrupt(&self) -> Result<(), MosaicError> {
        self.interrupted.store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_driver_replays_fragments() {
        let mut driver = ScriptedDriver::echo("hi there", 0.01);
        driver.connect(None).await.unwrap();
        driver.query("hello").await.unwrap();
        let fragments: Vec<_> = driver.receive_response().collect().await;
        assert_eq!(fragments.len(), 2);
        assert!(matches!(fragments[0], Ok(Fragment::Text(_))));
        assert!(matches!(fragments[1], Ok(Fragment::Result(_))));
    }

    #[tokio::test]
    async fn interrupt_empties_the_stream() {
        let mut driver = ScriptedDriver::echo("hi there", 0.01);
        driver.connect(None).await.unwrap();
        driver.query("hello").await.unwrap();
        driver.interrupt().await.unwrap();
        let fragments: Vec<_> = driver.receive_response().collect().await;
        assert!(fragments.is_empty());
    }

    #[tokio::test]
    async fn query_before_connect_fails() {
        let mut driver = ScriptedDriver::echo("hi", 0.0);
        assert!(driver.query("hello").await.is_err());
    }
}
