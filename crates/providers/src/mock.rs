//! Scripted provider for tests.
//!
//! Each call pops the next [`ScriptedTurn`]. Streaming turns are replayed
//! as word-level token events followed by tool-call events and `Done`,
//! so the engine's accumulation path is exercised the same way a real
//! SSE stream would: each tool call is a `ToolCallStarted` plus chunked
//! argument deltas, and never a `ToolCallFinished` (OpenAI-shaped
//! providers don't send one).

use std::collections::VecDeque;

use parking_lot::Mutex;

use fd_domain::error::{Error, Result};
use fd_domain::message::ToolCall;
use fd_domain::stream::{BoxStream, StreamEvent, Usage};

use crate::traits::{ChatRequest, ChatResponse, LlmProvider};

pub enum ScriptedTurn {
    /// A successful turn: text plus zero or more tool calls.
    Respond {
        text: String,
        tool_calls: Vec<ToolCall>,
        usage: Usage,
    },
    /// The provider fails with this message (e.g. "overloaded").
    Fail(String),
}

impl ScriptedTurn {
    pub fn text(text: &str) -> Self {
        Self::Respond {
            text: text.into(),
            tool_calls: Vec::new(),
            usage: Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            },
        }
    }

    pub fn with_tool_calls(text: &str, tool_calls: Vec<ToolCall>) -> Self {
        Self::Respond {
            text: text.into(),
            tool_calls,
            usage: Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            },
        }
    }
}

#[derive(Default)]
pub struct ScriptedProvider {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    /// Requests observed, for assertions.
    pub calls: Mutex<Vec<ChatRequest>>,
}

impl ScriptedProvider {
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, turn: ScriptedTurn) {
        self.turns.lock().push_back(turn);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    fn next_turn(&self) -> Result<ScriptedTurn> {
        self.turns.lock().pop_front().ok_or_else(|| Error::Provider {
            provider: "scripted".into(),
            message: "script exhausted".into(),
        })
    }
}

#[async_trait::async_trait]
impl LlmProvider for ScriptedProvider {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        self.calls.lock().push(req.clone());
        match self.next_turn()? {
            ScriptedTurn::Respond {
                text,
                tool_calls,
                usage,
            } => Ok(ChatResponse {
                content: text,
                tool_calls,
                usage: Some(usage),
                model: req.model.clone().unwrap_or_else(|| "scripted".into()),
                finish_reason: Some("stop".into()),
            }),
            ScriptedTurn::Fail(message) => Err(Error::Provider {
                provider: "scripted".into(),
                message,
            }),
        }
    }

    async fn chat_stream(
        &self,
        req: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        self.calls.lock().push(req.clone());
        let turn = self.next_turn()?;
        let (text, tool_calls, usage) = match turn {
            ScriptedTurn::Respond {
                text,
                tool_calls,
                usage,
            } => (text, tool_calls, usage),
            ScriptedTurn::Fail(message) => {
                return Err(Error::Provider {
                    provider: "scripted".into(),
                    message,
                })
            }
        };

        let stream = async_stream::stream! {
            for word in text.split_inclusive(' ') {
                yield Ok(StreamEvent::Token {
                    text: word.to_string(),
                });
            }
            let finish_reason = if tool_calls.is_empty() { "stop" } else { "tool_calls" };
            for tc in tool_calls {
                yield Ok(StreamEvent::ToolCallStarted {
                    call_id: tc.call_id.clone(),
                    tool_name: tc.tool_name,
                });
                // Arguments arrive as fragments, like a real SSE stream;
                // the consumer assembles them after the stream closes.
                let args = tc.arguments.to_string();
                let chars: Vec<char> = args.chars().collect();
                for chunk in chars.chunks(8) {
                    yield Ok(StreamEvent::ToolCallDelta {
                        call_id: tc.call_id.clone(),
                        delta: chunk.iter().collect(),
                    });
                }
            }
            yield Ok(StreamEvent::Done {
                usage: Some(usage),
                finish_reason: Some(finish_reason.into()),
            });
        };
        Ok(Box::pin(stream))
    }

    fn provider_id(&self) -> &str {
        "scripted"
    }
}
