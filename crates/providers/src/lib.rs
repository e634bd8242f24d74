//! LLM provider adapters.
//!
//! The worker talks to models through [`LlmProvider`] only. The shipped
//! adapter speaks the OpenAI chat-completions wire format (which covers
//! OpenAI, Azure, vLLM, Ollama, Together and most gateways); the scripted
//! provider drives tests without a network.

pub mod mock;
pub mod openai;
pub mod sse;
pub mod traits;

pub use mock::{ScriptedProvider, ScriptedTurn};
pub use openai::OpenAiCompatProvider;
pub use traits::{ChatRequest, ChatResponse, LlmProvider};
