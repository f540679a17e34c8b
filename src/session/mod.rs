//! Session engine
//!
//! Resolves where each send goes, decodes the token stream, keeps the
//! context window within budget and runs the model's tool loop.

pub mod compress;
pub mod connection;
pub mod interpreter;
pub mod message;
pub mod orchestrator;
pub mod stream;
pub mod tokens;
pub mod transport;

pub use compress::{CompressionPlan, CompressionStrategy, ContextCompressor, Summarizer};
pub use connection::{resolve_mode, ConnectionDescriptor, ConnectionSettings, Mode};
pub use interpreter::{parse_tool_calls, Interpretation, LoopFailure, LoopState, ToolCallInterpreter};
pub use message::{Message, MessageStatus, Role, ToolCallRequest, ToolCallStatus};
pub use orchestrator::{SendReport, SendStatus, SessionConfig, SessionEvent, SessionOrchestrator};
pub use stream::{decode_stream, StreamDecoder, StreamEvent};
pub use tokens::{BudgetBreakdown, ContextBudget, HeuristicTokenizer, TokenBudgetTracker, Tokenizer};
pub use transport::{HttpTransport, InferenceRequest, Transport};
