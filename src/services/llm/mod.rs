//! LLM gateway: one `generate` operation over several provider backends.
//!
//! - `models` - static model table, selects the backend and token budget
//! - `backend` - request building per provider
//! - `transport` - reqwest on a private tokio runtime, SSE line reading
//! - `stream` - fence stripping, coalescing, deadline and cancellation

mod backend;
mod decode;
mod gateway;
mod models;
mod sink;
mod stream;
mod transport;

pub use backend::{Backend, TokenSource, VertexTarget};
pub use decode::StreamEvent;
pub use gateway::{GatewayOptions, GenerationOutput, LlmGateway};
pub use models::{BackendKind, ModelSpec, available_models, resolve};
pub use sink::{MemorySink, OutputSink};
pub use stream::{Coalescer, Delivered, DeliveryPolicy, FenceStripper, deliver};
