//! Quota-gated batch image generation.
//!
//! [`GenerationOrchestrator`] walks a batch of descriptors one at a time:
//! it checks the user's quota, calls a [`GenerationClient`], reduces the
//! streamed reply with [`ResponseAssembler`], and records each success
//! before moving on.

pub mod assembler;
pub mod cancel;
pub mod client;
pub mod clients;
pub mod config;
pub mod orchestrator;

pub use assembler::ResponseAssembler;
pub use cancel::CancellationToken;
pub use client::{ClientError, ClientRegistry, FragmentStream, GenerationClient};
pub use clients::{default_client_registry, DryrunClient, GeminiClient};
pub use config::{EngineConfig, GeminiSettings};
pub use orchestrator::{BatchPhase, GenerationOrchestrator, OrchestratorError};
