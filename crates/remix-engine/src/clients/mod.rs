mod dryrun;
mod gemini;

pub use dryrun::DryrunClient;
pub use gemini::{parse_stream_event, GeminiClient, SseFragments};

use crate::client::ClientRegistry;
use crate::config::EngineConfig;

pub fn default_client_registry(config: &EngineConfig) -> ClientRegistry {
    let mut clients = ClientRegistry::new();
    clients.register(DryrunClient::default());
    clients.register(GeminiClient::new(config.gemini.clone()));
    clients
}
