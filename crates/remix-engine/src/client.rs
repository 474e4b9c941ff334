use indexmap::IndexMap;
use remix_contracts::{Descriptor, ErrorKind, ResponseFragment};
use thiserror::Error;

/// Terminal failures a generation call can end with.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("transport failure: {message}")]
    Transport { message: String },
    #[error("rate limited by backend: {message}")]
    RateLimited {
        message: String,
        retry_after_s: Option<u64>,
    },
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
}

impl ClientError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport { .. } => ErrorKind::TransportError,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::InvalidRequest { .. } => ErrorKind::InvalidRequest,
        }
    }

    /// Maps a non-success HTTP status onto the error taxonomy.
    pub fn from_status(status: u16, body: &str, retry_after_s: Option<u64>) -> Self {
        let message = format!("HTTP {status}: {}", truncate_text(body.trim(), 512));
        match status {
            429 => Self::RateLimited {
                message,
                retry_after_s,
            },
            400 | 401 | 403 | 404 | 413 | 422 => Self::InvalidRequest { message },
            _ => Self::Transport { message },
        }
    }
}

/// Single-pass, finite reply to one generation call. Not restartable.
pub type FragmentStream<'a> = Box<dyn Iterator<Item = Result<ResponseFragment, ClientError>> + 'a>;

/// Issues one outbound call per descriptor.
///
/// The call itself may fail before any fragment exists (bad credentials,
/// connection refused); once a stream is returned its items carry any
/// later failure. No quota or persistence side effects.
pub trait GenerationClient: Send + Sync {
    fn name(&self) -> &str;
    fn call<'a>(&'a self, descriptor: &'a Descriptor) -> Result<FragmentStream<'a>, ClientError>;
}

#[derive(Default)]
pub struct ClientRegistry {
    clients: IndexMap<String, Box<dyn GenerationClient>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<C: GenerationClient + 'static>(&mut self, client: C) {
        self.clients
            .insert(client.name().to_string(), Box::new(client));
    }

    pub fn get(&self, name: &str) -> Option<&dyn GenerationClient> {
        self.clients
            .get(name.trim())
            .map(|client| client.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.clients.keys().cloned().collect()
    }
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
