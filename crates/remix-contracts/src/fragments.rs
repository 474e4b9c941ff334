/// One unit yielded by a streaming generation reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseFragment {
    ImageChunk { bytes: Vec<u8>, mime_type: String },
    TextChunk { text: String },
    /// Keep-alives and parts carrying neither image nor text.
    Empty,
}

impl ResponseFragment {
    pub fn image(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self::ImageChunk {
            bytes,
            mime_type: mime_type.into(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::TextChunk { text: text.into() }
    }
}
