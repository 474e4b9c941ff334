use remix_contracts::{BinaryAsset, ErrorKind, GenerationOutcome, ResponseFragment};
use tracing::{debug, warn};

use crate::client::{truncate_text, ClientError};

const DEFAULT_MAX_DETAIL_CHARS: usize = 2000;

/// Reduces one fragment stream to exactly one outcome.
///
/// The first image fragment wins and ends consumption; fragments after it
/// are never pulled from the stream. Text is kept only as diagnostic
/// detail for the no-image and error cases.
#[derive(Debug, Clone)]
pub struct ResponseAssembler {
    max_detail_chars: usize,
}

impl Default for ResponseAssembler {
    fn default() -> Self {
        Self {
            max_detail_chars: DEFAULT_MAX_DETAIL_CHARS,
        }
    }
}

impl ResponseAssembler {
    pub fn new(max_detail_chars: usize) -> Self {
        Self {
            max_detail_chars: max_detail_chars.max(1),
        }
    }

    pub fn reduce<I>(&self, descriptor_id: &str, fragments: I) -> GenerationOutcome
    where
        I: IntoIterator<Item = Result<ResponseFragment, ClientError>>,
    {
        let mut text = String::new();
        let mut consumed = 0usize;

        for fragment in fragments {
            consumed += 1;
            match fragment {
                Ok(ResponseFragment::ImageChunk { bytes, mime_type }) => {
                    debug!(
                        descriptor_id,
                        fragments = consumed,
                        bytes = bytes.len(),
                        mime_type = %mime_type,
                        text = %text,
                        "image fragment received; stopping stream"
                    );
                    return GenerationOutcome::success(
                        descriptor_id,
                        BinaryAsset::new(bytes, mime_type),
                    );
                }
                Ok(ResponseFragment::TextChunk { text: chunk }) => {
                    text.push_str(&chunk);
                }
                Ok(ResponseFragment::Empty) => {}
                Err(err) => {
                    warn!(descriptor_id, fragments = consumed, error = %err, "generation stream failed");
                    let detail = if text.trim().is_empty() {
                        err.to_string()
                    } else {
                        format!("{err} (model text: {})", text.trim())
                    };
                    return GenerationOutcome::failure(
                        descriptor_id,
                        err.kind(),
                        truncate_text(&detail, self.max_detail_chars),
                    );
                }
            }
        }

        debug!(descriptor_id, fragments = consumed, text = %text, "stream ended without an image");
        GenerationOutcome::failure(
            descriptor_id,
            ErrorKind::NoImageProduced,
            truncate_text(&text, self.max_detail_chars),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use remix_contracts::{BinaryAsset, ErrorKind, GenerationOutcome, ResponseFragment};

    use super::ResponseAssembler;
    use crate::client::ClientError;

    fn ok(fragments: Vec<ResponseFragment>) -> Vec<Result<ResponseFragment, ClientError>> {
        fragments.into_iter().map(Ok).collect()
    }

    #[test]
    fn first_image_wins() {
        let outcome = ResponseAssembler::default().reduce(
            "d1",
            ok(vec![
                ResponseFragment::text("thinking"),
                ResponseFragment::image(b"A".to_vec(), "image/png"),
                ResponseFragment::text("trailing"),
                ResponseFragment::image(b"B".to_vec(), "image/jpeg"),
            ]),
        );
        assert_eq!(
            outcome,
            GenerationOutcome::success("d1", BinaryAsset::new(b"A".to_vec(), "image/png"))
        );
    }

    #[test]
    fn stops_pulling_after_first_image() {
        let pulled = Cell::new(0usize);
        let stream = (0..10).map(|idx| {
            pulled.set(pulled.get() + 1);
            if idx == 2 {
                Ok(ResponseFragment::image(vec![idx], "image/png"))
            } else {
                Ok(ResponseFragment::text(format!("t{idx}")))
            }
        });
        let outcome = ResponseAssembler::default().reduce("d1", stream);
        assert!(outcome.is_success());
        assert_eq!(pulled.get(), 3);
    }

    #[test]
    fn text_only_stream_is_no_image_with_concatenated_detail() {
        let outcome = ResponseAssembler::default().reduce(
            "d1",
            ok(vec![
                ResponseFragment::text("x"),
                ResponseFragment::Empty,
                ResponseFragment::text("y"),
            ]),
        );
        assert_eq!(
            outcome,
            GenerationOutcome::failure("d1", ErrorKind::NoImageProduced, "xy")
        );
    }

    #[test]
    fn empty_stream_is_no_image() {
        let outcome = ResponseAssembler::default().reduce("d1", Vec::new());
        assert_eq!(outcome.failure_reason(), Some(ErrorKind::NoImageProduced));
    }

    #[test]
    fn stream_error_maps_to_its_kind() {
        let outcome = ResponseAssembler::default().reduce(
            "d1",
            vec![
                Ok(ResponseFragment::text("partial")),
                Err(ClientError::RateLimited {
                    message: "HTTP 429".to_string(),
                    retry_after_s: None,
                }),
                Ok(ResponseFragment::image(vec![1], "image/png")),
            ],
        );
        let GenerationOutcome::Failure { reason, detail, .. } = outcome else {
            panic!("expected failure");
        };
        assert_eq!(reason, ErrorKind::RateLimited);
        assert!(detail.contains("HTTP 429"));
        assert!(detail.contains("partial"));
    }

    #[test]
    fn image_before_error_still_succeeds() {
        let outcome = ResponseAssembler::default().reduce(
            "d1",
            vec![
                Ok(ResponseFragment::image(vec![7], "image/webp")),
                Err(ClientError::transport("connection reset")),
            ],
        );
        assert_eq!(outcome.image().map(|asset| asset.bytes.clone()), Some(vec![7]));
    }

    #[test]
    fn detail_is_capped() {
        let outcome = ResponseAssembler::new(4).reduce(
            "d1",
            ok(vec![ResponseFragment::text("abcdefgh")]),
        );
        let GenerationOutcome::Failure { detail, .. } = outcome else {
            panic!("expected failure");
        };
        assert_eq!(detail, "abcd…");
    }
}
