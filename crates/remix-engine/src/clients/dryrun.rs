use std::io::Cursor;

use image::{ImageFormat, Rgb, RgbImage};
use remix_contracts::{Descriptor, ResponseFragment};
use sha2::{Digest, Sha256};

use crate::client::{ClientError, FragmentStream, GenerationClient};

/// Offline client that answers every call with a solid-colour PNG.
///
/// The colour is a hash of the instruction and reference bytes, so the
/// same descriptor always yields the same image. The reply mimics a real
/// backend: leading text, the image, then trailing text.
#[derive(Debug, Clone)]
pub struct DryrunClient {
    width: u32,
    height: u32,
}

impl Default for DryrunClient {
    fn default() -> Self {
        Self::new(256, 256)
    }
}

impl DryrunClient {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
        }
    }

    fn render(&self, digest: &[u8]) -> Result<Vec<u8>, ClientError> {
        let (r, g, b) = match digest {
            [r, g, b, ..] => (*r, *g, *b),
            _ => (128, 128, 128),
        };
        let image = RgbImage::from_pixel(self.width, self.height, Rgb([r, g, b]));
        let mut out = Cursor::new(Vec::new());
        image
            .write_to(&mut out, ImageFormat::Png)
            .map_err(|err| ClientError::transport(format!("dryrun PNG encode failed: {err}")))?;
        Ok(out.into_inner())
    }
}

impl GenerationClient for DryrunClient {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn call<'a>(&'a self, descriptor: &'a Descriptor) -> Result<FragmentStream<'a>, ClientError> {
        if descriptor.instruction_text.trim().is_empty() {
            return Err(ClientError::invalid_request("instruction text is empty"));
        }
        let digest = descriptor_digest(descriptor);
        let png = self.render(&digest)?;
        let fragments = vec![
            ResponseFragment::text(format!("dryrun render {}", hex::encode(&digest[..4]))),
            ResponseFragment::Empty,
            ResponseFragment::image(png, "image/png"),
            ResponseFragment::text("dryrun complete"),
        ];
        Ok(Box::new(fragments.into_iter().map(Ok)))
    }
}

fn descriptor_digest(descriptor: &Descriptor) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(descriptor.instruction_text.as_bytes());
    for asset in &descriptor.reference_assets {
        hasher.update(asset.mime_type.as_bytes());
        hasher.update(&asset.bytes);
    }
    hasher.finalize().to_vec()
}

#[cfg(test)]
mod tests {
    use remix_contracts::{BinaryAsset, Descriptor, ErrorKind, ResponseFragment};

    use super::DryrunClient;
    use crate::assembler::ResponseAssembler;
    use crate::client::GenerationClient;

    #[test]
    fn dryrun_reply_reduces_to_a_decodable_png() -> anyhow::Result<()> {
        let client = DryrunClient::new(8, 4);
        let descriptor = Descriptor::new(
            "v01",
            "wave hello",
            vec![BinaryAsset::new(vec![1, 2], "image/png")],
        );
        let outcome = ResponseAssembler::default().reduce("v01", client.call(&descriptor)?);
        let asset = outcome.image().cloned().unwrap_or_else(|| BinaryAsset::new(Vec::new(), ""));
        assert_eq!(asset.mime_type, "image/png");
        let decoded = image::load_from_memory(&asset.bytes)?;
        assert_eq!((decoded.width(), decoded.height()), (8, 4));
        Ok(())
    }

    #[test]
    fn same_descriptor_same_image() -> anyhow::Result<()> {
        let client = DryrunClient::default();
        let descriptor = Descriptor::new("v01", "sitting", Vec::new());
        let first: Vec<ResponseFragment> = client.call(&descriptor)?.collect::<Result<_, _>>()?;
        let second: Vec<ResponseFragment> = client.call(&descriptor)?.collect::<Result<_, _>>()?;
        assert_eq!(first, second);
        assert_eq!(first.len(), 4);
        Ok(())
    }

    #[test]
    fn blank_instruction_is_invalid() {
        let client = DryrunClient::default();
        let descriptor = Descriptor::new("v01", "   ", Vec::new());
        let err = client.call(&descriptor).err();
        assert_eq!(err.map(|err| err.kind()), Some(ErrorKind::InvalidRequest));
    }
}
