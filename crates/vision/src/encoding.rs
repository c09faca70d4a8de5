//! JPEG encoding of published frames.
//!
//! Every published state is encoded exactly once on the pipeline thread so
//! viewers only copy bytes.

use image::{ExtendedColorType, codecs::jpeg::JpegEncoder};
use thiserror::Error;
use video_ingest::Frame;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("frame buffer does not match its {width}x{height} dimensions")]
    Malformed { width: u32, height: u32 },
    #[error("JPEG encode failed: {0}")]
    Jpeg(#[from] image::ImageError),
}

pub fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>, EncodeError> {
    if !frame.is_well_formed() {
        return Err(EncodeError::Malformed {
            width: frame.width,
            height: frame.height,
        });
    }
    let mut buffer = Vec::with_capacity(frame.data.len() / 8);
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100)).encode(
        &frame.data,
        frame.width,
        frame.height,
        ExtendedColorType::Rgb8,
    )?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_decodable_jpeg() {
        let frame = Frame::solid(16, 8, [200, 10, 10]);
        let jpeg = encode_jpeg(&frame, 80).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (16, 8));
    }

    #[test]
    fn rejects_malformed_frames() {
        let mut frame = Frame::solid(4, 4, [0, 0, 0]);
        frame.data.truncate(10);
        assert!(matches!(
            encode_jpeg(&frame, 70),
            Err(EncodeError::Malformed { .. })
        ));
    }
}
