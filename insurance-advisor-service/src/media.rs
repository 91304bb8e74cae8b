use std::io::Cursor;

use bytes::Bytes;
use image::{DynamicImage, ImageFormat};
use prompt_flow::{Attachment, FlowError, Result};
use tracing::info;

use crate::gateways::transcription::{AudioClip, TranscriptionError};

/// Decode an uploaded image in any supported format and re-encode it as PNG.
pub async fn normalize_image(data: Bytes) -> Result<Attachment> {
    let input_len = data.len();
    let attachment = tokio::task::spawn_blocking(move || -> Result<Attachment> {
        let image = image::load_from_memory(&data)
            .map_err(|e| FlowError::Conversion(format!("Unsupported or corrupt image: {e}")))?;
        Ok(Attachment::png(encode_png(&image)?))
    })
    .await
    .map_err(|e| FlowError::Conversion(format!("Image conversion task failed: {e}")))??;

    info!(
        input_bytes = input_len,
        png_bytes = attachment.len(),
        "Image normalized to PNG"
    );
    Ok(attachment)
}

/// Bring an uploaded recording into an encoding the speech recognizer accepts.
pub async fn normalize_audio(data: Bytes) -> std::result::Result<AudioClip, TranscriptionError> {
    tokio::task::spawn_blocking(move || AudioClip::from_upload(data))
        .await
        .map_err(|e| TranscriptionError::Conversion(format!("Audio conversion task failed: {e}")))?
}

fn encode_png(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
        .map_err(|e| FlowError::Conversion(format!("Failed to encode PNG: {e}")))?;
    Ok(buffer)
}
