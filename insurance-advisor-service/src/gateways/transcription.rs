//! Speech-to-text for spoken accident reports.
//!
//! Uploads the recognizer reads natively (16-bit PCM WAV, FLAC, Ogg Opus) are
//! passed through untouched. Anything else, such as the M4A/AAC recordings
//! phones produce or MP3, is decoded and re-encoded as 16-bit mono PCM WAV.

use std::io::Cursor;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use symphonia::core::{
    audio::SampleBuffer,
    codecs::{CODEC_TYPE_NULL, DecoderOptions},
    errors::Error as DecodeError,
    formats::FormatOptions,
    io::MediaSourceStream,
    meta::MetadataOptions,
    probe::Hint,
};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_SPEECH_BASE_URL: &str = "https://speech.googleapis.com";
pub const DEFAULT_SPEECH_LANGUAGE: &str = "es-ES";

/// Opus streams always decode at 48 kHz.
const OPUS_SAMPLE_RATE_HZ: u32 = 48_000;

#[derive(Error, Debug)]
pub enum TranscriptionError {
    #[error("Audio conversion error: {0}")]
    Conversion(String),
    #[error("The audio could not be understood")]
    UnintelligibleAudio,
    #[error("Transcription service error: {0}")]
    Service(String),
}

impl TranscriptionError {
    pub fn kind(&self) -> &'static str {
        match self {
            TranscriptionError::Conversion(_) => "conversion_error",
            TranscriptionError::UnintelligibleAudio => "unintelligible_audio",
            TranscriptionError::Service(_) => "transcription_service_error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioEncoding {
    Linear16,
    Flac,
    OggOpus,
}

impl AudioEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioEncoding::Linear16 => "LINEAR16",
            AudioEncoding::Flac => "FLAC",
            AudioEncoding::OggOpus => "OGG_OPUS",
        }
    }
}

/// An uploaded recording in an encoding the recognizer accepts.
#[derive(Debug, Clone)]
pub struct AudioClip {
    pub encoding: AudioEncoding,
    pub sample_rate_hz: Option<u32>,
    pub data: Bytes,
}

impl AudioClip {
    /// Blocking: transcoding runs the full decoder. Call from the blocking pool.
    pub fn from_upload(data: Bytes) -> Result<Self, TranscriptionError> {
        if data.is_empty() {
            return Err(TranscriptionError::Conversion("audio upload is empty".into()));
        }

        let native = if data.starts_with(b"RIFF") && data.get(8..12) == Some(&b"WAVE"[..]) {
            pcm16_wav_rate(&data)?.map(|rate| (AudioEncoding::Linear16, Some(rate)))
        } else if data.starts_with(b"fLaC") {
            Some((AudioEncoding::Flac, None))
        } else if data.starts_with(b"OggS") && contains(&data, b"OpusHead") {
            Some((AudioEncoding::OggOpus, Some(OPUS_SAMPLE_RATE_HZ)))
        } else {
            None
        };

        let clip = match native {
            Some((encoding, sample_rate_hz)) => Self {
                encoding,
                sample_rate_hz,
                data,
            },
            None => transcode_to_wav(data)?,
        };
        debug!(
            encoding = clip.encoding.as_str(),
            sample_rate_hz = ?clip.sample_rate_hz,
            bytes = clip.data.len(),
            "Audio upload accepted"
        );
        Ok(clip)
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn u16_le(bytes: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_le_bytes(bytes.get(at..at + 2)?.try_into().ok()?))
}

fn u32_le(bytes: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_le_bytes(bytes.get(at..at + 4)?.try_into().ok()?))
}

/// Sample rate of a 16-bit PCM WAV. Other WAV flavours return `None` and get transcoded.
fn pcm16_wav_rate(data: &[u8]) -> Result<Option<u32>, TranscriptionError> {
    let mut offset = 12;
    while let (Some(id), Some(size)) = (data.get(offset..offset + 4), u32_le(data, offset + 4)) {
        let body = offset + 8;
        if id == b"fmt " {
            let format = u16_le(data, body);
            let sample_rate = u32_le(data, body + 4);
            let bits = u16_le(data, body + 14);
            return Ok(match (format, sample_rate, bits) {
                (Some(1), Some(rate), Some(16)) => Some(rate),
                _ => None,
            });
        }
        // Chunks are padded to an even length.
        offset = body + size as usize + (size as usize & 1);
    }
    Err(TranscriptionError::Conversion("WAV file has no fmt chunk".into()))
}

fn conversion(context: &str, err: impl std::fmt::Display) -> TranscriptionError {
    TranscriptionError::Conversion(format!("{context}: {err}"))
}

/// Decode any container and codec symphonia knows, downmix to mono and write
/// a 16-bit PCM WAV at the source sample rate.
fn transcode_to_wav(data: Bytes) -> Result<AudioClip, TranscriptionError> {
    let input_len = data.len();
    let source = MediaSourceStream::new(Box::new(Cursor::new(data)), Default::default());
    let probed = symphonia::default::get_probe()
        .format(
            &Hint::new(),
            source,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| conversion("unsupported audio format", e))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| TranscriptionError::Conversion("no audio track found".into()))?;
    let track_id = track.id;
    let mut sample_rate = track.codec_params.sample_rate;
    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| conversion("unsupported audio codec", e))?;

    let mut samples: Vec<i16> = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(DecodeError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(DecodeError::ResetRequired) => break,
            Err(e) => return Err(conversion("failed to read audio", e)),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(DecodeError::DecodeError(e)) => {
                debug!(error = e, "Skipping undecodable audio packet");
                continue;
            }
            Err(e) => return Err(conversion("failed to decode audio", e)),
        };
        let spec = *decoded.spec();
        sample_rate = Some(spec.rate);
        let channels = spec.channels.count().max(1);
        let mut buffer = SampleBuffer::<i16>::new(decoded.capacity() as u64, spec);
        buffer.copy_interleaved_ref(decoded);
        samples.extend(buffer.samples().chunks(channels).map(|frame| {
            let sum: i32 = frame.iter().map(|&s| i32::from(s)).sum();
            (sum / frame.len() as i32) as i16
        }));
    }

    let sample_rate = sample_rate
        .ok_or_else(|| TranscriptionError::Conversion("audio has no sample rate".into()))?;
    if samples.is_empty() {
        return Err(TranscriptionError::Conversion("audio contains no samples".into()));
    }

    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut wav = Cursor::new(Vec::new());
    let mut writer =
        hound::WavWriter::new(&mut wav, spec).map_err(|e| conversion("failed to write WAV", e))?;
    for sample in &samples {
        writer
            .write_sample(*sample)
            .map_err(|e| conversion("failed to write WAV", e))?;
    }
    writer
        .finalize()
        .map_err(|e| conversion("failed to write WAV", e))?;

    info!(
        input_bytes = input_len,
        sample_rate,
        samples = samples.len(),
        "Audio transcoded to 16-bit mono WAV"
    );
    Ok(AudioClip {
        encoding: AudioEncoding::Linear16,
        sample_rate_hz: Some(sample_rate),
        data: Bytes::from(wav.into_inner()),
    })
}

#[async_trait]
pub trait TranscriptionGateway: Send + Sync {
    /// Transcript of the whole clip. Silence or noise is [`TranscriptionError::UnintelligibleAudio`].
    async fn transcribe(&self, clip: &AudioClip) -> Result<String, TranscriptionError>;
}

#[derive(Debug, Clone)]
pub struct SpeechConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub language: String,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_SPEECH_BASE_URL.to_string(),
            language: DEFAULT_SPEECH_LANGUAGE.to_string(),
        }
    }
}

#[derive(Deserialize, Default)]
struct RecognizeResponse {
    #[serde(default)]
    results: Vec<RecognitionResult>,
}

#[derive(Deserialize)]
struct RecognitionResult {
    #[serde(default)]
    alternatives: Vec<Alternative>,
}

#[derive(Deserialize)]
struct Alternative {
    #[serde(default)]
    transcript: String,
}

impl RecognizeResponse {
    /// Best alternative of every result, in order.
    fn transcript(&self) -> String {
        self.results
            .iter()
            .filter_map(|r| r.alternatives.first())
            .map(|a| a.transcript.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Synchronous `speech:recognize` client.
pub struct GoogleSpeechGateway {
    http: reqwest::Client,
    config: SpeechConfig,
}

impl GoogleSpeechGateway {
    pub fn new(config: SpeechConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl TranscriptionGateway for GoogleSpeechGateway {
    async fn transcribe(&self, clip: &AudioClip) -> Result<String, TranscriptionError> {
        let api_key = self.config.api_key.as_deref().ok_or_else(|| {
            TranscriptionError::Service("SPEECH_API_KEY environment variable is not set".into())
        })?;

        let mut recognition = json!({
            "encoding": clip.encoding.as_str(),
            "languageCode": self.config.language,
            "enableAutomaticPunctuation": true,
        });
        if let Some(rate) = clip.sample_rate_hz {
            recognition["sampleRateHertz"] = json!(rate);
        }
        let body = json!({
            "config": recognition,
            "audio": { "content": STANDARD.encode(&clip.data) },
        });

        let url = format!(
            "{}/v1/speech:recognize",
            self.config.base_url.trim_end_matches('/')
        );
        let response = self
            .http
            .post(&url)
            .header("x-goog-api-key", api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| TranscriptionError::Service(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            warn!(status = %status, body = %detail, "Speech recognition request failed");
            return Err(TranscriptionError::Service(format!(
                "speech API returned {status}"
            )));
        }

        let recognized: RecognizeResponse = response
            .json()
            .await
            .map_err(|e| TranscriptionError::Service(format!("invalid speech API response: {e}")))?;
        let transcript = recognized.transcript();
        if transcript.is_empty() {
            return Err(TranscriptionError::UnintelligibleAudio);
        }

        info!(chars = transcript.len(), "Audio transcribed");
        Ok(transcript)
    }
}
