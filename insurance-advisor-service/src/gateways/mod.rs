pub mod transcription;
pub mod weather;
