//! MP3 pre-decode using symphonia
//!
//! The transport delivers each chunk's audio as an in-memory MP3 buffer; the
//! runway decodes it to PCM ahead of playback. The decoder is a trait seam so
//! tests (and embedders with their own codec stack) can substitute one.

use std::io::Cursor;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, warn};

use crate::audio::types::PcmChunk;
use crate::error::DecodeError;

/// Blocking MP3 → PCM decoder
///
/// Called only from the runway's dedicated pre-decode worker; implementations
/// may block. Must be cheap to share across chunks.
pub trait AudioDecoder: Send + Sync {
    fn decode(&self, chunk_index: u32, data: &[u8]) -> Result<PcmChunk, DecodeError>;
}

/// Symphonia-backed decoder for the MP3 buffers the backend emits
pub struct SymphoniaDecoder;

impl AudioDecoder for SymphoniaDecoder {
    fn decode(&self, chunk_index: u32, data: &[u8]) -> Result<PcmChunk, DecodeError> {
        debug!("Decoding chunk {} audio ({} bytes)", chunk_index, data.len());

        let cursor = Cursor::new(data.to_vec());
        let mss = MediaSourceStream::new(Box::new(cursor), Default::default());

        let mut hint = Hint::new();
        hint.with_extension("mp3");

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .map_err(|e| DecodeError::Audio {
                chunk_index,
                reason: format!("probe failed: {}", e),
            })?;

        let mut format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| DecodeError::Audio {
                chunk_index,
                reason: "no audio track found".to_string(),
            })?;

        let track_id = track.id;
        let codec_params = track.codec_params.clone();

        let sample_rate = codec_params.sample_rate.ok_or_else(|| DecodeError::Audio {
            chunk_index,
            reason: "sample rate not found".to_string(),
        })?;

        let channels = codec_params
            .channels
            .map(|c| c.count() as u16)
            .ok_or_else(|| DecodeError::Audio {
                chunk_index,
                reason: "channel count not found".to_string(),
            })?;

        let mut decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|e| DecodeError::Audio {
                chunk_index,
                reason: format!("failed to create decoder: {}", e),
            })?;

        let mut samples: Vec<f32> = Vec::new();
        let mut sample_buf: Option<SampleBuffer<f32>> = None;

        loop {
            let packet = match format.next_packet() {
                Ok(packet) => packet,
                Err(symphonia::core::errors::Error::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    break;
                }
                Err(e) => {
                    warn!("Error reading packet for chunk {}: {}", chunk_index, e);
                    break;
                }
            };

            if packet.track_id() != track_id {
                continue;
            }

            match decoder.decode(&packet) {
                Ok(decoded) => {
                    let buf = sample_buf.get_or_insert_with(|| {
                        SampleBuffer::new(decoded.capacity() as u64, *decoded.spec())
                    });
                    buf.copy_interleaved_ref(decoded);
                    samples.extend_from_slice(buf.samples());
                }
                Err(e) => {
                    // A corrupt packet mid-stream is not fatal; keep what decodes.
                    warn!("Decode error in chunk {}: {}", chunk_index, e);
                    continue;
                }
            }
        }

        if samples.is_empty() {
            return Err(DecodeError::EmptyPcm { chunk_index });
        }

        let pcm = PcmChunk::new(samples, sample_rate, channels);
        debug!(
            "Chunk {} decoded: {} frames, {}ms @ {}Hz",
            chunk_index,
            pcm.frame_count(),
            pcm.duration_ms(),
            sample_rate
        );

        Ok(pcm)
    }
}
