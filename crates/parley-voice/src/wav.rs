//! Mono 16-bit PCM WAV encoding and segment persistence.
//!
//! Completed speech segments are written as timestamped WAV files so the
//! emotion collaborator (and anything else downstream) can consume them.

use crate::error::VoiceResult;
use chrono::Utc;
use std::path::{Path, PathBuf};

/// Encode f32 PCM (mono) to 16-bit WAV bytes: RIFF header, `fmt ` chunk
/// (PCM, 1 channel, little-endian 16-bit), `data` chunk.
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> Vec<u8> {
    let data_len = samples.len() * 2;
    let file_len = 44 + data_len as u32;

    let mut buf = Vec::with_capacity(44 + data_len);
    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&(file_len - 8).to_le_bytes());
    buf.extend_from_slice(b"WAVE");
    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes()); // PCM
    buf.extend_from_slice(&1u16.to_le_bytes()); // mono
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    buf.extend_from_slice(&(sample_rate * 2).to_le_bytes()); // byte rate
    buf.extend_from_slice(&2u16.to_le_bytes()); // block align
    buf.extend_from_slice(&16u16.to_le_bytes()); // bits per sample
    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&(data_len as u32).to_le_bytes());
    for &s in samples {
        let i = (s.clamp(-1.0, 1.0) * 32767.0).round() as i16;
        buf.extend_from_slice(&i.to_le_bytes());
    }
    buf
}

/// Write a segment to `dir` as `segment-YYYYMMDD-HHMMSS-mmm.wav`.
/// Creates `dir` if missing; returns the written path.
pub fn write_segment_wav(dir: &Path, samples: &[f32], sample_rate: u32) -> VoiceResult<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let stamp = Utc::now().format("%Y%m%d-%H%M%S-%3f");
    let path = dir.join(format!("segment-{}.wav", stamp));
    std::fs::write(&path, encode_wav(samples, sample_rate))?;
    Ok(path)
}
