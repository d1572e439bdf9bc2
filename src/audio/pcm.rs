//! PCM helpers shared by the capture and playback paths
//!
//! Everything crossing the wire is 16-bit signed little-endian mono PCM,
//! base64-encoded. Everything inside the process is `f32` in [-1, 1].

use base64::{engine::general_purpose::STANDARD, Engine};

use crate::playback::PlaybackError;

/// Convert a float sample to i16 with clamped linear scaling.
pub fn float_to_i16(sample: f32) -> i16 {
    let clamped = sample.clamp(-1.0, 1.0);
    (clamped * i16::MAX as f32) as i16
}

/// Convert a whole float frame to PCM16.
pub fn frame_to_pcm16(frame: &[f32]) -> Vec<i16> {
    frame.iter().map(|&s| float_to_i16(s)).collect()
}

/// Base64-encode PCM16 samples as little-endian bytes.
pub fn encode_pcm16(samples: &[i16]) -> String {
    let bytes: Vec<u8> = samples.iter().flat_map(|&s| s.to_le_bytes()).collect();
    STANDARD.encode(&bytes)
}

/// Decode a base64 PCM16 little-endian payload into float samples.
pub fn decode_pcm16(payload: &str) -> Result<Vec<f32>, PlaybackError> {
    let bytes = STANDARD
        .decode(payload)
        .map_err(|e| PlaybackError::InvalidBase64(e.to_string()))?;

    if bytes.len() % 2 != 0 {
        return Err(PlaybackError::OddByteLength(bytes.len()));
    }

    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect())
}

/// Average interleaved channels down to mono.
pub fn mix_to_mono(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Resample mono audio with linear interpolation.
///
/// Returns the input unchanged when either rate is zero or the rates match.
pub fn resample_linear(samples: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if target_rate == 0 || source_rate == 0 {
        log::warn!(
            "Invalid sample rate (source: {}, target: {}), returning original",
            source_rate,
            target_rate
        );
        return samples.to_vec();
    }

    if source_rate == target_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = source_rate as f64 / target_rate as f64;
    let out_len = ((samples.len() as f64) / ratio).round() as usize;
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = pos.floor() as usize;
            let frac = (pos - idx as f64) as f32;
            let a = samples[idx.min(last)];
            let b = samples[(idx + 1).min(last)];
            a + (b - a) * frac
        })
        .collect()
}

/// Slices a continuous mono stream into equal-sized frames.
#[derive(Debug)]
pub struct FrameAssembler {
    frame_size: usize,
    pending: Vec<f32>,
}

impl FrameAssembler {
    pub fn new(frame_size: usize) -> Self {
        let frame_size = frame_size.max(1);
        Self {
            frame_size,
            pending: Vec::with_capacity(frame_size * 2),
        }
    }

    /// Append samples and return every frame that is now complete.
    pub fn push(&mut self, samples: &[f32]) -> Vec<Vec<f32>> {
        self.pending.extend_from_slice(samples);

        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_size {
            let rest = self.pending.split_off(self.frame_size);
            frames.push(std::mem::replace(&mut self.pending, rest));
        }
        frames
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_to_i16() {
        assert_eq!(float_to_i16(0.0), 0);
        assert_eq!(float_to_i16(1.0), i16::MAX);
        assert_eq!(float_to_i16(-1.0), -i16::MAX);

        // Clamping
        assert_eq!(float_to_i16(2.0), i16::MAX);
        assert_eq!(float_to_i16(-2.0), -i16::MAX);
    }

    #[test]
    fn test_encode_is_little_endian() {
        let encoded = encode_pcm16(&[0x1234, 0x5678]);
        let decoded = STANDARD.decode(encoded).unwrap();
        assert_eq!(decoded, vec![0x34, 0x12, 0x78, 0x56]);
    }

    #[test]
    fn test_decode_pcm16_scales_to_unit_range() {
        let payload = STANDARD.encode([0x00, 0x40, 0x00, 0xC0]);
        let samples = decode_pcm16(&payload).unwrap();
        assert_eq!(samples, vec![0.5, -0.5]);
    }

    #[test]
    fn test_decode_rejects_odd_length() {
        let payload = STANDARD.encode([0x00, 0x40, 0x00]);
        assert!(matches!(
            decode_pcm16(&payload),
            Err(PlaybackError::OddByteLength(3))
        ));
    }

    #[test]
    fn test_decode_rejects_bad_base64() {
        assert!(matches!(
            decode_pcm16("not base64!!"),
            Err(PlaybackError::InvalidBase64(_))
        ));
    }

    #[test]
    fn test_mix_to_mono() {
        let stereo = vec![0.2, 0.4, -1.0, 1.0];
        let mono = mix_to_mono(&stereo, 2);
        assert_eq!(mono.len(), 2);
        assert!((mono[0] - 0.3).abs() < 1e-6);
        assert_eq!(mono[1], 0.0);
    }

    #[test]
    fn test_resample_halves_length() {
        let input: Vec<f32> = (0..480).map(|i| i as f32 / 480.0).collect();
        let output = resample_linear(&input, 48000, 24000);
        assert_eq!(output.len(), 240);
        assert_eq!(output[0], input[0]);
        assert!((output[10] - input[20]).abs() < 1e-6);
    }

    #[test]
    fn test_resample_upsamples() {
        let output = resample_linear(&[0.0, 1.0], 16000, 32000);
        assert_eq!(output.len(), 4);
        assert!((output[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_resample_zero_rate_returns_original() {
        let input = vec![0.1, 0.2, 0.3];
        assert_eq!(resample_linear(&input, 48000, 0), input);
        assert_eq!(resample_linear(&input, 0, 24000), input);
    }

    #[test]
    fn test_frame_assembler_emits_fixed_frames() {
        let mut assembler = FrameAssembler::new(4);
        assert!(assembler.push(&[0.0; 3]).is_empty());

        let frames = assembler.push(&[1.0; 6]);
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.len() == 4));
        assert_eq!(frames[0], vec![0.0, 0.0, 0.0, 1.0]);
        assert_eq!(assembler.pending_len(), 1);
    }
}
