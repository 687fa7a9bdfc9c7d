// SPDX-FileCopyrightText: © 2025 StreamScribe Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Linear-interpolation sample-rate conversion for PCM16 mono audio.
//!
//! Providers disagree on input rates, so the forward path occasionally has
//! to stretch or shrink decoded PCM. Linear interpolation is plenty for
//! speech headed into a transcription model; no windowed-sinc machinery.

use std::borrow::Cow;

use streamscribe_core::ScribeError;

/// Sample rates the decoder and providers operate at.
pub const SUPPORTED_RATES: [u32; 5] = [8_000, 12_000, 16_000, 24_000, 48_000];

pub fn is_supported_rate(rate: u32) -> bool {
    SUPPORTED_RATES.contains(&rate)
}

/// Resamples mono PCM16 from `input_rate` to `output_rate`.
///
/// Output length is `⌊len × output_rate / input_rate⌋`. Matching rates
/// return the input slice unchanged (no copy).
///
/// # Errors
///
/// Returns a codec error when either rate is outside [`SUPPORTED_RATES`].
pub fn resample_linear(
    input: &[i16],
    input_rate: u32,
    output_rate: u32,
) -> Result<Cow<'_, [i16]>, ScribeError> {
    if !is_supported_rate(input_rate) || !is_supported_rate(output_rate) {
        return Err(ScribeError::Codec(format!(
            "unsupported resample rates {input_rate} -> {output_rate}"
        )));
    }
    if input_rate == output_rate {
        return Ok(Cow::Borrowed(input));
    }
    if input.is_empty() {
        return Ok(Cow::Owned(Vec::new()));
    }

    let ratio = f64::from(output_rate) / f64::from(input_rate);
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let output_len = (input.len() as f64 * ratio).floor() as usize;
    let mut output = Vec::with_capacity(output_len);

    for i in 0..output_len {
        #[allow(clippy::cast_precision_loss)]
        let src_pos = i as f64 / ratio;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let idx0 = src_pos.floor() as usize;
        let idx1 = (idx0 + 1).min(input.len() - 1);
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
        let frac = (src_pos - idx0 as f64) as f32;

        let s0 = f32::from(input[idx0]);
        let s1 = f32::from(input[idx1]);
        #[allow(clippy::cast_possible_truncation)]
        let sample = s0.mul_add(1.0 - frac, s1 * frac).round() as i32;
        #[allow(clippy::cast_possible_truncation)]
        output.push(sample.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16);
    }

    Ok(Cow::Owned(output))
}

/// Interprets little-endian bytes as PCM16 samples. A trailing odd byte
/// is dropped.
pub fn pcm16_from_le_bytes(bytes: &[u8]) -> Vec<i16> {
    bytes.chunks_exact(2).map(|pair| i16::from_le_bytes([pair[0], pair[1]])).collect()
}

/// Serializes PCM16 samples as little-endian bytes.
pub fn pcm16_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn matching_rates_borrow_the_input() {
        let input = vec![1i16, 2, 3, 4];
        let out = resample_linear(&input, 24_000, 24_000).unwrap();
        assert!(matches!(out, Cow::Borrowed(_)));
        assert_eq!(out.as_ref(), input.as_slice());
    }

    #[test]
    fn upsampling_matches_expected_length() {
        let input = vec![0i16; 480]; // 20ms at 24kHz
        let out = resample_linear(&input, 24_000, 48_000).unwrap();
        assert_eq!(out.len(), 960);
    }

    #[test]
    fn downsampling_matches_expected_length() {
        let input = vec![0i16; 960];
        let out = resample_linear(&input, 48_000, 16_000).unwrap();
        assert_eq!(out.len(), 320);
    }

    #[test]
    fn interpolation_fills_midpoints() {
        // Doubling the rate interleaves averaged neighbours.
        let input = vec![0i16, 100];
        let out = resample_linear(&input, 24_000, 48_000).unwrap();
        assert_eq!(out.as_ref(), &[0, 50, 100, 100]);
    }

    #[test]
    fn unsupported_rate_is_rejected() {
        assert!(resample_linear(&[0i16; 10], 44_100, 24_000).is_err());
        assert!(resample_linear(&[0i16; 10], 24_000, 11_025).is_err());
    }

    #[test]
    fn byte_round_trip_is_lossless() {
        let samples = vec![-32_768i16, -1, 0, 1, 32_767];
        let bytes = pcm16_to_le_bytes(&samples);
        assert_eq!(pcm16_from_le_bytes(&bytes), samples);
    }

    #[test]
    fn odd_trailing_byte_is_dropped() {
        assert_eq!(pcm16_from_le_bytes(&[0x01, 0x00, 0xff]), vec![1i16]);
    }
}
