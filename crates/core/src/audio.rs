//! Audio constants for the inbound media contract.
//!
//! Inbound audio is 16-bit signed little-endian PCM, 16 kHz, mono, delivered
//! as arbitrary-size byte chunks. Outbound audio keeps the same encoding but
//! runs at whatever rate the TTS provider declares at stream start.

/// Inbound sample rate in Hz.
pub const INBOUND_SAMPLE_RATE: u32 = 16_000;

/// Bytes per sample for 16-bit PCM.
pub const BYTES_PER_SAMPLE: usize = 2;

/// Number of PCM bytes covering `ms` milliseconds at the given sample rate.
pub fn bytes_per_ms(sample_rate: u32, ms: u32) -> usize {
    (sample_rate as usize * ms as usize / 1000) * BYTES_PER_SAMPLE
}

/// Decode a byte chunk as i16 samples, dropping a trailing odd byte.
pub fn samples(pcm: &[u8]) -> impl Iterator<Item = i16> + '_ {
    pcm.chunks_exact(BYTES_PER_SAMPLE)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_per_ms() {
        // 30 ms at 16 kHz mono s16le = 480 samples = 960 bytes
        assert_eq!(bytes_per_ms(INBOUND_SAMPLE_RATE, 30), 960);
        assert_eq!(bytes_per_ms(INBOUND_SAMPLE_RATE, 200), 6400);
    }

    #[test]
    fn test_sample_decoding() {
        let decoded: Vec<i16> = samples(&[0x01, 0x00, 0xff, 0xff]).collect();
        assert_eq!(decoded, vec![1, -1]);
    }
}
