//! G.711 Codec Utilities
//!
//! Pure Rust implementation of the ITU-T G.711 μ-law codec plus the audio
//! plumbing the call engine needs around it: μ-law to A-law translation for
//! PCMA trunks, μ-law WAV container framing for recordings, and two-channel
//! mixing in the μ-law byte domain.

use std::sync::OnceLock;

/// μ-law silence byte used when padding a shorter channel during mixing.
pub const MULAW_SILENCE: u8 = 0x7F;

/// μ-law silence byte carried in RTP keep-alive packets.
pub const MULAW_KEEPALIVE: u8 = 0xFF;

/// A-law silence byte carried in RTP keep-alive packets.
pub const ALAW_KEEPALIVE: u8 = 0xD5;

const ULAW_BIAS: i32 = 0x84;
const ULAW_CLIP: i32 = 32635;
const ALAW_CLIP: i32 = 32767;

/// Convert a 16-bit linear PCM sample to μ-law.
pub fn linear_to_mulaw(sample: i16) -> u8 {
    let sign = if sample < 0 { 0x80 } else { 0x00 };

    let mut sample = if sample < 0 {
        (-(sample as i32)).min(ULAW_CLIP)
    } else {
        (sample as i32).min(ULAW_CLIP)
    };

    sample += ULAW_BIAS;

    let exponent = match sample {
        s if s >= 0x4000 => 7,
        s if s >= 0x2000 => 6,
        s if s >= 0x1000 => 5,
        s if s >= 0x0800 => 4,
        s if s >= 0x0400 => 3,
        s if s >= 0x0200 => 2,
        s if s >= 0x0100 => 1,
        _ => 0,
    };

    let mantissa = (sample >> (exponent + 3)) & 0x0F;

    !(sign | (exponent << 4) | mantissa as u8)
}

/// Convert a μ-law byte back to 16-bit linear PCM.
pub fn mulaw_to_linear(mulaw: u8) -> i16 {
    let mulaw = !mulaw;

    let sign = mulaw & 0x80;
    let exponent = ((mulaw >> 4) & 0x07) as i32;
    let mantissa = (mulaw & 0x0F) as i32;

    let mut sample = ((mantissa << 3) + ULAW_BIAS) << exponent;
    sample -= ULAW_BIAS;

    if sign != 0 {
        -sample as i16
    } else {
        sample as i16
    }
}

/// Convert a 16-bit linear PCM sample to A-law.
pub fn linear_to_alaw(sample: i16) -> u8 {
    let sign = if sample < 0 { 0x00 } else { 0x80 };

    let mut sample = if sample < 0 {
        (-(sample as i32)).min(ALAW_CLIP)
    } else {
        (sample as i32).min(ALAW_CLIP)
    };

    let (exponent, mantissa) = if sample >= 256 {
        let exp = match sample {
            s if s >= 0x4000 => 7,
            s if s >= 0x2000 => 6,
            s if s >= 0x1000 => 5,
            s if s >= 0x0800 => 4,
            s if s >= 0x0400 => 3,
            s if s >= 0x0200 => 2,
            s if s >= 0x0100 => 1,
            _ => 0,
        };
        sample >>= exp + 3;
        (exp, (sample & 0x0F) as u8)
    } else {
        sample >>= 4;
        (0, (sample & 0x0F) as u8)
    };

    (sign | (exponent << 4) | mantissa) ^ 0x55
}

/// Convert an A-law byte back to 16-bit linear PCM.
pub fn alaw_to_linear(alaw: u8) -> i16 {
    let alaw = alaw ^ 0x55;

    let sign = alaw & 0x80;
    let exponent = ((alaw >> 4) & 0x07) as i32;
    let mantissa = (alaw & 0x0F) as i32;

    let mut sample = if exponent > 0 {
        ((mantissa << 4) + 0x108) << (exponent - 1)
    } else {
        (mantissa << 4) + 0x08
    };

    if sign == 0 {
        sample = -sample;
    }

    sample as i16
}

fn mulaw_to_alaw_table() -> &'static [u8; 256] {
    static TABLE: OnceLock<[u8; 256]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = [0u8; 256];
        for (b, slot) in table.iter_mut().enumerate() {
            *slot = linear_to_alaw(mulaw_to_linear(b as u8));
        }
        table
    })
}

/// Translate a single μ-law byte to its A-law equivalent.
pub fn mulaw_to_alaw(mulaw: u8) -> u8 {
    mulaw_to_alaw_table()[mulaw as usize]
}

/// Transcode a μ-law buffer to A-law, used when the trunk negotiates PCMA.
pub fn transcode_mulaw_to_alaw(payload: &[u8]) -> Vec<u8> {
    let table = mulaw_to_alaw_table();
    payload.iter().map(|&b| table[b as usize]).collect()
}

/// Mix two μ-law buffers into one.
///
/// Each output byte is the μ-law encoding of the averaged linear samples.
/// The shorter buffer is padded with μ-law silence.
pub fn mix_mulaw(a: &[u8], b: &[u8]) -> Vec<u8> {
    let len = a.len().max(b.len());
    let mut mixed = Vec::with_capacity(len);

    for i in 0..len {
        let sa = mulaw_to_linear(*a.get(i).unwrap_or(&MULAW_SILENCE)) as i32;
        let sb = mulaw_to_linear(*b.get(i).unwrap_or(&MULAW_SILENCE)) as i32;
        mixed.push(linear_to_mulaw(((sa + sb) / 2) as i16));
    }

    mixed
}

/// WAV audio format code for G.711 μ-law.
pub const WAV_FORMAT_MULAW: u16 = 7;

/// Parsed fields of a WAV header produced by [`mulaw_to_wav`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WavInfo {
    pub audio_format: u16,
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    pub data_size: u32,
}

/// Wrap raw μ-law bytes in a 44-byte RIFF/WAVE container.
///
/// Mono, 8000 Hz, 8 bits per sample, audio format 7 (μ-law).
pub fn mulaw_to_wav(payload: &[u8]) -> Vec<u8> {
    let data_size = payload.len() as u32;
    let sample_rate: u32 = 8000;
    let channels: u16 = 1;
    let bits_per_sample: u16 = 8;
    let byte_rate = sample_rate * channels as u32 * bits_per_sample as u32 / 8;
    let block_align = channels * bits_per_sample / 8;

    let mut wav = Vec::with_capacity(44 + payload.len());
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_size).to_le_bytes());
    wav.extend_from_slice(b"WAVE");
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&WAV_FORMAT_MULAW.to_le_bytes());
    wav.extend_from_slice(&channels.to_le_bytes());
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&block_align.to_le_bytes());
    wav.extend_from_slice(&bits_per_sample.to_le_bytes());
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_size.to_le_bytes());
    wav.extend_from_slice(payload);
    wav
}

/// Parse the 44-byte header written by [`mulaw_to_wav`].
pub fn parse_wav_header(wav: &[u8]) -> Option<WavInfo> {
    if wav.len() < 44 || &wav[0..4] != b"RIFF" || &wav[8..12] != b"WAVE" || &wav[12..16] != b"fmt "
    {
        return None;
    }

    Some(WavInfo {
        audio_format: u16::from_le_bytes([wav[20], wav[21]]),
        channels: u16::from_le_bytes([wav[22], wav[23]]),
        sample_rate: u32::from_le_bytes([wav[24], wav[25], wav[26], wav[27]]),
        bits_per_sample: u16::from_le_bytes([wav[34], wav[35]]),
        data_size: u32::from_le_bytes([wav[40], wav[41], wav[42], wav[43]]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mulaw_roundtrip_tolerance() {
        // G.711 is lossy but the error stays within one quantization step
        let samples: Vec<i16> = vec![0, 100, 1000, 10000, 30000, -100, -1000, -10000, -30000];

        for &original in &samples {
            let encoded = linear_to_mulaw(original);
            let decoded = mulaw_to_linear(encoded);

            let error = (original as i32 - decoded as i32).abs();
            assert!(
                error < 1000,
                "error too large for {}: decoded {}, error {}",
                original,
                decoded,
                error
            );
        }
    }

    #[test]
    fn test_mulaw_encode_deterministic() {
        for byte in 0..=u8::MAX {
            let linear = mulaw_to_linear(byte);
            assert_eq!(linear_to_mulaw(linear), linear_to_mulaw(linear));
            assert_eq!(mulaw_to_linear(byte), linear);
        }
    }

    #[test]
    fn test_mulaw_reencode_identity() {
        // decode ∘ encode is stable on the representable subset
        for byte in 0..=u8::MAX {
            let linear = mulaw_to_linear(byte);
            let reencoded = linear_to_mulaw(linear);
            let redecoded = mulaw_to_linear(reencoded);
            assert_eq!(linear, redecoded, "byte {:#04x}", byte);
        }
    }

    #[test]
    fn test_alaw_roundtrip_tolerance() {
        let samples: Vec<i16> = vec![0, 100, 1000, 10000, -100, -1000, -10000];

        for &original in &samples {
            let encoded = linear_to_alaw(original);
            let decoded = alaw_to_linear(encoded);

            let error = (original as i32 - decoded as i32).abs();
            assert!(error < 1000, "error too large for {}: {}", original, error);
        }
    }

    #[test]
    fn test_mulaw_to_alaw_table_consistency() {
        for byte in 0..=u8::MAX {
            assert_eq!(
                mulaw_to_alaw(byte),
                linear_to_alaw(mulaw_to_linear(byte)),
                "byte {:#04x}",
                byte
            );
        }
    }

    #[test]
    fn test_transcode_buffer() {
        let payload = vec![MULAW_SILENCE; 160];
        let transcoded = transcode_mulaw_to_alaw(&payload);
        assert_eq!(transcoded.len(), 160);
        assert!(transcoded.iter().all(|&b| b == mulaw_to_alaw(MULAW_SILENCE)));
    }

    #[test]
    fn test_mix_commutative() {
        let a: Vec<u8> = (0..160).map(|i| linear_to_mulaw((i * 50) as i16)).collect();
        let b: Vec<u8> = (0..160).map(|i| linear_to_mulaw((i * -30) as i16)).collect();

        assert_eq!(mix_mulaw(&a, &b), mix_mulaw(&b, &a));
    }

    #[test]
    fn test_mix_pads_shorter_with_silence() {
        let a: Vec<u8> = vec![linear_to_mulaw(8000); 4];
        let b: Vec<u8> = vec![linear_to_mulaw(8000); 2];

        let mixed = mix_mulaw(&a, &b);
        assert_eq!(mixed.len(), 4);

        // tail mixes against silence, so it decodes to roughly half amplitude
        let tail = mulaw_to_linear(mixed[3]) as i32;
        let full = mulaw_to_linear(mixed[0]) as i32;
        assert!(tail < full, "padded tail {} vs full {}", tail, full);
    }

    #[test]
    fn test_mix_silence_is_quiet() {
        let silence = vec![MULAW_SILENCE; 160];
        let mixed = mix_mulaw(&silence, &silence);
        for byte in mixed {
            assert!(mulaw_to_linear(byte).abs() < 16);
        }
    }

    #[test]
    fn test_wav_header_roundtrip() {
        let payload = vec![MULAW_SILENCE; 1600];
        let wav = mulaw_to_wav(&payload);

        assert_eq!(wav.len(), 44 + 1600);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");

        let info = parse_wav_header(&wav).unwrap();
        assert_eq!(info.audio_format, WAV_FORMAT_MULAW);
        assert_eq!(info.channels, 1);
        assert_eq!(info.sample_rate, 8000);
        assert_eq!(info.bits_per_sample, 8);
        assert_eq!(info.data_size, 1600);
    }

    #[test]
    fn test_wav_header_rejects_garbage() {
        assert!(parse_wav_header(&[0u8; 10]).is_none());
        assert!(parse_wav_header(&[0u8; 44]).is_none());
    }

    #[test]
    fn test_wav_empty_payload() {
        let wav = mulaw_to_wav(&[]);
        assert_eq!(wav.len(), 44);
        let info = parse_wav_header(&wav).unwrap();
        assert_eq!(info.data_size, 0);
    }
}
