//! Helper utilities for benchmarks

/// Generate an interleaved sine test signal, the same tone on every channel
pub fn generate_sine_wave(freq: f32, sample_rate: u32, frames: usize, channels: usize) -> Vec<f32> {
    (0..frames)
        .flat_map(|i| {
            let t = i as f32 / sample_rate as f32;
            let s = (2.0 * std::f32::consts::PI * freq * t).sin() * 0.5;
            std::iter::repeat(s).take(channels)
        })
        .collect()
}

/// Generate silence
pub fn generate_silence(frames: usize, channels: usize) -> Vec<f32> {
    vec![0.0; frames * channels]
}

/// Little-endian f32 payload bytes
pub fn float_bytes(samples: &[f32]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Little-endian signed 16-bit payload bytes
pub fn s16_bytes(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|s| ((s.clamp(-1.0, 1.0) * 32_767.0) as i16).to_le_bytes())
        .collect()
}

/// Calculate RMS level
pub fn calc_rms(buffer: &[f32]) -> f32 {
    if buffer.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = buffer.iter().map(|&s| s * s).sum();
    (sum_sq / buffer.len() as f32).sqrt()
}

/// Calculate peak level
pub fn calc_peak(buffer: &[f32]) -> f32 {
    buffer.iter().map(|&s| s.abs()).fold(0.0f32, f32::max)
}

/// Convert linear amplitude to decibels
pub fn amplitude_to_db(amp: f32) -> f32 {
    if amp <= 0.0 {
        -160.0
    } else {
        20.0 * amp.log10()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_sine_wave() {
        let wave = generate_sine_wave(440.0, 48_000, 512, 2);
        assert_eq!(wave.len(), 1024);
        assert!(wave.iter().all(|&s| (-0.5..=0.5).contains(&s)));
        assert!(wave.chunks(2).all(|f| f[0] == f[1]));
    }

    #[test]
    fn test_payload_encoding() {
        assert_eq!(float_bytes(&[0.5]), 0.5f32.to_le_bytes().to_vec());
        assert_eq!(s16_bytes(&[1.0, -2.0]), [0xff, 0x7f, 0x01, 0x80]);
    }

    #[test]
    fn test_calc_rms() {
        let signal = vec![1.0, -1.0, 1.0, -1.0];
        let rms = calc_rms(&signal);
        assert!((rms - 1.0).abs() < 0.01);
        assert_eq!(calc_rms(&[]), 0.0);
    }

    #[test]
    fn test_calc_peak() {
        let signal = vec![0.5, -0.8, 0.3, -0.2];
        let peak = calc_peak(&signal);
        assert!((peak - 0.8).abs() < 0.01);
    }

    #[test]
    fn test_amplitude_to_db() {
        assert!((amplitude_to_db(1.0) - 0.0).abs() < 0.1);
        assert!((amplitude_to_db(0.5) - (-6.02)).abs() < 0.1);
        assert_eq!(amplitude_to_db(0.0), -160.0);
    }
}
