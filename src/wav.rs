//! Linear PCM WAVE decoding and windowed RMS measurement.
//!
//! The decoder holds one buffer at a time. Playback progress is driven by the
//! caller through [`WavDecoder::advance`], which walks a read cursor forward in
//! real time and measures the energy of the samples it passed over.

use std::io::Cursor;

use thiserror::Error;

/// Why a WAVE buffer could not be decoded.
#[derive(Debug, Error)]
pub enum WavError {
    #[error("not a RIFF/WAVE buffer: {0}")]
    BadSignature(String),
    #[error("unsupported sample format: {0}")]
    UnsupportedFormat(String),
    #[error("unsupported bit depth: {0}")]
    UnsupportedBitDepth(u16),
    #[error("malformed sample data: {0}")]
    Malformed(String),
}

impl From<hound::Error> for WavError {
    fn from(err: hound::Error) -> Self {
        match err {
            hound::Error::FormatError(msg) => WavError::BadSignature(msg.to_string()),
            hound::Error::Unsupported => WavError::UnsupportedFormat("not linear PCM".to_string()),
            other => WavError::Malformed(other.to_string()),
        }
    }
}

/// Decoded samples, one normalized `[-1, 1]` array per channel.
#[derive(Clone, Debug)]
pub struct PcmBuffer {
    channels: Vec<Vec<f32>>,
    sample_rate: u32,
    bits_per_sample: u16,
}

impl PcmBuffer {
    /// Decode a RIFF/WAVE container holding integer PCM samples.
    pub fn decode(bytes: &[u8]) -> Result<Self, WavError> {
        let mut reader = hound::WavReader::new(Cursor::new(bytes))?;
        let spec = reader.spec();

        if spec.sample_format != hound::SampleFormat::Int {
            return Err(WavError::UnsupportedFormat(format!("{:?}", spec.sample_format)));
        }
        if !matches!(spec.bits_per_sample, 8 | 16 | 24 | 32) {
            return Err(WavError::UnsupportedBitDepth(spec.bits_per_sample));
        }
        let channel_count = spec.channels as usize;
        if channel_count == 0 {
            return Err(WavError::Malformed("zero channels".to_string()));
        }
        if spec.sample_rate == 0 {
            return Err(WavError::Malformed("zero sample rate".to_string()));
        }

        let scale = 1.0 / (1u64 << (spec.bits_per_sample - 1)) as f64;
        // The header's length is not trusted past the bytes actually present.
        let block_align = (channel_count * (spec.bits_per_sample as usize).div_ceil(8)).max(1);
        let frames = (reader.duration() as usize).min(bytes.len() / block_align);
        let mut channels = vec![Vec::with_capacity(frames); channel_count];

        // Samples are interleaved frame by frame.
        for (i, sample) in reader.samples::<i32>().enumerate() {
            let value = sample?;
            channels[i % channel_count].push((value as f64 * scale) as f32);
        }

        // A trailing partial frame is dropped so every channel has the same length.
        let len = channels.iter().map(Vec::len).min().unwrap_or(0);
        for channel in &mut channels {
            channel.truncate(len);
        }

        Ok(Self {
            channels,
            sample_rate: spec.sample_rate,
            bits_per_sample: spec.bits_per_sample,
        })
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn samples_per_channel(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn bits_per_sample(&self) -> u16 {
        self.bits_per_sample
    }

    pub fn channel(&self, index: usize) -> Option<&[f32]> {
        self.channels.get(index).map(Vec::as_slice)
    }

    /// Root-mean-square over `[start, end)` across every channel.
    fn rms(&self, start: usize, end: usize) -> f32 {
        let count = self.channels.len() * (end - start);
        if count == 0 {
            return 0.0;
        }
        let sum: f32 = self
            .channels
            .iter()
            .flat_map(|c| c[start..end].iter())
            .map(|v| v * v)
            .sum();
        (sum / count as f32).sqrt()
    }
}

/// Streaming reader over the currently playing buffer.
#[derive(Debug, Default)]
pub struct WavDecoder {
    pcm: Option<PcmBuffer>,
    cursor: usize,
    elapsed: f64,
    last_rms: f32,
}

impl WavDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current buffer. On failure the decoder is left empty.
    pub fn load(&mut self, bytes: &[u8]) -> Result<(), WavError> {
        self.release();
        match PcmBuffer::decode(bytes) {
            Ok(pcm) => {
                log::debug!(
                    "Loaded wav: {} ch, {} Hz, {} bit, {} samples",
                    pcm.channel_count(),
                    pcm.sample_rate(),
                    pcm.bits_per_sample(),
                    pcm.samples_per_channel()
                );
                self.pcm = Some(pcm);
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to decode wav buffer: {}", e);
                Err(e)
            }
        }
    }

    pub fn release(&mut self) {
        self.pcm = None;
        self.cursor = 0;
        self.elapsed = 0.0;
        self.last_rms = 0.0;
    }

    /// Move the cursor forward by `delta_seconds` of playback and measure the
    /// RMS of the samples passed over.
    ///
    /// Returns `false` when there is nothing left to play, which is the
    /// caller's cue to load the next buffer.
    pub fn advance(&mut self, delta_seconds: f32) -> bool {
        if delta_seconds <= 0.0 {
            return self.has_remaining();
        }

        let Some(pcm) = &self.pcm else {
            self.last_rms = 0.0;
            return false;
        };
        let total = pcm.samples_per_channel();
        if self.cursor >= total {
            self.last_rms = 0.0;
            return false;
        }

        self.elapsed += delta_seconds as f64;
        let goal = ((self.elapsed * pcm.sample_rate() as f64).floor() as usize).min(total);
        if goal > self.cursor {
            self.last_rms = pcm.rms(self.cursor, goal);
            self.cursor = goal;
        }
        true
    }

    pub fn has_remaining(&self) -> bool {
        self.pcm
            .as_ref()
            .is_some_and(|pcm| self.cursor < pcm.samples_per_channel())
    }

    pub fn rms(&self) -> f32 {
        self.last_rms
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn pcm(&self) -> Option<&PcmBuffer> {
        self.pcm.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_i16(channels: u16, sample_rate: u32, samples: &[i16]) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for &s in samples {
                writer.write_sample(s).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    fn encode_mono(bits_per_sample: u16, samples: &[i32]) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 8000,
            bits_per_sample,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for &s in samples {
                writer.write_sample(s).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    /// A canonical 44-byte header written by hand, so the data length can lie.
    fn raw_wav(channels: u16, sample_rate: u32, bits: u16, data_len: u32, payload: &[u8]) -> Vec<u8> {
        let block_align = channels * bits / 8;
        let mut out = Vec::new();
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + payload.len() as u32).to_le_bytes());
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&channels.to_le_bytes());
        out.extend_from_slice(&sample_rate.to_le_bytes());
        out.extend_from_slice(&(sample_rate * block_align as u32).to_le_bytes());
        out.extend_from_slice(&block_align.to_le_bytes());
        out.extend_from_slice(&bits.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&data_len.to_le_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_oversized_data_length_does_not_preallocate() {
        let bytes = raw_wav(1, 8000, 8, 0xFFFF_FFF0, &[128, 160, 96, 128]);
        match PcmBuffer::decode(&bytes) {
            Ok(pcm) => assert!(pcm.samples_per_channel() <= 4),
            Err(e) => assert!(matches!(e, WavError::Malformed(_) | WavError::BadSignature(_))),
        }
    }

    #[test]
    fn test_rejects_zero_sample_rate() {
        let bytes = raw_wav(1, 0, 16, 4, &[0, 0, 0, 64]);
        assert!(PcmBuffer::decode(&bytes).is_err());

        let mut decoder = WavDecoder::new();
        assert!(decoder.load(&bytes).is_err());
        assert!(!decoder.advance(0.1));
    }

    #[test]
    fn test_decode_24bit_normalized() {
        let bytes = encode_mono(24, &[4_194_304, -8_388_608, 0]);
        let pcm = PcmBuffer::decode(&bytes).unwrap();
        assert_eq!(pcm.bits_per_sample(), 24);
        let ch = pcm.channel(0).unwrap();
        assert!((ch[0] - 0.5).abs() < 1e-6);
        assert!((ch[1] + 1.0).abs() < 1e-6);
        assert!(ch[2].abs() < 1e-6);
    }

    #[test]
    fn test_decode_32bit_normalized() {
        let bytes = encode_mono(32, &[1 << 30, i32::MIN, -(1 << 29)]);
        let pcm = PcmBuffer::decode(&bytes).unwrap();
        assert_eq!(pcm.bits_per_sample(), 32);
        let ch = pcm.channel(0).unwrap();
        assert!((ch[0] - 0.5).abs() < 1e-6);
        assert!((ch[1] + 1.0).abs() < 1e-6);
        assert!((ch[2] + 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_stereo_partial_frame_keeps_channels_aligned() {
        // five 16-bit samples: two whole frames and one dangling left sample
        let payload: Vec<u8> = [100i16, -100, 200, -200, 300]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let bytes = raw_wav(2, 8000, 16, payload.len() as u32, &payload);
        match PcmBuffer::decode(&bytes) {
            Ok(pcm) => {
                assert_eq!(pcm.samples_per_channel(), 2);
                let left = pcm.channel(0).unwrap();
                let right = pcm.channel(1).unwrap();
                assert_eq!(left.len(), right.len());
                assert!((left[1] - 200.0 / 32768.0).abs() < 1e-6);
                assert!((right[1] + 200.0 / 32768.0).abs() < 1e-6);
            }
            // a reader may refuse a data chunk that is not whole frames
            Err(e) => assert!(matches!(e, WavError::Malformed(_) | WavError::BadSignature(_))),
        }
    }

    #[test]
    fn test_decode_stereo_counts() {
        let samples: Vec<i16> = (0..200).map(|i| (i * 10) as i16).collect();
        let bytes = encode_i16(2, 8000, &samples);
        let pcm = PcmBuffer::decode(&bytes).unwrap();
        assert_eq!(pcm.channel_count(), 2);
        assert_eq!(pcm.samples_per_channel(), 100);
        assert_eq!(pcm.bits_per_sample(), 16);
        // interleaving: left gets even indices
        let left = pcm.channel(0).unwrap();
        assert!((left[1] - 20.0 / 32768.0).abs() < 1e-6);
    }

    #[test]
    fn test_decode_8bit_is_centered() {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 1000,
            bits_per_sample: 8,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            writer.write_sample(0i8).unwrap();
            writer.write_sample(64i8).unwrap();
            writer.finalize().unwrap();
        }
        let pcm = PcmBuffer::decode(&cursor.into_inner()).unwrap();
        let ch = pcm.channel(0).unwrap();
        assert!(ch[0].abs() < 1e-6);
        assert!((ch[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_rejects_bad_signature() {
        let mut bytes = encode_i16(1, 8000, &[0, 1, 2]);
        bytes[0..4].copy_from_slice(b"RIFX");
        let mut decoder = WavDecoder::new();
        assert!(decoder.load(&bytes).is_err());
        assert!(decoder.pcm().is_none());
        assert!(!decoder.advance(0.1));
    }

    #[test]
    fn test_rejects_float_samples() {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 8000,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            writer.write_sample(0.25f32).unwrap();
            writer.finalize().unwrap();
        }
        assert!(PcmBuffer::decode(&cursor.into_inner()).is_err());
    }

    #[test]
    fn test_zero_samples_have_zero_rms() {
        let bytes = encode_i16(2, 100, &[0; 400]);
        let mut decoder = WavDecoder::new();
        decoder.load(&bytes).unwrap();
        while decoder.advance(0.13) {
            assert_eq!(decoder.rms(), 0.0);
        }
        assert_eq!(decoder.cursor(), 200);
    }

    #[test]
    fn test_constant_amplitude_rms() {
        let bytes = encode_i16(1, 100, &[16384; 100]);
        let mut decoder = WavDecoder::new();
        decoder.load(&bytes).unwrap();
        assert!(decoder.advance(0.25));
        assert_eq!(decoder.cursor(), 25);
        assert!((decoder.rms() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_advance_zero_is_idempotent() {
        let samples: Vec<i16> = (0..100).map(|i| (i * 300) as i16).collect();
        let bytes = encode_i16(1, 100, &samples);
        let mut decoder = WavDecoder::new();
        decoder.load(&bytes).unwrap();
        decoder.advance(0.3);
        let (cursor, rms) = (decoder.cursor(), decoder.rms());
        for _ in 0..5 {
            decoder.advance(0.0);
        }
        assert_eq!(decoder.cursor(), cursor);
        assert_eq!(decoder.rms(), rms);

        // also once the buffer is exhausted
        while decoder.advance(0.5) {}
        let rms_end = decoder.rms();
        decoder.advance(0.0);
        assert_eq!(decoder.rms(), rms_end);
    }

    #[test]
    fn test_advance_clamps_and_reports_end() {
        let bytes = encode_i16(1, 100, &[1000; 50]);
        let mut decoder = WavDecoder::new();
        decoder.load(&bytes).unwrap();
        assert!(decoder.advance(10.0));
        assert_eq!(decoder.cursor(), 50);
        assert!(!decoder.advance(0.1));
        assert_eq!(decoder.rms(), 0.0);
    }
}
