//! Audio-driven mouth movement.
//!
//! Decoded WAV buffers are queued by the caller and drained one at a time.
//! Each tick the driver advances the active buffer by the frame time and adds
//! `rms * weight` to every lip-sync parameter.

use std::collections::VecDeque;

use crate::model::Model;
use crate::wav::WavDecoder;

pub const DEFAULT_LIP_SYNC_WEIGHT: f32 = 5.0;

pub struct LipSyncDriver {
    decoder: WavDecoder,
    pending: VecDeque<Vec<u8>>,
    parameter_ids: Vec<String>,
    weight: f32,
}

impl Default for LipSyncDriver {
    fn default() -> Self {
        Self::new(Vec::new(), DEFAULT_LIP_SYNC_WEIGHT)
    }
}

impl LipSyncDriver {
    pub fn new(parameter_ids: Vec<String>, weight: f32) -> Self {
        Self {
            decoder: WavDecoder::new(),
            pending: VecDeque::new(),
            parameter_ids,
            weight,
        }
    }

    pub fn set_parameter_ids(&mut self, ids: Vec<String>) {
        self.parameter_ids = ids;
    }

    pub fn parameter_ids(&self) -> &[String] {
        &self.parameter_ids
    }

    pub fn set_weight(&mut self, weight: f32) {
        self.weight = weight;
    }

    pub fn weight(&self) -> f32 {
        self.weight
    }

    /// Queue a WAV buffer behind whatever is already playing.
    pub fn push_audio(&mut self, wav: Vec<u8>) {
        self.pending.push_back(wav);
        log::debug!("Queued audio buffer ({} pending)", self.pending.len());
    }

    /// Drop the active buffer and everything queued.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.decoder.release();
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_playing(&self) -> bool {
        self.decoder.has_remaining() || !self.pending.is_empty()
    }

    /// RMS of the most recent window.
    pub fn amplitude(&self) -> f32 {
        self.decoder.rms()
    }

    /// Advance playback and write the mouth value. Returns the value written.
    pub fn update(&mut self, model: &mut Model, delta_seconds: f32) -> f32 {
        if !self.decoder.advance(delta_seconds) {
            if let Some(next) = self.pending.pop_front() {
                // A malformed buffer is logged by the decoder and skipped.
                if self.decoder.load(&next).is_ok() {
                    log::debug!("Lip sync started next buffer");
                }
            }
        }

        let value = self.decoder.rms() * self.weight;
        for id in &self.parameter_ids {
            model.add_parameter_value(id, value, 1.0);
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn wav(samples: &[i16]) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 100,
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

    fn mouth_model() -> Model {
        crate::model::tests::model_from(serde_json::json!({
            "Parameters": [{"Id": "ParamMouthOpenY", "Min": 0.0, "Max": 1.0, "Default": 0.0}],
            "Drawables": []
        }))
    }

    #[test]
    fn test_drains_queue_and_writes_scaled_rms() {
        let mut model = mouth_model();
        let mut driver = LipSyncDriver::new(vec!["ParamMouthOpenY".to_string()], 0.5);
        driver.push_audio(wav(&[16384; 50]));
        assert!(driver.is_playing());

        // first tick loads the buffer
        driver.update(&mut model, 0.1);
        assert_eq!(driver.pending_count(), 0);
        driver.update(&mut model, 0.1);
        assert!((driver.amplitude() - 0.5).abs() < 1e-6);
        assert!((model.parameter_value("ParamMouthOpenY") - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_malformed_buffer_is_skipped() {
        let mut model = mouth_model();
        let mut driver = LipSyncDriver::new(vec!["ParamMouthOpenY".to_string()], 1.0);
        driver.push_audio(b"definitely not a wav".to_vec());
        driver.push_audio(wav(&[16384; 50]));
        driver.update(&mut model, 0.1);
        assert_eq!(driver.amplitude(), 0.0);
        driver.update(&mut model, 0.1);
        driver.update(&mut model, 0.1);
        assert!(driver.amplitude() > 0.0);
    }

    #[test]
    fn test_clear_stops_playback() {
        let mut driver = LipSyncDriver::default();
        driver.push_audio(wav(&[100; 10]));
        driver.clear();
        assert!(!driver.is_playing());
    }
}
