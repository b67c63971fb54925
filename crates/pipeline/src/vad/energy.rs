//! Energy-based VAD model
//!
//! Maps window RMS energy onto a probability between a noise floor and a
//! speech ceiling. Used when no neural model is configured.

use voice_session_core::{rms_db, Error, VadModel};

/// RMS-energy speech probability
#[derive(Debug, Clone)]
pub struct EnergyVadModel {
    sample_rate: u32,
    window_size: usize,
    floor_db: f32,
    ceiling_db: f32,
}

impl EnergyVadModel {
    /// Create with explicit floor/ceiling in dBFS
    pub fn new(floor_db: f32, ceiling_db: f32) -> Self {
        Self {
            sample_rate: 16000,
            window_size: 512,
            floor_db,
            ceiling_db: ceiling_db.max(floor_db + 1.0),
        }
    }

    /// Override the window geometry
    pub fn with_window(mut self, sample_rate: u32, window_size: usize) -> Self {
        self.sample_rate = sample_rate;
        self.window_size = window_size;
        self
    }
}

impl Default for EnergyVadModel {
    fn default() -> Self {
        Self::new(-50.0, -20.0)
    }
}

impl VadModel for EnergyVadModel {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn window_size(&self) -> usize {
        self.window_size
    }

    fn infer(&mut self, window: &[f32]) -> Result<f32, Error> {
        let db = rms_db(window);
        Ok(((db - self.floor_db) / (self.ceiling_db - self.floor_db)).clamp(0.0, 1.0))
    }
}
