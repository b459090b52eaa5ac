//! Voice activity gate.
//!
//! Buffers inbound PCM into fixed 30 ms frames (480 samples at 16 kHz),
//! classifies each frame voice/non-voice through a pluggable detector, and
//! runs the edge machine on top: `speech_started` fires after enough
//! consecutive voice frames, `speech_ended` after enough consecutive silence
//! frames while active. The gate is a side channel only; it never withholds
//! audio from the recognizer.

use voice_broker_core::audio::{BYTES_PER_SAMPLE, INBOUND_SAMPLE_RATE};

/// Samples per detector frame (30 ms at 16 kHz).
pub const FRAME_SAMPLES: usize = (INBOUND_SAMPLE_RATE as usize * 30) / 1000;

/// Bytes per detector frame.
pub const FRAME_BYTES: usize = FRAME_SAMPLES * BYTES_PER_SAMPLE;

/// Gate configuration. Thresholds are session-configurable.
#[derive(Debug, Clone)]
pub struct VadConfig {
    /// Consecutive voice frames required to confirm speech (12 -> 360 ms).
    pub activation_frames: usize,
    /// Consecutive silence frames required to confirm the end (20 -> 600 ms).
    pub release_frames: usize,
    /// Energy floor for the default detector, in dBFS.
    pub energy_threshold_db: f32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            activation_frames: 12,
            release_frames: 20,
            energy_threshold_db: -40.0,
        }
    }
}

/// Frame classifier. One frame in, voice/non-voice out.
pub trait VoiceDetector: Send {
    fn classify(&mut self, frame: &[i16]) -> bool;

    fn reset(&mut self) {}
}

/// Energy-based detector: RMS level against a dBFS floor. Good enough for
/// clean telephony audio; model-based detectors plug in behind the same
/// trait.
#[derive(Debug)]
pub struct EnergyDetector {
    threshold_db: f32,
}

impl EnergyDetector {
    pub fn new(threshold_db: f32) -> Self {
        Self { threshold_db }
    }

    fn energy_db(frame: &[i16]) -> f32 {
        if frame.is_empty() {
            return f32::NEG_INFINITY;
        }
        let sum: f64 = frame
            .iter()
            .map(|&s| {
                let v = s as f64 / i16::MAX as f64;
                v * v
            })
            .sum();
        let rms = (sum / frame.len() as f64).sqrt();
        (20.0 * rms.max(1e-10).log10()) as f32
    }
}

impl VoiceDetector for EnergyDetector {
    fn classify(&mut self, frame: &[i16]) -> bool {
        Self::energy_db(frame) > self.threshold_db
    }
}

/// Gate state as seen by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadState {
    Silence,
    Speech,
}

/// Edge event emitted by the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEdge {
    SpeechStarted,
    SpeechEnded,
}

/// The framing buffer plus edge machine.
pub struct VadGate {
    config: VadConfig,
    detector: Box<dyn VoiceDetector>,
    buffer: Vec<u8>,
    active: bool,
    consecutive_voice: usize,
    consecutive_silence: usize,
}

impl VadGate {
    pub fn new(config: VadConfig, detector: Box<dyn VoiceDetector>) -> Self {
        Self {
            detector,
            buffer: Vec::with_capacity(FRAME_BYTES * 2),
            active: false,
            consecutive_voice: 0,
            consecutive_silence: 0,
            config,
        }
    }

    /// Gate with the default energy detector.
    pub fn with_energy_detector(config: VadConfig) -> Self {
        let detector = EnergyDetector::new(config.energy_threshold_db);
        Self::new(config, Box::new(detector))
    }

    /// Feed an arbitrary-size PCM chunk. Whole 30 ms frames are classified;
    /// a short tail stays buffered for the next call. Returns the edges
    /// crossed while consuming this chunk.
    pub fn push(&mut self, pcm: &[u8]) -> Vec<VadEdge> {
        self.buffer.extend_from_slice(pcm);
        let mut edges = Vec::new();

        while self.buffer.len() >= FRAME_BYTES {
            let frame_bytes: Vec<u8> = self.buffer.drain(..FRAME_BYTES).collect();
            let frame: Vec<i16> = voice_broker_core::audio::samples(&frame_bytes).collect();

            let is_voice = self.detector.classify(&frame);
            if is_voice {
                self.consecutive_voice += 1;
                self.consecutive_silence = 0;
            } else {
                self.consecutive_voice = 0;
                self.consecutive_silence += 1;
            }

            if !self.active && self.consecutive_voice >= self.config.activation_frames {
                self.active = true;
                tracing::debug!(frames = self.consecutive_voice, "vad: speech started");
                edges.push(VadEdge::SpeechStarted);
            } else if self.active && self.consecutive_silence >= self.config.release_frames {
                self.active = false;
                tracing::debug!(frames = self.consecutive_silence, "vad: speech ended");
                edges.push(VadEdge::SpeechEnded);
            }
        }

        edges
    }

    pub fn state(&self) -> VadState {
        if self.active {
            VadState::Speech
        } else {
            VadState::Silence
        }
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.active = false;
        self.consecutive_voice = 0;
        self.consecutive_silence = 0;
        self.detector.reset();
    }
}
