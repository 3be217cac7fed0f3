//! Pose Engine
//!
//! Integrates host gyroscope angular rates into yaw/pitch angles and turns
//! them into debounced Left/Middle/Right/Back transitions. A guided
//! calibration sequence runs whenever processing is switched on.

use crate::domain::clock::Clock;
use crate::domain::models::colors;
use crate::domain::settings::PoseSettings;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoseState {
    Left,
    Middle,
    Right,
    Back,
}

/// One gyroscope reading. Rates in rad/s, timestamp in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseSample {
    /// Pitch rate
    pub rate_x: f32,
    /// Roll rate, unused for detection
    pub rate_y: f32,
    /// Yaw rate
    pub rate_z: f32,
    pub timestamp_ns: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationPhase {
    Steady,
    Left,
    Right,
    Forward,
    Back,
    Complete,
}

impl CalibrationPhase {
    pub fn next(self) -> Self {
        match self {
            Self::Steady => Self::Left,
            Self::Left => Self::Right,
            Self::Right => Self::Forward,
            Self::Forward => Self::Back,
            Self::Back | Self::Complete => Self::Complete,
        }
    }

    pub fn instruction(self) -> &'static str {
        match self {
            Self::Steady => "Hold device steady",
            Self::Left => "Tilt LEFT",
            Self::Right => "Tilt RIGHT",
            Self::Forward => "Tilt FORWARD",
            Self::Back => "Tilt BACK",
            Self::Complete => "Calibration complete",
        }
    }

    pub fn color(self) -> u32 {
        match self {
            Self::Steady | Self::Forward => colors::WHITE,
            Self::Left => colors::YELLOW,
            Self::Right | Self::Complete => colors::GREEN,
            Self::Back => colors::MAGENTA,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PoseEvent {
    CalibrationStarted,
    CalibrationPhase {
        phase: CalibrationPhase,
        instruction: &'static str,
        color: u32,
    },
    CalibrationComplete,
    Transition(PoseState),
}

impl PoseEvent {
    fn phase(phase: CalibrationPhase) -> Self {
        Self::CalibrationPhase {
            phase,
            instruction: phase.instruction(),
            color: phase.color(),
        }
    }
}

/// Thresholds in radians, timings in milliseconds.
#[derive(Debug, Clone)]
pub struct PoseConfig {
    pub decision_threshold: f32,
    pub significance_threshold: f32,
    pub max_angle: f32,
    pub debounce_ms: u64,
    pub phase_duration_ms: u64,
}

impl Default for PoseConfig {
    fn default() -> Self {
        Self::from(&PoseSettings::default())
    }
}

impl From<&PoseSettings> for PoseConfig {
    fn from(s: &PoseSettings) -> Self {
        Self {
            decision_threshold: s.decision_threshold_deg.to_radians(),
            significance_threshold: s.significance_threshold_deg.to_radians(),
            max_angle: s.max_angle_deg.to_radians(),
            debounce_ms: s.debounce_ms,
            phase_duration_ms: s.calibration_phase_ms,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CalibrationSession {
    phase: CalibrationPhase,
    phase_started_ms: u64,
}

pub struct PoseEngine {
    config: PoseConfig,
    clock: Box<dyn Clock>,

    processing_enabled: bool,
    last_ts_ns: Option<u64>,

    // Integrated angles (radians)
    yaw: f32,
    pitch: f32,

    current_pose: PoseState,
    last_transition_ms: Option<u64>,
    calibration: Option<CalibrationSession>,
}

impl PoseEngine {
    pub fn new(config: PoseConfig, clock: Box<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            processing_enabled: false,
            last_ts_ns: None,
            yaw: 0.0,
            pitch: 0.0,
            current_pose: PoseState::Middle,
            last_transition_ms: None,
            calibration: None,
        }
    }

    pub fn is_processing_enabled(&self) -> bool {
        self.processing_enabled
    }

    pub fn is_calibrating(&self) -> bool {
        self.calibration.is_some()
    }

    pub fn calibration_phase(&self) -> Option<CalibrationPhase> {
        self.calibration.map(|s| s.phase)
    }

    pub fn current_pose(&self) -> PoseState {
        self.current_pose
    }

    /// Current integrated (yaw, pitch) in radians.
    pub fn angles(&self) -> (f32, f32) {
        (self.yaw, self.pitch)
    }

    /// Turning processing on always starts a fresh calibration session.
    pub fn set_processing_enabled(&mut self, enabled: bool) -> Vec<PoseEvent> {
        self.processing_enabled = enabled;
        info!("Pose processing enabled={}", enabled);

        if enabled {
            self.start_calibration()
        } else {
            self.calibration = None;
            self.current_pose = PoseState::Middle;
            self.reset_integration();
            Vec::new()
        }
    }

    fn start_calibration(&mut self) -> Vec<PoseEvent> {
        self.calibration = Some(CalibrationSession {
            phase: CalibrationPhase::Steady,
            phase_started_ms: self.clock.now_ms(),
        });
        self.reset_integration();
        self.current_pose = PoseState::Middle;
        info!("Starting interactive calibration - hold device steady");

        vec![
            PoseEvent::CalibrationStarted,
            PoseEvent::phase(CalibrationPhase::Steady),
        ]
    }

    /// Feed one gyroscope sample.
    pub fn process(&mut self, sample: PoseSample) -> Option<PoseEvent> {
        if !self.processing_enabled {
            return None;
        }

        let Some(last_ts) = self.last_ts_ns else {
            self.last_ts_ns = Some(sample.timestamp_ns);
            return None;
        };
        let dt = sample.timestamp_ns.saturating_sub(last_ts) as f32 / 1_000_000_000.0;
        self.last_ts_ns = Some(sample.timestamp_ns);

        let max = self.config.max_angle;
        self.yaw = (self.yaw + sample.rate_z * dt).clamp(-max, max);
        self.pitch = (self.pitch + sample.rate_x * dt).clamp(-max, max);

        if self.calibration.is_some() {
            // No detection while calibrating
            return self.advance_calibration_if_due();
        }

        self.detect()
    }

    /// Advance calibration from the wall clock alone.
    pub fn tick(&mut self) -> Option<PoseEvent> {
        if !self.processing_enabled {
            return None;
        }
        self.advance_calibration_if_due()
    }

    fn advance_calibration_if_due(&mut self) -> Option<PoseEvent> {
        let session = self.calibration?;
        let now = self.clock.now_ms();
        if now.saturating_sub(session.phase_started_ms) < self.config.phase_duration_ms {
            return None;
        }

        self.yaw = 0.0;
        self.pitch = 0.0;

        let next = session.phase.next();
        if next == CalibrationPhase::Complete {
            self.calibration = None;
            info!("Calibration complete! Motion detection active.");
            return Some(PoseEvent::CalibrationComplete);
        }

        self.calibration = Some(CalibrationSession {
            phase: next,
            phase_started_ms: now,
        });
        info!("Calibration: {}", next.instruction());
        Some(PoseEvent::phase(next))
    }

    fn detect(&mut self) -> Option<PoseEvent> {
        let threshold = self.config.decision_threshold;

        let candidate = if self.yaw.abs() > self.pitch.abs() {
            if self.yaw > threshold {
                PoseState::Right
            } else if self.yaw < -threshold {
                PoseState::Left
            } else {
                PoseState::Middle
            }
        } else if self.pitch < -threshold {
            PoseState::Back
        } else {
            // Forward tilt and neutral both map to the middle pose
            PoseState::Middle
        };

        let significance = self.config.significance_threshold;
        let significant = self.yaw.abs() > significance || self.pitch.abs() > significance;

        let now = self.clock.now_ms();
        let debounced = self
            .last_transition_ms
            .map_or(true, |last| now.saturating_sub(last) > self.config.debounce_ms);

        if candidate == self.current_pose || !significant || !debounced {
            return None;
        }

        debug!(
            "pose={:?} yaw={:.1} pitch={:.1}",
            candidate,
            self.yaw.to_degrees(),
            self.pitch.to_degrees()
        );

        self.current_pose = candidate;
        self.last_transition_ms = Some(now);
        // New position becomes the reference
        self.reset_integration();

        Some(PoseEvent::Transition(candidate))
    }

    fn reset_integration(&mut self) {
        self.yaw = 0.0;
        self.pitch = 0.0;
        self.last_ts_ns = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::clock::ManualClock;

    const SECOND_NS: u64 = 1_000_000_000;

    fn engine() -> (PoseEngine, ManualClock) {
        let clock = ManualClock::new(1_000);
        let engine = PoseEngine::new(PoseConfig::default(), Box::new(clock.clone()));
        (engine, clock)
    }

    fn sample(rate_x: f32, rate_z: f32, timestamp_ns: u64) -> PoseSample {
        PoseSample {
            rate_x,
            rate_y: 0.0,
            rate_z,
            timestamp_ns,
        }
    }

    /// Runs the whole calibration sequence and returns the next free timestamp.
    fn finish_calibration(engine: &mut PoseEngine, clock: &ManualClock) -> u64 {
        engine.set_processing_enabled(true);
        let mut ts = SECOND_NS;
        engine.process(sample(0.0, 0.0, ts));
        for _ in 0..5 {
            clock.advance(1500);
            ts += SECOND_NS / 100;
            engine.process(sample(0.0, 0.0, ts));
        }
        assert!(!engine.is_calibrating());
        ts
    }

    #[test]
    fn test_calibration_walks_every_phase() {
        let (mut engine, clock) = engine();

        let start = engine.set_processing_enabled(true);
        assert_eq!(start[0], PoseEvent::CalibrationStarted);
        let mut phases = vec![match start[1] {
            PoseEvent::CalibrationPhase { phase, .. } => phase,
            ref other => panic!("unexpected {:?}", other),
        }];

        let mut ts = SECOND_NS;
        assert_eq!(engine.process(sample(0.0, 0.0, ts)), None);

        let mut completed = false;
        for _ in 0..5 {
            clock.advance(1500);
            ts += SECOND_NS / 100;
            match engine.process(sample(0.0, 0.0, ts)) {
                Some(PoseEvent::CalibrationPhase { phase, .. }) => phases.push(phase),
                Some(PoseEvent::CalibrationComplete) => completed = true,
                other => panic!("unexpected {:?}", other),
            }
        }

        assert_eq!(
            phases,
            vec![
                CalibrationPhase::Steady,
                CalibrationPhase::Left,
                CalibrationPhase::Right,
                CalibrationPhase::Forward,
                CalibrationPhase::Back,
            ]
        );
        assert!(completed);
        assert_eq!(engine.calibration_phase(), None);
    }

    #[test]
    fn test_no_detection_during_calibration() {
        let (mut engine, clock) = engine();
        engine.set_processing_enabled(true);

        engine.process(sample(0.0, 0.0, SECOND_NS));
        // A full second at 1 rad/s is far past the decision threshold
        clock.advance(100);
        assert_eq!(engine.process(sample(0.0, 1.0, 2 * SECOND_NS)), None);
        assert_eq!(engine.current_pose(), PoseState::Middle);
    }

    #[test]
    fn test_phase_boundary_resets_angles() {
        let (mut engine, clock) = engine();
        engine.set_processing_enabled(true);
        engine.process(sample(0.0, 0.0, SECOND_NS));
        clock.advance(1500);
        engine.process(sample(0.0, 0.5, 2 * SECOND_NS));
        assert_eq!(engine.angles(), (0.0, 0.0));
    }

    #[test]
    fn test_tick_advances_without_samples() {
        let (mut engine, clock) = engine();
        engine.set_processing_enabled(true);
        assert_eq!(engine.tick(), None);
        clock.advance(1500);
        assert!(matches!(
            engine.tick(),
            Some(PoseEvent::CalibrationPhase {
                phase: CalibrationPhase::Left,
                ..
            })
        ));
    }

    #[test]
    fn test_yaw_right_then_left_with_debounce() {
        let (mut engine, clock) = engine();
        let mut ts = finish_calibration(&mut engine, &clock);

        // 0.6 rad/s for one second is roughly 34 degrees
        ts += SECOND_NS;
        assert_eq!(
            engine.process(sample(0.0, 0.6, ts)),
            Some(PoseEvent::Transition(PoseState::Right))
        );

        // Baseline was reset: first sample only re-anchors
        clock.advance(100);
        ts += SECOND_NS / 100;
        assert_eq!(engine.process(sample(0.0, 0.0, ts)), None);
        ts += SECOND_NS;
        assert_eq!(engine.process(sample(0.0, -0.6, ts)), None);
        assert_eq!(engine.current_pose(), PoseState::Right);

        clock.advance(450);
        ts += SECOND_NS / 100;
        assert_eq!(
            engine.process(sample(0.0, 0.0, ts)),
            Some(PoseEvent::Transition(PoseState::Left))
        );
    }

    #[test]
    fn test_back_tilt_on_negative_pitch() {
        let (mut engine, clock) = engine();
        let ts = finish_calibration(&mut engine, &clock);
        assert_eq!(
            engine.process(sample(-0.6, 0.0, ts + SECOND_NS)),
            Some(PoseEvent::Transition(PoseState::Back))
        );
    }

    #[test]
    fn test_forward_tilt_is_middle() {
        let (mut engine, clock) = engine();
        let ts = finish_calibration(&mut engine, &clock);
        // Already in middle, so a forward tilt emits nothing
        assert_eq!(engine.process(sample(0.6, 0.0, ts + SECOND_NS)), None);
    }

    #[test]
    fn test_return_to_middle_needs_significant_motion() {
        let (mut engine, clock) = engine();
        let mut ts = finish_calibration(&mut engine, &clock);
        ts += SECOND_NS;
        engine.process(sample(0.0, 0.6, ts));
        assert_eq!(engine.current_pose(), PoseState::Right);

        clock.advance(1000);
        ts += SECOND_NS / 100;
        engine.process(sample(0.0, 0.0, ts));
        // About 11 degrees: middle candidate, but below the significance threshold
        ts += SECOND_NS;
        assert_eq!(engine.process(sample(0.0, 0.2, ts)), None);
        // 23 degrees of forward pitch makes the motion significant
        ts += SECOND_NS;
        assert_eq!(
            engine.process(sample(0.4, 0.0, ts)),
            Some(PoseEvent::Transition(PoseState::Middle))
        );
    }

    #[test]
    fn test_angles_are_clamped() {
        let (mut engine, clock) = engine();
        let ts = finish_calibration(&mut engine, &clock);
        // Hold the debounce so no transition resets the accumulator
        engine.last_transition_ms = Some(clock.now_ms());
        engine.process(sample(0.0, 10.0, ts + SECOND_NS));
        let (yaw, _) = engine.angles();
        assert!((yaw - 90f32.to_radians()).abs() < 1e-5);
    }

    #[test]
    fn test_disable_resets_pose_and_drops_samples() {
        let (mut engine, clock) = engine();
        let ts = finish_calibration(&mut engine, &clock);
        engine.process(sample(0.0, 0.6, ts + SECOND_NS));
        assert_eq!(engine.current_pose(), PoseState::Right);

        assert!(engine.is_processing_enabled());
        assert!(engine.set_processing_enabled(false).is_empty());
        assert!(!engine.is_processing_enabled());
        assert_eq!(engine.current_pose(), PoseState::Middle);
        assert_eq!(engine.process(sample(0.0, 5.0, ts + 3 * SECOND_NS)), None);
    }
}
