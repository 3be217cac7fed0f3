//! Activity Classifier
//!
//! Keeps a rolling window of accelerometer-derived feature vectors and runs
//! a pretrained fixed-function model over it once the window is full. A
//! stability gate suppresses single-window misclassifications.

use crate::domain::models::Direction;
use crate::domain::settings::ClassifierSettings;
use crate::error::ClassifierError;
use std::collections::VecDeque;
use tracing::{debug, info, warn};

pub const WINDOW_SIZE: usize = 50;
pub const NUM_FEATURES: usize = 10;
pub const NUM_CLASSES: usize = 6;

/// Standard deviation used until the raw queue first fills.
const COLD_START_STD: f32 = 0.1;
/// Largest absolute feature maps to this value after normalisation.
const NORMALIZED_PEAK: f32 = 10.0;

/// `[ax, ay, az, |a|, mean_x, mean_y, mean_z, std_x, std_y, std_z]`
pub type FeatureVector = [f32; NUM_FEATURES];
pub type FeatureWindow = [FeatureVector; WINDOW_SIZE];

/// Model output classes, in output-index order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Activity {
    Boxing,
    Clapping,
    Running,
    SittingDown,
    StandingUp,
    Walking,
}

impl Activity {
    pub const ALL: [Activity; NUM_CLASSES] = [
        Self::Boxing,
        Self::Clapping,
        Self::Running,
        Self::SittingDown,
        Self::StandingUp,
        Self::Walking,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Self::Boxing => "boxing",
            Self::Clapping => "clapping",
            Self::Running => "running",
            Self::SittingDown => "sitting down",
            Self::StandingUp => "standing up",
            Self::Walking => "walking",
        }
    }

    /// Direction shown on the activity card. Display only, never counted.
    pub fn display_direction(&self) -> Option<Direction> {
        match self {
            Self::Walking | Self::Running => Some(Direction::Forward),
            Self::Boxing => Some(Direction::Left),
            Self::Clapping => Some(Direction::Back),
            Self::SittingDown | Self::StandingUp => None,
        }
    }
}

/// A pretrained model mapping one normalised window to per-class confidences.
pub trait ActivityModel: Send {
    fn predict(&mut self, window: &FeatureWindow) -> anyhow::Result<[f32; NUM_CLASSES]>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassificationResult {
    pub activity: Activity,
    pub confidence: f32,
    pub stable_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Classification {
    /// Window not yet full, or the label has not been stable long enough.
    Collecting,
    Activity(ClassificationResult),
}

#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub confidence_threshold: f32,
    pub stability_threshold: u32,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self::from(&ClassifierSettings::default())
    }
}

impl From<&ClassifierSettings> for ClassifierConfig {
    fn from(s: &ClassifierSettings) -> Self {
        Self {
            confidence_threshold: s.confidence_threshold,
            stability_threshold: s.stability_threshold,
        }
    }
}

pub struct ActivityClassifier {
    model: Option<Box<dyn ActivityModel>>,
    config: ClassifierConfig,

    window: Box<FeatureWindow>,
    // Normalised copy handed to the model
    input: Box<FeatureWindow>,
    recent: VecDeque<[f32; 3]>,
    index: usize,
    ready: bool,

    last_detected: Option<Activity>,
    stable_count: u32,
    last_confidence: f32,
}

impl ActivityClassifier {
    /// `None` leaves the classifier permanently unloaded: every call reports
    /// [`ClassifierError::ModelUnavailable`].
    pub fn new(model: Option<Box<dyn ActivityModel>>, config: ClassifierConfig) -> Self {
        if model.is_some() {
            info!("Activity model loaded");
        } else {
            warn!("Activity model unavailable, classification disabled");
        }

        Self {
            model,
            config,
            window: Box::new([[0.0; NUM_FEATURES]; WINDOW_SIZE]),
            input: Box::new([[0.0; NUM_FEATURES]; WINDOW_SIZE]),
            recent: VecDeque::with_capacity(WINDOW_SIZE + 1),
            index: 0,
            ready: false,
            last_detected: None,
            stable_count: 0,
            last_confidence: 0.0,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn window_size(&self) -> usize {
        WINDOW_SIZE
    }

    pub fn last_confidence(&self) -> f32 {
        self.last_confidence
    }

    /// Feed one accelerometer sample.
    pub fn process(&mut self, ax: f32, ay: f32, az: f32) -> Result<Classification, ClassifierError> {
        if self.model.is_none() {
            return Err(ClassifierError::ModelUnavailable);
        }

        if !(ax.is_finite() && ay.is_finite() && az.is_finite()) {
            warn!("Invalid sensor data: x={}, y={}, z={}", ax, ay, az);
            return Err(ClassifierError::InvalidSample {
                x: ax,
                y: ay,
                z: az,
            });
        }

        let magnitude = (ax * ax + ay * ay + az * az).sqrt();
        self.recent.push_back([ax, ay, az]);
        if self.recent.len() > WINDOW_SIZE {
            self.recent.pop_front();
        }

        let (means, stds) = self.rolling_stats([ax, ay, az]);

        self.window[self.index] = [
            ax, ay, az, magnitude, means[0], means[1], means[2], stds[0], stds[1], stds[2],
        ];
        self.index = (self.index + 1) % WINDOW_SIZE;
        if self.index == 0 && !self.ready {
            self.ready = true;
            debug!("Classification window ready");
        }

        if !self.ready {
            return Ok(Classification::Collecting);
        }

        self.classify()
    }

    fn rolling_stats(&self, latest: [f32; 3]) -> ([f32; 3], [f32; 3]) {
        if self.recent.len() < WINDOW_SIZE {
            return (latest, [COLD_START_STD; 3]);
        }

        let count = self.recent.len() as f32;
        let mut sums = [0.0f32; 3];
        let mut sum_squares = [0.0f32; 3];
        for sample in &self.recent {
            for axis in 0..3 {
                sums[axis] += sample[axis];
                sum_squares[axis] += sample[axis] * sample[axis];
            }
        }

        let mut means = [0.0f32; 3];
        let mut stds = [0.0f32; 3];
        for axis in 0..3 {
            means[axis] = sums[axis] / count;
            // Rounding can push the variance a hair below zero
            stds[axis] = (sum_squares[axis] / count - means[axis] * means[axis])
                .max(0.0)
                .sqrt();
        }
        (means, stds)
    }

    fn classify(&mut self) -> Result<Classification, ClassifierError> {
        let Some(model) = self.model.as_mut() else {
            return Err(ClassifierError::ModelUnavailable);
        };

        let peak = self
            .window
            .iter()
            .flat_map(|row| row.iter())
            .fold(0.0f32, |acc, v| acc.max(v.abs()));
        let scale = if peak > 0.0 { NORMALIZED_PEAK / peak } else { 1.0 };

        for (dst, src) in self.input.iter_mut().zip(self.window.iter()) {
            for (d, s) in dst.iter_mut().zip(src.iter()) {
                *d = s * scale;
            }
        }

        let scores = model
            .predict(&self.input)
            .map_err(|e| ClassifierError::Inference(e.to_string()))?;
        if scores.iter().any(|s| !s.is_finite()) {
            return Err(ClassifierError::Inference(format!(
                "non-finite confidence scores: {:?}",
                scores
            )));
        }

        let mut best = 0;
        for i in 1..NUM_CLASSES {
            if scores[i] > scores[best] {
                best = i;
            }
        }
        let activity = Activity::ALL[best];
        let confidence = scores[best];
        self.last_confidence = confidence;
        debug!(
            "Confidence scores: {:?}, max {:.3} ({})",
            scores,
            confidence,
            activity.label()
        );

        if self.last_detected != Some(activity) {
            self.stable_count = 1;
            self.last_detected = Some(activity);
            debug!("New activity detected: {}", activity.label());
        } else if confidence > self.config.confidence_threshold {
            self.stable_count += 1;
        } else {
            self.stable_count = 0;
            debug!("Confidence too low, resetting stable count");
        }

        if self.stable_count >= self.config.stability_threshold {
            Ok(Classification::Activity(ClassificationResult {
                activity,
                confidence,
                stable_count: self.stable_count,
            }))
        } else {
            Ok(Classification::Collecting)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Returns queued score vectors, repeating the last one.
    struct ScriptedModel {
        scores: VecDeque<[f32; NUM_CLASSES]>,
        last_input: Arc<Mutex<Option<FeatureWindow>>>,
    }

    impl ScriptedModel {
        fn new(scores: Vec<[f32; NUM_CLASSES]>) -> Self {
            Self {
                scores: scores.into(),
                last_input: Arc::new(Mutex::new(None)),
            }
        }
    }

    impl ActivityModel for ScriptedModel {
        fn predict(&mut self, window: &FeatureWindow) -> anyhow::Result<[f32; NUM_CLASSES]> {
            *self.last_input.lock().unwrap() = Some(*window);
            let next = if self.scores.len() > 1 {
                self.scores.pop_front()
            } else {
                self.scores.front().copied()
            };
            next.ok_or_else(|| anyhow::anyhow!("no scores scripted"))
        }
    }

    const WALKING: [f32; NUM_CLASSES] = [0.05, 0.05, 0.1, 0.0, 0.0, 0.8];
    const BOXING: [f32; NUM_CLASSES] = [0.7, 0.1, 0.1, 0.0, 0.0, 0.1];
    const WALKING_WEAK: [f32; NUM_CLASSES] = [0.1, 0.1, 0.1, 0.1, 0.1, 0.15];

    fn classifier(scores: Vec<[f32; NUM_CLASSES]>) -> ActivityClassifier {
        ActivityClassifier::new(
            Some(Box::new(ScriptedModel::new(scores))),
            ClassifierConfig::default(),
        )
    }

    fn fill(classifier: &mut ActivityClassifier, n: usize) -> Vec<Classification> {
        (0..n)
            .map(|i| classifier.process(0.1 * i as f32, 9.8, 0.3).unwrap())
            .collect()
    }

    #[test]
    fn test_unloaded_model_fails_closed() {
        let mut classifier = ActivityClassifier::new(None, ClassifierConfig::default());
        assert!(!classifier.is_loaded());
        for _ in 0..60 {
            assert_eq!(
                classifier.process(0.0, 0.0, 9.8),
                Err(ClassifierError::ModelUnavailable)
            );
        }
    }

    #[test]
    fn test_cold_start_needs_three_stable_windows() {
        let mut classifier = classifier(vec![WALKING]);

        let results = fill(&mut classifier, 49);
        assert!(results.iter().all(|r| *r == Classification::Collecting));
        assert!(!classifier.is_ready());

        // 50th and 51st samples classify but are not yet stable
        assert_eq!(fill(&mut classifier, 2), vec![Classification::Collecting; 2]);
        assert!(classifier.is_ready());

        match classifier.process(0.5, 9.7, 0.2).unwrap() {
            Classification::Activity(result) => {
                assert_eq!(result.activity, Activity::Walking);
                assert_eq!(result.stable_count, 3);
                assert!((result.confidence - 0.8).abs() < 1e-6);
            }
            other => panic!("expected stable activity, got {:?}", other),
        }
    }

    #[test]
    fn test_label_change_restarts_stability() {
        let mut classifier = classifier(vec![WALKING, WALKING, WALKING, BOXING, BOXING, BOXING]);
        fill(&mut classifier, 49);

        let results = fill(&mut classifier, 6);
        assert_eq!(results[0], Classification::Collecting);
        assert_eq!(results[1], Classification::Collecting);
        assert!(matches!(results[2], Classification::Activity(r) if r.activity == Activity::Walking));
        // Boxing starts over at one
        assert_eq!(results[3], Classification::Collecting);
        assert_eq!(results[4], Classification::Collecting);
        assert!(matches!(results[5], Classification::Activity(r) if r.activity == Activity::Boxing));
    }

    #[test]
    fn test_low_confidence_repeat_resets_counter() {
        let mut classifier = classifier(vec![WALKING, WALKING, WALKING_WEAK, WALKING, WALKING, WALKING]);
        fill(&mut classifier, 49);

        let results = fill(&mut classifier, 6);
        // counts: 1, 2, 0, 1, 2, 3
        assert!(results[..5].iter().all(|r| *r == Classification::Collecting));
        assert!(matches!(results[5], Classification::Activity(r) if r.stable_count == 3));
    }

    #[test]
    fn test_invalid_sample_leaves_state_untouched() {
        let mut classifier = classifier(vec![WALKING]);
        fill(&mut classifier, 49);

        assert!(matches!(
            classifier.process(f32::NAN, 0.0, 0.0),
            Err(ClassifierError::InvalidSample { .. })
        ));
        assert!(matches!(
            classifier.process(0.0, f32::INFINITY, 0.0),
            Err(ClassifierError::InvalidSample { .. })
        ));
        assert!(!classifier.is_ready());

        classifier.process(0.0, 9.8, 0.0).unwrap();
        assert!(classifier.is_ready());
    }

    #[test]
    fn test_window_is_scaled_to_peak_of_ten() {
        let model = ScriptedModel::new(vec![WALKING]);
        let seen = model.last_input.clone();
        let mut classifier = ActivityClassifier::new(Some(Box::new(model)), ClassifierConfig::default());

        for _ in 0..WINDOW_SIZE {
            classifier.process(1.0, 2.0, 2.0).unwrap();
        }

        let input = seen.lock().unwrap().take().expect("model was called");
        let peak = input
            .iter()
            .flat_map(|row| row.iter())
            .fold(0.0f32, |acc, v| acc.max(v.abs()));
        assert!((peak - 10.0).abs() < 1e-4);

        // Magnitude is 3, so the scale is 10/3
        let scale = 10.0 / 3.0;
        assert!((input[0][3] - 3.0 * scale).abs() < 1e-4);
        // Cold-start rows carry the fallback deviation
        assert!((input[0][7] - 0.1 * scale).abs() < 1e-4);
        // The last row sees a full queue of identical samples
        assert!(input[WINDOW_SIZE - 1][7].abs() < 1e-3);
        assert!((input[WINDOW_SIZE - 1][4] - 1.0 * scale).abs() < 1e-3);
    }

    struct FlakyModel {
        calls: u32,
    }

    impl ActivityModel for FlakyModel {
        fn predict(&mut self, _window: &FeatureWindow) -> anyhow::Result<[f32; NUM_CLASSES]> {
            self.calls += 1;
            if self.calls == 1 {
                anyhow::bail!("interpreter failure");
            }
            Ok(WALKING)
        }
    }

    #[test]
    fn test_inference_error_is_reported_and_recoverable() {
        let mut classifier =
            ActivityClassifier::new(Some(Box::new(FlakyModel { calls: 0 })), ClassifierConfig::default());
        fill(&mut classifier, 49);

        assert!(matches!(
            classifier.process(0.0, 9.8, 0.0),
            Err(ClassifierError::Inference(_))
        ));
        assert_eq!(classifier.process(0.0, 9.8, 0.0), Ok(Classification::Collecting));
        assert!((classifier.last_confidence() - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_display_direction_mapping() {
        assert_eq!(Activity::Walking.display_direction(), Some(Direction::Forward));
        assert_eq!(Activity::Running.display_direction(), Some(Direction::Forward));
        assert_eq!(Activity::Boxing.display_direction(), Some(Direction::Left));
        assert_eq!(Activity::Clapping.display_direction(), Some(Direction::Back));
        assert_eq!(Activity::SittingDown.display_direction(), None);
    }
}
