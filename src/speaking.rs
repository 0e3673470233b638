/// Derived "user is speaking" signal
///
/// Recomputed from scratch on every frame: no smoothing, no hysteresis.

/// Reducer over per-frame speech probabilities
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeakingReducer {
    threshold: f32,
}

impl SpeakingReducer {
    /// The threshold is fixed for the reducer's lifetime
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    /// Next speaking value. The previous value is ignored.
    pub fn reduce(&self, _previous: bool, probability: f32) -> bool {
        probability > self.threshold
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strict_threshold() {
        let reducer = SpeakingReducer::new(0.6);

        assert!(!reducer.reduce(false, 0.59));
        assert!(reducer.reduce(false, 0.61));
        assert!(!reducer.reduce(true, 0.6));
    }

    #[test]
    fn test_no_memory_of_previous_frames() {
        let reducer = SpeakingReducer::new(0.5);

        let mut speaking = false;
        for (probability, expected) in [(0.9, true), (0.1, false), (0.7, true), (0.5, false)] {
            speaking = reducer.reduce(speaking, probability);
            assert_eq!(speaking, expected);
        }
    }

    #[test]
    fn test_extreme_thresholds() {
        assert!(!SpeakingReducer::new(1.0).reduce(false, 1.0));
        assert!(SpeakingReducer::new(0.0).reduce(false, 0.01));
        assert!(!SpeakingReducer::new(0.0).reduce(true, 0.0));
    }
}
