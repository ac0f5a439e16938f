//! Emotion classification collaborator.
//!
//! The classifier runs one inference at a time: occupancy is a single
//! permit, and a call while one is in flight gets `BackendBusy`. The turn
//! controller treats that as "proceed without emotion enrichment".

use crate::error::{VoiceError, VoiceResult};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::debug;

/// Classifies one utterance's audio into an emotion label.
pub trait EmotionClassifier: Send + Sync {
    /// Classify a segment's PCM. Returns `BackendBusy` if a prior call is
    /// still in flight.
    fn classify(&self, samples: &[f32], sample_rate: u32) -> VoiceResult<String>;
}

/// Wraps any classify function with single-slot occupancy semantics.
pub struct SingleSlotClassifier<F>
where
    F: Fn(&[f32], u32) -> VoiceResult<String> + Send + Sync,
{
    permit: Arc<Semaphore>,
    infer: F,
}

impl<F> SingleSlotClassifier<F>
where
    F: Fn(&[f32], u32) -> VoiceResult<String> + Send + Sync,
{
    pub fn new(infer: F) -> Self {
        Self {
            permit: Arc::new(Semaphore::new(1)),
            infer,
        }
    }
}

impl<F> EmotionClassifier for SingleSlotClassifier<F>
where
    F: Fn(&[f32], u32) -> VoiceResult<String> + Send + Sync,
{
    fn classify(&self, samples: &[f32], sample_rate: u32) -> VoiceResult<String> {
        let Ok(_guard) = self.permit.try_acquire() else {
            debug!("Emotion classifier busy, skipping enrichment");
            return Err(VoiceError::BackendBusy(
                "emotion classifier already running".to_string(),
            ));
        };
        (self.infer)(samples, sample_rate)
    }
}

/// Placeholder classifier: always neutral, never busy.
#[derive(Debug, Default)]
pub struct NeutralClassifier;

impl EmotionClassifier for NeutralClassifier {
    fn classify(&self, _samples: &[f32], _sample_rate: u32) -> VoiceResult<String> {
        Ok("neutral".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn neutral_classifier_labels_everything_neutral() {
        let c = NeutralClassifier;
        assert_eq!(c.classify(&[0.0; 64], 16000).unwrap(), "neutral");
    }

    #[test]
    fn second_call_while_busy_is_rejected() {
        // Block the first call inside inference until told to finish.
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = std::sync::Mutex::new(release_rx);
        let classifier = Arc::new(SingleSlotClassifier::new(move |_s: &[f32], _r: u32| {
            release_rx.lock().unwrap().recv().ok();
            Ok("happy".to_string())
        }));

        let c2 = Arc::clone(&classifier);
        let handle = std::thread::spawn(move || c2.classify(&[0.0; 8], 16000));

        // Give the first call time to take the permit.
        std::thread::sleep(std::time::Duration::from_millis(50));
        let second = classifier.classify(&[0.0; 8], 16000);
        assert!(matches!(second, Err(VoiceError::BackendBusy(_))));

        release_tx.send(()).unwrap();
        assert_eq!(handle.join().unwrap().unwrap(), "happy");

        // Permit is free again after completion.
        release_tx.send(()).unwrap();
        assert_eq!(classifier.classify(&[0.0; 8], 16000).unwrap(), "happy");
    }
}
