//! Sliding sample windows for classifier input.
//!
//! Each device class accumulates samples until its trigger length is reached.
//! The full window is handed to the classifier, and once the verdict is in the
//! oldest `slide` samples are dropped so consecutive windows overlap.

use crate::core::sample::AccelSample;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::collections::VecDeque;

/// Reference wearable window: 150 samples, slide 50.
pub const WEARABLE_CAPACITY: usize = 150;
pub const WEARABLE_SLIDE: usize = 50;

/// Reference handheld window: 50 samples, slide 25.
pub const HANDHELD_CAPACITY: usize = 50;
pub const HANDHELD_SLIDE: usize = 25;

/// Window geometry for one device class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowShape {
    /// Hard cap, which is also the trigger length
    pub capacity: usize,
    /// Samples dropped from the front after each classification
    pub slide: usize,
}

impl WindowShape {
    pub fn wearable() -> Self {
        Self {
            capacity: WEARABLE_CAPACITY,
            slide: WEARABLE_SLIDE,
        }
    }

    pub fn handheld() -> Self {
        Self {
            capacity: HANDHELD_CAPACITY,
            slide: HANDHELD_SLIDE,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.capacity > 0 && self.slide > 0 && self.slide <= self.capacity
    }
}

/// A bounded, ordered run of samples for one device class.
#[derive(Debug, Clone)]
pub struct WindowBuffer {
    shape: WindowShape,
    samples: VecDeque<AccelSample>,
}

impl WindowBuffer {
    pub fn new(shape: WindowShape) -> Self {
        Self {
            shape,
            samples: VecDeque::with_capacity(shape.capacity),
        }
    }

    /// Append a sample, dropping from the front beyond the cap.
    ///
    /// The incoming sample is always kept. Returns how many old samples were
    /// dropped to make room.
    pub fn append(&mut self, sample: AccelSample) -> usize {
        self.samples.push_back(sample);
        let mut dropped = 0;
        while self.samples.len() > self.shape.capacity {
            self.samples.pop_front();
            dropped += 1;
        }
        dropped
    }

    /// Whether the buffer holds a full window.
    ///
    /// In-flight and cooldown gating live on the session, which owns both flags.
    pub fn is_full(&self) -> bool {
        self.samples.len() >= self.shape.capacity
    }

    /// Copy of the current window, oldest first.
    pub fn snapshot(&self) -> Vec<AccelSample> {
        self.samples.iter().copied().collect()
    }

    /// Drop the oldest `slide` samples after a classification completes.
    pub fn drain_after_classification(&mut self) {
        let n = self.shape.slide.min(self.samples.len());
        self.samples.drain(..n);
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn shape(&self) -> WindowShape {
        self.shape
    }
}

/// Magnitude statistics of a window, logged alongside each classification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowSummary {
    pub samples: usize,
    pub peak_magnitude: f64,
    pub mean_magnitude: f64,
    pub magnitude_std_dev: f64,
}

impl WindowSummary {
    pub fn from_samples(samples: &[AccelSample]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }

        let magnitudes: Vec<f64> = samples.iter().map(AccelSample::magnitude).collect();
        let peak = magnitudes.iter().copied().fold(f64::MIN, f64::max);
        let std_dev = if magnitudes.len() > 1 {
            magnitudes.iter().std_dev()
        } else {
            0.0
        };

        Self {
            samples: magnitudes.len(),
            peak_magnitude: peak,
            mean_magnitude: magnitudes.iter().mean(),
            magnitude_std_dev: std_dev,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(z: f64) -> AccelSample {
        AccelSample::new(0.0, 0.0, z)
    }

    #[test]
    fn test_buffer_never_exceeds_capacity() {
        let shape = WindowShape {
            capacity: 5,
            slide: 2,
        };
        let mut buffer = WindowBuffer::new(shape);

        let mut dropped = 0;
        for i in 0..23 {
            dropped += buffer.append(sample(i as f64 * 0.01));
            assert!(buffer.len() <= shape.capacity);
        }
        assert_eq!(dropped, 18);
        assert!(buffer.is_full());

        // The newest sample survives the drop.
        let last = buffer.snapshot().last().copied().unwrap();
        assert!((last.acc_z - 0.22).abs() < 1e-9);
    }

    #[test]
    fn test_slide_keeps_overlap() {
        let mut buffer = WindowBuffer::new(WindowShape::handheld());
        for i in 0..HANDHELD_CAPACITY {
            buffer.append(sample(i as f64));
        }
        assert!(buffer.is_full());

        buffer.drain_after_classification();
        assert_eq!(buffer.len(), HANDHELD_CAPACITY - HANDHELD_SLIDE);
        assert_eq!(buffer.snapshot()[0].acc_z, HANDHELD_SLIDE as f64);
        assert!(!buffer.is_full());
    }

    #[test]
    fn test_drain_on_short_buffer() {
        let mut buffer = WindowBuffer::new(WindowShape::wearable());
        buffer.append(sample(1.0));
        buffer.drain_after_classification();
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_shape_validation() {
        assert!(WindowShape::wearable().is_valid());
        assert!(!WindowShape {
            capacity: 10,
            slide: 11
        }
        .is_valid());
        assert!(!WindowShape {
            capacity: 10,
            slide: 0
        }
        .is_valid());
    }

    #[test]
    fn test_window_summary() {
        let samples = vec![sample(1.0), sample(3.0)];
        let summary = WindowSummary::from_samples(&samples);
        assert_eq!(summary.samples, 2);
        assert!((summary.peak_magnitude - 3.0).abs() < 1e-9);
        assert!((summary.mean_magnitude - 2.0).abs() < 1e-9);
        assert!(summary.magnitude_std_dev > 0.0);

        assert_eq!(WindowSummary::from_samples(&[]), WindowSummary::default());
    }
}
