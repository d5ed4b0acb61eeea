//! Face descriptor arithmetic and enrollment sample collection.
//!
//! An enrollment collects several descriptors of the same face during one
//! passed liveness session and stores their elementwise mean. Averaging
//! smooths per-frame noise in the recognition network's output.
//!
//! Policy: averaging an empty sample set is an error
//! ([`DescriptorError::EmptySampleSet`]) rather than a zero vector, since a
//! zero descriptor would silently enroll a face that matches nothing.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DescriptorError {
    #[error("no descriptor samples to average")]
    EmptySampleSet,
    #[error("descriptor dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("descriptor contains a non-finite value")]
    NonFinite,
}

/// Elementwise mean of equally sized descriptors.
pub fn average<D: AsRef<[f32]>>(samples: &[D]) -> Result<Vec<f32>, DescriptorError> {
    let first = samples.first().ok_or(DescriptorError::EmptySampleSet)?.as_ref();
    let dim = first.len();

    let mut sum = vec![0.0f64; dim];
    for sample in samples {
        let sample = sample.as_ref();
        if sample.len() != dim {
            return Err(DescriptorError::DimensionMismatch {
                expected: dim,
                got: sample.len(),
            });
        }
        for (acc, &v) in sum.iter_mut().zip(sample) {
            *acc += f64::from(v);
        }
    }

    let n = samples.len() as f64;
    Ok(sum.into_iter().map(|s| (s / n) as f32).collect())
}

/// Euclidean (L2) distance between two descriptors.
///
/// Only the overlapping prefix is compared; callers are expected to check
/// dimensions first (see [`check_dimension`]).
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum::<f32>()
        .sqrt()
}

/// Reject descriptors of the wrong length or with NaN/Inf values.
pub fn check_dimension(descriptor: &[f32], expected: usize) -> Result<(), DescriptorError> {
    if descriptor.len() != expected {
        return Err(DescriptorError::DimensionMismatch {
            expected,
            got: descriptor.len(),
        });
    }
    if descriptor.iter().any(|v| !v.is_finite()) {
        return Err(DescriptorError::NonFinite);
    }
    Ok(())
}

/// Result of offering a descriptor to an [`EnrollmentSampleSet`].
#[derive(Debug, Clone, PartialEq)]
pub enum SampleOutcome {
    /// Stored; carries the new sample count.
    Added(usize),
    /// Quota already met; the descriptor was ignored.
    Full,
    Rejected(DescriptorError),
}

/// Descriptors collected for one enrollment, bounded to `required` entries.
///
/// All stored descriptors share the dimension of the first one accepted.
#[derive(Debug, Clone)]
pub struct EnrollmentSampleSet {
    samples: Vec<Vec<f32>>,
    required: usize,
}

impl EnrollmentSampleSet {
    pub fn new(required: usize) -> Self {
        Self {
            samples: Vec::with_capacity(required.min(64)),
            required,
        }
    }

    pub fn push(&mut self, descriptor: &[f32]) -> SampleOutcome {
        if self.is_complete() {
            return SampleOutcome::Full;
        }
        let expected = self.samples.first().map_or(descriptor.len(), Vec::len);
        if let Err(e) = check_dimension(descriptor, expected) {
            return SampleOutcome::Rejected(e);
        }
        if descriptor.is_empty() {
            return SampleOutcome::Rejected(DescriptorError::DimensionMismatch {
                expected: self.dimension().unwrap_or(0),
                got: 0,
            });
        }
        self.samples.push(descriptor.to_vec());
        SampleOutcome::Added(self.samples.len())
    }

    pub fn is_complete(&self) -> bool {
        self.samples.len() >= self.required
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn required(&self) -> usize {
        self.required
    }

    pub fn dimension(&self) -> Option<usize> {
        self.samples.first().map(Vec::len)
    }

    /// Canonical descriptor: elementwise mean of the collected samples.
    pub fn average(&self) -> Result<Vec<f32>, DescriptorError> {
        average(&self.samples)
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_two_descriptors() {
        let avg = average(&[vec![1.0, 2.0, 3.0], vec![3.0, 2.0, 1.0]]).unwrap();
        assert_eq!(avg, vec![2.0, 2.0, 2.0]);
    }

    #[test]
    fn test_average_single_is_identity() {
        let d = vec![0.125f32, -0.5, 0.75, 0.0];
        assert_eq!(average(&[d.clone()]).unwrap(), d);
    }

    #[test]
    fn test_average_rejects_mismatch() {
        let err = average(&[vec![1.0, 2.0], vec![1.0, 2.0, 3.0]]).unwrap_err();
        assert_eq!(
            err,
            DescriptorError::DimensionMismatch {
                expected: 2,
                got: 3
            }
        );
    }

    #[test]
    fn test_average_empty_is_error() {
        let empty: [Vec<f32>; 0] = [];
        assert_eq!(average(&empty).unwrap_err(), DescriptorError::EmptySampleSet);
    }

    #[test]
    fn test_distance_identity_and_symmetry() {
        let a = [0.3f32, -1.2, 4.0, 0.0];
        let b = [1.0f32, 2.0, -3.5, 0.25];
        assert_eq!(euclidean_distance(&a, &a), 0.0);
        assert_eq!(euclidean_distance(&a, &b), euclidean_distance(&b, &a));
        assert!((euclidean_distance(&[0.0, 0.0], &[3.0, 4.0]) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_check_dimension() {
        assert!(check_dimension(&[0.0; 128], 128).is_ok());
        assert!(matches!(
            check_dimension(&[0.0; 127], 128),
            Err(DescriptorError::DimensionMismatch { got: 127, .. })
        ));
        assert_eq!(
            check_dimension(&[0.0, f32::NAN], 2),
            Err(DescriptorError::NonFinite)
        );
    }

    #[test]
    fn test_sample_set_stops_at_quota() {
        let mut set = EnrollmentSampleSet::new(2);
        assert_eq!(set.push(&[1.0, 1.0]), SampleOutcome::Added(1));
        assert_eq!(set.push(&[3.0, 3.0]), SampleOutcome::Added(2));
        assert!(set.is_complete());
        assert_eq!(set.push(&[9.0, 9.0]), SampleOutcome::Full);
        assert_eq!(set.len(), 2);
        assert_eq!(set.average().unwrap(), vec![2.0, 2.0]);
    }

    #[test]
    fn test_sample_set_with_huge_quota() {
        let mut set = EnrollmentSampleSet::new(usize::MAX);
        assert_eq!(set.push(&[1.0, 2.0]), SampleOutcome::Added(1));
        assert!(!set.is_complete());
        assert_eq!(set.required(), usize::MAX);
    }

    #[test]
    fn test_sample_set_rejects_other_dimensions() {
        let mut set = EnrollmentSampleSet::new(3);
        set.push(&[1.0, 2.0, 3.0]);
        assert!(matches!(
            set.push(&[1.0, 2.0]),
            SampleOutcome::Rejected(DescriptorError::DimensionMismatch { .. })
        ));
        assert!(matches!(set.push(&[]), SampleOutcome::Rejected(_)));
        assert_eq!(set.len(), 1);
        assert_eq!(set.dimension(), Some(3));

        set.clear();
        assert!(set.is_empty());
        assert_eq!(set.average().unwrap_err(), DescriptorError::EmptySampleSet);
    }

    #[test]
    fn test_sample_set_rejects_empty_first_descriptor() {
        let mut set = EnrollmentSampleSet::new(3);
        assert!(matches!(set.push(&[]), SampleOutcome::Rejected(_)));
        assert!(set.is_empty());
    }
}
