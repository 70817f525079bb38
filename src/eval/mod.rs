/// Evaluation loop accounting, outcomes, and the result line
use std::fmt;
use std::path::PathBuf;

use candle_core::{DType, Device, Tensor, D};

use crate::config::InputType;
use crate::{EvalError, Result};

pub mod evaluator;

pub use evaluator::Evaluator;

/// Options for one evaluation loop
#[derive(Debug, Clone)]
pub struct EvalOptions {
    /// Examples per batch
    pub batch_size: usize,
    /// Device the model and batches live on
    pub device: Device,
    /// Background input producer threads
    pub num_threads: usize,
    /// Batches buffered ahead of the loop
    pub queue_capacity: usize,
}

impl Default for EvalOptions {
    fn default() -> Self {
        Self {
            batch_size: 200,
            device: Device::Cpu,
            num_threads: 2,
            queue_capacity: 8,
        }
    }
}

/// Batches needed to cover `num_examples` once
pub fn num_iterations(num_examples: usize, batch_size: usize) -> usize {
    num_examples.div_ceil(batch_size)
}

/// Running count of correct top-1 predictions
#[derive(Debug, Clone)]
pub struct AccuracyAccumulator {
    true_count: u64,
    iterations: usize,
    batch_size: usize,
}

impl AccuracyAccumulator {
    pub fn new(iterations: usize, batch_size: usize) -> Self {
        Self {
            true_count: 0,
            iterations,
            batch_size,
        }
    }

    pub fn add(&mut self, correct: u64) {
        self.true_count += correct;
    }

    pub fn true_count(&self) -> u64 {
        self.true_count
    }

    /// Examples the loop is planned to see, counting wrapped repeats
    pub fn total_sample_count(&self) -> usize {
        self.iterations * self.batch_size
    }

    pub fn value(&self) -> f64 {
        self.true_count as f64 / self.total_sample_count() as f64
    }
}

/// Running sum of per-batch losses
///
/// The result is the mean over batches executed, not over examples.
#[derive(Debug, Clone, Default)]
pub struct ErrorAccumulator {
    sum: f64,
    steps: usize,
}

impl ErrorAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, batch_loss: f64) {
        self.sum += batch_loss;
        self.steps += 1;
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    /// `None` before the first batch
    pub fn value(&self) -> Option<f64> {
        if self.steps == 0 {
            None
        } else {
            Some(self.sum / self.steps as f64)
        }
    }
}

/// Number of rows whose label is among the top-1 scores
///
/// Ties with the maximum count as correct.
pub fn correct_predictions(scores: &Tensor, labels: &Tensor) -> Result<u64> {
    let scores = scores.to_dtype(DType::F32)?;
    let max = scores.max_keepdim(D::Minus1)?;
    let labels = labels.to_dtype(DType::U32)?.unsqueeze(1)?.contiguous()?;
    let target = scores.gather(&labels, D::Minus1)?;
    let hits = target.ge(&max)?.to_dtype(DType::U32)?.sum_all()?;
    Ok(hits.to_scalar::<u32>()? as u64)
}

/// A computed metric
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Metric {
    Accuracy(f64),
    Error(f64),
}

impl Metric {
    pub fn value(&self) -> f64 {
        match self {
            Metric::Accuracy(v) | Metric::Error(v) => *v,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Metric::Accuracy(_) => "accuracy",
            Metric::Error(_) => "error",
        }
    }
}

/// How an evaluation run ended
#[derive(Debug)]
pub enum EvalOutcome {
    Finished(Metric),
    /// The checkpoint directory held no checkpoint
    MissingCheckpoint { dir: PathBuf },
    /// A batch step or an input producer failed; all producers are joined
    Aborted {
        steps_completed: usize,
        cause: EvalError,
    },
}

impl EvalOutcome {
    pub fn metric(&self) -> Option<Metric> {
        match self {
            EvalOutcome::Finished(metric) => Some(*metric),
            _ => None,
        }
    }

    pub fn value(&self) -> Option<f64> {
        self.metric().map(|m| m.value())
    }
}

/// `<timestamp>: <split> <accuracy|error> = <value>`
pub fn report_line(timestamp: impl fmt::Display, input_type: InputType, metric: Metric) -> String {
    format!(
        "{}: {} {} = {:.3}",
        timestamp,
        input_type,
        metric.label(),
        metric.value()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iterations_round_up() {
        assert_eq!(num_iterations(450, 200), 3);
        assert_eq!(num_iterations(400, 200), 2);
        assert_eq!(num_iterations(1, 200), 1);
        assert_eq!(num_iterations(0, 200), 0);

        let acc = AccuracyAccumulator::new(num_iterations(450, 200), 200);
        assert_eq!(acc.total_sample_count(), 600);
    }

    #[test]
    fn test_accuracy_divides_by_planned_samples() {
        let mut acc = AccuracyAccumulator::new(3, 200);
        acc.add(200);
        acc.add(150);
        acc.add(100);
        assert_eq!(acc.true_count(), 450);
        assert_eq!(acc.value(), 0.75);
    }

    #[test]
    fn test_error_is_mean_per_batch() {
        let mut acc = ErrorAccumulator::new();
        assert_eq!(acc.value(), None);
        for loss in [2.0, 4.0, 6.0] {
            acc.add(loss);
        }
        assert_eq!(acc.steps(), 3);
        assert_eq!(acc.value(), Some(4.0));
    }

    #[test]
    fn test_correct_predictions() -> Result<()> {
        let device = Device::Cpu;
        let scores = Tensor::new(
            &[[0.1f32, 0.9, 0.0], [0.8, 0.1, 0.1], [0.3, 0.3, 0.4], [0.5, 0.5, 0.0]],
            &device,
        )?;
        // hit, miss, hit, tie (counts)
        let labels = Tensor::new(&[1u32, 2, 2, 1], &device)?;
        assert_eq!(correct_predictions(&scores, &labels)?, 3);
        Ok(())
    }

    #[test]
    fn test_report_line() {
        let line = report_line("2016-10-10 12:00:00", InputType::Test, Metric::Accuracy(0.98765));
        assert_eq!(line, "2016-10-10 12:00:00: test accuracy = 0.988");

        let line = report_line("t", InputType::Validation, Metric::Error(4.0));
        assert_eq!(line, "t: validation error = 4.000");
    }

    #[test]
    fn test_outcome_value() {
        assert_eq!(EvalOutcome::Finished(Metric::Error(1.5)).value(), Some(1.5));
        let missing = EvalOutcome::MissingCheckpoint {
            dir: PathBuf::from("ckpt"),
        };
        assert!(missing.value().is_none());
    }
}
