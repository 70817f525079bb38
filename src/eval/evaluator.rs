/// Checkpoint evaluation driver
use std::path::Path;

use candle_core::Tensor;

use super::{
    correct_predictions, num_iterations, AccuracyAccumulator, ErrorAccumulator, EvalOptions,
    EvalOutcome, Metric,
};
use crate::checkpoint::Checkpoint;
use crate::config::InputType;
use crate::data::{Batch, BatchQueue, Coordinator, Dataset, InputPipeline};
use crate::models::autoencoder::scalar_loss;
use crate::models::{
    Autoencoder, Classifier, InputSpec, ModelHandle, ParameterRegistry, Phase,
};
use crate::{EvalError, Result};

/// Steps the batch loop completed and the error that ended it, if any
struct LoopReport {
    steps: usize,
    error: Option<EvalError>,
}

/// Evaluates models against one dataset
///
/// Owns the parameter registry shared by the train-phase registration pass
/// and the eval-phase build, and the coordinator of the input producers.
pub struct Evaluator<'a> {
    dataset: &'a dyn Dataset,
    options: EvalOptions,
    registry: ParameterRegistry,
    coordinator: Coordinator,
    l2_penalty: f64,
}

impl<'a> Evaluator<'a> {
    pub fn new(dataset: &'a dyn Dataset, options: EvalOptions) -> Self {
        let registry = ParameterRegistry::new(options.device.clone());
        Self {
            dataset,
            options,
            registry,
            coordinator: Coordinator::new(),
            l2_penalty: 0.0,
        }
    }

    /// Penalty used by the autoencoder train-phase pass
    pub fn with_l2_penalty(mut self, l2_penalty: f64) -> Self {
        self.l2_penalty = l2_penalty;
        self
    }

    pub fn registry(&self) -> &ParameterRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ParameterRegistry {
        &mut self.registry
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    fn input_spec(&self) -> InputSpec {
        InputSpec {
            feature_dim: self.dataset.feature_dim(),
            num_classes: self.dataset.num_classes(),
        }
    }

    fn iterations(&self, input_type: InputType) -> Result<usize> {
        if self.options.batch_size == 0 {
            return Err(EvalError::Config("batch_size must be > 0".to_string()));
        }
        let num_examples = self.dataset.num_examples(input_type);
        if num_examples == 0 {
            return Err(EvalError::Config(format!(
                "{} split of {} has no examples",
                input_type,
                self.dataset.name()
            )));
        }
        Ok(num_iterations(num_examples, self.options.batch_size))
    }

    /// One-example zero batch used by the registration pass
    fn placeholder(&self) -> Result<Tensor> {
        Ok(Tensor::zeros(
            (1, self.dataset.feature_dim()),
            self.registry.dtype(),
            self.registry.device(),
        )?)
    }

    /// Build `model` in train phase and run it once, registering every
    /// parameter name it declares
    pub fn register(&mut self, model: &ModelHandle) -> Result<()> {
        let spec = self.input_spec();
        let images = self.placeholder()?;
        match model {
            ModelHandle::Classifier(m) => {
                let net = m.build(self.registry.builder(), &spec)?;
                net.get(&images, Phase::Train)?;
            }
            ModelHandle::Autoencoder(m) => {
                let net = m.build(self.registry.builder(), &spec, self.l2_penalty)?;
                let (_, reconstruction) = net.get(&images, Phase::Train)?;
                let penalty = scalar_loss(&net.regularization()?)?;
                let loss = scalar_loss(&net.loss(&reconstruction, &images)?)?;
                log::debug!("Train-phase placeholder loss {:.4}, penalty {:.4}", loss, penalty);
            }
        }
        log::info!(
            "Registered {} parameters for {} {}",
            self.registry.len(),
            model.kind(),
            model.name()
        );
        Ok(())
    }

    /// Register `model`, then run the evaluation its capability set allows
    pub fn evaluate<P: AsRef<Path>>(
        &mut self,
        model: &ModelHandle,
        checkpoint_dir: P,
        input_type: InputType,
    ) -> Result<EvalOutcome> {
        self.register(model)?;
        match model {
            ModelHandle::Classifier(m) => self.accuracy(checkpoint_dir, m.as_ref(), input_type),
            ModelHandle::Autoencoder(m) => self.error(checkpoint_dir, m.as_ref(), input_type),
        }
    }

    /// Restore the latest checkpoint into the registry
    ///
    /// Returns `false` when the directory holds none.
    fn restore_latest(&mut self, checkpoint_dir: &Path) -> Result<bool> {
        match Checkpoint::latest(checkpoint_dir)? {
            Some(checkpoint) => {
                checkpoint.restore(&mut self.registry)?;
                Ok(true)
            }
            None => {
                log::warn!("[!] No checkpoint file found in {}", checkpoint_dir.display());
                Ok(false)
            }
        }
    }

    /// Top-1 accuracy of a classifier over one pass of a split
    ///
    /// # Arguments
    /// * `checkpoint_dir` - Directory searched for the latest checkpoint
    /// * `model` - Classifier collaborator
    /// * `input_type` - Split to evaluate
    ///
    /// # Returns
    /// `true_count / (iterations * batch_size)`, or why no value was computed
    pub fn accuracy<P: AsRef<Path>>(
        &mut self,
        checkpoint_dir: P,
        model: &dyn Classifier,
        input_type: InputType,
    ) -> Result<EvalOutcome> {
        let checkpoint_dir = checkpoint_dir.as_ref();
        let iterations = self.iterations(input_type)?;
        let spec = self.input_spec();

        let net = model.build(self.registry.builder(), &spec)?;
        if !self.restore_latest(checkpoint_dir)? {
            return Ok(EvalOutcome::MissingCheckpoint {
                dir: checkpoint_dir.to_path_buf(),
            });
        }

        let mut accumulator = AccuracyAccumulator::new(iterations, self.options.batch_size);
        let report = self.run_batches(input_type, iterations, |batch| {
            let (_, scores) = net.get(&batch.images, Phase::Eval)?;
            let correct = correct_predictions(&scores, &batch.labels)?;
            log::debug!("Batch correct: {}", correct);
            accumulator.add(correct);
            Ok(())
        });

        if let Some(cause) = report.error {
            return Ok(aborted(report.steps, cause));
        }

        let value = accumulator.value();
        log::info!(
            "{} correct of {} samples ({} batches)",
            accumulator.true_count(),
            accumulator.total_sample_count(),
            report.steps
        );
        Ok(EvalOutcome::Finished(Metric::Accuracy(value)))
    }

    /// Mean per-batch reconstruction loss of an autoencoder over one pass of
    /// a split
    ///
    /// The divisor is the number of batches executed, not examples.
    pub fn error<P: AsRef<Path>>(
        &mut self,
        checkpoint_dir: P,
        model: &dyn Autoencoder,
        input_type: InputType,
    ) -> Result<EvalOutcome> {
        let checkpoint_dir = checkpoint_dir.as_ref();
        let iterations = self.iterations(input_type)?;
        let spec = self.input_spec();

        let net = model.build(self.registry.builder(), &spec, 0.0)?;
        if !self.restore_latest(checkpoint_dir)? {
            return Ok(EvalOutcome::MissingCheckpoint {
                dir: checkpoint_dir.to_path_buf(),
            });
        }

        let mut accumulator = ErrorAccumulator::new();
        let report = self.run_batches(input_type, iterations, |batch| {
            let (_, reconstructions) = net.get(&batch.images, Phase::Eval)?;
            let loss = scalar_loss(&net.loss(&reconstructions, &batch.images)?)?;
            log::debug!("Batch loss: {:.4}", loss);
            accumulator.add(loss);
            Ok(())
        });

        if let Some(cause) = report.error {
            return Ok(aborted(report.steps, cause));
        }

        match accumulator.value() {
            Some(value) => Ok(EvalOutcome::Finished(Metric::Error(value))),
            None => Ok(aborted(
                report.steps,
                EvalError::Pipeline("no batches were evaluated".to_string()),
            )),
        }
    }

    /// Run `step` on up to `iterations` batches while producers feed the
    /// queue; the producers are joined before this returns
    fn run_batches<F>(&self, input_type: InputType, iterations: usize, step: F) -> LoopReport
    where
        F: FnMut(Batch) -> Result<()>,
    {
        self.coordinator.reset();
        let pipeline = InputPipeline::new(
            self.dataset,
            input_type,
            self.options.batch_size,
            self.options.device.clone(),
        )
        .with_threads(self.options.num_threads)
        .with_capacity(self.options.queue_capacity);

        log::info!(
            "Evaluating {} batches of {} from {} split",
            iterations,
            self.options.batch_size,
            input_type
        );

        let mut report = pipeline.run(&self.coordinator, |queue| {
            batch_loop(queue, iterations, step)
        });

        // A producer failure stops the loop early without a step error
        if report.error.is_none() {
            report.error = self.coordinator.take_error();
        }
        report
    }
}

fn batch_loop<F>(queue: &BatchQueue<'_>, iterations: usize, mut step: F) -> LoopReport
where
    F: FnMut(Batch) -> Result<()>,
{
    let mut steps = 0;
    while steps < iterations && !queue.coordinator().should_stop() {
        let outcome = queue.next_batch().and_then(&mut step);
        if let Err(e) = outcome {
            return LoopReport {
                steps,
                error: Some(e),
            };
        }
        steps += 1;
    }
    LoopReport { steps, error: None }
}

fn aborted(steps_completed: usize, cause: EvalError) -> EvalOutcome {
    log::error!(
        "Evaluation aborted after {} batches: {}",
        steps_completed,
        cause
    );
    EvalOutcome::Aborted {
        steps_completed,
        cause,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{save_checkpoint, CheckpointMetadata};
    use crate::data::SyntheticDataset;
    use crate::models::{ClassifierNet, DenseAutoencoder, LinearClassifier};
    use candle_core::{DType, Device};
    use std::cell::Cell;

    fn options(batch_size: usize) -> EvalOptions {
        EvalOptions {
            batch_size,
            device: Device::Cpu,
            num_threads: 2,
            queue_capacity: 4,
        }
    }

    /// Save a linear classifier whose weights are the identity on the
    /// first `num_classes` features
    fn save_identity_linear(dataset: &SyntheticDataset, dir: &Path) -> Result<()> {
        let mut evaluator = Evaluator::new(dataset, options(200));
        evaluator.register(&ModelHandle::Classifier(Box::new(LinearClassifier)))?;

        let (classes, features) = (dataset.num_classes(), dataset.feature_dim());
        let mut weight = vec![0f32; classes * features];
        for c in 0..classes {
            weight[c * features + c] = 1.0;
        }
        let registry = evaluator.registry_mut();
        registry.set("fc.weight", &Tensor::from_vec(weight, (classes, features), &Device::Cpu)?)?;
        registry.set("fc.bias", &Tensor::zeros(classes, DType::F32, &Device::Cpu)?)?;
        save_checkpoint(registry, dir, &CheckpointMetadata::default())?;
        Ok(())
    }

    #[test]
    fn test_known_weights_give_perfect_accuracy() -> Result<()> {
        let dataset = SyntheticDataset::with_seed(5)?;
        let dir = tempfile::tempdir()?;
        save_identity_linear(&dataset, dir.path())?;

        // Fresh registry: the model starts from its initializers
        let mut evaluator = Evaluator::new(&dataset, options(200));
        let model = ModelHandle::Classifier(Box::new(LinearClassifier));
        let outcome = evaluator.evaluate(&model, dir.path(), InputType::Validation)?;

        assert_eq!(outcome.metric(), Some(Metric::Accuracy(1.0)));
        assert_eq!(evaluator.coordinator().active_producers(), 0);
        Ok(())
    }

    #[test]
    fn test_missing_checkpoint_yields_no_metric() -> Result<()> {
        let dataset = SyntheticDataset::with_seed(0)?;
        let dir = tempfile::tempdir()?;
        let mut evaluator = Evaluator::new(&dataset, options(50));
        let model = ModelHandle::Classifier(Box::new(LinearClassifier));

        let outcome = evaluator.evaluate(&model, dir.path(), InputType::Test)?;
        assert!(matches!(outcome, EvalOutcome::MissingCheckpoint { .. }));
        assert!(outcome.value().is_none());
        assert_eq!(evaluator.coordinator().active_producers(), 0);
        Ok(())
    }

    #[test]
    fn test_wrong_architecture_is_fatal() -> Result<()> {
        let dataset = SyntheticDataset::with_seed(0)?;
        let dir = tempfile::tempdir()?;
        save_identity_linear(&dataset, dir.path())?;

        let mut evaluator = Evaluator::new(&dataset, options(50));
        let model = crate::models::by_name("mlp")?;
        let result = evaluator.evaluate(&model, dir.path(), InputType::Validation);
        assert!(matches!(result, Err(EvalError::Checkpoint(_))));
        Ok(())
    }

    #[test]
    fn test_autoencoder_error_matches_direct_loss() -> Result<()> {
        let dataset = SyntheticDataset::with_seed(1)?;
        let dir = tempfile::tempdir()?;
        let model = ModelHandle::Autoencoder(Box::new(DenseAutoencoder::default()));

        let mut trained = Evaluator::new(&dataset, options(450));
        trained.register(&model)?;
        save_checkpoint(trained.registry(), dir.path(), &CheckpointMetadata::default())?;

        // One batch covers the whole validation split
        let mut evaluator = Evaluator::new(&dataset, options(450));
        let outcome = evaluator.evaluate(&model, dir.path(), InputType::Validation)?;
        let value = match outcome.metric() {
            Some(Metric::Error(v)) => v,
            other => panic!("expected an error metric, got {:?}", other),
        };

        let net = DenseAutoencoder::default().build(
            trained.registry().builder(),
            &evaluator.input_spec(),
            0.0,
        )?;
        let batch = dataset.read_batch(InputType::Validation, 0, 450, &Device::Cpu)?;
        let (_, reconstruction) = net.get(&batch.images, Phase::Eval)?;
        let expected = scalar_loss(&net.loss(&reconstruction, &batch.images)?)?;
        assert!((value - expected).abs() < 1e-6);
        assert_eq!(evaluator.coordinator().active_producers(), 0);
        Ok(())
    }

    #[test]
    fn test_dispatch_follows_capability_set() -> Result<()> {
        let dataset = SyntheticDataset::with_seed(2)?;

        let classifier_dir = tempfile::tempdir()?;
        save_identity_linear(&dataset, classifier_dir.path())?;
        let classifier = ModelHandle::Classifier(Box::new(LinearClassifier));
        let mut evaluator = Evaluator::new(&dataset, options(100));
        let outcome = evaluator.evaluate(&classifier, classifier_dir.path(), InputType::Test)?;
        assert!(matches!(outcome.metric(), Some(Metric::Accuracy(_))));
        assert!(evaluator.registry().names().iter().all(|n| n.starts_with("fc.")));

        let autoencoder_dir = tempfile::tempdir()?;
        let autoencoder = ModelHandle::Autoencoder(Box::new(DenseAutoencoder::default()));
        let mut trained = Evaluator::new(&dataset, options(100));
        trained.register(&autoencoder)?;
        save_checkpoint(trained.registry(), autoencoder_dir.path(), &CheckpointMetadata::default())?;
        let mut evaluator = Evaluator::new(&dataset, options(100));
        let outcome = evaluator.evaluate(&autoencoder, autoencoder_dir.path(), InputType::Test)?;
        assert!(matches!(outcome.metric(), Some(Metric::Error(_))));
        assert!(evaluator.registry().names().iter().all(|n| !n.starts_with("fc.")));
        Ok(())
    }

    /// Linear classifier whose forward pass fails from the `fail_at`-th call
    struct Flaky {
        fail_at: usize,
    }

    struct FlakyNet {
        inner: Box<dyn ClassifierNet>,
        calls: Cell<usize>,
        fail_at: usize,
    }

    impl ClassifierNet for FlakyNet {
        fn get(&self, images: &Tensor, phase: Phase) -> Result<(Tensor, Tensor)> {
            let call = self.calls.get();
            self.calls.set(call + 1);
            if phase == Phase::Eval && call >= self.fail_at {
                return Err(EvalError::Model("device lost".to_string()));
            }
            self.inner.get(images, phase)
        }
    }

    impl Classifier for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        fn build(
            &self,
            vb: candle_nn::VarBuilder,
            spec: &InputSpec,
        ) -> Result<Box<dyn ClassifierNet>> {
            Ok(Box::new(FlakyNet {
                inner: LinearClassifier.build(vb, spec)?,
                calls: Cell::new(0),
                fail_at: self.fail_at,
            }))
        }
    }

    #[test]
    fn test_step_failure_aborts_and_joins_producers() -> Result<()> {
        let dataset = SyntheticDataset::with_seed(0)?;
        let dir = tempfile::tempdir()?;
        save_identity_linear(&dataset, dir.path())?;

        let mut evaluator = Evaluator::new(&dataset, options(50));
        let model = ModelHandle::Classifier(Box::new(Flaky { fail_at: 2 }));
        let outcome = evaluator.evaluate(&model, dir.path(), InputType::Validation)?;

        match outcome {
            EvalOutcome::Aborted {
                steps_completed,
                cause,
            } => {
                assert_eq!(steps_completed, 2);
                assert!(matches!(cause, EvalError::Model(_)));
            }
            other => panic!("expected abort, got {:?}", other),
        }
        assert!(evaluator.coordinator().should_stop());
        assert_eq!(evaluator.coordinator().active_producers(), 0);
        Ok(())
    }

    /// Synthetic data whose reads fail from batch `fail_from` on
    struct CorruptAfter {
        inner: SyntheticDataset,
        fail_from: usize,
    }

    impl Dataset for CorruptAfter {
        fn name(&self) -> &str {
            "corrupt"
        }

        fn num_examples(&self, input_type: InputType) -> usize {
            self.inner.num_examples(input_type)
        }

        fn num_classes(&self) -> usize {
            self.inner.num_classes()
        }

        fn feature_dim(&self) -> usize {
            self.inner.feature_dim()
        }

        fn read_batch(
            &self,
            input_type: InputType,
            batch_index: usize,
            batch_size: usize,
            device: &Device,
        ) -> Result<Batch> {
            if batch_index >= self.fail_from {
                return Err(EvalError::Dataset(format!("corrupt record in batch {}", batch_index)));
            }
            self.inner.read_batch(input_type, batch_index, batch_size, device)
        }
    }

    fn expect_dataset_abort(outcome: EvalOutcome, iterations: usize) {
        match outcome {
            EvalOutcome::Aborted {
                steps_completed,
                cause,
            } => {
                assert!(steps_completed < iterations);
                assert!(matches!(cause, EvalError::Dataset(_)));
            }
            other => panic!("expected abort, got {:?}", other),
        }
    }

    #[test]
    fn test_producer_failure_aborts_accuracy() -> Result<()> {
        let dataset = CorruptAfter {
            inner: SyntheticDataset::with_seed(0)?,
            fail_from: 1,
        };
        let dir = tempfile::tempdir()?;
        save_identity_linear(&dataset.inner, dir.path())?;

        // 450 validation examples in batches of 50: 9 iterations
        let mut evaluator = Evaluator::new(&dataset, options(50));
        let model = ModelHandle::Classifier(Box::new(LinearClassifier));
        let outcome = evaluator.evaluate(&model, dir.path(), InputType::Validation)?;

        expect_dataset_abort(outcome, 9);
        assert!(evaluator.coordinator().should_stop());
        assert_eq!(evaluator.coordinator().active_producers(), 0);
        Ok(())
    }

    #[test]
    fn test_producer_failure_aborts_error() -> Result<()> {
        let dataset = CorruptAfter {
            inner: SyntheticDataset::with_seed(0)?,
            fail_from: 1,
        };
        let dir = tempfile::tempdir()?;
        let model = ModelHandle::Autoencoder(Box::new(DenseAutoencoder::default()));
        let mut trained = Evaluator::new(&dataset, options(50));
        trained.register(&model)?;
        save_checkpoint(trained.registry(), dir.path(), &CheckpointMetadata::default())?;

        let mut evaluator = Evaluator::new(&dataset, options(50));
        let outcome = evaluator.evaluate(&model, dir.path(), InputType::Validation)?;

        expect_dataset_abort(outcome, 9);
        assert_eq!(evaluator.coordinator().active_producers(), 0);
        Ok(())
    }

    #[test]
    fn test_empty_split_is_a_config_error() -> Result<()> {
        let dataset = crate::data::NumpyDataset::from_arrays(
            "empty",
            vec![(
                InputType::Test,
                ndarray::Array2::zeros((0, 4)),
                ndarray::Array1::zeros(0),
            )],
            2,
        )?;
        let mut evaluator = Evaluator::new(&dataset, options(10));
        let result = evaluator.accuracy("unused", &LinearClassifier, InputType::Test);
        assert!(matches!(result, Err(EvalError::Config(_))));
        Ok(())
    }
}
