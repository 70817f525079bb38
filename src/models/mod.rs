/// Model collaborators
///
/// A model is either a classifier or an autoencoder. `ModelHandle` carries
/// exactly one of the two capability sets and the evaluator dispatches on
/// the variant.
use candle_core::Tensor;
use candle_nn::VarBuilder;

use crate::{EvalError, Result};

pub mod autoencoder;
pub mod mlp;
pub mod registry;

pub use autoencoder::DenseAutoencoder;
pub use mlp::{LinearClassifier, Mlp};
pub use registry::ParameterRegistry;

/// Whether a forward pass runs with training-time behavior (dropout)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Train,
    Eval,
}

impl Phase {
    pub fn is_train(&self) -> bool {
        matches!(self, Phase::Train)
    }
}

/// Shape information a model needs from the dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputSpec {
    pub feature_dim: usize,
    pub num_classes: usize,
}

/// A built classifier network
pub trait ClassifierNet {
    /// Returns `(intermediate, scores)`, scores shaped [batch, num_classes]
    fn get(&self, images: &Tensor, phase: Phase) -> Result<(Tensor, Tensor)>;
}

/// Classifier collaborator
pub trait Classifier: Send + Sync {
    fn name(&self) -> &str;

    /// Build the network, drawing parameters from `vb`
    fn build(&self, vb: VarBuilder, spec: &InputSpec) -> Result<Box<dyn ClassifierNet>>;
}

/// A built autoencoder network
pub trait AutoencoderNet {
    /// Returns `(latent, reconstruction)`, reconstruction shaped like `images`
    fn get(&self, images: &Tensor, phase: Phase) -> Result<(Tensor, Tensor)>;

    /// Scalar reconstruction loss
    fn loss(&self, reconstructions: &Tensor, targets: &Tensor) -> Result<Tensor>;

    /// Weight penalty term, zero when built with `l2_penalty = 0`
    fn regularization(&self) -> Result<Tensor>;
}

/// Autoencoder collaborator
pub trait Autoencoder: Send + Sync {
    fn name(&self) -> &str;

    fn build(
        &self,
        vb: VarBuilder,
        spec: &InputSpec,
        l2_penalty: f64,
    ) -> Result<Box<dyn AutoencoderNet>>;
}

/// A model and the capability set it exposes
pub enum ModelHandle {
    Classifier(Box<dyn Classifier>),
    Autoencoder(Box<dyn Autoencoder>),
}

impl ModelHandle {
    pub fn name(&self) -> &str {
        match self {
            ModelHandle::Classifier(m) => m.name(),
            ModelHandle::Autoencoder(m) => m.name(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ModelHandle::Classifier(_) => "classifier",
            ModelHandle::Autoencoder(_) => "autoencoder",
        }
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.kind(), self.name())
    }
}

/// Look up a built-in model by name
pub fn by_name(name: &str) -> Result<ModelHandle> {
    match name {
        "mlp" => Ok(ModelHandle::Classifier(Box::new(Mlp::default()))),
        "linear" => Ok(ModelHandle::Classifier(Box::new(LinearClassifier))),
        "autoencoder" => Ok(ModelHandle::Autoencoder(Box::new(DenseAutoencoder::default()))),
        other => Err(EvalError::Config(format!(
            "Unknown model: {}. Must be 'mlp', 'linear', or 'autoencoder'",
            other
        ))),
    }
}
