/// Feed-forward classifiers
use candle_core::Tensor;
use candle_nn::{Dropout, VarBuilder};

use super::{Classifier, ClassifierNet, InputSpec, Phase};
use crate::layers::{Activation, Dense};
use crate::Result;

/// One hidden layer, ReLU, dropout during training
#[derive(Debug, Clone)]
pub struct Mlp {
    pub hidden_size: usize,
    pub dropout: f32,
}

impl Default for Mlp {
    fn default() -> Self {
        Self {
            hidden_size: 64,
            dropout: 0.5,
        }
    }
}

struct MlpNet {
    fc1: Dense,
    fc2: Dense,
    dropout: Dropout,
}

impl ClassifierNet for MlpNet {
    fn get(&self, images: &Tensor, phase: Phase) -> Result<(Tensor, Tensor)> {
        let hidden = self.fc1.forward(images)?;
        let hidden = self.dropout.forward(&hidden, phase.is_train())?;
        let scores = self.fc2.forward(&hidden)?;
        Ok((hidden, scores))
    }
}

impl Classifier for Mlp {
    fn name(&self) -> &str {
        "mlp"
    }

    fn build(&self, vb: VarBuilder, spec: &InputSpec) -> Result<Box<dyn ClassifierNet>> {
        let fc1 = Dense::new(spec.feature_dim, self.hidden_size, Activation::Relu, vb.pp("fc1"))?;
        let fc2 = Dense::new(self.hidden_size, spec.num_classes, Activation::Identity, vb.pp("fc2"))?;
        Ok(Box::new(MlpNet {
            fc1,
            fc2,
            dropout: Dropout::new(self.dropout),
        }))
    }
}

/// Single affine layer; parameters `fc.weight` [classes, features] and `fc.bias`
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearClassifier;

struct LinearNet {
    fc: Dense,
}

impl ClassifierNet for LinearNet {
    fn get(&self, images: &Tensor, _phase: Phase) -> Result<(Tensor, Tensor)> {
        let scores = self.fc.forward(images)?;
        Ok((images.clone(), scores))
    }
}

impl Classifier for LinearClassifier {
    fn name(&self) -> &str {
        "linear"
    }

    fn build(&self, vb: VarBuilder, spec: &InputSpec) -> Result<Box<dyn ClassifierNet>> {
        let fc = Dense::new(spec.feature_dim, spec.num_classes, Activation::Identity, vb.pp("fc"))?;
        Ok(Box::new(LinearNet { fc }))
    }
}
