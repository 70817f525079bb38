/// Dense autoencoder
use candle_core::{DType, Tensor};
use candle_nn::VarBuilder;

use super::{Autoencoder, AutoencoderNet, InputSpec, Phase};
use crate::layers::{Activation, Dense};
use crate::Result;

/// `encoder: features -> latent (tanh)`, `decoder: latent -> features`
#[derive(Debug, Clone)]
pub struct DenseAutoencoder {
    pub latent_size: usize,
}

impl Default for DenseAutoencoder {
    fn default() -> Self {
        Self { latent_size: 4 }
    }
}

struct DenseAutoencoderNet {
    encoder: Dense,
    decoder: Dense,
    l2_penalty: f64,
}

impl AutoencoderNet for DenseAutoencoderNet {
    fn get(&self, images: &Tensor, _phase: Phase) -> Result<(Tensor, Tensor)> {
        let latent = self.encoder.forward(images)?;
        let reconstruction = self.decoder.forward(&latent)?;
        Ok((latent, reconstruction))
    }

    /// Mean squared error over all elements
    fn loss(&self, reconstructions: &Tensor, targets: &Tensor) -> Result<Tensor> {
        Ok(candle_nn::loss::mse(reconstructions, targets)?)
    }

    fn regularization(&self) -> Result<Tensor> {
        let weights = (self.encoder.l2()? + self.decoder.l2()?)?;
        Ok((weights * self.l2_penalty)?)
    }
}

impl Autoencoder for DenseAutoencoder {
    fn name(&self) -> &str {
        "autoencoder"
    }

    fn build(
        &self,
        vb: VarBuilder,
        spec: &InputSpec,
        l2_penalty: f64,
    ) -> Result<Box<dyn AutoencoderNet>> {
        let encoder = Dense::new(spec.feature_dim, self.latent_size, Activation::Tanh, vb.pp("encoder"))?;
        let decoder = Dense::new(self.latent_size, spec.feature_dim, Activation::Identity, vb.pp("decoder"))?;
        Ok(Box::new(DenseAutoencoderNet {
            encoder,
            decoder,
            l2_penalty,
        }))
    }
}

/// Loss as a host f64, whatever the tensor dtype
pub(crate) fn scalar_loss(loss: &Tensor) -> Result<f64> {
    Ok(loss.to_dtype(DType::F64)?.to_scalar::<f64>()?)
}
