/// Fully connected layer with automatic dtype casting
use candle_core::{DType, Result, Tensor};
use candle_nn::{Init, VarBuilder};

/// Activation applied after the affine transform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Identity,
    Relu,
    Tanh,
}

impl Activation {
    pub fn apply(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Activation::Identity => Ok(x.clone()),
            Activation::Relu => x.relu(),
            Activation::Tanh => x.tanh(),
        }
    }
}

/// Dense layer: `activation(input @ weight^T + bias)`
///
/// Parameters are registered as `<prefix>.weight` ([out, in]) and
/// `<prefix>.bias` ([out]).
pub struct Dense {
    weight: Tensor,
    bias: Tensor,
    activation: Activation,
}

impl Dense {
    /// Create new Dense layer
    ///
    /// # Arguments
    /// * `in_features` - Input dimension
    /// * `out_features` - Output dimension
    /// * `activation` - Activation applied to the output
    /// * `vb` - VarBuilder for parameter lookup/initialization
    pub fn new(
        in_features: usize,
        out_features: usize,
        activation: Activation,
        vb: VarBuilder,
    ) -> Result<Self> {
        let weight = vb.get_with_hints(
            (out_features, in_features),
            "weight",
            candle_nn::init::DEFAULT_KAIMING_NORMAL,
        )?;
        let bound = 1. / (in_features as f64).sqrt();
        let bias = vb.get_with_hints(out_features, "bias", Init::Uniform { lo: -bound, up: bound })?;

        Ok(Self {
            weight,
            bias,
            activation,
        })
    }

    /// Forward pass; parameters are cast to the input dtype
    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let dtype = input.dtype();
        let weight = cast(&self.weight, dtype)?;
        let bias = cast(&self.bias, dtype)?;

        let output = input.broadcast_matmul(&weight.t()?)?.broadcast_add(&bias)?;
        self.activation.apply(&output)
    }

    /// Sum of squared weights, for L2 regularization
    pub fn l2(&self) -> Result<Tensor> {
        self.weight.sqr()?.sum_all()
    }
}

fn cast(t: &Tensor, dtype: DType) -> Result<Tensor> {
    if t.dtype() != dtype {
        t.to_dtype(dtype)
    } else {
        Ok(t.clone())
    }
}
