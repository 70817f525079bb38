/// Named parameter registry shared by every build of a model
///
/// Both the train-phase and the eval-phase instantiation draw their
/// parameters from the same registry, so a name created by the first build
/// is reused by the second, and a checkpoint restores into both.
use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};

use crate::{EvalError, Result};

pub struct ParameterRegistry {
    varmap: VarMap,
    dtype: DType,
    device: Device,
}

impl ParameterRegistry {
    /// Create an empty F32 registry on `device`
    pub fn new(device: Device) -> Self {
        Self {
            varmap: VarMap::new(),
            dtype: DType::F32,
            device,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// VarBuilder backed by this registry
    ///
    /// Existing names are returned as-is, after a shape check; new names
    /// are initialized and registered.
    pub fn builder(&self) -> VarBuilder<'_> {
        VarBuilder::from_varmap(&self.varmap, self.dtype, &self.device)
    }

    /// Registered parameter names, sorted
    pub fn names(&self) -> Vec<String> {
        let data = self.varmap.data().lock().unwrap_or_else(|p| p.into_inner());
        let mut names: Vec<String> = data.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.varmap.data().lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current value of a parameter
    pub fn get(&self, name: &str) -> Option<Tensor> {
        let data = self.varmap.data().lock().unwrap_or_else(|p| p.into_inner());
        data.get(name).map(|v| v.as_tensor().clone())
    }

    /// Snapshot of every parameter, keyed by name
    pub fn tensors(&self) -> HashMap<String, Tensor> {
        let data = self.varmap.data().lock().unwrap_or_else(|p| p.into_inner());
        data.iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect()
    }

    /// Overwrite one registered parameter; the shape must match
    pub fn set(&mut self, name: &str, value: &Tensor) -> Result<()> {
        if !self.names().iter().any(|n| n == name) {
            return Err(EvalError::Model(format!("unknown parameter: {}", name)));
        }
        let value = value.to_dtype(self.dtype)?.to_device(&self.device)?;
        self.varmap.set_one(name, value)?;
        Ok(())
    }

    /// Restore every registered parameter from a safetensors file by name
    ///
    /// A name missing from the file or a shape mismatch is fatal.
    pub fn restore<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        if self.is_empty() {
            return Err(EvalError::Checkpoint(
                "no parameters registered; build the model before restoring".to_string(),
            ));
        }
        self.varmap.load(path).map_err(|e| {
            EvalError::Checkpoint(format!("failed to restore from {}: {}", path.display(), e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_reuses_names() -> Result<()> {
        let registry = ParameterRegistry::new(Device::Cpu);
        let first = registry.builder().pp("fc").get((2, 3), "weight")?;
        let second = registry.builder().pp("fc").get((2, 3), "weight")?;

        assert_eq!(registry.names(), vec!["fc.weight".to_string()]);
        // Same storage, not a re-initialization
        assert_eq!(first.to_vec2::<f32>()?, second.to_vec2::<f32>()?);
        Ok(())
    }

    #[test]
    fn test_builder_rejects_shape_change() {
        let registry = ParameterRegistry::new(Device::Cpu);
        registry.builder().get((2, 3), "w").unwrap();
        assert!(registry.builder().get((3, 3), "w").is_err());
    }

    #[test]
    fn test_set_known_parameter() -> Result<()> {
        let mut registry = ParameterRegistry::new(Device::Cpu);
        registry.builder().get((2, 2), "w")?;
        registry.set("w", &Tensor::eye(2, DType::F32, &Device::Cpu)?)?;
        let w = registry.get("w").ok_or_else(|| EvalError::Model("missing".to_string()))?;
        assert_eq!(w.to_vec2::<f32>()?, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);

        assert!(registry.set("nope", &w).is_err());
        Ok(())
    }

    #[test]
    fn test_restore_requires_parameters() {
        let mut registry = ParameterRegistry::new(Device::Cpu);
        assert!(matches!(
            registry.restore("missing.safetensors"),
            Err(EvalError::Checkpoint(_))
        ));
    }
}
