//! Parameter store: the single owner of every trainable tensor.
//!
//! Wraps a [`VarMap`] and adds safetensors checkpointing. Loading is
//! all-or-nothing: every name and shape is validated before the first
//! parameter is overwritten.

use std::collections::HashMap;
use std::path::Path;

use candle_core::safetensors::Load;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use causalbert_core::{CausalBertError, Result};
use safetensors::SafeTensors;

/// Decoder weight of the MLM head; tied to the word embeddings in BERT
/// pretraining checkpoints, which often omit it.
const MLM_DECODER_WEIGHT: &str = "cls.predictions.decoder.weight";
const MLM_DECODER_BIAS: &str = "cls.predictions.bias";

/// Outcome of seeding from a pretrained checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeedReport {
    /// Parameters overwritten from the checkpoint.
    pub loaded: usize,
    /// Parameters with no counterpart, left at their initial values.
    pub missing: Vec<String>,
}

pub struct ParameterStore {
    varmap: VarMap,
    device: Device,
}

impl ParameterStore {
    pub fn new(device: &Device) -> Self {
        Self {
            varmap: VarMap::new(),
            device: device.clone(),
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Builder that registers new parameters in this store.
    pub fn var_builder(&self) -> VarBuilder<'static> {
        VarBuilder::from_varmap(&self.varmap, DType::F32, &self.device)
    }

    pub fn all_vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    /// Snapshot of `(name, var)` pairs sorted by name.
    pub fn named_vars(&self) -> Result<Vec<(String, Var)>> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|e| CausalBertError::Model(format!("Parameter store poisoned: {e}")))?;
        let mut vars: Vec<(String, Var)> =
            data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(vars)
    }

    /// Total number of scalar parameters.
    pub fn num_parameters(&self) -> usize {
        self.all_vars().iter().map(|v| v.elem_count()).sum()
    }

    /// Write every parameter to a safetensors file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        self.varmap
            .save(path)
            .map_err(|e| CausalBertError::Model(format!("Failed to save checkpoint: {e}")))?;
        tracing::info!(path = %path.display(), "Checkpoint saved");
        Ok(())
    }

    /// Restore every parameter from a checkpoint written by [`Self::save`].
    ///
    /// # Errors
    ///
    /// [`CausalBertError::ModelLoadMismatch`] when a parameter is absent from
    /// the file or stored with another shape. No parameter is modified then.
    pub fn load(&self, path: &Path) -> Result<()> {
        let bytes = std::fs::read(path)?;
        let file = SafeTensors::deserialize(&bytes).map_err(|e| {
            CausalBertError::ModelLoadMismatch(format!(
                "{} is not a safetensors file: {e}",
                path.display()
            ))
        })?;

        let mut problems = Vec::new();
        let mut staged = Vec::new();
        for (name, var) in self.named_vars()? {
            match file.tensor(&name) {
                Ok(view) if view.shape() == var.dims() => staged.push((var, view)),
                Ok(view) => problems.push(format!(
                    "'{name}': checkpoint {:?} vs model {:?}",
                    view.shape(),
                    var.dims()
                )),
                Err(_) => problems.push(format!("'{name}': missing from checkpoint")),
            }
        }
        if !problems.is_empty() {
            return Err(CausalBertError::ModelLoadMismatch(summarize(&problems)));
        }

        let tensors = staged
            .into_iter()
            .map(|(var, view)| {
                let t = view
                    .load(&self.device)
                    .and_then(|t| t.to_dtype(var.dtype()))
                    .map_err(|e| CausalBertError::Model(format!("Failed to read tensor: {e}")))?;
                Ok((var, t))
            })
            .collect::<Result<Vec<(Var, Tensor)>>>()?;
        assign(&tensors)?;

        tracing::info!(
            path = %path.display(),
            parameters = tensors.len(),
            "Checkpoint loaded"
        );
        Ok(())
    }

    /// Overwrite parameters from a pretrained checkpoint where names match.
    ///
    /// Accepts legacy `gamma`/`beta` layer-norm names and files without the
    /// `bert.` prefix. A missing MLM decoder is seeded from the word
    /// embeddings. Parameters without a counterpart keep their initial values;
    /// a counterpart with the wrong shape is fatal.
    pub fn seed_from_pretrained(&self, path: &Path) -> Result<SeedReport> {
        let tensors = candle_core::safetensors::load(path, &self.device).map_err(|e| {
            CausalBertError::ModelLoadMismatch(format!(
                "Failed to read pretrained weights {}: {e}",
                path.display()
            ))
        })?;

        let mut report = SeedReport::default();
        let mut problems = Vec::new();
        let mut staged = Vec::new();
        for (name, var) in self.named_vars()? {
            let Some(source) = pretrained_candidates(&name)
                .into_iter()
                .find(|c| tensors.contains_key(c))
            else {
                report.missing.push(name);
                continue;
            };
            let t = &tensors[&source];
            if t.dims() != var.dims() {
                problems.push(format!(
                    "'{name}' (from '{source}'): pretrained {:?} vs model {:?}",
                    t.dims(),
                    var.dims()
                ));
                continue;
            }
            let t = t
                .to_dtype(var.dtype())
                .map_err(|e| CausalBertError::Model(format!("Failed to convert '{source}': {e}")))?;
            staged.push((var, t));
        }
        if !problems.is_empty() {
            return Err(CausalBertError::ModelLoadMismatch(summarize(&problems)));
        }

        assign(&staged)?;
        report.loaded = staged.len();

        if !report.missing.is_empty() {
            tracing::warn!(
                missing = report.missing.len(),
                first = %report.missing[0],
                "Parameters without pretrained values keep their initialization"
            );
        }
        tracing::info!(
            path = %path.display(),
            loaded = report.loaded,
            "Pretrained weights applied"
        );
        Ok(report)
    }

    /// Detached copies of every parameter, keyed by name.
    pub fn snapshot(&self) -> Result<HashMap<String, Tensor>> {
        self.named_vars()?
            .into_iter()
            .map(|(name, var)| {
                let t = var
                    .as_tensor()
                    .copy()
                    .map_err(|e| CausalBertError::Model(format!("Failed to copy '{name}': {e}")))?;
                Ok((name, t))
            })
            .collect()
    }
}

fn assign(staged: &[(Var, Tensor)]) -> Result<()> {
    for (var, t) in staged {
        var.set(t)
            .map_err(|e| CausalBertError::Model(format!("Failed to assign parameter: {e}")))?;
    }
    Ok(())
}

fn summarize(problems: &[String]) -> String {
    const SHOWN: usize = 5;
    let mut msg = problems
        .iter()
        .take(SHOWN)
        .cloned()
        .collect::<Vec<_>>()
        .join("; ");
    if problems.len() > SHOWN {
        msg.push_str(&format!(" (+{} more)", problems.len() - SHOWN));
    }
    msg
}

/// Names a pretrained file may use for parameter `name`, in priority order.
fn pretrained_candidates(name: &str) -> Vec<String> {
    let mut bases = vec![name.to_string()];
    if let Some(stripped) = name.strip_prefix("bert.") {
        bases.push(stripped.to_string());
    }
    match name {
        MLM_DECODER_WEIGHT => {
            bases.push("bert.embeddings.word_embeddings.weight".to_string());
            bases.push("embeddings.word_embeddings.weight".to_string());
        }
        MLM_DECODER_BIAS => bases.push("cls.predictions.decoder.bias".to_string()),
        _ => {}
    }

    let mut out = Vec::with_capacity(bases.len() * 2);
    for base in bases {
        let legacy = if base.contains("LayerNorm") {
            base.strip_suffix(".weight")
                .map(|p| format!("{p}.gamma"))
                .or_else(|| base.strip_suffix(".bias").map(|p| format!("{p}.beta")))
        } else {
            None
        };
        out.push(base);
        out.extend(legacy);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_with_linear(device: &Device, out: usize) -> ParameterStore {
        let store = ParameterStore::new(device);
        candle_nn::linear(3, out, store.var_builder().pp("head")).unwrap();
        store
    }

    #[test]
    fn test_save_then_load_restores_values() {
        let device = Device::Cpu;
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ckpt/model.safetensors");

        let a = store_with_linear(&device, 2);
        a.save(&path).unwrap();

        let b = store_with_linear(&device, 2);
        b.load(&path).unwrap();
        let (sa, sb) = (a.snapshot().unwrap(), b.snapshot().unwrap());
        for (name, t) in &sa {
            let diff: f32 = (t - &sb[name])
                .unwrap()
                .abs()
                .unwrap()
                .sum_all()
                .unwrap()
                .to_scalar()
                .unwrap();
            assert_eq!(diff, 0.0, "{name} differs");
        }
    }

    #[test]
    fn test_shape_mismatch_is_fatal_and_atomic() {
        let device = Device::Cpu;
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.safetensors");
        store_with_linear(&device, 4).save(&path).unwrap();

        let target = store_with_linear(&device, 2);
        let before = target.snapshot().unwrap();
        let err = target.load(&path).unwrap_err();
        assert!(matches!(err, CausalBertError::ModelLoadMismatch(_)));

        let after = target.snapshot().unwrap();
        for (name, t) in &before {
            let same: f32 = (t - &after[name])
                .unwrap()
                .abs()
                .unwrap()
                .sum_all()
                .unwrap()
                .to_scalar()
                .unwrap();
            assert_eq!(same, 0.0);
        }
    }

    #[test]
    fn test_missing_parameter_is_mismatch() {
        let device = Device::Cpu;
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.safetensors");
        store_with_linear(&device, 2).save(&path).unwrap();

        let target = store_with_linear(&device, 2);
        candle_nn::linear(2, 2, target.var_builder().pp("extra")).unwrap();
        let err = target.load(&path).unwrap_err();
        assert!(err.to_string().contains("extra.weight"));
    }

    #[test]
    fn test_seed_accepts_legacy_names() {
        let device = Device::Cpu;
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pretrained.safetensors");

        let mut tensors = HashMap::new();
        tensors.insert(
            "embeddings.LayerNorm.gamma".to_string(),
            Tensor::full(2.0f32, 4, &device).unwrap(),
        );
        tensors.insert(
            "embeddings.word_embeddings.weight".to_string(),
            Tensor::full(0.5f32, (6, 4), &device).unwrap(),
        );
        candle_core::safetensors::save(&tensors, &path).unwrap();

        let store = ParameterStore::new(&device);
        let vb = store.var_builder();
        candle_nn::layer_norm(4, 1e-12, vb.pp("bert").pp("embeddings").pp("LayerNorm")).unwrap();
        vb.pp("cls")
            .pp("predictions")
            .pp("decoder")
            .get_with_hints((6, 4), "weight", candle_nn::Init::Const(0.0))
            .unwrap();

        let report = store.seed_from_pretrained(&path).unwrap();
        assert_eq!(report.loaded, 2);
        assert_eq!(report.missing, vec!["bert.embeddings.LayerNorm.bias".to_string()]);

        let snap = store.snapshot().unwrap();
        let gamma: Vec<f32> = snap["bert.embeddings.LayerNorm.weight"].to_vec1().unwrap();
        assert_eq!(gamma, vec![2.0; 4]);
        let decoder: f32 = snap[MLM_DECODER_WEIGHT]
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!((decoder - 12.0).abs() < 1e-5);
    }

    #[test]
    fn test_candidate_names() {
        let c = pretrained_candidates("bert.encoder.layer.0.output.LayerNorm.bias");
        assert_eq!(
            c,
            vec![
                "bert.encoder.layer.0.output.LayerNorm.bias",
                "bert.encoder.layer.0.output.LayerNorm.beta",
                "encoder.layer.0.output.LayerNorm.bias",
                "encoder.layer.0.output.LayerNorm.beta",
            ]
        );
    }
}
