use crate::{
    error::EvalError,
    sampler::{Generator, InputInfo},
};
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, create_dir_all},
    path::{Path, PathBuf},
};
use tch::{nn, nn::ModuleT, Device, Kind, Tensor};

/// Self-description of a model artifact directory.
pub const MODULE_FILE: &str = "module.json";
/// Checkpoint written after the batch-norm warm-up.
pub const ACCU_CHECKPOINT: &str = "model-with-accu.ot";
/// Name fragment of the accumulator switch variables.
pub const ACCU_SWITCH: &str = "accu.update_accus";

const BN_MOMENTUM: f64 = 0.1;
const BN_EPS: f64 = 1e-5;

fn default_weights() -> String {
    String::from("generator.ot")
}

/// Declared schema of a generator artifact.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSpec {
    pub z_dim: i64,
    /// Present for conditional generators.
    #[serde(default)]
    pub num_classes: Option<i64>,
    pub base_channels: i64,
    #[serde(default = "default_weights")]
    pub weights: String,
}

impl ModuleSpec {
    pub fn new(z_dim: i64, num_classes: Option<i64>, base_channels: i64) -> Self {
        Self {
            z_dim,
            num_classes,
            base_channels,
            weights: default_weights(),
        }
    }
}

fn tr2d(p: nn::Path, c_in: i64, c_out: i64, padding: i64, stride: i64) -> nn::ConvTranspose2D {
    let cfg = nn::ConvTransposeConfig {
        stride,
        padding,
        bias: false,
        ..Default::default()
    };
    nn::conv_transpose2d(p, c_in, c_out, 4, cfg)
}

/// Batch norm that can average batch statistics over many forward passes.
///
/// While `accu.update_accus` is set, every inference pass adds its batch
/// mean/variance to the accumulators and normalizes with the batch
/// statistics. Once the switch is cleared, inference uses the accumulated
/// averages, or the running statistics if nothing was accumulated.
#[derive(Debug)]
pub struct AccuBatchNorm {
    ws: Tensor,
    bs: Tensor,
    running_mean: Tensor,
    running_var: Tensor,
    update_accus: Tensor,
    accu_mean: Tensor,
    accu_var: Tensor,
    accu_counter: Tensor,
}

impl AccuBatchNorm {
    pub fn new(p: nn::Path, dim: i64) -> Self {
        let accu = &p / "accu";
        Self {
            ws: p.ones("weight", &[dim]),
            bs: p.zeros("bias", &[dim]),
            running_mean: p.zeros_no_train("running_mean", &[dim]),
            running_var: p.ones_no_train("running_var", &[dim]),
            update_accus: accu.zeros_no_train("update_accus", &[]),
            accu_mean: accu.zeros_no_train("accu_mean", &[dim]),
            accu_var: accu.zeros_no_train("accu_var", &[dim]),
            accu_counter: accu.zeros_no_train("accu_counter", &[]),
        }
    }

    fn normalize(&self, xs: &Tensor, mean: &Tensor, var: &Tensor, train: bool) -> Tensor {
        Tensor::batch_norm(
            xs,
            Some(&self.ws),
            Some(&self.bs),
            Some(mean),
            Some(var),
            train,
            BN_MOMENTUM,
            BN_EPS,
            false,
        )
    }

    fn accumulate(&self, xs: &Tensor) -> (Tensor, Tensor) {
        let mean = xs.mean_dim(&[0, 2, 3], false, Kind::Float);
        let var = xs.var_dim(&[0, 2, 3], false, false);
        tch::no_grad(|| {
            let mut accu_mean = self.accu_mean.shallow_clone();
            accu_mean.copy_(&(&self.accu_mean + &mean));
            let mut accu_var = self.accu_var.shallow_clone();
            accu_var.copy_(&(&self.accu_var + &var));
            let mut counter = self.accu_counter.shallow_clone();
            counter.copy_(&(&self.accu_counter + 1.));
        });
        (mean, var)
    }
}

impl ModuleT for AccuBatchNorm {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        if train {
            return self.normalize(xs, &self.running_mean, &self.running_var, true);
        }
        if self.update_accus.double_value(&[]) > 0. {
            let (mean, var) = self.accumulate(xs);
            return self.normalize(xs, &mean, &var, false);
        }
        let counter = self.accu_counter.double_value(&[]);
        if counter > 0. {
            self.normalize(
                xs,
                &(&self.accu_mean / counter),
                &(&self.accu_var / counter),
                false,
            )
        } else {
            self.normalize(xs, &self.running_mean, &self.running_var, false)
        }
    }
}

/// DCGAN generator, optionally conditioned by a label embedding.
#[derive(Debug)]
pub struct GeneratorNet {
    embed: Option<nn::Embedding>,
    body: nn::SequentialT,
}

pub fn generator(root: &nn::Path, spec: &ModuleSpec) -> GeneratorNet {
    let c = spec.base_channels;
    let (embed, c_in) = match spec.num_classes {
        Some(n) => (
            Some(nn::embedding(root / "embed", n, spec.z_dim, Default::default())),
            spec.z_dim * 2,
        ),
        None => (None, spec.z_dim),
    };
    let body = nn::seq_t()
        .add(tr2d(root / "tr1", c_in, c * 16, 0, 1))
        .add(AccuBatchNorm::new(root / "bn1", c * 16))
        .add_fn(Tensor::relu)
        .add(tr2d(root / "tr2", c * 16, c * 8, 1, 2))
        .add(AccuBatchNorm::new(root / "bn2", c * 8))
        .add_fn(Tensor::relu)
        .add(tr2d(root / "tr3", c * 8, c * 4, 1, 2))
        .add(AccuBatchNorm::new(root / "bn3", c * 4))
        .add_fn(Tensor::relu)
        .add(tr2d(root / "tr4", c * 4, c * 2, 1, 2))
        .add(AccuBatchNorm::new(root / "bn4", c * 2))
        .add_fn(Tensor::relu)
        .add(tr2d(root / "tr5", c * 2, 3, 1, 2))
        .add_fn(Tensor::tanh);
    GeneratorNet { embed, body }
}

impl GeneratorNet {
    fn forward(&self, z: &Tensor, labels: Option<&Tensor>) -> Tensor {
        let z = match (&self.embed, labels) {
            (Some(embed), Some(labels)) => Tensor::cat(&[z, &labels.apply(embed)], 1),
            _ => z.shallow_clone(),
        };
        let n = z.size()[0];
        z.view([n, -1, 1, 1]).apply_t(&self.body, false)
    }
}

/// A generator artifact: `module.json` plus a VarStore weight file.
pub struct GanModule {
    dir: PathBuf,
    spec: ModuleSpec,
    vs: nn::VarStore,
    net: GeneratorNet,
}

impl GanModule {
    /// Freshly initialised module rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>, spec: ModuleSpec, device: Device) -> Self {
        let vs = nn::VarStore::new(device);
        let net = generator(&vs.root(), &spec);
        Self {
            dir: dir.into(),
            spec,
            vs,
            net,
        }
    }

    /// Load the artifact in `dir` for sampling batches of `batch_size`.
    pub fn load(dir: &Path, batch_size: i64, device: Device) -> Result<Self, EvalError> {
        let spec: ModuleSpec = serde_json::from_str(&fs::read_to_string(dir.join(MODULE_FILE))?)?;
        let mut module = Self::new(dir, spec, device);
        module.vs.load(dir.join(&module.spec.weights))?;
        module.vs.freeze();
        tracing::info!(
            module = %dir.display(),
            tags = %format!("gen,bs{}", batch_size),
            "loaded generator, inputs: {:?}",
            module.input_info()
        );
        Ok(module)
    }

    /// Write `module.json` and the weights into the module directory.
    pub fn export(&self) -> Result<(), EvalError> {
        if !self.dir.is_dir() {
            create_dir_all(&self.dir)?;
        }
        fs::write(
            self.dir.join(MODULE_FILE),
            serde_json::to_string_pretty(&self.spec)?,
        )?;
        self.vs.save(self.dir.join(&self.spec.weights))?;
        Ok(())
    }

    pub fn spec(&self) -> &ModuleSpec {
        &self.spec
    }
}

impl Generator for GanModule {
    fn input_info(&self) -> InputInfo {
        InputInfo {
            z_dim: self.spec.z_dim,
            labels: self.net.embed.is_some(),
        }
    }

    fn device(&self) -> Device {
        self.vs.device()
    }

    fn generate(&self, z: &Tensor, labels: Option<&Tensor>) -> Result<Tensor, EvalError> {
        match (self.net.embed.is_some(), labels) {
            (true, None) => Err(EvalError::contract(
                "conditional generator called without labels",
            )),
            (false, Some(_)) => Err(EvalError::contract(
                "unconditional generator has no label input",
            )),
            _ => Ok(tch::no_grad(|| self.net.forward(z, labels))),
        }
    }

    fn accumulator_switches(&self) -> Vec<Tensor> {
        let mut switches = self
            .vs
            .variables()
            .into_iter()
            .filter(|(name, _)| name.contains(ACCU_SWITCH))
            .collect::<Vec<_>>();
        switches.sort_by(|a, b| a.0.cmp(&b.0));
        switches.into_iter().map(|(_, t)| t).collect()
    }

    fn save_checkpoint(&self) -> Result<PathBuf, EvalError> {
        let path = self.dir.join(ACCU_CHECKPOINT);
        self.vs.save(&path)?;
        Ok(path)
    }
}

// Generate a 2D matrix of images from a tensor with multiple images.
pub fn image_matrix(imgs: &Tensor, sz: i64) -> Tensor {
    let imgs = ((imgs + 1.) * 127.5).clamp(0., 255.).to_kind(Kind::Uint8);
    let mut ys = Vec::new();
    for i in 0..sz {
        ys.push(Tensor::cat(
            &(0..sz)
                .map(|j| imgs.narrow(0, sz * i + j, 1))
                .collect::<Vec<_>>(),
            2,
        ));
    }
    Tensor::cat(&ys, 3).squeeze_dim(0)
}
