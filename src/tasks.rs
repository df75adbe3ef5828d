use crate::{dataset::EvalDataSample, error::EvalError, model::image_matrix};
use std::{collections::BTreeMap, fs::create_dir_all, path::PathBuf};
use tch::{Kind, Tensor};

/// Returned in place of a score when a fake image has non-finite values.
pub const NAN_DETECTED: f64 = 31337.0;

/// Metric name to score, for one fake data sample.
pub type TaskResult = BTreeMap<String, f64>;

/// A metric computed from one fake data sample against the real one.
pub trait EvalTask {
    fn name(&self) -> &str;

    fn run(&self, fake: &EvalDataSample, real: &EvalDataSample) -> Result<TaskResult, EvalError>;
}

fn all_finite(t: &Tensor) -> bool {
    t.isfinite().all().to_kind(Kind::Int64).int64_value(&[]) == 1
}

fn mean_cov(x: &Tensor) -> (Tensor, Tensor) {
    let x = x.to_kind(Kind::Double);
    let n = x.size()[0];
    let mu = x.mean_dim(&[0], false, Kind::Double);
    let centered = &x - &mu;
    let cov = centered.transpose(0, 1).matmul(&centered) / (n - 1).max(1) as f64;
    (mu, cov)
}

fn sqrt_psd(m: &Tensor) -> Tensor {
    let (vals, vecs) = m.linalg_eigh("L");
    vecs.matmul(&vals.clamp_min(0.).sqrt().diag(0))
        .matmul(&vecs.transpose(0, 1))
}

/// Fréchet distance between Gaussians fitted to the two activation sets.
pub fn frechet_distance(fake: &Tensor, real: &Tensor) -> f64 {
    let (mu1, sigma1) = mean_cov(fake);
    let (mu2, sigma2) = mean_cov(real);
    let diff = &mu1 - &mu2;
    let s1 = sqrt_psd(&sigma1);
    let cross = sqrt_psd(&s1.matmul(&sigma2).matmul(&s1));
    let score = (&diff * &diff).sum(Kind::Double) + sigma1.trace() + sigma2.trace()
        - cross.trace() * 2.;
    score.double_value(&[])
}

/// `exp(E[KL(p(y|x) || p(y))])` over the softmax of the logits.
pub fn inception_score(logits: &Tensor) -> f64 {
    let p = logits.to_kind(Kind::Double).softmax(-1, Kind::Double);
    let log_p = p.clamp_min(1e-12).log();
    let p_y = p.mean_dim(&[0], true, Kind::Double);
    let kl = (&p * (log_p - p_y.clamp_min(1e-12).log())).sum_dim_intlist(&[1], false, Kind::Double);
    kl.mean(Kind::Double).exp().double_value(&[])
}

/// Fréchet Inception Distance, `fid_score`.
pub struct FidTask;

impl EvalTask for FidTask {
    fn name(&self) -> &str {
        "FID"
    }

    fn run(&self, fake: &EvalDataSample, real: &EvalDataSample) -> Result<TaskResult, EvalError> {
        let fake = &fake.features()?.activations;
        let real = &real.features()?.activations;
        let score = if all_finite(fake) {
            frechet_distance(fake, real)
        } else {
            NAN_DETECTED
        };
        tracing::info!("Frechet Inception Distance: {:.3}", score);
        Ok(BTreeMap::from([(String::from("fid_score"), score)]))
    }
}

/// Inception Score of the fake sample, `inception_score`.
pub struct InceptionScoreTask;

impl EvalTask for InceptionScoreTask {
    fn name(&self) -> &str {
        "IS"
    }

    fn run(&self, fake: &EvalDataSample, _real: &EvalDataSample) -> Result<TaskResult, EvalError> {
        let logits = &fake.features()?.logits;
        let score = if all_finite(logits) {
            inception_score(logits)
        } else {
            NAN_DETECTED
        };
        tracing::info!("Inception Score: {:.3}", score);
        Ok(BTreeMap::from([(String::from("inception_score"), score)]))
    }
}

/// Writes a grid of the first generated images for visual inspection.
pub struct SaveExamples {
    pub dir: PathBuf,
    pub max_examples: i64,
}

impl SaveExamples {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_examples: 64,
        }
    }

    /// Export the grid of `dset`, returning the written file.
    pub fn export(
        &self,
        dset: &EvalDataSample,
        step: &str,
        run: usize,
    ) -> Result<PathBuf, EvalError> {
        let images = dset.images()?;
        let n = images.size()[0].min(self.max_examples);
        let sz = (n as f64).sqrt().floor() as i64;
        if sz == 0 {
            return Err(EvalError::contract("no images to export"));
        }
        if !self.dir.is_dir() {
            create_dir_all(&self.dir)?;
        }
        let path = self.dir.join(format!("step_{}_fake_{}.png", step, run));
        let matrix = image_matrix(&images.to_device(tch::Device::Cpu), sz);
        tch::vision::image::save(&matrix, &path)?;
        Ok(path)
    }
}
