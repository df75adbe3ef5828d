use tch::{Device, Kind, Tensor};

/// Seed fixed once per evaluation call, before warm-up and sampling.
pub const EVAL_SEED: i64 = 42;

/// Sampling distribution of the latent vectors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ArgEnum)]
pub enum Distribution {
    /// Uniform over `[minval, maxval)`.
    Uniform,
    /// Zero-mean normal with `stddev`.
    Normal,
}

/// Distribution plus every parameter a distribution may ask for.
///
/// A distribution only reads the parameters it understands, the rest are
/// ignored.
#[derive(Clone, Debug, PartialEq)]
pub struct NoiseConfig {
    pub distribution: Distribution,
    pub minval: f64,
    pub maxval: f64,
    pub stddev: f64,
}

impl Default for NoiseConfig {
    fn default() -> Self {
        Self {
            distribution: Distribution::Uniform,
            minval: -1.,
            maxval: 1.,
            stddev: 1.,
        }
    }
}

impl NoiseConfig {
    /// Draw one batch of latent vectors from the libtorch global generator.
    ///
    /// Every call advances the generator, so consecutive runs never share
    /// noise while the whole sequence stays fixed by [`seed`].
    pub fn sample(&self, shape: &[i64], device: Device) -> Tensor {
        match self.distribution {
            Distribution::Uniform => {
                Tensor::rand(shape, (Kind::Float, device)) * (self.maxval - self.minval)
                    + self.minval
            }
            Distribution::Normal => Tensor::randn(shape, (Kind::Float, device)) * self.stddev,
        }
    }
}

/// Reset the libtorch generator to the evaluation seed.
pub fn seed() {
    tch::manual_seed(EVAL_SEED);
}
