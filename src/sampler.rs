use crate::{config::EvalConfig, error::EvalError, noise::NoiseConfig};
use std::path::PathBuf;
use tch::{Device, Kind, Tensor};

/// Declared inputs of a generator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InputInfo {
    pub z_dim: i64,
    /// Whether the generator takes a class label input.
    pub labels: bool,
}

/// A pre-trained generative model.
pub trait Generator {
    fn input_info(&self) -> InputInfo;

    fn device(&self) -> Device;

    /// One forward pass. `labels` must be given exactly when the model is
    /// conditional.
    fn generate(&self, z: &Tensor, labels: Option<&Tensor>) -> Result<Tensor, EvalError>;

    /// Batch-norm accumulator switches, empty if the model has none.
    fn accumulator_switches(&self) -> Vec<Tensor>;

    /// Persist the current model state next to the artifact.
    fn save_checkpoint(&self) -> Result<PathBuf, EvalError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Labels {
    Unconditional,
    Uniform(i64),
    Forced(i64),
}

/// Uniform call contract over a [`Generator`]: noise in, one batch out.
pub struct Sampler<G> {
    generator: G,
    noise: NoiseConfig,
    batch_size: i64,
    z_dim: i64,
    labels: Labels,
}

impl<G: Generator> Sampler<G> {
    /// Check the model schema against the configuration.
    ///
    /// Fails before any sampling if a forced label targets an unconditional
    /// model, or a conditional model comes without a class count.
    pub fn new(
        generator: G,
        config: &EvalConfig,
        num_classes: Option<i64>,
    ) -> Result<Self, EvalError> {
        let info = generator.input_info();
        let labels = match (info.labels, config.force_label) {
            (false, Some(label)) => {
                return Err(EvalError::contract(format!(
                    "force_label={} requires a conditional generator",
                    label
                )))
            }
            (false, None) => Labels::Unconditional,
            (true, force_label) => {
                let num_classes = num_classes.ok_or_else(|| {
                    EvalError::contract("conditional generator but dataset has no num_classes")
                })?;
                match force_label {
                    Some(label) if !(0..num_classes).contains(&label) => {
                        return Err(EvalError::contract(format!(
                            "force_label={} outside of {} classes",
                            label, num_classes
                        )))
                    }
                    Some(label) => Labels::Forced(label),
                    None => Labels::Uniform(num_classes),
                }
            }
        };
        Ok(Self {
            generator,
            noise: config.noise.clone(),
            batch_size: config.eval_batch_size,
            z_dim: info.z_dim,
            labels,
        })
    }

    pub fn generator(&self) -> &G {
        &self.generator
    }

    pub fn batch_size(&self) -> i64 {
        self.batch_size
    }

    /// Generate one batch from fresh noise.
    pub fn sample(&self) -> Result<Tensor, EvalError> {
        let device = self.generator.device();
        let z = self.noise.sample(&[self.batch_size, self.z_dim], device);
        let labels = match self.labels {
            Labels::Unconditional => None,
            Labels::Uniform(num_classes) => Some(Tensor::randint(
                num_classes,
                &[self.batch_size],
                (Kind::Int64, device),
            )),
            Labels::Forced(label) => {
                Some(Tensor::full(&[self.batch_size], label, (Kind::Int64, device)))
            }
        };
        self.generator.generate(&z, labels.as_ref())
    }
}

/// Execution context of a whole sampling step.
///
/// The orchestrator hands over the complete step and blocks until it is
/// done; per-batch scheduling stays inside the executor.
pub trait Executor {
    fn dispatch(
        &self,
        step: &mut dyn FnMut() -> Result<Tensor, EvalError>,
    ) -> Result<Tensor, EvalError>;
}

/// Runs the step in place.
pub struct LocalExecutor;

impl Executor for LocalExecutor {
    fn dispatch(
        &self,
        step: &mut dyn FnMut() -> Result<Tensor, EvalError>,
    ) -> Result<Tensor, EvalError> {
        tch::no_grad(step)
    }
}

/// Runs the step as one unit on the accelerator the generator lives on and
/// hands the result back on the host.
pub struct DeviceExecutor;

impl Executor for DeviceExecutor {
    fn dispatch(
        &self,
        step: &mut dyn FnMut() -> Result<Tensor, EvalError>,
    ) -> Result<Tensor, EvalError> {
        let out = tch::no_grad(step)?;
        tracing::debug!("sampling step finished on {:?}", out.device());
        Ok(out.to_device(Device::Cpu))
    }
}

/// Executor selected by the `distributed` flag.
pub fn executor(distributed: bool) -> Box<dyn Executor> {
    if distributed {
        tracing::info!("dispatching sampling runs to {:?}", Device::cuda_if_available());
        Box::new(DeviceExecutor)
    } else {
        Box::new(LocalExecutor)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::noise::tests::rng_lock;
    use std::cell::{Cell, RefCell};

    /// Reshapes `z` into 2x2 images and records every call.
    pub(crate) struct MockGenerator {
        pub(crate) info: InputInfo,
        pub(crate) calls: Cell<usize>,
        pub(crate) switches: Vec<Tensor>,
        pub(crate) calls_with_switches_on: Cell<usize>,
        pub(crate) saved: Cell<usize>,
        pub(crate) labels_seen: RefCell<Vec<i64>>,
        pub(crate) poison: bool,
    }

    impl MockGenerator {
        pub(crate) fn new(labels: bool) -> Self {
            Self {
                info: InputInfo { z_dim: 4, labels },
                calls: Cell::new(0),
                switches: Vec::new(),
                calls_with_switches_on: Cell::new(0),
                saved: Cell::new(0),
                labels_seen: RefCell::new(Vec::new()),
                poison: false,
            }
        }

        pub(crate) fn with_switches(mut self, n: usize) -> Self {
            self.switches = (0..n)
                .map(|_| Tensor::zeros(&[], (Kind::Float, Device::Cpu)))
                .collect();
            self
        }
    }

    impl Generator for &MockGenerator {
        fn input_info(&self) -> InputInfo {
            self.info
        }

        fn device(&self) -> Device {
            Device::Cpu
        }

        fn generate(&self, z: &Tensor, labels: Option<&Tensor>) -> Result<Tensor, EvalError> {
            if labels.is_some() != self.info.labels {
                return Err(EvalError::contract("label input mismatch"));
            }
            self.calls.set(self.calls.get() + 1);
            if self
                .switches
                .iter()
                .any(|s| s.double_value(&[]) > 0.)
            {
                self.calls_with_switches_on
                    .set(self.calls_with_switches_on.get() + 1);
            }
            if let Some(labels) = labels {
                self.labels_seen
                    .borrow_mut()
                    .extend(Vec::<i64>::from(labels));
            }
            let imgs = z.view([-1, 1, 2, 2]);
            if self.poison {
                Ok(imgs / 0.)
            } else {
                Ok(imgs)
            }
        }

        fn accumulator_switches(&self) -> Vec<Tensor> {
            self.switches.iter().map(Tensor::shallow_clone).collect()
        }

        fn save_checkpoint(&self) -> Result<PathBuf, EvalError> {
            self.saved.set(self.saved.get() + 1);
            Ok(PathBuf::from("mock-with-accu.ot"))
        }
    }

    #[test]
    fn force_label_on_unconditional_fails_before_sampling() {
        let gen = MockGenerator::new(false);
        let config = EvalConfig {
            force_label: Some(3),
            ..Default::default()
        };
        let err = Sampler::new(&gen, &config, Some(10)).err().unwrap();
        assert!(matches!(err, EvalError::ContractViolation(_)));
        assert_eq!(gen.calls.get(), 0);
    }

    #[test]
    fn conditional_requires_class_count() {
        let gen = MockGenerator::new(true);
        let err = Sampler::new(&gen, &EvalConfig::default(), None).err().unwrap();
        assert!(matches!(err, EvalError::ContractViolation(_)));
    }

    #[test]
    fn forced_label_out_of_range() {
        let gen = MockGenerator::new(true);
        let config = EvalConfig {
            force_label: Some(10),
            ..Default::default()
        };
        assert!(Sampler::new(&gen, &config, Some(10)).is_err());
    }

    #[test]
    fn forced_label_pins_every_sample() {
        let _guard = rng_lock();
        let gen = MockGenerator::new(true);
        let config = EvalConfig {
            eval_batch_size: 8,
            force_label: Some(7),
            ..Default::default()
        };
        let sampler = Sampler::new(&gen, &config, Some(10)).unwrap();
        let imgs = sampler.sample().unwrap();
        assert_eq!(imgs.size(), vec![8, 1, 2, 2]);
        assert_eq!(*gen.labels_seen.borrow(), vec![7; 8]);
    }

    #[test]
    fn uniform_labels_stay_in_range() {
        let _guard = rng_lock();
        let gen = MockGenerator::new(true);
        let config = EvalConfig {
            eval_batch_size: 256,
            ..Default::default()
        };
        let sampler = Sampler::new(&gen, &config, Some(3)).unwrap();
        sampler.sample().unwrap();
        let seen = gen.labels_seen.borrow();
        assert_eq!(seen.len(), 256);
        assert!(seen.iter().all(|l| (0..3).contains(l)));
        assert!((0..3).all(|c| seen.contains(&c)));
    }

    #[test]
    fn executors_return_host_tensors() {
        let mut step = || Ok::<_, EvalError>(Tensor::ones(&[2, 2], (Kind::Float, Device::Cpu)));
        for exec in [executor(false), executor(true)] {
            let out = exec.dispatch(&mut step).unwrap();
            assert_eq!(out.device(), Device::Cpu);
            assert_eq!(out.size(), vec![2, 2]);
        }
    }
}
