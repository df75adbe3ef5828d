use crate::{error::EvalError, noise::NoiseConfig};
use std::path::PathBuf;

/// Examples pushed through the generator during the batch-norm warm-up.
pub const NUM_ACCU_EXAMPLES: i64 = 204_800;

/// Options of one evaluation call.
#[derive(Clone, Debug)]
pub struct EvalConfig {
    pub eval_batch_size: i64,
    /// Pin every generated sample to one class. Conditional models only.
    pub force_label: Option<i64>,
    pub noise: NoiseConfig,
    pub num_averaging_runs: usize,
    /// Dispatch sampling through the accelerator executor.
    pub distributed: bool,
    pub num_accu_examples: i64,
    /// Where the save-examples export writes; disabled when `None`.
    pub examples_dir: Option<PathBuf>,
    /// Name of the evaluated step, used to tag exported examples.
    pub step: String,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            eval_batch_size: 64,
            force_label: None,
            noise: NoiseConfig::default(),
            num_averaging_runs: 1,
            distributed: false,
            num_accu_examples: NUM_ACCU_EXAMPLES,
            examples_dir: None,
            step: String::from("0"),
        }
    }
}

impl EvalConfig {
    /// Reject sizes the pipeline cannot work with.
    pub fn validate(&self, num_test_examples: i64) -> Result<(), EvalError> {
        if self.eval_batch_size <= 0 {
            return Err(EvalError::contract(format!(
                "eval_batch_size must be positive, got {}",
                self.eval_batch_size
            )));
        }
        if num_test_examples <= 0 {
            return Err(EvalError::contract(format!(
                "eval_test_samples must be positive, got {}",
                num_test_examples
            )));
        }
        if self.num_averaging_runs == 0 {
            return Err(EvalError::contract("num_averaging_runs must be at least 1"));
        }
        if self.num_accu_examples < 0 {
            return Err(EvalError::contract(format!(
                "num_accu_examples must not be negative, got {}",
                self.num_accu_examples
            )));
        }
        Ok(())
    }

    /// Batches needed to cover `num_examples`, rounding up.
    pub fn num_batches(&self, num_examples: i64) -> i64 {
        (num_examples + self.eval_batch_size - 1) / self.eval_batch_size
    }
}
