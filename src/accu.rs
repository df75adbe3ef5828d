//! One-shot batch-norm accumulator warm-up.
//!
//! Generators trained with accumulated batch statistics ship with switch
//! variables (`accu.update_accus`). Before sampling, the switches are turned
//! on and the generator is run over many batches so that every batch norm
//! averages its statistics, then the switches are turned off again. This is a
//! compatibility step for such models only; for anything else it is a no-op.
//!
//! The switches belong to the loaded model, so two evaluations must not warm
//! up the same model concurrently.

use crate::error::EvalError;
use tch::Tensor;

const LOG_EVERY: i64 = 500;

#[derive(Debug, PartialEq, Eq)]
pub enum WarmupState {
    Idle,
    Accumulating,
    /// A warm-up step failed; the switches were turned off again.
    Failed,
    /// `updated` is false if the model had no switches.
    Done { updated: bool },
}

pub struct AccuWarmup {
    state: WarmupState,
    num_accu_examples: i64,
}

fn set_switches(switches: &[Tensor], value: f64) {
    tch::no_grad(|| {
        for switch in switches {
            let _ = switch.shallow_clone().fill_(value);
        }
    });
}

impl AccuWarmup {
    pub fn new(num_accu_examples: i64) -> Self {
        Self {
            state: WarmupState::Idle,
            num_accu_examples,
        }
    }

    pub fn state(&self) -> &WarmupState {
        &self.state
    }

    /// Run the warm-up with `step` producing one generator batch.
    ///
    /// Returns `true` if accumulators were updated, in which case the caller
    /// is expected to persist the model.
    pub fn run<F>(
        &mut self,
        switches: Vec<Tensor>,
        batch_size: i64,
        mut step: F,
    ) -> Result<bool, EvalError>
    where
        F: FnMut() -> Result<Tensor, EvalError>,
    {
        if self.state != WarmupState::Idle {
            return Err(EvalError::contract("batch-norm warm-up already ran"));
        }
        tracing::info!("update_accu_switches: {}", switches.len());
        if switches.is_empty() {
            self.state = WarmupState::Done { updated: false };
            return Ok(false);
        }

        if batch_size <= 0 {
            return Err(EvalError::contract(format!(
                "warm-up batch size must be positive, got {}",
                batch_size
            )));
        }
        let num_batches = self.num_accu_examples / batch_size;
        set_switches(&switches, 1.);
        self.state = WarmupState::Accumulating;
        let pb = indicatif::ProgressBar::new(num_batches as u64);
        for i in 0..num_batches {
            if i % LOG_EVERY == 0 {
                tracing::info!("Updating BN accumulators {}/{} steps.", i, num_batches);
            }
            pb.set_position(i as u64);
            if let Err(e) = step() {
                set_switches(&switches, 0.);
                pb.abandon();
                self.state = WarmupState::Failed;
                return Err(e);
            }
        }
        pb.finish_and_clear();
        set_switches(&switches, 0.);
        self.state = WarmupState::Done { updated: true };
        tracing::info!("Done updating BN accumulators.");
        Ok(true)
    }
}
