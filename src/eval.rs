use crate::{
    accu::AccuWarmup,
    aggregate::{aggregate, merge, EvalResults},
    config::EvalConfig,
    dataset::{DatasetProvider, EvalDataSample, FeatureExtractor},
    error::EvalError,
    noise,
    sampler::{executor, Executor, Generator, Sampler},
    tasks::{EvalTask, SaveExamples},
};
use tch::{Kind, Tensor};

/// Generate `num_batches` batches and stack them into one dataset tensor.
fn sample_fake_dataset<G: Generator>(
    sampler: &Sampler<G>,
    num_batches: i64,
) -> Result<Tensor, EvalError> {
    let pb = indicatif::ProgressBar::new(num_batches as u64);
    let mut batches = Vec::with_capacity(num_batches as usize);
    for i in 0..num_batches {
        pb.set_position(i as u64);
        let batch = sampler.sample()?;
        if batch.isfinite().all().to_kind(Kind::Int64).int64_value(&[]) != 1 {
            pb.abandon();
            return Err(EvalError::corruption(format!(
                "generator produced non-finite values in batch {}",
                i
            )));
        }
        batches.push(batch);
    }
    pb.finish_and_clear();
    Ok(Tensor::cat(&batches, 0))
}

/// Draw `num_averaging_runs` fake datasets and compute their features.
///
/// Only the first dataset keeps its raw images, later ones are reduced to
/// their features as soon as those exist.
pub fn sample_fake_datasets<G: Generator, F: FeatureExtractor>(
    sampler: &Sampler<G>,
    executor: &dyn Executor,
    extractor: &F,
    config: &EvalConfig,
    num_test_examples: i64,
) -> Result<Vec<EvalDataSample>, EvalError> {
    let num_batches = config.num_batches(num_test_examples);
    let export = config.examples_dir.as_ref().map(|dir| SaveExamples::new(dir));
    let mut fake_dsets = Vec::with_capacity(config.num_averaging_runs);
    for i in 0..config.num_averaging_runs {
        tracing::info!(
            "Generating fake data set {}/{}.",
            i + 1,
            config.num_averaging_runs
        );
        let images = executor.dispatch(&mut || sample_fake_dataset(sampler, num_batches))?;
        let mut fake_dset = EvalDataSample::new(images);

        if let Some(export) = &export {
            match export.export(&fake_dset, &config.step, i) {
                Ok(path) => tracing::info!("saved examples to {}", path.display()),
                Err(e) => tracing::warn!("failed to save examples of run {}: {}", i, e),
            }
        }

        tracing::info!(
            "Computing inception features for generated data {}/{}.",
            i + 1,
            config.num_averaging_runs
        );
        let features = extractor.transform(fake_dset.images()?, config.eval_batch_size)?;
        fake_dset.set_features(features)?;
        fake_dset.set_num_examples(num_test_examples)?;
        if i != 0 {
            fake_dset.discard_images()?;
        }
        fake_dsets.push(fake_dset);
    }
    Ok(fake_dsets)
}

/// Real dataset with its features, built once per evaluation.
pub fn real_dataset<D: DatasetProvider, F: FeatureExtractor>(
    dataset: &D,
    extractor: &F,
    num_test_examples: i64,
    batch_size: i64,
) -> Result<EvalDataSample, EvalError> {
    let mut real_dset = EvalDataSample::new(dataset.real_images(num_test_examples)?);
    tracing::info!("Getting Inception features for real images.");
    let features = extractor.transform(real_dset.images()?, batch_size)?;
    real_dset.set_features(features)?;
    real_dset.set_num_examples(num_test_examples)?;
    Ok(real_dset)
}

/// Run every task on every fake dataset and aggregate per task.
pub fn run_tasks(
    tasks: &[Box<dyn EvalTask>],
    fake_dsets: &[EvalDataSample],
    real_dset: &EvalDataSample,
) -> Result<EvalResults, EvalError> {
    let mut results = EvalResults::new();
    for task in tasks {
        let runs = fake_dsets
            .iter()
            .map(|fake| task.run(fake, real_dset))
            .collect::<Result<Vec<_>, _>>()?;
        let stats = aggregate(&runs)?;
        tracing::info!("Computed results for task {}: {:?}", task.name(), stats);
        merge(&mut results, stats)?;
    }
    Ok(results)
}

/// Evaluate `generator` against `dataset`.
///
/// Returns `Ok(None)` if `tasks` is empty.
pub fn evaluate<G, D, F>(
    generator: G,
    dataset: &D,
    extractor: &F,
    tasks: &[Box<dyn EvalTask>],
    config: &EvalConfig,
) -> Result<Option<EvalResults>, EvalError>
where
    G: Generator,
    D: DatasetProvider,
    F: FeatureExtractor,
{
    let num_test_examples = dataset.eval_test_samples();
    config.validate(num_test_examples)?;
    // Same latent vectors for every evaluation of the same configuration.
    noise::seed();
    let sampler = Sampler::new(generator, config, dataset.num_classes())?;
    let executor = executor(config.distributed);

    let mut warmup = AccuWarmup::new(config.num_accu_examples);
    let switches = sampler.generator().accumulator_switches();
    if warmup.run(switches, sampler.batch_size(), || sampler.sample())? {
        let path = sampler.generator().save_checkpoint()?;
        tracing::info!(
            "Exported generator with accumulated batch stats to {}.",
            path.display()
        );
    }
    tracing::debug!("batch-norm warm-up: {:?}", warmup.state());
    if tasks.is_empty() {
        tracing::error!("Task list is empty, returning.");
        return Ok(None);
    }

    let fake_dsets =
        sample_fake_datasets(&sampler, executor.as_ref(), extractor, config, num_test_examples)?;
    let real_dset = real_dataset(dataset, extractor, num_test_examples, config.eval_batch_size)?;
    tracing::info!(
        "evaluating {} fake data sets against {:?} real examples",
        fake_dsets.len(),
        real_dset.num_examples()
    );
    run_tasks(tasks, &fake_dsets, &real_dset).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        aggregate::MetricValue,
        dataset::tests::{FixedDataset, FlattenExtractor},
        noise::tests::rng_lock,
        sampler::tests::MockGenerator,
        tasks::TaskResult,
    };
    use std::cell::Cell;
    use tch::Device;

    /// Reports the mean activation of the fake sample.
    struct MeanTask {
        key: &'static str,
    }

    impl MeanTask {
        fn boxed(key: &'static str) -> Box<dyn EvalTask> {
            Box::new(Self { key })
        }
    }

    impl EvalTask for MeanTask {
        fn name(&self) -> &str {
            self.key
        }

        fn run(
            &self,
            fake: &EvalDataSample,
            real: &EvalDataSample,
        ) -> Result<TaskResult, EvalError> {
            assert!(real.images().is_ok());
            let mean = fake.features()?.activations.mean(Kind::Double).double_value(&[]);
            Ok(TaskResult::from([(self.key.to_string(), mean)]))
        }
    }

    fn dataset(n: i64, num_classes: Option<i64>) -> FixedDataset {
        FixedDataset {
            images: Tensor::zeros(&[n, 1, 2, 2], (Kind::Float, Device::Cpu)),
            num_classes,
            requests: Cell::new(0),
        }
    }

    fn sampler<'a>(gen: &'a MockGenerator, config: &EvalConfig) -> Sampler<&'a MockGenerator> {
        Sampler::new(gen, config, Some(10)).unwrap()
    }

    #[test]
    fn covers_test_examples_with_ceil_batches() {
        let _guard = rng_lock();
        let gen = MockGenerator::new(false);
        let config = EvalConfig::default();
        let fakes = sample_fake_datasets(
            &sampler(&gen, &config),
            &crate::sampler::LocalExecutor,
            &FlattenExtractor,
            &config,
            1000,
        )
        .unwrap();
        assert_eq!(gen.calls.get(), 16);
        assert_eq!(fakes.len(), 1);
        assert_eq!(fakes[0].num_examples(), Some(1000));
        assert_eq!(fakes[0].images().unwrap().size()[0], 1000);
        assert_eq!(fakes[0].features().unwrap().activations.size(), vec![1000, 4]);
    }

    /// Counts dispatched units and the generator calls made inside each.
    struct CountingExecutor<'a> {
        gen: &'a MockGenerator,
        calls_per_dispatch: std::cell::RefCell<Vec<usize>>,
    }

    impl Executor for CountingExecutor<'_> {
        fn dispatch(
            &self,
            step: &mut dyn FnMut() -> Result<Tensor, EvalError>,
        ) -> Result<Tensor, EvalError> {
            let before = self.gen.calls.get();
            let out = step()?;
            self.calls_per_dispatch
                .borrow_mut()
                .push(self.gen.calls.get() - before);
            Ok(out)
        }
    }

    #[test]
    fn each_run_is_dispatched_as_one_unit() {
        let _guard = rng_lock();
        let gen = MockGenerator::new(false);
        let config = EvalConfig {
            eval_batch_size: 8,
            num_averaging_runs: 3,
            ..Default::default()
        };
        let exec = CountingExecutor {
            gen: &gen,
            calls_per_dispatch: Default::default(),
        };
        let fakes = sample_fake_datasets(
            &sampler(&gen, &config),
            &exec,
            &FlattenExtractor,
            &config,
            20,
        )
        .unwrap();
        assert_eq!(fakes.len(), 3);
        assert_eq!(*exec.calls_per_dispatch.borrow(), vec![3, 3, 3]);
        assert_eq!(gen.calls.get(), 9);
    }

    #[test]
    fn invalid_sizes_fail_before_sampling() {
        let _guard = rng_lock();
        let gen = MockGenerator::new(false).with_switches(1);
        let zero_batch = EvalConfig {
            eval_batch_size: 0,
            ..Default::default()
        };
        let tasks = [MeanTask::boxed("mean")];
        let err = evaluate(&gen, &dataset(8, None), &FlattenExtractor, &tasks, &zero_batch)
            .unwrap_err();
        assert!(matches!(err, EvalError::ContractViolation(_)));

        let empty = dataset(0, None);
        let err = evaluate(&gen, &empty, &FlattenExtractor, &tasks, &EvalConfig::default())
            .unwrap_err();
        assert!(matches!(err, EvalError::ContractViolation(_)));
        assert_eq!(gen.calls.get(), 0);
        assert_eq!(empty.requests.get(), 0);
    }

    #[test]
    fn later_runs_release_images() {
        let _guard = rng_lock();
        let gen = MockGenerator::new(false);
        let config = EvalConfig {
            eval_batch_size: 8,
            num_averaging_runs: 3,
            ..Default::default()
        };
        let fakes = sample_fake_datasets(
            &sampler(&gen, &config),
            &crate::sampler::LocalExecutor,
            &FlattenExtractor,
            &config,
            20,
        )
        .unwrap();
        assert_eq!(gen.calls.get(), 9);
        assert!(fakes[0].images().is_ok());
        for fake in &fakes[1..] {
            assert!(matches!(fake.images(), Err(EvalError::ImagesDiscarded)));
            assert_eq!(fake.features().unwrap().activations.size(), vec![20, 4]);
        }
        let first = &fakes[0].features().unwrap().activations;
        let second = &fakes[1].features().unwrap().activations;
        assert!(!first.equal(second));
    }

    #[test]
    fn corrupted_output_aborts() {
        let _guard = rng_lock();
        let mut gen = MockGenerator::new(false);
        gen.poison = true;
        let config = EvalConfig {
            eval_batch_size: 4,
            ..Default::default()
        };
        let err = evaluate(
            &gen,
            &dataset(8, None),
            &FlattenExtractor,
            &[MeanTask::boxed("mean")],
            &config,
        )
        .unwrap_err();
        assert!(matches!(err, EvalError::NumericCorruption { .. }));
    }

    #[test]
    fn export_failure_does_not_abort() {
        let _guard = rng_lock();
        let blocker = tempfile::NamedTempFile::new().unwrap();
        let gen = MockGenerator::new(false);
        let config = EvalConfig {
            eval_batch_size: 4,
            // A regular file cannot host the examples directory.
            examples_dir: Some(blocker.path().join("examples")),
            ..Default::default()
        };
        let results = evaluate(
            &gen,
            &dataset(8, None),
            &FlattenExtractor,
            &[MeanTask::boxed("mean")],
            &config,
        )
        .unwrap();
        assert!(results.is_some());
    }

    #[test]
    fn empty_task_set_returns_nothing() {
        let _guard = rng_lock();
        let gen = MockGenerator::new(false);
        let data = dataset(8, None);
        let config = EvalConfig::default();
        let results = evaluate(&gen, &data, &FlattenExtractor, &[], &config).unwrap();
        assert!(results.is_none());
        assert_eq!(gen.calls.get(), 0);
        assert_eq!(data.requests.get(), 0);
    }

    #[test]
    fn force_label_on_unconditional_model_fails_first() {
        let _guard = rng_lock();
        let gen = MockGenerator::new(false).with_switches(1);
        let config = EvalConfig {
            force_label: Some(1),
            ..Default::default()
        };
        let err = evaluate(
            &gen,
            &dataset(8, Some(10)),
            &FlattenExtractor,
            &[MeanTask::boxed("mean")],
            &config,
        )
        .unwrap_err();
        assert!(matches!(err, EvalError::ContractViolation(_)));
        assert_eq!(gen.calls.get(), 0);
        assert_eq!(gen.saved.get(), 0);
    }

    #[test]
    fn warm_up_persists_checkpoint_once() {
        let _guard = rng_lock();
        let gen = MockGenerator::new(true).with_switches(2);
        let config = EvalConfig {
            eval_batch_size: 4,
            num_accu_examples: 40,
            ..Default::default()
        };
        evaluate(
            &gen,
            &dataset(8, Some(3)),
            &FlattenExtractor,
            &[MeanTask::boxed("mean")],
            &config,
        )
        .unwrap();
        assert_eq!(gen.saved.get(), 1);
        assert_eq!(gen.calls_with_switches_on.get(), 10);
        assert_eq!(gen.calls.get(), 10 + 2);
    }

    #[test]
    fn identical_configs_reproduce_results() {
        let _guard = rng_lock();
        let config = EvalConfig {
            eval_batch_size: 16,
            num_averaging_runs: 3,
            ..Default::default()
        };
        let data = dataset(50, Some(5));
        let run = || {
            let gen = MockGenerator::new(true);
            let tasks = [MeanTask::boxed("mean"), MeanTask::boxed("other")];
            evaluate(&gen, &data, &FlattenExtractor, &tasks, &config)
                .unwrap()
                .unwrap()
        };
        let a = run();
        let b = run();
        assert_eq!(a, b);
        assert_eq!(a.len(), 6);
        match &a["mean_list"] {
            MetricValue::Text(list) => assert_eq!(list.split('_').count(), 3),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(a["mean_std"], MetricValue::Float(std) if std > 0.));
    }

    #[test]
    fn colliding_task_keys_are_rejected() {
        let _guard = rng_lock();
        let gen = MockGenerator::new(false);
        let config = EvalConfig {
            eval_batch_size: 4,
            ..Default::default()
        };
        let tasks = [MeanTask::boxed("mean"), MeanTask::boxed("mean")];
        let err = evaluate(&gen, &dataset(8, None), &FlattenExtractor, &tasks, &config)
            .unwrap_err();
        assert!(matches!(err, EvalError::DuplicateMetric(_)));
    }
}
