use crate::error::EvalError;
use std::{mem, path::PathBuf};
use tch::{CModule, Device, IValue, Kind, Tensor};

/// Perceptual features of a data sample, one row per example.
#[derive(Debug)]
pub struct FeatureSet {
    pub activations: Tensor,
    pub logits: Tensor,
}

impl FeatureSet {
    fn truncate(&self, n: i64) -> Self {
        Self {
            activations: self.activations.narrow(0, 0, n),
            logits: self.logits.narrow(0, 0, n),
        }
    }
}

#[derive(Debug)]
enum Contents {
    Images(Tensor),
    ImagesAndFeatures(Tensor, FeatureSet),
    FeaturesOnly(FeatureSet),
}

/// Images of one dataset and, once computed, their features.
///
/// Discarding the images moves the sample into a features-only state; the
/// pixels cannot be recovered afterwards.
#[derive(Debug)]
pub struct EvalDataSample {
    contents: Contents,
    num_examples: Option<i64>,
}

impl EvalDataSample {
    pub fn new(images: Tensor) -> Self {
        Self {
            contents: Contents::Images(images),
            num_examples: None,
        }
    }

    pub fn images(&self) -> Result<&Tensor, EvalError> {
        match &self.contents {
            Contents::Images(images) | Contents::ImagesAndFeatures(images, _) => Ok(images),
            Contents::FeaturesOnly(_) => Err(EvalError::ImagesDiscarded),
        }
    }

    pub fn features(&self) -> Result<&FeatureSet, EvalError> {
        match &self.contents {
            Contents::ImagesAndFeatures(_, features) | Contents::FeaturesOnly(features) => {
                Ok(features)
            }
            Contents::Images(_) => Err(EvalError::MissingFeatures),
        }
    }

    pub fn set_features(&mut self, features: FeatureSet) -> Result<(), EvalError> {
        let images = self.images()?.shallow_clone();
        self.contents = Contents::ImagesAndFeatures(images, features);
        Ok(())
    }

    /// Declared example count, `None` until set.
    pub fn num_examples(&self) -> Option<i64> {
        self.num_examples
    }

    fn rows(&self) -> i64 {
        match &self.contents {
            Contents::Images(images) | Contents::ImagesAndFeatures(images, _) => images.size()[0],
            Contents::FeaturesOnly(features) => features.activations.size()[0],
        }
    }

    /// Declare the example count and drop everything past it.
    ///
    /// Fails if the sample holds fewer than `n` examples.
    pub fn set_num_examples(&mut self, n: i64) -> Result<(), EvalError> {
        let available = self.rows();
        if n > available {
            return Err(EvalError::NotEnoughExamples {
                available,
                requested: n,
            });
        }
        self.contents = match &self.contents {
            Contents::Images(images) => Contents::Images(images.narrow(0, 0, n)),
            Contents::ImagesAndFeatures(images, features) => {
                Contents::ImagesAndFeatures(images.narrow(0, 0, n), features.truncate(n))
            }
            Contents::FeaturesOnly(features) => Contents::FeaturesOnly(features.truncate(n)),
        };
        self.num_examples = Some(n);
        Ok(())
    }

    /// Release the raw images, keeping the features.
    pub fn discard_images(&mut self) -> Result<(), EvalError> {
        let contents = mem::replace(&mut self.contents, Contents::Images(Tensor::new()));
        let (contents, result) = match contents {
            Contents::ImagesAndFeatures(_, features) | Contents::FeaturesOnly(features) => {
                (Contents::FeaturesOnly(features), Ok(()))
            }
            Contents::Images(images) => (Contents::Images(images), Err(EvalError::MissingFeatures)),
        };
        self.contents = contents;
        result
    }
}

/// Ground-truth data source.
pub trait DatasetProvider {
    /// Class count, present for labelled datasets.
    fn num_classes(&self) -> Option<i64>;

    fn eval_test_samples(&self) -> i64;

    /// First `num_examples` real images, scaled to `[-1, 1]`.
    fn real_images(&self, num_examples: i64) -> Result<Tensor, EvalError>;
}

/// Real images read from a directory of image files.
pub struct ImageDirDataset {
    pub dir: PathBuf,
    pub image_size: i64,
    pub num_classes: Option<i64>,
    pub eval_test_samples: i64,
}

impl DatasetProvider for ImageDirDataset {
    fn num_classes(&self) -> Option<i64> {
        self.num_classes
    }

    fn eval_test_samples(&self) -> i64 {
        self.eval_test_samples
    }

    fn real_images(&self, num_examples: i64) -> Result<Tensor, EvalError> {
        let images = tch::vision::image::load_dir(&self.dir, self.image_size, self.image_size)?;
        tracing::info!("loaded real images: {:?}", images.size());
        let available = images.size()[0];
        if available < num_examples {
            return Err(EvalError::NotEnoughExamples {
                available,
                requested: num_examples,
            });
        }
        Ok(images
            .narrow(0, 0, num_examples)
            .to_kind(Kind::Float)
            / 127.5
            - 1.)
    }
}

/// Batched transform from images to perceptual features.
pub trait FeatureExtractor {
    fn transform(&self, images: &Tensor, batch_size: i64) -> Result<FeatureSet, EvalError>;
}

/// TorchScript Inception export returning `(activations, logits)`.
pub struct InceptionExtractor {
    module: CModule,
    device: Device,
}

impl InceptionExtractor {
    pub fn load(path: impl AsRef<std::path::Path>, device: Device) -> Result<Self, EvalError> {
        let module = CModule::load_on_device(path, device)?;
        Ok(Self { module, device })
    }
}

impl FeatureExtractor for InceptionExtractor {
    fn transform(&self, images: &Tensor, batch_size: i64) -> Result<FeatureSet, EvalError> {
        if batch_size <= 0 || images.size()[0] == 0 {
            return Err(EvalError::contract(format!(
                "cannot extract features of {} images in batches of {}",
                images.size()[0],
                batch_size
            )));
        }
        let mut activations = Vec::new();
        let mut logits = Vec::new();
        for batch in images.split(batch_size, 0) {
            let out = tch::no_grad(|| {
                self.module
                    .forward_is(&[IValue::Tensor(batch.to_device(self.device))])
            })?;
            match out {
                IValue::Tuple(mut outs) if outs.len() == 2 => {
                    match (outs.pop(), outs.pop()) {
                        (Some(IValue::Tensor(l)), Some(IValue::Tensor(a))) => {
                            activations.push(a.to_device(Device::Cpu));
                            logits.push(l.to_device(Device::Cpu));
                        }
                        _ => {
                            return Err(EvalError::contract(
                                "feature extractor must return two tensors",
                            ))
                        }
                    }
                }
                _ => {
                    return Err(EvalError::contract(
                        "feature extractor must return (activations, logits)",
                    ))
                }
            }
        }
        Ok(FeatureSet {
            activations: Tensor::cat(&activations, 0),
            logits: Tensor::cat(&logits, 0),
        })
    }
}
