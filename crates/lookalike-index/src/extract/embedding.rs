//! Pretrained ResNet-50 embedding extractor.
//!
//! Images are resized to a square input (224x224 by default), scaled to
//! `[0, 1]`, normalized with the ImageNet channel mean/std and run through a
//! frozen ResNet-50 whose classifier head is removed. Global average pooling
//! yields a 2048-wide embedding.

use std::path::Path;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Func, VarBuilder};
use candle_transformers::models::resnet;
use image::DynamicImage;
use image::imageops::FilterType;

use super::{ExtractionError, FeatureExtractor, ImageDecoder, ModelLoadError, Result};
use crate::vector::FeatureVector;

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// ResNet-50 backbone with global average pooling.
pub struct ResNetEmbeddingExtractor {
    model: Func<'static>,
    device: Device,
    input_size: u32,
    decoder: ImageDecoder,
}

impl ResNetEmbeddingExtractor {
    pub const ID: &'static str = "resnet50-avgpool";
    /// Width of the pooled output.
    pub const DIMENSION: usize = 2048;
    pub const DEFAULT_INPUT_SIZE: u32 = 224;

    /// Load backbone weights from a safetensors file.
    ///
    /// Expects the standard torchvision/timm parameter names (`conv1.weight`,
    /// `layer1.0.conv1.weight`, ...). Runs on the CPU.
    pub fn load(weights: &Path, input_size: u32) -> std::result::Result<Self, ModelLoadError> {
        if input_size == 0 {
            return Err(ModelLoadError::InvalidConfig(
                "input size must be non-zero".to_string(),
            ));
        }
        if !weights.is_file() {
            return Err(ModelLoadError::WeightsNotFound(weights.to_path_buf()));
        }

        let device = Device::Cpu;
        // SAFETY: the weights file is memory-mapped read-only and must not be
        // modified while the extractor is alive.
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights], DType::F32, &device)
                .map_err(|e| ModelLoadError::Backbone(format!("{}: {}", weights.display(), e)))?
        };
        let extractor = Self::from_var_builder(vb, device, input_size)?;

        tracing::info!("Loaded ResNet-50 backbone from {}", weights.display());
        Ok(extractor)
    }

    fn from_var_builder(
        vb: VarBuilder<'static>,
        device: Device,
        input_size: u32,
    ) -> std::result::Result<Self, ModelLoadError> {
        let model = resnet::resnet50_no_final_layer(vb)
            .map_err(|e| ModelLoadError::Backbone(e.to_string()))?;

        Ok(Self {
            model,
            device,
            input_size,
            decoder: ImageDecoder::default(),
        })
    }

    pub fn with_decoder(mut self, decoder: ImageDecoder) -> Self {
        self.decoder = decoder;
        self
    }

    pub fn input_size(&self) -> u32 {
        self.input_size
    }

    /// Build the `(1, 3, size, size)` normalized input tensor.
    fn preprocess(&self, image: &DynamicImage) -> candle_core::Result<Tensor> {
        let size = self.input_size as usize;
        let rgb = image
            .resize_exact(self.input_size, self.input_size, FilterType::Triangle)
            .to_rgb8();

        let mean = Tensor::new(&IMAGENET_MEAN, &self.device)?.reshape((3, 1, 1))?;
        let std = Tensor::new(&IMAGENET_STD, &self.device)?.reshape((3, 1, 1))?;

        let pixels = Tensor::from_vec(rgb.into_raw(), (size, size, 3), &self.device)?
            .permute((2, 0, 1))?
            .to_dtype(DType::F32)?;
        let scaled = (pixels / 255.0)?;

        scaled.broadcast_sub(&mean)?.broadcast_div(&std)?.unsqueeze(0)
    }

    fn embed(&self, image: &DynamicImage) -> candle_core::Result<Vec<f32>> {
        let input = self.preprocess(image)?;
        self.model.forward(&input)?.squeeze(0)?.to_vec1::<f32>()
    }
}

impl FeatureExtractor for ResNetEmbeddingExtractor {
    fn id(&self) -> &str {
        Self::ID
    }

    fn dimension(&self) -> usize {
        Self::DIMENSION
    }

    fn decoder(&self) -> &ImageDecoder {
        &self.decoder
    }

    fn extract_image(&self, image: &DynamicImage) -> Result<FeatureVector> {
        if image.width() == 0 || image.height() == 0 {
            return Err(ExtractionError::EmptyImage);
        }
        let values = self
            .embed(image)
            .map_err(|e| ExtractionError::Inference(e.to_string()))?;
        Ok(FeatureVector::new(values))
    }
}
