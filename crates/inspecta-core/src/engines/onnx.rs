//! In-process ONNX classifier engine.
//!
//! The engine owns the judgment logic; inference itself sits behind
//! [`InferenceBackend`]. With the `onnx-runtime` feature an ONNX Runtime
//! backend is constructed from the manifest's `modelPath`.

use crate::algorithm::{
    AlgorithmEngine, AlgorithmInput, AlgorithmMeasurement, AlgorithmResult, ImageKeys,
    MeasurementLimits,
};
use crate::cancel::CancellationToken;
use crate::error::{InspectaError, Result};
use crate::plugins::{EngineFactory, EngineKinds, EngineManifest, FactoryContext};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Runs a classifier on one decoded image.
pub trait InferenceBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Per-class scores. Blocking.
    fn classify(&self, image: &image::DynamicImage) -> Result<Vec<f32>>;
}

/// Builds a backend for a model file.
pub type BackendLoader = Arc<dyn Fn(&Path, &EngineManifest) -> Result<Arc<dyn InferenceBackend>> + Send + Sync>;

pub struct OnnxEngine {
    id: String,
    name: String,
    version: String,
    model_path: PathBuf,
    model_present: bool,
    backend: Option<Arc<dyn InferenceBackend>>,
    labels: Vec<String>,
    ok_label: String,
    min_confidence: f64,
    image_key: String,
}

impl OnnxEngine {
    pub const CONFIDENCE: &'static str = "Confidence";
    pub const DEFAULT_OK_LABEL: &'static str = "OK";
    pub const DEFAULT_MIN_CONFIDENCE: f64 = 0.5;

    pub fn new(id: impl Into<String>, version: impl Into<String>, model_path: impl Into<PathBuf>) -> Self {
        let model_path = model_path.into();
        Self {
            id: id.into(),
            name: "ONNX classifier".to_string(),
            version: version.into(),
            model_present: model_path.is_file(),
            model_path,
            backend: None,
            labels: Vec::new(),
            ok_label: Self::DEFAULT_OK_LABEL.to_string(),
            min_confidence: Self::DEFAULT_MIN_CONFIDENCE,
            image_key: ImageKeys::GRAY.to_string(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_backend(mut self, backend: Arc<dyn InferenceBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_ok_label(mut self, label: impl Into<String>) -> Self {
        self.ok_label = label.into();
        self
    }

    pub fn with_min_confidence(mut self, min_confidence: f64) -> Self {
        self.min_confidence = min_confidence;
        self
    }

    pub fn with_image_key(mut self, key: impl Into<String>) -> Self {
        self.image_key = key.into();
        self
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    fn failed(&self, message: impl Into<String>) -> AlgorithmResult {
        AlgorithmResult::failed(&self.id, message).with_version(&self.version)
    }

    fn label_for(&self, index: usize) -> String {
        self.labels
            .get(index)
            .cloned()
            .unwrap_or_else(|| format!("class{}", index))
    }

    fn unavailable_reason(&self) -> String {
        if self.backend.is_none() {
            "no inference backend attached".to_string()
        } else {
            format!("model file not found: {}", self.model_path.display())
        }
    }
}

/// Index and score of the best class. NaN scores never win.
fn argmax(scores: &[f32]) -> Option<(usize, f32)> {
    scores
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, s)| !s.is_nan())
        .fold(None, |best, (i, s)| match best {
            Some((_, b)) if b >= s => best,
            _ => Some((i, s)),
        })
}

#[async_trait]
impl AlgorithmEngine for OnnxEngine {
    fn engine_id(&self) -> &str {
        &self.id
    }

    fn engine_name(&self) -> &str {
        &self.name
    }

    fn engine_version(&self) -> &str {
        &self.version
    }

    fn is_available(&self) -> bool {
        self.model_present && self.backend.is_some()
    }

    async fn execute(&self, input: &AlgorithmInput, cancel: &CancellationToken) -> AlgorithmResult {
        let started = Instant::now();
        let Some(backend) = self.backend.clone().filter(|_| self.model_present) else {
            return AlgorithmResult::not_available(&self.id, self.unavailable_reason())
                .with_version(&self.version);
        };
        if cancel.is_cancelled() {
            return self.failed("cancelled");
        }
        let Some(path) = input.image_path(&self.image_key) else {
            return self.failed(format!("input has no '{}' image", self.image_key));
        };

        let scores = tokio::task::spawn_blocking(move || -> Result<Vec<f32>> {
            let image = image::open(&path).map_err(|e| InspectaError::Validation {
                field: "image".to_string(),
                message: format!("cannot decode {}: {}", path.display(), e),
            })?;
            backend.classify(&image)
        })
        .await;
        let scores = match scores {
            Ok(Ok(scores)) => scores,
            Ok(Err(e)) => return self.failed(e.to_string()),
            Err(e) => return self.failed(format!("inference aborted: {}", e)),
        };

        if cancel.is_cancelled() {
            return self.failed("cancelled");
        }
        let Some((index, score)) = argmax(&scores) else {
            return self.failed("model produced no usable scores");
        };

        let label = self.label_for(index);
        let lower = input
            .param_f64(&format!("{}.Lower", Self::CONFIDENCE))
            .unwrap_or(self.min_confidence);
        debug!("ONNX '{}' classified as {} ({:.3})", self.id, label, score);

        let mut result = AlgorithmResult::success(&self.id, &self.version);
        result.push_measurement(AlgorithmMeasurement::new(
            Self::CONFIDENCE,
            f64::from(score),
            MeasurementLimits::at_least(lower),
        ));
        let is_ok_label = label == self.ok_label;
        result.set_ok(is_ok_label);
        if !is_ok_label {
            result.defect_type = label.clone();
        }
        result.description = label;
        result.record_elapsed(started.elapsed());
        result.with_debug(
            "scores",
            scores
                .iter()
                .map(|s| format!("{:.4}", s))
                .collect::<Vec<_>>()
                .join(","),
        )
    }
}

/// Builds [`OnnxEngine`]s. Without a backend loader the engines are
/// constructed but report unavailable.
pub struct OnnxFactory {
    loader: Option<BackendLoader>,
}

impl OnnxFactory {
    pub fn with_loader(loader: BackendLoader) -> Self {
        Self {
            loader: Some(loader),
        }
    }

    pub fn without_backend() -> Self {
        Self { loader: None }
    }
}

impl Default for OnnxFactory {
    #[cfg(feature = "onnx-runtime")]
    fn default() -> Self {
        Self::with_loader(Arc::new(|path, entry| {
            let backend = ort_backend::OrtBackend::load(path, entry)?;
            Ok(Arc::new(backend) as Arc<dyn InferenceBackend>)
        }))
    }

    #[cfg(not(feature = "onnx-runtime"))]
    fn default() -> Self {
        Self::without_backend()
    }
}

impl EngineFactory for OnnxFactory {
    fn kind(&self) -> &str {
        EngineKinds::ONNX
    }

    fn create(
        &self,
        entry: &EngineManifest,
        context: &FactoryContext,
    ) -> Result<Arc<dyn AlgorithmEngine>> {
        let model = entry
            .setting_str("modelPath")
            .ok_or_else(|| InspectaError::Validation {
                field: "modelPath".to_string(),
                message: "onnx engines need a modelPath setting".to_string(),
            })?;
        let model_path = context.resolve(model);

        let mut engine = OnnxEngine::new(&entry.id, context.version_for(entry), &model_path)
            .with_name(entry.display_name_or_id());
        if let Some(labels) = entry.setting_strings("labels") {
            engine = engine.with_labels(labels);
        }
        if let Some(ok_label) = entry.setting_str("okLabel") {
            engine = engine.with_ok_label(ok_label);
        }
        if let Some(min) = entry.setting_f64("minConfidence") {
            engine = engine.with_min_confidence(min);
        }
        if let Some(key) = entry.setting_str("imageKey") {
            engine = engine.with_image_key(key);
        }

        match &self.loader {
            Some(loader) if model_path.is_file() => {
                engine = engine.with_backend(loader(&model_path, entry)?);
            }
            Some(_) => warn!(
                "ONNX engine '{}' model {} is missing; engine will be unavailable",
                entry.id,
                model_path.display()
            ),
            None => debug!(
                "ONNX engine '{}' has no inference backend in this build",
                entry.id
            ),
        }
        Ok(Arc::new(engine))
    }
}

#[cfg(feature = "onnx-runtime")]
mod ort_backend {
    //! ONNX Runtime backend: RGB, resized, scaled to `0..1`, NCHW.

    use super::InferenceBackend;
    use crate::error::{InspectaError, Result};
    use crate::plugins::EngineManifest;
    use ort::session::Session;
    use ort::value::Tensor;
    use std::path::Path;
    use std::sync::Mutex;

    pub struct OrtBackend {
        session: Mutex<Session>,
        input_size: u32,
    }

    fn ort_error(e: impl std::fmt::Display) -> InspectaError {
        InspectaError::Other(format!("ONNX Runtime: {}", e))
    }

    impl OrtBackend {
        pub const DEFAULT_INPUT_SIZE: u32 = 224;

        pub fn load(path: &Path, entry: &EngineManifest) -> Result<Self> {
            let session = Session::builder()
                .map_err(ort_error)?
                .commit_from_file(path)
                .map_err(ort_error)?;
            let input_size = entry
                .setting_u64("inputSize")
                .and_then(|s| u32::try_from(s).ok())
                .unwrap_or(Self::DEFAULT_INPUT_SIZE);
            Ok(Self {
                session: Mutex::new(session),
                input_size,
            })
        }
    }

    impl InferenceBackend for OrtBackend {
        fn name(&self) -> &str {
            "onnx-runtime"
        }

        fn classify(&self, image: &image::DynamicImage) -> Result<Vec<f32>> {
            let size = self.input_size;
            let rgb = image
                .resize_exact(size, size, image::imageops::FilterType::Triangle)
                .to_rgb8();
            let plane = (size * size) as usize;
            let mut data = vec![0f32; 3 * plane];
            for (i, pixel) in rgb.pixels().enumerate() {
                for c in 0..3 {
                    data[c * plane + i] = f32::from(pixel.0[c]) / 255.0;
                }
            }

            let tensor = Tensor::from_array(([1usize, 3, size as usize, size as usize], data))
                .map_err(ort_error)?;
            let mut session = self
                .session
                .lock()
                .map_err(|_| InspectaError::Other("ONNX session lock poisoned".to_string()))?;
            let outputs = session.run(ort::inputs![tensor]).map_err(ort_error)?;
            let (_, logits) = outputs[0].try_extract_tensor::<f32>().map_err(ort_error)?;

            // Softmax so the confidence limit reads as a probability.
            let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
            let sum: f32 = exps.iter().sum();
            Ok(exps.into_iter().map(|e| e / sum).collect())
        }
    }
}
