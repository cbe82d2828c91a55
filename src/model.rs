use std::io::Cursor;
use std::time::Duration;

use async_trait::async_trait;
use image::error::{ParameterError, ParameterErrorKind};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageError, ImageOutputFormat, RgbImage};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::labels::{Label, ModelVariant, VOCABULARY_SIZE};

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("could not read image: {0}")]
    Image(#[from] ImageError),
    #[error("prediction request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("prediction server answered with status {0}")]
    Status(u16),
    #[error("malformed prediction response: {0}")]
    Malformed(String),
}

/// An upload resized to the resolution of the model it is sent to.
#[derive(Debug, Clone)]
pub struct PreparedImage {
    variant: ModelVariant,
    pixels: RgbImage,
}

impl PreparedImage {
    pub fn from_bytes(image_data: &[u8], variant: ModelVariant) -> Result<Self, InferenceError> {
        let img = image::load_from_memory(image_data)?;
        Ok(Self::from_image(&img, variant))
    }

    pub fn from_image(img: &DynamicImage, variant: ModelVariant) -> Self {
        let size = variant.size();
        let (width, height) = img.dimensions();
        let pixels = if (width, height) == (size, size) {
            img.to_rgb8()
        } else {
            img.resize_exact(size, size, FilterType::Lanczos3).to_rgb8()
        };
        Self { variant, pixels }
    }

    pub fn variant(&self) -> ModelVariant {
        self.variant
    }

    /// Raw RGB8 pixels, row major, as stored with a history record.
    pub fn rgb_bytes(&self) -> Vec<u8> {
        self.pixels.as_raw().clone()
    }

    /// Grayscale intensities in `[0, 1]`, laid out `[row][column][channel]`.
    ///
    /// Luma uses the ITU-R 601-2 weights the hosted models were trained with.
    pub fn tensor(&self) -> Vec<Vec<[f32; 1]>> {
        let size = self.variant.size();
        (0..size)
            .map(|y| {
                (0..size)
                    .map(|x| {
                        let [r, g, b] = self.pixels.get_pixel(x, y).0.map(u32::from);
                        let luma = (r * 19595 + g * 38470 + b * 7471 + 0x8000) >> 16;
                        [luma as f32 / 255.0]
                    })
                    .collect()
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub label: Label,
    pub probabilities: Vec<f64>,
}

impl Prediction {
    pub fn from_probabilities(probabilities: Vec<f64>) -> Result<Self, InferenceError> {
        if probabilities.len() != VOCABULARY_SIZE {
            return Err(InferenceError::Malformed(format!(
                "expected {} probabilities, got {}",
                VOCABULARY_SIZE,
                probabilities.len()
            )));
        }
        if probabilities.iter().any(|p| !p.is_finite()) {
            return Err(InferenceError::Malformed(
                "probabilities must be finite".to_string(),
            ));
        }
        let label = Label::from_probabilities(&probabilities)
            .ok_or_else(|| InferenceError::Malformed("no highest probability".to_string()))?;
        Ok(Self {
            label,
            probabilities,
        })
    }
}

/// Something that can classify a prepared image.
#[async_trait]
pub trait Predictor: Send + Sync {
    async fn predict(&self, image: &PreparedImage) -> Result<Prediction, InferenceError>;
}

#[derive(Serialize)]
struct PredictRequest<'a> {
    signature_name: &'a str,
    instances: Vec<Vec<Vec<[f32; 1]>>>,
}

#[derive(Deserialize)]
struct PredictResponse {
    #[serde(default)]
    predictions: Vec<Vec<f64>>,
    #[serde(default)]
    error: Option<String>,
}

/// Client for the remote TensorFlow Serving style prediction server.
pub struct InferenceClient {
    http: reqwest::Client,
    base_url: String,
}

impl InferenceClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, InferenceError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, variant: ModelVariant) -> String {
        let size = variant.size();
        format!("{}/v1/models/model_{size}:predict", self.base_url)
    }
}

#[async_trait]
impl Predictor for InferenceClient {
    #[instrument(skip_all, fields(model = %image.variant()))]
    async fn predict(&self, image: &PreparedImage) -> Result<Prediction, InferenceError> {
        let body = PredictRequest {
            signature_name: "serving_default",
            instances: vec![image.tensor()],
        };

        let response = self
            .http
            .post(self.endpoint(image.variant()))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            warn!(
                status = status.as_u16(),
                "Prediction server rejected request"
            );
            return Err(InferenceError::Status(status.as_u16()));
        }

        let parsed: PredictResponse = response
            .json()
            .await
            .map_err(|e| InferenceError::Malformed(e.to_string()))?;
        if let Some(error) = parsed.error {
            return Err(InferenceError::Malformed(error));
        }
        let probabilities = parsed
            .predictions
            .into_iter()
            .next()
            .ok_or_else(|| InferenceError::Malformed("empty predictions".to_string()))?;

        let prediction = Prediction::from_probabilities(probabilities)?;
        debug!(label = %prediction.label, "Prediction received");
        Ok(prediction)
    }
}

/// Encodes stored RGB8 pixels of a `variant` sized image as PNG.
pub fn encode_png(pixels: Vec<u8>, variant: ModelVariant) -> Result<Vec<u8>, ImageError> {
    let size = variant.size();
    let image = RgbImage::from_raw(size, size, pixels).ok_or_else(|| {
        ImageError::Parameter(ParameterError::from_kind(
            ParameterErrorKind::DimensionMismatch,
        ))
    })?;
    let mut png = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image)
        .write_to(&mut png, ImageOutputFormat::Png)?;
    Ok(png.into_inner())
}
