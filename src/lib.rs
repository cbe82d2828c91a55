//! Vegetable image classification service.
//!
//! Users upload a square vegetable photo, the image is classified by a
//! remote model server, and signed-in users can browse and filter the
//! predictions they have made.

pub mod app;
pub mod auth;
pub mod config;
pub mod error;
pub mod forms;
pub mod labels;
pub mod logging;
pub mod model;
pub mod routes;
pub mod store;

pub use app::{router, AppState, SharedState};
pub use config::Config;
pub use error::AppError;
pub use labels::{Label, ModelVariant};
pub use model::{InferenceClient, InferenceError, Prediction, Predictor, PreparedImage};
pub use store::{HistoryFilter, SearchCriteria, SearchResult, Store, StoreError};
