//! Submitted forms and their validation rules.
//!
//! Every validator collects all failing messages so the client can show them
//! together, the same way the upload and account pages report them inline.

use std::io::Cursor;
use std::sync::OnceLock;

use image::io::Reader as ImageReader;
use regex::Regex;
use serde::Deserialize;

use crate::labels::{Label, ModelVariant};
use crate::store::SearchCriteria;

pub const ANY: &str = "Any";
pub const MIN_IMAGE_SIZE: u32 = 31;
pub const MAX_IMAGE_SIZE: u32 = 512;
const ALLOWED_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];
const REQUIRED: &str = "This field is required.";
const WEAK_PASSWORD: &str = "Error: Password must contain at least 8 characters, \
    has at least one lower, upper, number, and special character";
const PROBABILITY_RANGE: &str =
    "Error: Minimum probability of the prediction must not be below 0 or above 100 percent";
const PASSWORD_MISMATCH: &str = "Error: The password does not match the confirm password";
const SAME_EMAIL: &str = "New email must not be the same as the current email";
const SAME_PASSWORD: &str = "New password must not be the same as the current password";
const EMAIL_PATTERN: &str = r"^[^@\s]+@[^@\s]+\.[^@\s.]+$";
pub const NOT_AN_IMAGE: &str = "Please upload images only!";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}", .0.join("; "))]
pub struct ValidationError(pub Vec<String>);

impl ValidationError {
    pub fn single(message: impl Into<String>) -> Self {
        Self(vec![message.into()])
    }

    pub fn messages(&self) -> &[String] {
        &self.0
    }
}

fn finish<T>(errors: Vec<String>, value: impl FnOnce() -> T) -> Result<T, ValidationError> {
    if errors.is_empty() {
        Ok(value())
    } else {
        Err(ValidationError(errors))
    }
}

fn email_regex() -> &'static Regex {
    static EMAIL: OnceLock<Regex> = OnceLock::new();
    EMAIL.get_or_init(compile_email_regex)
}

fn compile_email_regex() -> Regex {
    Regex::new(EMAIL_PATTERN).expect("Valid email regex")
}

fn check_email(email: &str, errors: &mut Vec<String>) {
    if email.is_empty() {
        errors.push(REQUIRED.to_string());
    } else if !email_regex().is_match(email) {
        errors.push("Invalid email address!".to_string());
    }
}

/// At least 8 characters with a lowercase, an uppercase, a digit and a
/// special character, and equal to its confirmation.
fn check_new_password(password: &str, confirm: &str, errors: &mut Vec<String>) {
    if password.is_empty() {
        errors.push(REQUIRED.to_string());
        return;
    }
    let (mut lower, mut upper, mut numeric, mut special) = (false, false, false, false);
    for c in password.chars() {
        if c.is_uppercase() {
            upper = true;
        } else if c.is_lowercase() {
            lower = true;
        } else if c.is_numeric() {
            numeric = true;
        } else if !c.is_alphanumeric() {
            special = true;
        }
    }
    let long_enough = password.chars().count() >= 8;
    if !(long_enough && lower && upper && numeric && special) {
        errors.push(WEAK_PASSWORD.to_string());
    } else if password != confirm {
        errors.push(PASSWORD_MISMATCH.to_string());
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SignUpForm {
    pub email: String,
    pub password: String,
    pub confirm: String,
}

impl SignUpForm {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut errors = Vec::new();
        check_email(&self.email, &mut errors);
        if self.confirm.is_empty() {
            errors.push(REQUIRED.to_string());
        }
        check_new_password(&self.password, &self.confirm, &mut errors);
        finish(errors, || ())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SignInForm {
    pub email: String,
    pub password: String,
}

impl SignInForm {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut errors = Vec::new();
        if self.email.is_empty() || self.password.is_empty() {
            errors.push(REQUIRED.to_string());
        }
        finish(errors, || ())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ChangeEmailForm {
    pub current_email: String,
    pub new_email: String,
}

impl ChangeEmailForm {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut errors = Vec::new();
        if self.current_email.is_empty() {
            errors.push(REQUIRED.to_string());
        } else if self.current_email == self.new_email {
            errors.push(SAME_EMAIL.to_string());
        }
        check_email(&self.new_email, &mut errors);
        finish(errors, || ())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ChangePasswordForm {
    pub current_password: String,
    pub new_password: String,
    pub new_confirm: String,
}

impl ChangePasswordForm {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut errors = Vec::new();
        if self.current_password.is_empty() {
            errors.push(REQUIRED.to_string());
        } else if self.current_password == self.new_password {
            errors.push(SAME_PASSWORD.to_string());
        }
        if self.new_confirm.is_empty() {
            errors.push(REQUIRED.to_string());
        }
        check_new_password(&self.new_password, &self.new_confirm, &mut errors);
        finish(errors, || ())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchForm {
    pub model: String,
    pub prediction: String,
    pub prob_pred: String,
}

impl Default for SearchForm {
    fn default() -> Self {
        Self {
            model: ANY.to_string(),
            prediction: ANY.to_string(),
            prob_pred: "0".to_string(),
        }
    }
}

impl SearchForm {
    pub fn validate(&self) -> Result<SearchCriteria, ValidationError> {
        let mut errors = Vec::new();

        let model = match self.model.as_str() {
            "" => {
                errors.push(REQUIRED.to_string());
                None
            }
            ANY => None,
            other => match other.parse::<ModelVariant>() {
                Ok(variant) => Some(variant),
                Err(_) => {
                    errors.push("Not a valid choice".to_string());
                    None
                }
            },
        };

        let label = match self.prediction.as_str() {
            "" => {
                errors.push(REQUIRED.to_string());
                None
            }
            ANY => None,
            other => match other.parse::<Label>() {
                Ok(label) => Some(label),
                Err(_) => {
                    errors.push("Not a valid choice".to_string());
                    None
                }
            },
        };

        let raw = self.prob_pred.trim();
        let min_probability = if raw.is_empty() {
            0.0
        } else {
            match raw.parse::<f64>() {
                Ok(value) if (0.0..=100.0).contains(&value) => value,
                Ok(_) => {
                    errors.push(PROBABILITY_RANGE.to_string());
                    0.0
                }
                Err(_) => {
                    errors.push("Not a valid float value.".to_string());
                    0.0
                }
            }
        };

        finish(errors, || SearchCriteria {
            model,
            label,
            min_probability,
        })
    }
}

/// Raw fields of the multipart upload form.
#[derive(Debug, Clone, Default)]
pub struct UploadForm {
    pub file_name: Option<String>,
    pub image: Vec<u8>,
    pub model: String,
}

/// An upload whose header declares an acceptable square image. The pixels
/// are still encoded.
#[derive(Debug, Clone)]
pub struct ValidUpload {
    pub image: Vec<u8>,
    pub variant: ModelVariant,
}

impl UploadForm {
    /// Checks the declared dimensions from the image header only, so an
    /// oversized upload is refused without decoding it.
    pub fn validate(self) -> Result<ValidUpload, ValidationError> {
        let mut errors = Vec::new();

        let image_ok = if self.image.is_empty() {
            errors.push("Please upload an image!".to_string());
            false
        } else if !self.has_allowed_extension() {
            errors.push(NOT_AN_IMAGE.to_string());
            false
        } else {
            match image_dimensions(&self.image) {
                Some((width, height)) => match size_error(width, height) {
                    Some(message) => {
                        errors.push(message);
                        false
                    }
                    None => true,
                },
                None => {
                    errors.push(NOT_AN_IMAGE.to_string());
                    false
                }
            }
        };

        let variant = if self.model.is_empty() {
            errors.push(REQUIRED.to_string());
            None
        } else {
            match self.model.parse::<ModelVariant>() {
                Ok(variant) => Some(variant),
                Err(_) => {
                    errors.push("Not a valid choice".to_string());
                    None
                }
            }
        };

        match variant {
            Some(variant) if image_ok && errors.is_empty() => Ok(ValidUpload {
                image: self.image,
                variant,
            }),
            _ => Err(ValidationError(errors)),
        }
    }

    fn has_allowed_extension(&self) -> bool {
        let name = match &self.file_name {
            Some(name) => name,
            None => return true,
        };
        match name.rsplit_once('.') {
            Some((_, ext)) => {
                let ext = ext.to_ascii_lowercase();
                ALLOWED_EXTENSIONS.contains(&ext.as_str())
            }
            None => false,
        }
    }
}

/// Width and height declared by the image header.
fn image_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}

fn size_error(width: u32, height: u32) -> Option<String> {
    let size_text = format!("Current image size: {} x {} pixels", width, height);
    if width != height {
        Some(format!(
            "Error: Image must be exactly a square image! {}",
            size_text
        ))
    } else if width > MAX_IMAGE_SIZE {
        Some(format!(
            "Error: Image must not exceed the specified width/height! {}",
            size_text
        ))
    } else if width < MIN_IMAGE_SIZE {
        Some(format!(
            "Error: Image must not be below the specified width/height {}",
            size_text
        ))
    } else {
        None
    }
}
