//! The fixed vegetable vocabulary and the model variants that can classify it.
//!
//! The order of [`Label`] variants is significant: position `i` of every
//! probability vector returned by the prediction server is the probability
//! of the `i`-th label.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::{EnumCount, EnumIter, IntoEnumIterator};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
    strum::IntoStaticStr,
    EnumIter,
    EnumCount,
)]
pub enum Label {
    Bean,
    #[strum(to_string = "Bitter_Gourd")]
    #[serde(rename = "Bitter_Gourd")]
    BitterGourd,
    #[strum(to_string = "Bottle_Gourd")]
    #[serde(rename = "Bottle_Gourd")]
    BottleGourd,
    Brinjal,
    Broccoli,
    Cabbage,
    Capsicum,
    Carrot,
    Cauliflower,
    Cucumber,
    Papaya,
    Potato,
    Pumpkin,
    Radish,
    Tomato,
}

/// Number of entries in every probability vector.
pub const VOCABULARY_SIZE: usize = Label::COUNT;

impl Label {
    pub fn from_index(index: usize) -> Option<Self> {
        Self::iter().nth(index)
    }

    pub fn index(self) -> usize {
        self as usize
    }

    /// Label with the highest probability, `None` unless the vector covers the
    /// whole vocabulary.
    pub fn from_probabilities(probabilities: &[f64]) -> Option<Self> {
        if probabilities.len() != VOCABULARY_SIZE {
            return None;
        }
        argmax(probabilities).and_then(Self::from_index)
    }

    pub fn names() -> Vec<&'static str> {
        Self::iter().map(Into::into).collect()
    }
}

/// Index of the first maximum, matching numpy's `argmax` tie-breaking.
pub fn argmax(values: &[f64]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, &value) in values.iter().enumerate() {
        if value.is_nan() {
            continue;
        }
        if best.map_or(true, |(_, current)| value > current) {
            best = Some((i, value));
        }
    }
    best.map(|(i, _)| i)
}

/// Indices sorted by descending probability.
pub fn ranked(values: &[f64]) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..values.len()).collect();
    indices.sort_by(|&a, &b| {
        values[b]
            .partial_cmp(&values[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    indices
}

/// Input resolution of a hosted model. Stored in history records as its tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter)]
pub enum ModelVariant {
    #[serde(rename = "31")]
    Px31,
    #[serde(rename = "128")]
    Px128,
}

impl ModelVariant {
    pub fn size(self) -> u32 {
        match self {
            ModelVariant::Px31 => 31,
            ModelVariant::Px128 => 128,
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            ModelVariant::Px31 => "31",
            ModelVariant::Px128 => "128",
        }
    }

    /// Human readable choice shown in forms, e.g. `128 pixels model`.
    pub fn choice(self) -> String {
        format!("{} pixels model", self.size())
    }

    pub fn choices() -> Vec<String> {
        Self::iter().rev().map(Self::choice).collect()
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown model variant: {0}")]
pub struct UnknownModelVariant(pub String);

impl FromStr for ModelVariant {
    type Err = UnknownModelVariant;

    /// Accepts either the bare tag (`"31"`) or the form choice (`"31 pixels model"`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Self::iter()
            .find(|variant| trimmed == variant.tag() || trimmed == variant.choice())
            .ok_or_else(|| UnknownModelVariant(s.to_string()))
    }
}
