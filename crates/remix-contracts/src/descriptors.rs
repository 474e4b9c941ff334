use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::assets::BinaryAsset;

/// One requested variation of the reference image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    pub id: String,
    pub instruction_text: String,
    #[serde(default)]
    pub reference_assets: Vec<BinaryAsset>,
}

impl Descriptor {
    pub fn new(
        id: impl Into<String>,
        instruction_text: impl Into<String>,
        reference_assets: Vec<BinaryAsset>,
    ) -> Self {
        Self {
            id: id.into(),
            instruction_text: instruction_text.into(),
            reference_assets,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariationKind {
    Pose,
    Style,
    Background,
    Custom,
}

impl VariationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pose => "pose",
            Self::Style => "style",
            Self::Background => "background",
            Self::Custom => "custom",
        }
    }

    pub fn instruction_for(self, label: &str) -> String {
        let label = label.trim();
        match self {
            Self::Pose => format!(
                "Keep the subject identical to the reference image and change the pose to: {label}."
            ),
            Self::Style => format!(
                "Redraw the reference image in the following style, keeping the subject recognisable: {label}."
            ),
            Self::Background => format!(
                "Keep the subject from the reference image unchanged and replace the background with: {label}."
            ),
            Self::Custom => label.to_string(),
        }
    }
}

impl fmt::Display for VariationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VariationKind {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pose" => Ok(Self::Pose),
            "style" => Ok(Self::Style),
            "background" | "bg" => Ok(Self::Background),
            "custom" | "instruction" => Ok(Self::Custom),
            other => Err(format!("unknown variation kind '{other}'")),
        }
    }
}

/// Builds descriptors in submission order with ids `v01`, `v02`, ...
/// sharing one set of reference assets.
#[derive(Debug, Clone, Default)]
pub struct DescriptorBatchBuilder {
    references: Vec<BinaryAsset>,
    descriptors: Vec<Descriptor>,
}

impl DescriptorBatchBuilder {
    pub fn new(references: Vec<BinaryAsset>) -> Self {
        Self {
            references,
            descriptors: Vec::new(),
        }
    }

    pub fn push(&mut self, kind: VariationKind, label: &str) -> &mut Self {
        if label.trim().is_empty() {
            return self;
        }
        let id = format!("v{:02}", self.descriptors.len() + 1);
        self.descriptors.push(Descriptor::new(
            id,
            kind.instruction_for(label),
            self.references.clone(),
        ));
        self
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn build(self) -> Vec<Descriptor> {
        self.descriptors
    }
}
