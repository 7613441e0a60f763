use std::fmt;
use std::str::FromStr;

use super::ChatError;

/// Upstream model class. Each tier has its own session namespace per user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelTier {
    Default,
    Paid,
    Gpt4,
}

impl ModelTier {
    pub const ALL: [ModelTier; 3] = [ModelTier::Default, ModelTier::Paid, ModelTier::Gpt4];

    /// Model name as sent by clients and forwarded upstream
    pub fn slug(self) -> &'static str {
        match self {
            ModelTier::Default => "text-davinci-002-render-sha",
            ModelTier::Paid => "text-davinci-002-render-paid",
            ModelTier::Gpt4 => "gpt-4",
        }
    }
}

impl FromStr for ModelTier {
    type Err = ChatError;

    fn from_str(slug: &str) -> Result<Self, Self::Err> {
        ModelTier::ALL
            .into_iter()
            .find(|tier| tier.slug() == slug)
            .ok_or_else(|| ChatError::UnsupportedModel(slug.to_string()))
    }
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

/// The tier a request runs on, and whether the caller asked for it explicitly
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierSelection {
    pub tier: ModelTier,
    /// `None` leaves the upstream model unset for the turn
    pub model_override: Option<ModelTier>,
}

impl TierSelection {
    /// Resolve the optional `model` request field. Absent or empty means the
    /// default tier without an override.
    pub fn resolve(model: Option<&str>) -> Result<Self, ChatError> {
        match model.filter(|m| !m.is_empty()) {
            None => Ok(Self {
                tier: ModelTier::Default,
                model_override: None,
            }),
            Some(slug) => {
                let tier = slug.parse()?;
                Ok(Self {
                    tier,
                    model_override: Some(tier),
                })
            }
        }
    }
}
