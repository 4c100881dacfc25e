use serde::{Deserialize, Serialize};

/// A model a provider can answer with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Model {
    pub id: String,
    /// Shown in listings; equals `id` unless the provider reports a nicer name.
    pub name: String,
}

impl Model {
    pub fn from_id(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
        }
    }
}

/// Identifies who answers an assistant message: a registered provider and one
/// of its models.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelRef {
    pub provider_id: String,
    pub model_id: String,
}

impl ModelRef {
    pub fn new(provider_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            model_id: model_id.into(),
        }
    }
}

impl std::fmt::Display for ModelRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.provider_id)?;
        f.write_str("/")?;
        f.write_str(&self.model_id)
    }
}

pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

/// Listed when the provider's model endpoint cannot be reached.
pub fn default_openai_models() -> Vec<Model> {
    [DEFAULT_OPENAI_MODEL, "gpt-4o", "gpt-4.1", "o3"]
        .into_iter()
        .map(Model::from_id)
        .collect()
}

pub const DEFAULT_DEEPSEEK_MODEL: &str = "deepseek-chat";

pub fn default_deepseek_models() -> Vec<Model> {
    [DEFAULT_DEEPSEEK_MODEL, "deepseek-reasoner"]
        .into_iter()
        .map(Model::from_id)
        .collect()
}
