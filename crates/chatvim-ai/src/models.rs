//! Model registry with public lookup API.

use crate::{Api, Error, Model, Provider, Result};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const GOOGLE_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

struct ModelEntry {
    id: &'static str,
    name: &'static str,
    provider: Provider,
    max_tokens: u32,
}

const MODEL_ENTRIES: &[ModelEntry] = &[
    ModelEntry {
        id: "gpt-3.5-turbo",
        name: "GPT-3.5 Turbo",
        provider: Provider::OpenAI,
        max_tokens: 4096,
    },
    ModelEntry {
        id: "gpt-4",
        name: "GPT-4",
        provider: Provider::OpenAI,
        max_tokens: 8192,
    },
    ModelEntry {
        id: "gpt-4-turbo",
        name: "GPT-4 Turbo",
        provider: Provider::OpenAI,
        max_tokens: 4096,
    },
    ModelEntry {
        id: "gpt-4o",
        name: "GPT-4o",
        provider: Provider::OpenAI,
        max_tokens: 16384,
    },
    ModelEntry {
        id: "gpt-4o-mini",
        name: "GPT-4o mini",
        provider: Provider::OpenAI,
        max_tokens: 16384,
    },
    ModelEntry {
        id: "gpt-4.1",
        name: "GPT-4.1",
        provider: Provider::OpenAI,
        max_tokens: 32768,
    },
    ModelEntry {
        id: "gpt-4.1-mini",
        name: "GPT-4.1 mini",
        provider: Provider::OpenAI,
        max_tokens: 32768,
    },
    ModelEntry {
        id: "claude-3-5-haiku-latest",
        name: "Claude Haiku 3.5",
        provider: Provider::Anthropic,
        max_tokens: 8192,
    },
    ModelEntry {
        id: "claude-sonnet-4-5",
        name: "Claude Sonnet 4.5",
        provider: Provider::Anthropic,
        max_tokens: 64000,
    },
    ModelEntry {
        id: "claude-opus-4-1",
        name: "Claude Opus 4.1",
        provider: Provider::Anthropic,
        max_tokens: 32000,
    },
    ModelEntry {
        id: "gemini-2.5-flash",
        name: "Gemini 2.5 Flash",
        provider: Provider::Google,
        max_tokens: 65536,
    },
    ModelEntry {
        id: "gemini-2.5-pro",
        name: "Gemini 2.5 Pro",
        provider: Provider::Google,
        max_tokens: 65536,
    },
];

impl ModelEntry {
    fn to_model(&self) -> Model {
        build_model(self.id, self.name, self.provider, self.max_tokens)
    }
}

fn build_model(id: &str, name: &str, provider: Provider, max_tokens: u32) -> Model {
    let (api, base_url) = match provider {
        Provider::Anthropic => (Api::AnthropicMessages, ANTHROPIC_BASE_URL),
        Provider::Google => (Api::GoogleGenerativeAI, GOOGLE_BASE_URL),
        Provider::OpenAI | Provider::Custom => (Api::OpenAICompletions, OPENAI_BASE_URL),
    };
    Model {
        id: id.to_string(),
        name: name.to_string(),
        api,
        provider,
        base_url: base_url.to_string(),
        max_tokens,
    }
}

/// Look up a model by ID.
pub fn get_model_by_id(id: &str) -> Option<Model> {
    MODEL_ENTRIES
        .iter()
        .find(|e| e.id == id)
        .map(|e| e.to_model())
}

/// Get all registered models.
pub fn get_all_models() -> Vec<Model> {
    MODEL_ENTRIES.iter().map(|e| e.to_model()).collect()
}

/// Guess the provider from a model id's family prefix.
pub fn infer_provider(id: &str) -> Option<Provider> {
    let id = id.to_lowercase();
    if id.starts_with("gpt-")
        || id.starts_with("o1")
        || id.starts_with("o3")
        || id.starts_with("o4")
        || id.starts_with("chatgpt-")
    {
        Some(Provider::OpenAI)
    } else if id.starts_with("claude") {
        Some(Provider::Anthropic)
    } else if id.starts_with("gemini") {
        Some(Provider::Google)
    } else {
        None
    }
}

/// Resolve a model id to a full model definition.
///
/// Registry entries win; unknown ids from a recognizable family get that
/// provider's defaults so newly released models work without an update.
pub fn resolve_model(id: &str) -> Result<Model> {
    if let Some(model) = get_model_by_id(id) {
        return Ok(model);
    }

    match infer_provider(id) {
        Some(provider) => Ok(build_model(id, id, provider, 4096)),
        None => Err(Error::ModelNotFound(id.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookup() {
        let model = get_model_by_id("gpt-4").unwrap();
        assert_eq!(model.provider, Provider::OpenAI);
        assert_eq!(model.api, Api::OpenAICompletions);
        assert_eq!(model.base_url, OPENAI_BASE_URL);
    }

    #[test]
    fn test_registry_apis_follow_provider() {
        for model in get_all_models() {
            let expected = match model.provider {
                Provider::Anthropic => Api::AnthropicMessages,
                Provider::Google => Api::GoogleGenerativeAI,
                Provider::OpenAI | Provider::Custom => Api::OpenAICompletions,
            };
            assert_eq!(model.api, expected, "{}", model.id);
        }
    }

    #[test]
    fn test_resolve_unknown_family_member() {
        let model = resolve_model("claude-haiku-9").unwrap();
        assert_eq!(model.provider, Provider::Anthropic);
        assert_eq!(model.base_url, ANTHROPIC_BASE_URL);

        let model = resolve_model("gemini-3.0-ultra").unwrap();
        assert_eq!(model.api, Api::GoogleGenerativeAI);

        let model = resolve_model("o3-mini").unwrap();
        assert_eq!(model.provider, Provider::OpenAI);
    }

    #[test]
    fn test_resolve_unknown_model() {
        let err = resolve_model("llama-3").unwrap_err();
        assert!(matches!(err, Error::ModelNotFound(id) if id == "llama-3"));
    }

    #[test]
    fn test_registry_ids_are_unique() {
        let all = get_all_models();
        for (i, a) in all.iter().enumerate() {
            assert!(
                all.iter().skip(i + 1).all(|b| b.id != a.id),
                "duplicate model id {}",
                a.id
            );
        }
    }
}
