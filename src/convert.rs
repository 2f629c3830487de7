//! Entry points: model resolution and one-call conversion.
//!
//! [`convert`] wires the default collaborators (pdfium rasteriser and a model
//! client resolved from the config or the environment) into a
//! [`DocumentProcessor`] and runs a single job. Callers that convert many
//! documents should build one processor with [`processor_from_config`] and
//! call [`DocumentProcessor::run`] for each, so the model client is shared.

use crate::cancel::CancelToken;
use crate::config::ProcessorConfig;
use crate::error::PipelineError;
use crate::job::JobState;
use crate::model::{EdgequakeModel, OpenAiCompatModel, VisionModel};
use crate::pipeline::render::PdfiumRasterizer;
use crate::processor::DocumentProcessor;
use crate::progress::ProcessingCallback;
use edgequake_llm::{LLMProvider, ProviderFactory};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Model used when a provider is selected without naming one.
pub const DEFAULT_MODEL: &str = "gpt-4.1-nano";

/// Convert one document with the default rasteriser and the model resolved
/// from `config`.
///
/// # Errors
/// Only when no model client can be built. Everything that goes wrong once
/// the job has started is reported in the returned [`JobState`].
pub async fn convert(
    source: impl AsRef<Path>,
    output_dir: Option<PathBuf>,
    config: ProcessorConfig,
    callback: Arc<dyn ProcessingCallback>,
    cancel: CancelToken,
) -> Result<JobState, PipelineError> {
    let processor = processor_from_config(config)?;
    Ok(processor.run(source, output_dir, callback, cancel).await)
}

/// Build a processor with the pdfium rasteriser and the resolved model.
pub fn processor_from_config(config: ProcessorConfig) -> Result<DocumentProcessor, PipelineError> {
    let model = resolve_model(&config)?;
    let rasterizer = Arc::new(PdfiumRasterizer::from_config(&config));
    Ok(DocumentProcessor::new(config, model, rasterizer))
}

/// Pick the model client.
///
/// Resolution order:
///
/// 1. **Explicit client** (`config.provider`).
/// 2. **OpenAI-compatible endpoint** (`config.api_base_url`), talking
///    streaming chat completions directly.
/// 3. **Named edgequake-llm provider** (`config.provider_name` + model).
/// 4. **`OCR_API_BASE_URL`** (+ `OCR_API_KEY`, `OCR_MODEL_NAME`) in the
///    environment.
/// 5. **`EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`**, when both are set.
/// 6. **`OPENAI_API_KEY`** present → the `openai` provider.
/// 7. **Full auto-detection** (`ProviderFactory::from_env`).
pub fn resolve_model(config: &ProcessorConfig) -> Result<Arc<dyn VisionModel>, PipelineError> {
    if let Some(provider) = &config.provider {
        debug!("using caller-supplied model client {}", provider.name());
        return Ok(Arc::clone(provider));
    }

    if let Some(base_url) = &config.api_base_url {
        let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
        return openai_compat(base_url, config.api_key.clone(), model, config);
    }

    if let Some(name) = &config.provider_name {
        let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
        return edgequake(name, model);
    }

    if let Some(base_url) = env_non_empty("OCR_API_BASE_URL") {
        let model = config
            .model
            .clone()
            .or_else(|| env_non_empty("OCR_MODEL_NAME"))
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let key = config.api_key.clone().or_else(|| env_non_empty("OCR_API_KEY"));
        return openai_compat(&base_url, key, &model, config);
    }

    if let (Some(provider), Some(model)) = (
        env_non_empty("EDGEQUAKE_LLM_PROVIDER"),
        env_non_empty("EDGEQUAKE_MODEL"),
    ) {
        return edgequake(&provider, &model);
    }

    if env_non_empty("OPENAI_API_KEY").is_some() {
        let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
        return edgequake("openai", model);
    }

    let (llm, _embedding) =
        ProviderFactory::from_env().map_err(|e| PipelineError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No model provider could be detected from the environment.\n\
                 Set OCR_API_BASE_URL, OPENAI_API_KEY or ANTHROPIC_API_KEY, \
                 or pass --provider.\nError: {e}"
            ),
        })?;
    info!("auto-detected model provider from environment");
    Ok(Arc::new(EdgequakeModel::new(llm, "auto")))
}

fn openai_compat(
    base_url: &str,
    api_key: Option<String>,
    model: &str,
    config: &ProcessorConfig,
) -> Result<Arc<dyn VisionModel>, PipelineError> {
    info!(base_url, model, "using OpenAI-compatible endpoint");
    let client = OpenAiCompatModel::new(base_url, api_key, model, config.api_timeout_secs)?;
    Ok(Arc::new(client))
}

fn edgequake(provider: &str, model: &str) -> Result<Arc<dyn VisionModel>, PipelineError> {
    info!(provider, model, "using edgequake-llm provider");
    let llm: Arc<dyn LLMProvider> = ProviderFactory::create_llm_provider(provider, model)
        .map_err(|e| PipelineError::ProviderNotConfigured {
            provider: provider.to_string(),
            hint: format!("{e}"),
        })?;
    Ok(Arc::new(EdgequakeModel::new(llm, format!("{provider}/{model}"))))
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelRequest, StructuredResponse, TextStream};
    use crate::error::BatchError;
    use async_trait::async_trait;

    struct Fixed;

    #[async_trait]
    impl VisionModel for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }
        async fn stream_text(&self, _: ModelRequest) -> Result<TextStream, BatchError> {
            Err(BatchError::Cancelled)
        }
        async fn extract_regions(&self, _: ModelRequest) -> Result<StructuredResponse, BatchError> {
            Err(BatchError::Cancelled)
        }
    }

    #[test]
    fn explicit_client_wins() {
        let config = ProcessorConfig::builder()
            .provider(Arc::new(Fixed))
            .api_base_url("http://localhost:1")
            .build()
            .unwrap();
        assert_eq!(resolve_model(&config).unwrap().name(), "fixed");
    }

    #[test]
    fn base_url_selects_openai_compatible_client() {
        let config = ProcessorConfig::builder()
            .api_base_url("http://localhost:8000/v1/")
            .model("qwen2.5-vl")
            .build()
            .unwrap();
        assert_eq!(resolve_model(&config).unwrap().name(), "qwen2.5-vl");
    }
}
