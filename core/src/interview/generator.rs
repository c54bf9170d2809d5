use std::time::Duration;

use async_trait::async_trait;
use matchcore_shared::{CoreError, CoreResult};

#[derive(Debug, Clone)]
pub struct GenerationParams {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 220,
            temperature: 0.8,
            top_p: 0.95,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub text: String,
    pub stop_suggested: bool,
}

/// The interview turn loop's sole generator-facing dependency. Callers
/// must enforce their own deadline; this trait does not impose one itself so
/// fakes used in tests can simulate a hang without a real clock.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str, params: &GenerationParams) -> CoreResult<GenerationOutcome>;
}

pub struct HttpTextGenerator {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTextGenerator {
    pub fn new(endpoint: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }
}

#[derive(serde::Serialize)]
struct GenerateRequest<'a> {
    prompt: &'a str,
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
}

#[derive(serde::Deserialize)]
struct GenerateResponse {
    text: String,
    #[serde(default)]
    stop_suggested: bool,
}

#[async_trait]
impl TextGenerator for HttpTextGenerator {
    /// Transient failures (timeouts, 5xx) are retried up to twice within a
    /// turn before the error surfaces to the turn loop.
    async fn generate(&self, prompt: &str, params: &GenerationParams) -> CoreResult<GenerationOutcome> {
        let body = GenerateRequest {
            prompt,
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            top_p: params.top_p,
        };

        let mut last_err = None;
        for attempt in 0..3 {
            match self
                .client
                .post(&self.endpoint)
                .timeout(Duration::from_secs(20))
                .json(&body)
                .send()
                .await
            {
                Ok(resp) if resp.status().is_server_error() => {
                    last_err = Some(CoreError::Transient(format!("generator returned {}", resp.status())));
                }
                Ok(resp) => {
                    return resp
                        .json::<GenerateResponse>()
                        .await
                        .map(|r| GenerationOutcome {
                            text: r.text,
                            stop_suggested: r.stop_suggested,
                        })
                        .map_err(|e| CoreError::Internal(anyhow::anyhow!(e)));
                }
                Err(e) => {
                    last_err = Some(CoreError::Transient(e.to_string()));
                }
            }
            if attempt < 2 {
                tracing::debug!(attempt, "retrying text generator call");
            }
        }

        Err(last_err.unwrap_or_else(|| CoreError::Transient("generator unreachable".into())))
    }
}

/// Scripted fake for interview-loop unit tests.
pub struct ScriptedTextGenerator {
    responses: std::sync::Mutex<std::collections::VecDeque<GenerationOutcome>>,
}

impl ScriptedTextGenerator {
    pub fn new(responses: Vec<GenerationOutcome>) -> Self {
        Self {
            responses: std::sync::Mutex::new(responses.into()),
        }
    }
}

#[async_trait]
impl TextGenerator for ScriptedTextGenerator {
    async fn generate(&self, _prompt: &str, _params: &GenerationParams) -> CoreResult<GenerationOutcome> {
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| CoreError::Transient("scripted generator exhausted".into()))
    }
}

/// A generator that never returns, for exercising the mission-timeout path.
pub struct HangingTextGenerator;

#[async_trait]
impl TextGenerator for HangingTextGenerator {
    async fn generate(&self, _prompt: &str, _params: &GenerationParams) -> CoreResult<GenerationOutcome> {
        std::future::pending::<()>().await;
        unreachable!()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_generator_replies_in_order() {
        let gen = ScriptedTextGenerator::new(vec![
            GenerationOutcome { text: "one".into(), stop_suggested: false },
            GenerationOutcome { text: "two".into(), stop_suggested: true },
        ]);
        let params = GenerationParams::default();
        assert_eq!(gen.generate("p", &params).await.unwrap().text, "one");
        assert!(gen.generate("p", &params).await.unwrap().stop_suggested);
    }
}
