use async_trait::async_trait;
use serde::Deserialize;

#[derive(Debug, Clone, Copy, serde::Serialize, Deserialize)]
pub struct JudgeDecision {
    pub should_notify: bool,
}

/// Maps a completed transcript to a notify/don't-notify decision. A
/// malformed upstream response is never propagated as an error — it is
/// downgraded to the safe default (don't notify) here, so callers never see
/// a judge failure.
#[async_trait]
pub trait Judge: Send + Sync {
    async fn evaluate(&self, owner_objective: &str, transcript: &serde_json::Value) -> JudgeDecision;
}

pub struct HttpJudge {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpJudge {
    pub fn new(endpoint: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }
}

#[derive(serde::Serialize)]
struct JudgeRequest<'a> {
    owner_objective: &'a str,
    transcript: &'a serde_json::Value,
}

#[async_trait]
impl Judge for HttpJudge {
    async fn evaluate(&self, owner_objective: &str, transcript: &serde_json::Value) -> JudgeDecision {
        let body = JudgeRequest {
            owner_objective,
            transcript,
        };

        let result = self
            .client
            .post(&self.endpoint)
            .timeout(std::time::Duration::from_secs(15))
            .json(&body)
            .send()
            .await;

        match result {
            Ok(resp) => match resp.json::<JudgeDecision>().await {
                Ok(decision) => decision,
                Err(e) => {
                    tracing::warn!(error = %e, "judge response failed to parse, defaulting to no-notify");
                    JudgeDecision { should_notify: false }
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "judge call failed, defaulting to no-notify");
                JudgeDecision { should_notify: false }
            }
        }
    }
}

/// Scripted fake for interview-loop unit tests.
pub struct ScriptedJudge {
    decision: JudgeDecision,
}

impl ScriptedJudge {
    pub fn new(should_notify: bool) -> Self {
        Self {
            decision: JudgeDecision { should_notify },
        }
    }
}

#[async_trait]
impl Judge for ScriptedJudge {
    async fn evaluate(&self, _owner_objective: &str, _transcript: &serde_json::Value) -> JudgeDecision {
        self.decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_judge_returns_configured_decision() {
        let judge = ScriptedJudge::new(true);
        let decision = judge.evaluate("find a climbing partner", &serde_json::json!([])).await;
        assert!(decision.should_notify);
    }
}
