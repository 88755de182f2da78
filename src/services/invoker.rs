//! Endpoint invocation for replaying records through a challenger

use crate::error::Result;
use crate::services::judge::{ChatMessage, ContentPart, JudgeClient, JudgeRequest};
use crate::types::{Attachment, MonitoredEndpoint};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Runs an endpoint's prompt against an input and returns its output
#[async_trait]
pub trait EndpointInvoker: Send + Sync {
    async fn invoke(
        &self,
        endpoint: &MonitoredEndpoint,
        input: &serde_json::Value,
        attachments: &[Attachment],
    ) -> Result<serde_json::Value>;
}

/// Invoker that executes endpoints on the same chat model capability the judge uses
pub struct ChatEndpointInvoker {
    client: Arc<dyn JudgeClient>,
}

impl ChatEndpointInvoker {
    pub fn new(client: Arc<dyn JudgeClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EndpointInvoker for ChatEndpointInvoker {
    async fn invoke(
        &self,
        endpoint: &MonitoredEndpoint,
        input: &serde_json::Value,
        attachments: &[Attachment],
    ) -> Result<serde_json::Value> {
        debug!("Invoking endpoint {}", endpoint.id);

        let mut parts = vec![ContentPart::Text {
            text: render_input(input),
        }];
        parts.extend(
            attachments
                .iter()
                .filter(|a| a.is_image())
                .map(|a| ContentPart::Image { url: a.url.clone() }),
        );

        let request = JudgeRequest::new(vec![
            ChatMessage::system(endpoint.parameters.prompt.clone()),
            ChatMessage::user_parts(parts),
        ])
        .with_model(endpoint.parameters.model.clone());

        let completion = self.client.complete(&request).await?;

        // Structured endpoints answer in JSON; keep plain text otherwise
        Ok(serde_json::from_str(completion.text.trim())
            .unwrap_or(serde_json::Value::String(completion.text)))
    }
}

fn render_input(input: &serde_json::Value) -> String {
    match input {
        serde_json::Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_input() {
        assert_eq!(render_input(&json!("plain")), "plain");
        assert!(render_input(&json!({"a": 1})).contains("\"a\": 1"));
    }
}
