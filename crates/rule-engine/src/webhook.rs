//! Webhook 调用
//!
//! 动作执行阶段只生成 [`WebhookRequest`]，由引擎在触发时异步发出。
//! 调用失败不影响执行结果，只体现在 [`WebhookResult`] 中。

use crate::models::{HttpMethod, WebhookResult};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

/// 待发送的 Webhook 请求
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookRequest {
    pub rule_id: String,
    pub url: String,
    pub method: HttpMethod,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
}

/// Webhook 客户端接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WebhookClient: Send + Sync {
    /// 发送请求，任何失败都转成 `success = false` 的结果
    async fn call(&self, request: WebhookRequest) -> WebhookResult;
}

/// 基于 reqwest 的 HTTP 客户端
#[derive(Debug, Clone)]
pub struct HttpWebhookClient {
    client: reqwest::Client,
}

impl HttpWebhookClient {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "创建带超时的 HTTP 客户端失败，使用默认客户端");
                reqwest::Client::new()
            });
        Self { client }
    }

    fn method(method: HttpMethod) -> reqwest::Method {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

#[async_trait]
impl WebhookClient for HttpWebhookClient {
    async fn call(&self, request: WebhookRequest) -> WebhookResult {
        let mut builder = self
            .client
            .request(Self::method(request.method), &request.url);

        let has_content_type = request
            .headers
            .keys()
            .any(|k| k.eq_ignore_ascii_case("content-type"));
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body.clone() {
            if !has_content_type {
                builder = builder.header(reqwest::header::CONTENT_TYPE, "application/json");
            }
            builder = builder.body(body);
        }

        match builder.send().await {
            Ok(resp) => {
                let status = resp.status();
                let response = resp
                    .text()
                    .await
                    .unwrap_or_else(|e| format!("读取响应失败: {e}"));
                debug!(url = %request.url, status = status.as_u16(), "Webhook 调用完成");
                WebhookResult {
                    url: request.url,
                    status_code: status.as_u16(),
                    response,
                    success: status.is_success(),
                }
            }
            Err(e) => {
                warn!(url = %request.url, rule_id = %request.rule_id, error = %e, "Webhook 调用失败");
                WebhookResult {
                    url: request.url,
                    status_code: 0,
                    response: e.to_string(),
                    success: false,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(url: &str) -> WebhookRequest {
        WebhookRequest {
            rule_id: "r1".to_string(),
            url: url.to_string(),
            method: HttpMethod::Post,
            headers: BTreeMap::new(),
            body: Some("{}".to_string()),
        }
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_reports_failure() {
        let client = HttpWebhookClient::new(Duration::from_millis(500));
        let result = client.call(request("http://127.0.0.1:1/hook")).await;

        assert!(!result.success);
        assert_eq!(result.status_code, 0);
        assert!(!result.response.is_empty());
    }

    #[tokio::test]
    async fn test_mock_client() {
        let mut mock = MockWebhookClient::new();
        mock.expect_call().times(1).returning(|req| WebhookResult {
            url: req.url,
            status_code: 204,
            response: String::new(),
            success: true,
        });

        let result = mock.call(request("http://example.com/hook")).await;
        assert!(result.success);
        assert_eq!(result.status_code, 204);
    }
}
