//! CDP connection and session management
//!
//! `Connection` speaks at browser scope (targets, version, shutdown);
//! `Session` speaks to one attached page.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use super::transport::{PageEvent, Transport};
use super::types::*;
use crate::error::Result;

/// A CDP connection to the browser
pub struct Connection {
    transport: Arc<Transport>,
}

impl Connection {
    /// Create a new connection wrapping a transport
    pub fn new(transport: Transport) -> Self {
        Self {
            transport: Arc::new(transport),
        }
    }

    /// Get browser version info
    pub async fn version(&self) -> Result<BrowserGetVersionResult> {
        self.transport
            .send("Browser.getVersion", &BrowserGetVersion {})
            .await
    }

    /// Create a new target (tab) with an isolated browsing context
    pub async fn create_target(&self, url: &str) -> Result<String> {
        let result: TargetCreateTargetResult = self
            .transport
            .send(
                "Target.createTarget",
                &TargetCreateTarget {
                    url: url.to_string(),
                },
            )
            .await?;
        Ok(result.target_id)
    }

    /// Attach to a target and get a session
    pub async fn attach_to_target(&self, target_id: &str) -> Result<Session> {
        let result: TargetAttachToTargetResult = self
            .transport
            .send(
                "Target.attachToTarget",
                &TargetAttachToTarget {
                    target_id: target_id.to_string(),
                    flatten: Some(true),
                },
            )
            .await?;

        Ok(Session {
            transport: Arc::clone(&self.transport),
            session_id: result.session_id,
            target_id: target_id.to_string(),
        })
    }

    /// Close a target
    pub async fn close_target(&self, target_id: &str) -> Result<bool> {
        let result: TargetCloseTargetResult = self
            .transport
            .send(
                "Target.closeTarget",
                &TargetCloseTarget {
                    target_id: target_id.to_string(),
                },
            )
            .await?;
        Ok(result.success)
    }

    /// Close the browser
    pub async fn close(&self) -> Result<()> {
        let _ = self
            .transport
            .send::<_, serde_json::Value>("Browser.close", &BrowserClose {})
            .await;
        self.transport.close().await
    }
}

/// A CDP session attached to a specific page target
pub struct Session {
    transport: Arc<Transport>,
    session_id: String,
    target_id: String,
}

impl Session {
    /// Get the session ID
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Get the target ID
    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    /// Send a command to this session
    pub async fn send<C, R>(&self, method: &str, params: &C) -> Result<R>
    where
        C: serde::Serialize,
        R: serde::de::DeserializeOwned,
    {
        self.transport
            .send_to_session(&self.session_id, method, params)
            .await
    }

    /// Subscribe to this session's event stream
    pub async fn subscribe_events(&self) -> mpsc::UnboundedReceiver<PageEvent> {
        self.transport.subscribe(&self.session_id).await
    }

    /// Drop this session's event subscription
    pub async fn unsubscribe_events(&self) {
        self.transport.unsubscribe(&self.session_id).await;
    }

    /// Enable page events
    pub async fn page_enable(&self) -> Result<()> {
        self.send::<_, serde_json::Value>("Page.enable", &PageEnable {})
            .await?;
        Ok(())
    }

    /// Navigate to a URL
    pub async fn navigate(&self, url: &str) -> Result<PageNavigateResult> {
        self.send(
            "Page.navigate",
            &PageNavigate {
                url: url.to_string(),
            },
        )
        .await
    }

    /// Register a script to run on every new document, before page scripts
    pub async fn add_init_script(&self, source: &str) -> Result<String> {
        let result: PageAddScriptToEvaluateOnNewDocumentResult = self
            .send(
                "Page.addScriptToEvaluateOnNewDocument",
                &PageAddScriptToEvaluateOnNewDocument {
                    source: source.to_string(),
                },
            )
            .await?;
        Ok(result.identifier)
    }

    /// Evaluate a JavaScript expression, returning the result by value
    pub async fn evaluate(&self, expression: &str) -> Result<RuntimeEvaluateResult> {
        self.send(
            "Runtime.evaluate",
            &RuntimeEvaluate {
                expression: expression.to_string(),
                return_by_value: Some(true),
                await_promise: Some(true),
            },
        )
        .await
    }

    /// Evaluate an expression and extract its string value, if any
    pub async fn evaluate_string(&self, expression: &str) -> Result<Option<String>> {
        let result = self.evaluate(expression).await?;
        Ok(result
            .result
            .value
            .and_then(|v| v.as_str().map(String::from)))
    }

    /// Get the document root node id
    pub async fn document_node(&self) -> Result<i32> {
        let result: DomGetDocumentResult = self
            .send("DOM.getDocument", &DomGetDocument { depth: Some(0) })
            .await?;
        Ok(result.root.node_id)
    }

    /// Query for a single element; 0 means no match
    pub async fn query_selector(&self, node_id: i32, selector: &str) -> Result<i32> {
        let result: DomQuerySelectorResult = self
            .send(
                "DOM.querySelector",
                &DomQuerySelector {
                    node_id,
                    selector: selector.to_string(),
                },
            )
            .await?;
        Ok(result.node_id)
    }

    /// Override the user agent for this page
    pub async fn set_user_agent(&self, user_agent: &str) -> Result<()> {
        self.send::<_, serde_json::Value>(
            "Network.setUserAgentOverride",
            &NetworkSetUserAgentOverride {
                user_agent: user_agent.to_string(),
            },
        )
        .await?;
        Ok(())
    }

    /// Install extra headers sent with every request from this page
    pub async fn set_extra_headers(&self, headers: &HashMap<String, String>) -> Result<()> {
        self.send::<_, serde_json::Value>(
            "Network.setExtraHTTPHeaders",
            &NetworkSetExtraHttpHeaders {
                headers: headers.clone(),
            },
        )
        .await?;
        Ok(())
    }

    /// Install a mobile device emulation profile (viewport + touch)
    pub async fn emulate_mobile(
        &self,
        width: u32,
        height: u32,
        device_scale_factor: f64,
    ) -> Result<()> {
        self.send::<_, serde_json::Value>(
            "Emulation.setDeviceMetricsOverride",
            &EmulationSetDeviceMetricsOverride {
                width,
                height,
                device_scale_factor,
                mobile: true,
            },
        )
        .await?;
        self.send::<_, serde_json::Value>(
            "Emulation.setTouchEmulationEnabled",
            &EmulationSetTouchEmulationEnabled {
                enabled: true,
                max_touch_points: Some(5),
            },
        )
        .await?;
        Ok(())
    }

    /// Enable request interception for every request, paused at Request stage
    pub async fn fetch_enable(&self) -> Result<()> {
        self.send::<_, serde_json::Value>(
            "Fetch.enable",
            &FetchEnable {
                patterns: vec![RequestPattern {
                    url_pattern: Some("*".to_string()),
                    resource_type: None,
                    request_stage: Some("Request".to_string()),
                }],
            },
        )
        .await?;
        Ok(())
    }

    /// Release a paused request unchanged
    pub async fn fetch_continue(&self, request_id: &str) -> Result<()> {
        self.send::<_, serde_json::Value>(
            "Fetch.continueRequest",
            &FetchContinueRequest {
                request_id: request_id.to_string(),
            },
        )
        .await?;
        Ok(())
    }

    /// Fail a paused request with the given network error reason
    pub async fn fetch_fail(&self, request_id: &str, reason: &str) -> Result<()> {
        self.send::<_, serde_json::Value>(
            "Fetch.failRequest",
            &FetchFailRequest {
                request_id: request_id.to_string(),
                error_reason: reason.to_string(),
            },
        )
        .await?;
        Ok(())
    }
}
