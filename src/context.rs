//! Explicit interception context.
//!
//! There is no process-wide interceptor: callers build an
//! [`InterceptorContext`], register gateways in it, and pass it to whatever
//! captures requests (for example [`crate::remote::RemoteClient`]).

use crate::decision::Decision;
use crate::error::{Result, TimesFailure, ValidationError};
use crate::gateway::InterceptionGateway;
use crate::message::{InterceptedRequest, MockResponse};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// A set of gateways, each owning one base URL.
///
/// Clones share the same set.
#[derive(Debug, Clone, Default)]
pub struct InterceptorContext {
    gateways: Arc<RwLock<Vec<Arc<InterceptionGateway>>>>,
}

impl InterceptorContext {
    /// Empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a gateway. A gateway with the same base URL is replaced.
    pub async fn register(&self, gateway: Arc<InterceptionGateway>) {
        let mut gateways = self.gateways.write().await;
        gateways.retain(|existing| existing.base_url() != gateway.base_url());
        debug!(base_url = %gateway.base_url(), "Gateway registered");
        gateways.push(gateway);
    }

    /// Remove the gateway for `base_url`. Returns it if present.
    pub async fn unregister(&self, base_url: &url::Url) -> Option<Arc<InterceptionGateway>> {
        let mut gateways = self.gateways.write().await;
        let index = gateways.iter().position(|g| g.base_url() == base_url)?;
        Some(gateways.remove(index))
    }

    /// Registered gateways, in registration order.
    pub async fn gateways(&self) -> Vec<Arc<InterceptionGateway>> {
        self.gateways.read().await.clone()
    }

    /// Running gateway with the most specific base URL containing `request`.
    pub async fn gateway_for(&self, request: &InterceptedRequest) -> Option<Arc<InterceptionGateway>> {
        self.gateways
            .read()
            .await
            .iter()
            .filter(|g| g.is_running() && g.relative_path(&request.url).is_some())
            .max_by_key(|g| g.specificity())
            .cloned()
    }

    /// Decide `request` through the owning gateway; `Bypass` when none owns it.
    pub async fn dispatch(&self, request: &InterceptedRequest) -> Result<Decision> {
        match self.gateway_for(request).await {
            Some(gateway) => gateway.decide(request).await,
            None => {
                debug!(url = %request.url, "No gateway owns request");
                Ok(Decision::Bypass)
            }
        }
    }

    /// Handle `request` through the owning gateway.
    ///
    /// Returns `None` when no running gateway owns it.
    pub async fn handle(&self, request: &InterceptedRequest) -> Option<Result<MockResponse>> {
        let gateway = self.gateway_for(request).await?;
        Some(gateway.handle(request).await)
    }

    /// Check usage bounds of every gateway's registry, aggregating failures.
    pub async fn check_times(&self) -> std::result::Result<(), ValidationError> {
        let mut failures: Vec<TimesFailure> = Vec::new();
        for gateway in self.gateways().await {
            if let Err(ValidationError::TimesNotSatisfied { failures: found }) =
                gateway.registry().check_times().await
            {
                failures.extend(found);
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::TimesNotSatisfied { failures })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{HandlerDeclaration, HandlerRegistry};
    use http::Method;

    async fn gateway(base: &str, body: &str) -> Arc<InterceptionGateway> {
        let registry = HandlerRegistry::new();
        registry
            .register(
                HandlerDeclaration::any("/**")
                    .unwrap()
                    .respond_with(MockResponse::ok().with_text(body.to_string())),
            )
            .await;
        let gateway = Arc::new(InterceptionGateway::new(base, registry).unwrap());
        gateway.start();
        gateway
    }

    fn get(url: &str) -> InterceptedRequest {
        InterceptedRequest::new(Method::GET, url).unwrap()
    }

    #[tokio::test]
    async fn test_dispatch_prefers_longest_base_url() {
        let context = InterceptorContext::new();
        context.register(gateway("http://api.test", "root").await).await;
        context.register(gateway("http://api.test/v2", "v2").await).await;

        let decision = context.dispatch(&get("http://api.test/v2/users")).await.unwrap();
        assert_eq!(decision.response().and_then(|r| r.text()), Some("v2"));

        let decision = context.dispatch(&get("http://api.test/v1/users")).await.unwrap();
        assert_eq!(decision.response().and_then(|r| r.text()), Some("root"));
    }

    #[tokio::test]
    async fn test_unowned_and_stopped_gateways_bypass() {
        let context = InterceptorContext::new();
        let stopped = gateway("http://api.test", "stopped").await;
        stopped.stop();
        context.register(stopped).await;

        assert!(context.dispatch(&get("http://api.test/a")).await.unwrap().is_bypass());
        assert!(context.dispatch(&get("http://elsewhere.test/a")).await.unwrap().is_bypass());
        assert!(context.handle(&get("http://elsewhere.test/a")).await.is_none());
    }

    #[tokio::test]
    async fn test_register_replaces_same_base_url() {
        let context = InterceptorContext::new();
        context.register(gateway("http://api.test", "first").await).await;
        context.register(gateway("http://api.test", "second").await).await;
        assert_eq!(context.gateways().await.len(), 1);

        let response = context.handle(&get("http://api.test/x")).await.unwrap().unwrap();
        assert_eq!(response.text(), Some("second"));

        let base = url::Url::parse("http://api.test").unwrap();
        assert!(context.unregister(&base).await.is_some());
        assert!(context.gateways().await.is_empty());
    }

    #[tokio::test]
    async fn test_check_times_aggregates_registries() {
        let context = InterceptorContext::new();
        for base in ["http://a.test", "http://b.test"] {
            let registry = HandlerRegistry::new();
            registry
                .register(HandlerDeclaration::get("/x").unwrap().respond_with(MockResponse::ok()).once())
                .await;
            context
                .register(Arc::new(InterceptionGateway::new(base, registry).unwrap()))
                .await;
        }
        let Err(ValidationError::TimesNotSatisfied { failures }) = context.check_times().await else {
            panic!("expected unmet usage bounds");
        };
        assert_eq!(failures.len(), 2);
    }
}
