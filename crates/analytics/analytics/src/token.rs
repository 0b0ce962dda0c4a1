//! Access token providers for proxy mode.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::error::{AnalyticsError, AnalyticsResult};

/// Boxed future returned by function-based providers.
pub type TokenFuture = Pin<Box<dyn Future<Output = AnalyticsResult<String>> + Send>>;

/// Source of opaque bearer tokens for the analytics proxy.
///
/// The pipeline asks for a token once at startup and again whenever the
/// proxy answers 401. Tokens carry no expiry the pipeline knows about.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Fetches a fresh token.
    async fn fetch_token(&self) -> AnalyticsResult<String>;
}

/// Wrapper for function-based token providers.
pub struct FnTokenProvider<F>
where
    F: Fn() -> TokenFuture + Send + Sync,
{
    provider: F,
}

impl<F> FnTokenProvider<F>
where
    F: Fn() -> TokenFuture + Send + Sync,
{
    /// Creates a new function token provider.
    pub fn new(provider: F) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl<F> TokenProvider for FnTokenProvider<F>
where
    F: Fn() -> TokenFuture + Send + Sync,
{
    async fn fetch_token(&self) -> AnalyticsResult<String> {
        (self.provider)().await
    }
}

/// Provider handing out a fixed sequence of tokens, then repeating the last.
///
/// Useful for tests and for deployments with a long-lived token.
pub struct StaticTokenProvider {
    tokens: Vec<String>,
    calls: AtomicUsize,
}

impl StaticTokenProvider {
    /// Creates a provider that always returns the same token.
    pub fn new(token: impl Into<String>) -> Self {
        Self::sequence([token.into()])
    }

    /// Creates a provider returning the given tokens in order.
    pub fn sequence<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Returns how many tokens were handed out.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn fetch_token(&self) -> AnalyticsResult<String> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.tokens
            .get(call)
            .or_else(|| self.tokens.last())
            .cloned()
            .ok_or_else(|| AnalyticsError::Token("no token configured".to_string()))
    }
}
