//! Pending-operation handles
//!
//! Every caller-facing operation returns a [`Token`] immediately. The client
//! resolves it exactly once, when the matching acknowledgement arrives or the
//! operation is abandoned; waiting with a timeout only stops the caller's
//! wait and never cancels the operation.

use crate::error::ClientError;
use crate::packet::{ConnectReturnCode, QoS};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::watch;

/// Which operation a token tracks, with its operation-specific data
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Connect,
    Publish,
    Subscribe { filters: Vec<(String, QoS)> },
    Unsubscribe { filters: Vec<String> },
    Disconnect,
}

/// Final state of a resolved token
#[derive(Debug, Default)]
pub(crate) struct Outcome {
    pub error: Option<ClientError>,
    pub return_code: Option<ConnectReturnCode>,
    pub session_present: bool,
    pub granted_qos: Vec<u8>,
    pub message_id: Option<u16>,
}

impl Outcome {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn failed(error: ClientError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }
}

#[derive(Debug)]
struct TokenInner {
    kind: TokenKind,
    outcome: OnceLock<Outcome>,
    done: watch::Sender<bool>,
}

/// Handle on an in-flight operation
#[derive(Debug, Clone)]
pub struct Token {
    inner: Arc<TokenInner>,
}

impl Token {
    pub(crate) fn new(kind: TokenKind) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            inner: Arc::new(TokenInner {
                kind,
                outcome: OnceLock::new(),
                done,
            }),
        }
    }

    /// A token already resolved with `error`, for operations rejected before
    /// any network activity
    pub(crate) fn failed(kind: TokenKind, error: ClientError) -> Self {
        let token = Self::new(kind);
        token.resolve(Outcome::failed(error));
        token
    }

    /// Resolve the token; returns false if it was already resolved
    pub(crate) fn resolve(&self, outcome: Outcome) -> bool {
        if self.inner.outcome.set(outcome).is_err() {
            return false;
        }
        self.inner.done.send_replace(true);
        true
    }

    pub(crate) fn resolve_ok(&self) -> bool {
        self.resolve(Outcome::ok())
    }

    pub(crate) fn resolve_err(&self, error: ClientError) -> bool {
        self.resolve(Outcome::failed(error))
    }

    pub fn kind(&self) -> &TokenKind {
        &self.inner.kind
    }

    pub fn is_complete(&self) -> bool {
        self.inner.outcome.get().is_some()
    }

    /// Wait until the operation completes
    pub async fn wait(&self) {
        let mut done = self.inner.done.subscribe();
        // The sender lives as long as `self`, so this only returns once resolved
        let _ = done.wait_for(|resolved| *resolved).await;
    }

    /// Wait at most `timeout`; returns whether the operation completed
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }

    /// Error of a completed operation, `None` while pending or on success
    pub fn error(&self) -> Option<&ClientError> {
        self.inner.outcome.get().and_then(|o| o.error.as_ref())
    }

    /// CONNACK return code of a completed connect
    pub fn return_code(&self) -> Option<ConnectReturnCode> {
        self.inner.outcome.get().and_then(|o| o.return_code)
    }

    /// Whether the broker resumed an existing session on connect
    pub fn session_present(&self) -> bool {
        self.inner
            .outcome
            .get()
            .map(|o| o.session_present)
            .unwrap_or(false)
    }

    /// SUBACK return codes of a completed subscribe, one per filter
    pub fn granted_qos(&self) -> &[u8] {
        self.inner
            .outcome
            .get()
            .map(|o| o.granted_qos.as_slice())
            .unwrap_or(&[])
    }

    /// Message id used for a completed QoS 1/2 publish, subscribe or unsubscribe
    pub fn message_id(&self) -> Option<u16> {
        self.inner.outcome.get().and_then(|o| o.message_id)
    }

    /// Topic filters of a subscribe or unsubscribe token
    pub fn filters(&self) -> Vec<String> {
        match &self.inner.kind {
            TokenKind::Subscribe { filters } => filters.iter().map(|(f, _)| f.clone()).collect(),
            TokenKind::Unsubscribe { filters } => filters.clone(),
            _ => Vec::new(),
        }
    }

    pub(crate) fn same(&self, other: &Token) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
