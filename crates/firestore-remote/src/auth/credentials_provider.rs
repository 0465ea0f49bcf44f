//! Auth token acquisition.
//!
//! The transport never caches or refreshes tokens itself: every call asks the
//! [`CredentialsProvider`] for the current token, and tells it to drop that
//! token when the server rejects it as unauthenticated.

use core::fmt;
use firestore_remote_core::Result;
use futures::{FutureExt, future::BoxFuture};
use portable_atomic::{AtomicUsize, Ordering};

/// An auth token, or the absence of one for unauthenticated access.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Token {
    value: Option<String>,
    uid: Option<String>,
}

impl Token {
    pub fn new(value: impl Into<String>, uid: Option<String>) -> Self {
        Self {
            value: Some(value.into()),
            uid,
        }
    }

    /// A token that sends no `authorization` header.
    pub fn unauthenticated() -> Self {
        Self::default()
    }

    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    /// The user the token was minted for, if known.
    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    pub fn is_valid(&self) -> bool {
        self.value.is_some()
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("value", &self.value.as_ref().map(|_| "<redacted>"))
            .field("uid", &self.uid)
            .finish()
    }
}

/// Source of auth tokens.
///
/// `get_token` may resolve on any thread; callers are responsible for
/// getting back onto their own execution context.
pub trait CredentialsProvider: Send + Sync + 'static {
    fn get_token(&self) -> BoxFuture<'static, Result<Token>>;

    /// Marks the current token as rejected so the next `get_token` fetches a
    /// fresh one.
    fn invalidate_token(&self) {}
}

/// Always yields an unauthenticated token.
#[derive(Clone, Copy, Debug, Default)]
pub struct EmptyCredentialsProvider;

impl CredentialsProvider for EmptyCredentialsProvider {
    fn get_token(&self) -> BoxFuture<'static, Result<Token>> {
        futures::future::ready(Ok(Token::unauthenticated())).boxed()
    }
}

/// Yields the same token forever. Invalidation is counted but otherwise
/// ignored, since there is nothing to refresh.
#[derive(Debug)]
pub struct StaticCredentialsProvider {
    token: Token,
    invalidations: AtomicUsize,
}

impl StaticCredentialsProvider {
    pub fn new(token: Token) -> Self {
        Self {
            token,
            invalidations: AtomicUsize::new(0),
        }
    }

    pub fn invalidations(&self) -> usize {
        self.invalidations.load(Ordering::Relaxed)
    }
}

impl CredentialsProvider for StaticCredentialsProvider {
    fn get_token(&self) -> BoxFuture<'static, Result<Token>> {
        futures::future::ready(Ok(self.token.clone())).boxed()
    }

    fn invalidate_token(&self) {
        let count = self.invalidations.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::warn!(invalidations = count, "Static token rejected by the server");
    }
}
