// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt::Debug;
use std::sync::Arc;
use std::{future::Future, pin::Pin};
use tokio::sync::OnceCell;

/// Identity fields merged into every event payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub installation_id: String,
    pub session_id: String,
}

impl Identity {
    pub fn new(installation_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            installation_id: installation_id.into(),
            session_id: session_id.into(),
        }
    }
}

pub type IdentityResolverFn =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Identity> + Send>> + Send + Sync>;

/// Supplies the installation and session ids. They are resolved at most once
/// per provider and never regenerated by the pipeline.
#[derive(Clone)]
pub enum IdentityProvider {
    Static(Identity),
    Dynamic {
        resolver_fn: IdentityResolverFn,
        identity: Arc<OnceCell<Identity>>,
    },
}

impl IdentityProvider {
    pub fn new_from_resolver(resolver_fn: IdentityResolverFn) -> Self {
        Self::Dynamic {
            resolver_fn,
            identity: Arc::new(OnceCell::new()),
        }
    }

    pub fn new_from_static(identity: Identity) -> Self {
        Self::Static(identity)
    }

    pub async fn get_identity(&self) -> &Identity {
        match self {
            Self::Static(identity) => identity,
            Self::Dynamic {
                resolver_fn,
                identity,
            } => {
                identity
                    .get_or_init(|| async { (resolver_fn)().await })
                    .await
            }
        }
    }
}

impl Debug for IdentityProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IdentityProvider")
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn new_from_resolver() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let provider = IdentityProvider::new_from_resolver(Arc::new(move || {
            counted.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move { Identity::new("install-1", "session-1") })
        }));

        assert_eq!(
            provider.get_identity().await,
            &Identity::new("install-1", "session-1")
        );
        // Resolved once, cached afterwards
        assert_eq!(provider.get_identity().await.session_id, "session-1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn new_from_static() {
        let provider = IdentityProvider::new_from_static(Identity::new("install-2", "session-2"));
        assert_eq!(provider.get_identity().await.installation_id, "install-2");
    }
}
