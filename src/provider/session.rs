//! Cleanup registry for the providers of one checkout.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use super::ResourceProvider;

/// Every provider instantiated for one testrun.
///
/// A session is owned by a single checkout; it is never shared between
/// testruns. On failure [`checkin_all`](Self::checkin_all) returns every
/// resource any registered provider still holds.
#[derive(Default)]
pub struct ProviderSession {
    providers: Mutex<Vec<Arc<dyn ResourceProvider>>>,
}

impl ProviderSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, provider: Arc<dyn ResourceProvider>) {
        self.providers.lock().await.push(provider);
    }

    pub async fn len(&self) -> usize {
        self.providers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.providers.lock().await.is_empty()
    }

    /// Calls `checkin_all` once on every registered provider and forgets
    /// them. Never fails.
    pub async fn checkin_all(&self) {
        let providers = std::mem::take(&mut *self.providers.lock().await);
        if providers.is_empty() {
            return;
        }
        info!("Checking in resources of {} provider(s)", providers.len());
        futures::future::join_all(providers.iter().map(|p| p.checkin_all())).await;
    }

    /// Forgets every provider without checking anything in.
    pub async fn reset(&self) {
        self.providers.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ResourceKind;
    use crate::provider::stub::StubProvider;

    #[tokio::test]
    async fn test_checkin_all_reaches_every_provider_once() {
        let session = ProviderSession::new();
        let stubs: Vec<_> = ResourceKind::ALL
            .into_iter()
            .map(|kind| Arc::new(StubProvider::new(kind, 1)))
            .collect();
        for stub in &stubs {
            session.register(stub.clone()).await;
        }
        assert_eq!(session.len().await, 3);

        session.checkin_all().await;
        session.checkin_all().await;

        assert!(session.is_empty().await);
        for stub in &stubs {
            assert_eq!(stub.checkin_all_calls(), 1);
        }
    }

    #[tokio::test]
    async fn test_reset_skips_checkin() {
        let session = ProviderSession::new();
        let stub = Arc::new(StubProvider::new(ResourceKind::Iut, 1));
        session.register(stub.clone()).await;

        session.reset().await;
        session.checkin_all().await;

        assert_eq!(stub.checkin_all_calls(), 0);
    }
}
