//! Scripted provider for tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::json;

use super::{
    CheckoutRequest, ProviderError, ProviderResult, Resource, ResourceKind, ResourceProvider,
};
use crate::rules::Dataset;

/// Hands out `script[n]` resources on the n-th probe, then `steady` forever.
pub(crate) struct StubProvider {
    id: String,
    kind: ResourceKind,
    script: Mutex<VecDeque<usize>>,
    steady: usize,
    failing: bool,
    next_id: AtomicUsize,
    held: Mutex<Vec<Resource>>,
    probes: AtomicUsize,
    checkins: AtomicUsize,
    checkin_alls: AtomicUsize,
}

impl StubProvider {
    pub fn new(kind: ResourceKind, steady: usize) -> Self {
        Self::scripted(kind, Vec::new(), steady)
    }

    pub fn scripted(kind: ResourceKind, script: Vec<usize>, steady: usize) -> Self {
        Self {
            id: format!("stub-{}", kind.path_segment()),
            kind,
            script: Mutex::new(script.into()),
            steady,
            failing: false,
            next_id: AtomicUsize::new(0),
            held: Mutex::new(Vec::new()),
            probes: AtomicUsize::new(0),
            checkins: AtomicUsize::new(0),
            checkin_alls: AtomicUsize::new(0),
        }
    }

    /// Every checkout fails with a non-retryable error.
    pub fn failing(kind: ResourceKind) -> Self {
        Self {
            failing: true,
            ..Self::new(kind, 0)
        }
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn checkin_calls(&self) -> usize {
        self.checkins.load(Ordering::SeqCst)
    }

    pub fn checkin_all_calls(&self) -> usize {
        self.checkin_alls.load(Ordering::SeqCst)
    }

    pub fn held(&self) -> usize {
        self.held.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn probe(&self, request: &CheckoutRequest) -> Option<Vec<Resource>> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let available = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or(self.steady);
        if available < request.minimum || available == 0 {
            return None;
        }

        let taken: Vec<Resource> = (0..available.min(request.maximum))
            .map(|_| {
                let n = self.next_id.fetch_add(1, Ordering::SeqCst);
                let mut value = json!({"id": format!("{}-{}", self.kind.binding(), n)});
                if self.kind == ResourceKind::ExecutionSpace {
                    value["instructions"] =
                        json!({"identifier": uuid::Uuid::new_v4().to_string()});
                }
                Resource::from_value(self.kind, &self.id, value)
            })
            .collect();
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(taken.iter().cloned());
        Some(taken)
    }
}

#[async_trait]
impl ResourceProvider for StubProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ResourceKind {
        self.kind
    }

    async fn wait_for_and_checkout(
        &self,
        request: &CheckoutRequest,
        _dataset: &Dataset,
    ) -> ProviderResult<Vec<Resource>> {
        if self.failing {
            return Err(ProviderError::CheckoutFailed {
                kind: self.kind,
                reason: "stub refuses".to_string(),
            });
        }
        let found = request
            .policy
            .wait_for("stub", move || async move { self.probe(request) })
            .await;
        found.ok_or_else(|| ProviderError::CheckoutTimeout {
            kind: self.kind,
            provider: self.id.clone(),
            minimum: request.minimum,
            timeout_secs: request.policy.timeout().as_secs(),
            reason: "stub exhausted".to_string(),
        })
    }

    async fn checkin(&self, resource: &Resource) -> ProviderResult<()> {
        self.checkins.fetch_add(1, Ordering::SeqCst);
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|held| held.id != resource.id);
        Ok(())
    }

    async fn checkin_all(&self) {
        self.checkin_alls.fetch_add(1, Ordering::SeqCst);
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    async fn checked_out(&self) -> Vec<Resource> {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
