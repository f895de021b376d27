//! Requester registry.
//!
//! Descriptors are kept in registration order; lookups go by requester kind,
//! which is unique among live descriptors.

use std::sync::Arc;

use tokio::sync::RwLock;

use super::descriptor::SlDesc;
use crate::core::{IfType, ReqType, SoolinkError, SoolinkResult, TransMode};

/// Live descriptors, in registration order.
#[derive(Debug)]
pub struct Registry {
    descriptors: RwLock<Vec<Arc<SlDesc>>>,
    max_ready_blocks: usize,
}

impl Registry {
    /// Create an empty registry whose descriptors hold `max_ready_blocks`.
    pub fn new(max_ready_blocks: usize) -> Self {
        Self {
            descriptors: RwLock::new(Vec::new()),
            max_ready_blocks,
        }
    }

    /// Register a requester.
    pub async fn register(
        &self,
        req_type: ReqType,
        if_type: IfType,
        trans_mode: TransMode,
    ) -> SoolinkResult<Arc<SlDesc>> {
        let mut descriptors = self.descriptors.write().await;
        if descriptors.iter().any(|d| d.req_type() == req_type) {
            return Err(SoolinkError::AlreadyRegistered(req_type));
        }

        let desc = Arc::new(SlDesc::new(
            req_type,
            if_type,
            trans_mode,
            self.max_ready_blocks,
        ));
        descriptors.push(Arc::clone(&desc));
        tracing::debug!(?req_type, ?if_type, ?trans_mode, "requester registered");
        Ok(desc)
    }

    /// Remove a requester's descriptor and close it.
    pub async fn unregister(&self, desc: &SlDesc) -> SoolinkResult<()> {
        let mut descriptors = self.descriptors.write().await;
        let pos = descriptors
            .iter()
            .position(|d| std::ptr::eq(Arc::as_ptr(d), desc))
            .ok_or(SoolinkError::NotRegistered(desc.req_type()))?;

        let removed = descriptors.remove(pos);
        removed.close();
        tracing::debug!(req_type = ?removed.req_type(), "requester unregistered");
        Ok(())
    }

    /// Find the descriptor of a requester kind.
    pub async fn find(&self, req_type: ReqType) -> Option<Arc<SlDesc>> {
        self.descriptors
            .read()
            .await
            .iter()
            .find(|d| d.req_type() == req_type)
            .cloned()
    }

    /// Descriptors in registration order.
    pub async fn all(&self) -> Vec<Arc<SlDesc>> {
        self.descriptors.read().await.clone()
    }

    /// Close and remove every descriptor.
    pub async fn clear(&self) {
        let mut descriptors = self.descriptors.write().await;
        for desc in descriptors.drain(..) {
            desc.close();
        }
    }
}
