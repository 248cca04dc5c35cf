//! Reacts to participants appearing in and leaving the room

use futures_util::future::join_all;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::coordinator::{HandshakeOutcome, TransportCoordinator};
use crate::error::{Result, SessionError};

#[derive(Clone)]
pub struct ParticipantEventRouter {
    coordinator: Arc<TransportCoordinator>,
}

impl ParticipantEventRouter {
    pub fn new(coordinator: Arc<TransportCoordinator>) -> Self {
        Self { coordinator }
    }

    /// Start consuming a new remote producer on its own task
    pub fn producer_appeared(&self, remote_producer_id: String) -> JoinHandle<Result<HandshakeOutcome>> {
        tracing::info!("Producer {} appeared", remote_producer_id);
        let coordinator = Arc::clone(&self.coordinator);
        // Reserved before spawning so a producer-closed handled next sees it
        let ticket = coordinator.begin_consume(&remote_producer_id);
        tokio::spawn(async move {
            match ticket {
                Some(ticket) => coordinator.finish_consume(&remote_producer_id, ticket).await,
                None => Ok(HandshakeOutcome::AlreadyTracked),
            }
        })
    }

    /// Release everything held for a producer that left. Unknown ids are
    /// ignored.
    pub async fn producer_closed(&self, remote_producer_id: &str) {
        tracing::info!("Producer {} closed", remote_producer_id);
        match self.coordinator.release_remote(remote_producer_id).await {
            Ok(()) => {}
            Err(SessionError::StaleEvent(id)) => {
                tracing::debug!("Ignoring producer-closed for untracked producer {}", id);
            }
            Err(e) => tracing::warn!("Failed to release producer {}: {}", remote_producer_id, e),
        }
    }

    /// Consume every producer already in the room. Individual failures are
    /// logged and do not fail the discovery.
    pub async fn discover_existing_producers(&self) -> Result<Vec<HandshakeOutcome>> {
        let producer_ids = self.coordinator.signaling().get_producers().await?;
        tracing::info!("Discovered {} existing producers", producer_ids.len());

        let handshakes = producer_ids.iter().map(|id| {
            let coordinator = Arc::clone(&self.coordinator);
            async move { (id, coordinator.consume_remote(id).await) }
        });

        let outcomes = join_all(handshakes)
            .await
            .into_iter()
            .filter_map(|(id, result)| match result {
                Ok(outcome) => Some(outcome),
                Err(e) => {
                    tracing::warn!("Discovery of producer {} failed: {}", id, e);
                    None
                }
            })
            .collect();

        Ok(outcomes)
    }
}
