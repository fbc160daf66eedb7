//! Storage multiplexer
//!
//! Presents a fixed set of named storages as one [`Storage`]. Writes go to every capable
//! child, reads are merged across children, and health signals are aggregated. Children
//! are only ever seen through the capability traits, so decorated children and
//! decorated multiplexers behave the same.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use pubpoll_types::{
    Error, JwtExp, JwtJti, Message, Result, StorageId, SubscriberLocator,
};
use serde_json::{json, Map};
use tracing::{debug, warn};

use crate::traits::{JwtStorage, ProbeDetail, PubSubStorage, Storage};

/// Turn per-child failures into a single result
fn join_errors(errors: Vec<(StorageId, Error)>) -> Result<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::Aggregate(errors))
    }
}

/// Composes several storages into one
pub struct StorageMultiplexer {
    children: BTreeMap<StorageId, Arc<dyn Storage>>,
}

impl StorageMultiplexer {
    /// Wrap a non-empty set of storages
    pub fn new(children: BTreeMap<StorageId, Arc<dyn Storage>>) -> Result<Self> {
        if children.is_empty() {
            return Err(Error::Config(
                "storage multiplexer requires at least one storage".to_string(),
            ));
        }
        Ok(Self { children })
    }

    fn pubsub_children(&self) -> Vec<(&StorageId, &dyn PubSubStorage)> {
        self.children
            .iter()
            .filter_map(|(id, storage)| storage.as_pubsub().map(|p| (id, p)))
            .collect()
    }

    fn jwt_children(&self) -> Vec<(&StorageId, &dyn JwtStorage)> {
        self.children
            .iter()
            .filter_map(|(id, storage)| storage.as_jwt().map(|j| (id, j)))
            .collect()
    }

    async fn probe(&self, readiness: bool) -> Result<ProbeDetail> {
        let results = join_all(self.children.iter().map(|(id, storage)| async move {
            let result = if readiness {
                storage.readiness().await
            } else {
                storage.liveness().await
            };
            (id, result)
        }))
        .await;

        let mut detail = Map::new();
        let mut errors = Vec::new();
        for (id, result) in results {
            match result {
                Ok(child) => {
                    detail.insert(id.to_string(), child);
                }
                Err(e) => {
                    detail.insert(id.to_string(), json!({ "error": e.to_string() }));
                    errors.push((id.clone(), e));
                }
            }
        }
        join_errors(errors)?;
        Ok(ProbeDetail::Object(detail))
    }
}

impl fmt::Display for StorageMultiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("multiplexer(")?;
        for (i, id) in self.children.keys().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", id)?;
        }
        f.write_str(")")
    }
}

#[async_trait]
impl Storage for StorageMultiplexer {
    fn file_descriptor_pressure(&self) -> usize {
        self.children
            .values()
            .map(|storage| storage.file_descriptor_pressure())
            .sum()
    }

    async fn liveness(&self) -> Result<ProbeDetail> {
        self.probe(false).await
    }

    async fn readiness(&self) -> Result<ProbeDetail> {
        self.probe(true).await
    }

    async fn shutdown(&self) -> Result<()> {
        let results = join_all(
            self.children
                .iter()
                .map(|(id, storage)| async move { (id, storage.shutdown().await) }),
        )
        .await;
        join_errors(
            results
                .into_iter()
                .filter_map(|(id, result)| result.err().map(|e| (id.clone(), e)))
                .collect(),
        )
    }

    fn as_pubsub(&self) -> Option<&dyn PubSubStorage> {
        if self.children.values().any(|s| s.as_pubsub().is_some()) {
            Some(self)
        } else {
            None
        }
    }

    fn as_jwt(&self) -> Option<&dyn JwtStorage> {
        if self.children.values().any(|s| s.as_jwt().is_some()) {
            Some(self)
        } else {
            None
        }
    }
}

/// Poll every given child without waiting
async fn sweep<'a>(
    children: &[(&'a StorageId, &'a dyn PubSubStorage)],
    subscriber: &SubscriberLocator,
    max_messages: usize,
) -> Vec<(&'a StorageId, Result<Vec<Message>>)> {
    join_all(children.iter().map(|&(id, pubsub)| async move {
        (id, pubsub.poll(subscriber, max_messages, Duration::ZERO).await)
    }))
    .await
}

#[async_trait]
impl PubSubStorage for StorageMultiplexer {
    async fn publish(&self, message: &Message) -> Result<()> {
        let children = self.pubsub_children();
        if children.is_empty() {
            return Err(Error::Unsupported("pubsub"));
        }
        let results = join_all(
            children
                .iter()
                .map(|&(id, pubsub)| async move { (id, pubsub.publish(message).await) }),
        )
        .await;
        join_errors(
            results
                .into_iter()
                .filter_map(|(id, result)| result.err().map(|e| (id.clone(), e)))
                .collect(),
        )
    }

    /// Concurrent merge: a zero-wait sweep first, then a race of blocking polls that ends
    /// at the first non-empty answer, then another sweep of the remaining children.
    /// `max_messages` applies to each child, and duplicates across children are dropped.
    async fn poll(
        &self,
        subscriber: &SubscriberLocator,
        max_messages: usize,
        max_wait: Duration,
    ) -> Result<Vec<Message>> {
        let children = self.pubsub_children();
        if children.is_empty() {
            return Err(Error::Unsupported("pubsub"));
        }

        let mut batches: BTreeMap<&StorageId, Vec<Message>> = BTreeMap::new();
        let mut errors = Vec::new();
        let mut healthy = Vec::with_capacity(children.len());

        for (id, result) in sweep(&children, subscriber, max_messages).await {
            match result {
                Ok(messages) => {
                    if !messages.is_empty() {
                        batches.insert(id, messages);
                    }
                    healthy.push(id);
                }
                Err(e) => errors.push((id.clone(), e)),
            }
        }
        let healthy: Vec<_> = children
            .into_iter()
            .filter(|(id, _)| healthy.contains(id))
            .collect();

        if batches.is_empty() && !healthy.is_empty() && !max_wait.is_zero() {
            let mut racing: FuturesUnordered<_> = healthy
                .iter()
                .map(|&(id, pubsub)| async move {
                    (id, pubsub.poll(subscriber, max_messages, max_wait).await)
                })
                .collect();

            let mut winner = None;
            while let Some((id, result)) = racing.next().await {
                match result {
                    Ok(messages) if !messages.is_empty() => {
                        batches.insert(id, messages);
                        winner = Some(id);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => errors.push((id.clone(), e)),
                }
            }
            // Pending polls are dropped; nothing they have not returned is consumed.
            drop(racing);

            if let Some(winner) = winner {
                let others: Vec<_> = healthy
                    .iter()
                    .copied()
                    .filter(|&(id, _)| id != winner)
                    .collect();
                for (id, result) in sweep(&others, subscriber, max_messages).await {
                    match result {
                        Ok(messages) if !messages.is_empty() => {
                            batches.insert(id, messages);
                        }
                        Ok(_) => {}
                        Err(e) => errors.push((id.clone(), e)),
                    }
                }
            }
        }

        if batches.is_empty() {
            join_errors(errors)?;
            return Ok(Vec::new());
        }
        for (id, e) in &errors {
            warn!(storage = %id, subscriber = %subscriber, error = %e, "Poll failed on one storage");
        }

        let mut seen = HashSet::new();
        let merged: Vec<Message> = batches
            .into_values()
            .flatten()
            .filter(|m| seen.insert(m.message_id.clone()))
            .collect();
        debug!(subscriber = %subscriber, count = merged.len(), "Merged poll results");
        Ok(merged)
    }
}

#[async_trait]
impl JwtStorage for StorageMultiplexer {
    async fn revoke_jwt(&self, exp: JwtExp, jti: &JwtJti) -> Result<()> {
        let children = self.jwt_children();
        if children.is_empty() {
            return Err(Error::Unsupported("jwt"));
        }
        let results = join_all(
            children
                .iter()
                .map(|&(id, jwt)| async move { (id, jwt.revoke_jwt(exp, jti).await) }),
        )
        .await;
        join_errors(
            results
                .into_iter()
                .filter_map(|(id, result)| result.err().map(|e| (id.clone(), e)))
                .collect(),
        )
    }

    /// Revoked if any child says so; a failing child cannot vouch for a token
    async fn is_revoked_jwt(&self, jti: &JwtJti) -> Result<bool> {
        let children = self.jwt_children();
        if children.is_empty() {
            return Err(Error::Unsupported("jwt"));
        }
        let results = join_all(
            children
                .iter()
                .map(|&(id, jwt)| async move { (id, jwt.is_revoked_jwt(jti).await) }),
        )
        .await;

        let mut errors = Vec::new();
        for (id, result) in results {
            match result {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(e) => errors.push((id.clone(), e)),
            }
        }
        join_errors(errors)?;
        Ok(false)
    }
}
