//! Conformance suites shared by every storage implementation
//!
//! Each suite takes a constructor so the same assertions run against the in-memory engine,
//! the multiplexer and the instrumentation decorator.

use std::sync::Arc;
use std::time::Duration;

use pubpoll_types::{
    Channel, ChannelId, ChannelProvider, Error, JwtJti, ManualClock, Message, MessageId,
    Result, SubscriberId, SubscriberLocator, SystemClock,
};

use crate::traits::Storage;

/// Resolves every well-formed ID, except the ones starting with `invalid-`
pub(crate) struct StubChannelProvider {
    expire: Duration,
}

impl ChannelProvider for StubChannelProvider {
    fn get(&self, id: &ChannelId) -> Result<Arc<Channel>> {
        if id.as_str().starts_with("invalid-") {
            return Err(Error::InvalidChannel(id.to_string()));
        }
        Ok(Arc::new(Channel::new(id.clone(), self.expire)))
    }

    fn jwt_clock_skew_leeway_max(&self) -> Duration {
        Duration::ZERO
    }
}

pub(crate) fn stub_channels(expire: Duration) -> Arc<dyn ChannelProvider> {
    Arc::new(StubChannelProvider { expire })
}

pub(crate) fn channel_id(id: &str) -> ChannelId {
    ChannelId::new(id).unwrap()
}

pub(crate) fn locator(channel: &str, subscriber: &str) -> SubscriberLocator {
    SubscriberLocator::new(channel_id(channel), SubscriberId::new(subscriber).unwrap())
}

pub(crate) fn message(channel: &str, id: &str, content: &str) -> Message {
    Message::new(
        channel_id(channel),
        MessageId::new(id).unwrap(),
        content.to_string(),
    )
}

fn ids(messages: &[Message]) -> Vec<&str> {
    messages.iter().map(|m| m.message_id.as_str()).collect()
}

fn setup<F>(ctor: F) -> Arc<dyn Storage>
where
    F: Fn(Arc<dyn SystemClock>, Arc<dyn ChannelProvider>) -> Arc<dyn Storage>,
{
    ctor(
        Arc::new(ManualClock::starting_now()),
        stub_channels(Duration::from_secs(60)),
    )
}

/// Probes, identity and shutdown
pub(crate) async fn core_function_test<F>(ctor: F)
where
    F: Fn(Arc<dyn SystemClock>, Arc<dyn ChannelProvider>) -> Arc<dyn Storage>,
{
    let storage = setup(ctor);

    assert!(!storage.to_string().is_empty());
    storage.liveness().await.unwrap();
    storage.readiness().await.unwrap();
    storage.shutdown().await.unwrap();
}

/// Publish and poll semantics. Run under a paused Tokio clock.
pub(crate) async fn pubsub_test<F>(ctor: F)
where
    F: Fn(Arc<dyn SystemClock>, Arc<dyn ChannelProvider>) -> Arc<dyn Storage>,
{
    let storage = setup(ctor);
    let pubsub = storage.as_pubsub().expect("pub/sub capability");
    let s1 = locator("ch-1", "s1");
    let s2 = locator("ch-1", "s2");

    // Register both subscribers
    assert!(pubsub.poll(&s1, 64, Duration::ZERO).await.unwrap().is_empty());
    assert!(pubsub.poll(&s2, 64, Duration::ZERO).await.unwrap().is_empty());

    // FIFO delivery to every subscriber
    for id in ["m1", "m2", "m3"] {
        pubsub.publish(&message("ch-1", id, "payload")).await.unwrap();
    }
    let received = pubsub.poll(&s1, 64, Duration::ZERO).await.unwrap();
    assert_eq!(ids(&received), vec!["m1", "m2", "m3"]);
    assert_eq!(received[0].content_as_str(), Some("payload"));
    assert!(pubsub.poll(&s1, 64, Duration::ZERO).await.unwrap().is_empty());

    // max_messages bounds a single poll
    let first = pubsub.poll(&s2, 1, Duration::ZERO).await.unwrap();
    assert_eq!(ids(&first), vec!["m1"]);
    let rest = pubsub.poll(&s2, 64, Duration::ZERO).await.unwrap();
    assert_eq!(ids(&rest), vec!["m2", "m3"]);

    // A message ID is delivered once
    pubsub.publish(&message("ch-1", "m4", "a")).await.unwrap();
    pubsub.publish(&message("ch-1", "m4", "a")).await.unwrap();
    assert_eq!(ids(&pubsub.poll(&s1, 64, Duration::ZERO).await.unwrap()), vec!["m4"]);

    // Channels are isolated
    let other = locator("ch-2", "s1");
    assert!(pubsub.poll(&other, 64, Duration::ZERO).await.unwrap().is_empty());

    assert!(pubsub.publish(&message("invalid-ch", "m1", "a")).await.is_err());
    assert!(pubsub
        .poll(&locator("invalid-ch", "s1"), 64, Duration::ZERO)
        .await
        .is_err());

    // Timeout yields an empty batch
    let started = tokio::time::Instant::now();
    let received = pubsub
        .poll(&s1, 64, Duration::from_millis(200))
        .await
        .unwrap();
    assert!(received.is_empty());
    assert!(started.elapsed() >= Duration::from_millis(200));

    // A blocked poll returns as soon as a message arrives
    let publisher = Arc::clone(&storage);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        publisher
            .as_pubsub()
            .unwrap()
            .publish(&message("ch-1", "m5", "late"))
            .await
            .unwrap();
    });
    let started = tokio::time::Instant::now();
    let received = pubsub.poll(&s1, 64, Duration::from_secs(5)).await.unwrap();
    assert_eq!(ids(&received), vec!["m5"]);
    assert!(started.elapsed() < Duration::from_secs(5));

    storage.shutdown().await.unwrap();
}

/// JWT revocation semantics
pub(crate) async fn jwt_test<F>(ctor: F)
where
    F: Fn(Arc<dyn SystemClock>, Arc<dyn ChannelProvider>) -> Arc<dyn Storage>,
{
    let clock = Arc::new(ManualClock::starting_now());
    let storage = ctor(clock.clone(), stub_channels(Duration::from_secs(60)));
    let jwt = storage.as_jwt().expect("jwt capability");
    let exp = clock.now() + chrono::Duration::hours(1);
    let revoked = JwtJti::new("jti-1").unwrap();
    let unknown = JwtJti::new("jti-2").unwrap();

    assert!(!jwt.is_revoked_jwt(&revoked).await.unwrap());

    jwt.revoke_jwt(exp, &revoked).await.unwrap();
    jwt.revoke_jwt(exp, &revoked).await.unwrap();
    assert!(jwt.is_revoked_jwt(&revoked).await.unwrap());
    assert!(!jwt.is_revoked_jwt(&unknown).await.unwrap());

    storage.shutdown().await.unwrap();
}
