//! Channel resolution
//!
//! Channels are not declared one by one. The `channels` configuration section lists
//! atoms, each a regex over channel IDs with the settings it contributes. A channel is the
//! merge of every atom its ID matches.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use pubpoll_types::{
    Channel, ChannelId, ChannelProvider, Error, HumanDuration, JwtPolicy, Result, SystemClock,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// How long an unknown channel ID stays cached as unknown
pub const NEGATIVE_CACHE_TTL: Duration = Duration::from_secs(60);

/// Minimum pause between two cache eviction sweeps
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// One entry of the `channels` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ChannelConfig {
    /// Pattern the whole channel ID must match
    pub regex: String,

    /// Lifetime of messages and idle subscribers
    #[serde(default = "default_channel_expire")]
    pub expire: HumanDuration,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt: Option<ChannelJwtConfig>,
}

/// JWT requirements of the channels matched by an atom
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ChannelJwtConfig {
    /// Accepted issuers
    #[serde(default)]
    pub iss: Vec<String>,

    #[serde(default)]
    pub clock_skew_leeway: HumanDuration,
}

fn default_channel_expire() -> HumanDuration {
    HumanDuration::from_secs(30 * 60)
}

impl ChannelConfig {
    /// A single atom matching every channel ID
    pub fn catch_all() -> Self {
        Self {
            regex: ".+".to_string(),
            expire: default_channel_expire(),
            jwt: None,
        }
    }
}

struct ChannelAtom {
    regex: Regex,
    expire: Duration,
    jwt: Option<JwtPolicy>,
}

/// Resolves channels from the configured atoms
pub struct ConfigChannelProvider {
    atoms: Vec<ChannelAtom>,
}

impl ConfigChannelProvider {
    pub fn new(configs: &[ChannelConfig]) -> Result<Self> {
        let atoms = configs
            .iter()
            .enumerate()
            .map(|(i, config)| {
                let regex = Regex::new(&format!("^(?:{})$", config.regex)).map_err(|e| {
                    Error::Config(format!(
                        "channels[{}].regex {:?} is not a valid regex: {}",
                        i, config.regex, e
                    ))
                })?;
                Ok(ChannelAtom {
                    regex,
                    expire: config.expire.as_duration(),
                    jwt: config.jwt.as_ref().map(|jwt| JwtPolicy {
                        issuers: jwt.iss.clone(),
                        clock_skew_leeway: jwt.clock_skew_leeway.as_duration(),
                    }),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { atoms })
    }
}

impl ChannelProvider for ConfigChannelProvider {
    fn get(&self, id: &ChannelId) -> Result<Arc<Channel>> {
        let mut matched = self
            .atoms
            .iter()
            .filter(|atom| atom.regex.is_match(id.as_str()))
            .peekable();
        if matched.peek().is_none() {
            return Err(Error::InvalidChannel(id.to_string()));
        }

        let mut expire = Duration::ZERO;
        let mut jwt = None;
        for atom in matched {
            expire = expire.max(atom.expire);
            if jwt.is_none() {
                jwt = atom.jwt.clone();
            }
        }

        let channel = Channel::new(id.clone(), expire);
        Ok(Arc::new(match jwt {
            Some(jwt) => channel.with_jwt(jwt),
            None => channel,
        }))
    }

    fn jwt_clock_skew_leeway_max(&self) -> Duration {
        self.atoms
            .iter()
            .filter_map(|atom| atom.jwt.as_ref().map(|jwt| jwt.clock_skew_leeway))
            .max()
            .unwrap_or(Duration::ZERO)
    }
}

enum CacheEntry {
    Found {
        channel: Arc<Channel>,
        last_access: DateTime<Utc>,
    },
    Missing {
        until: DateTime<Utc>,
    },
}

impl CacheEntry {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        match self {
            CacheEntry::Found {
                channel,
                last_access,
            } => {
                let idle = now.signed_duration_since(*last_access);
                idle.to_std().map_or(true, |idle| idle <= channel.expire())
            }
            CacheEntry::Missing { until } => *until > now,
        }
    }
}

/// Memoizes another provider
///
/// Resolved channels stay cached while they are used more often than their expiry.
/// Unknown IDs are remembered for [`NEGATIVE_CACHE_TTL`]. Other failures are not cached.
pub struct CachedChannelProvider {
    inner: Arc<dyn ChannelProvider>,
    clock: Arc<dyn SystemClock>,
    cache: DashMap<ChannelId, CacheEntry>,
    last_sweep: Mutex<DateTime<Utc>>,
}

impl CachedChannelProvider {
    pub fn new(inner: Arc<dyn ChannelProvider>, clock: Arc<dyn SystemClock>) -> Self {
        let now = clock.now();
        Self {
            inner,
            clock,
            cache: DashMap::new(),
            last_sweep: Mutex::new(now),
        }
    }

    /// Number of cached entries, positive and negative
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    fn sweep(&self, now: DateTime<Utc>) {
        {
            let mut last_sweep = self.last_sweep.lock();
            let since = now.signed_duration_since(*last_sweep).to_std();
            if since.map_or(true, |since| since < SWEEP_INTERVAL) {
                return;
            }
            *last_sweep = now;
        }
        let before = self.cache.len();
        self.cache.retain(|_, entry| entry.is_fresh(now));
        debug!(evicted = before.saturating_sub(self.cache.len()), "Channel cache swept");
    }
}

impl ChannelProvider for CachedChannelProvider {
    fn get(&self, id: &ChannelId) -> Result<Arc<Channel>> {
        let now = self.clock.now();
        if let Some(mut entry) = self.cache.get_mut(id) {
            if entry.is_fresh(now) {
                match &mut *entry {
                    CacheEntry::Found {
                        channel,
                        last_access,
                    } => {
                        *last_access = now;
                        return Ok(Arc::clone(channel));
                    }
                    CacheEntry::Missing { .. } => {
                        return Err(Error::InvalidChannel(id.to_string()));
                    }
                }
            }
        }

        self.sweep(now);
        match self.inner.get(id) {
            Ok(channel) => {
                self.cache.insert(
                    id.clone(),
                    CacheEntry::Found {
                        channel: Arc::clone(&channel),
                        last_access: now,
                    },
                );
                Ok(channel)
            }
            Err(Error::InvalidChannel(detail)) => {
                let ttl = chrono::Duration::from_std(NEGATIVE_CACHE_TTL)
                    .unwrap_or(chrono::Duration::MAX);
                self.cache.insert(
                    id.clone(),
                    CacheEntry::Missing {
                        until: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
                    },
                );
                Err(Error::InvalidChannel(detail))
            }
            Err(e) => Err(e),
        }
    }

    fn file_descriptor_pressure(&self) -> usize {
        self.inner.file_descriptor_pressure()
    }

    fn jwt_clock_skew_leeway_max(&self) -> Duration {
        self.inner.jwt_clock_skew_leeway_max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use pubpoll_types::ManualClock;

    fn atom(regex: &str, expire_secs: u64) -> ChannelConfig {
        ChannelConfig {
            regex: regex.to_string(),
            expire: HumanDuration::from_secs(expire_secs),
            jwt: None,
        }
    }

    fn id(value: &str) -> ChannelId {
        ChannelId::new(value).unwrap()
    }

    /// Counts lookups and fails with a storage error for IDs starting with `broken-`
    struct CountingProvider {
        inner: ConfigChannelProvider,
        calls: AtomicUsize,
    }

    impl ChannelProvider for CountingProvider {
        fn get(&self, id: &ChannelId) -> Result<Arc<Channel>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if id.as_str().starts_with("broken-") {
                return Err(Error::Storage("lookup failed".into()));
            }
            self.inner.get(id)
        }

        fn file_descriptor_pressure(&self) -> usize {
            3
        }

        fn jwt_clock_skew_leeway_max(&self) -> Duration {
            self.inner.jwt_clock_skew_leeway_max()
        }
    }

    fn cached() -> (Arc<CountingProvider>, Arc<ManualClock>, CachedChannelProvider) {
        let inner = Arc::new(CountingProvider {
            inner: ConfigChannelProvider::new(&[atom("chat-.+", 10), atom("broken-.+", 10)])
                .unwrap(),
            calls: AtomicUsize::new(0),
        });
        let clock = Arc::new(ManualClock::starting_now());
        let provider = CachedChannelProvider::new(inner.clone(), clock.clone());
        (inner, clock, provider)
    }

    #[test]
    fn test_regex_is_anchored() {
        let provider = ConfigChannelProvider::new(&[atom("chat-[0-9]+", 60)]).unwrap();
        assert!(provider.get(&id("chat-42")).is_ok());
        assert!(matches!(
            provider.get(&id("xchat-42")),
            Err(Error::InvalidChannel(_))
        ));
        assert!(provider.get(&id("chat-42x")).is_err());
    }

    #[test]
    fn test_atoms_are_merged() {
        let provider = ConfigChannelProvider::new(&[
            atom("chat-.+", 60),
            ChannelConfig {
                regex: "chat-secure-.+".to_string(),
                expire: HumanDuration::from_secs(300),
                jwt: Some(ChannelJwtConfig {
                    iss: vec!["https://issuer.example.com".into()],
                    clock_skew_leeway: HumanDuration::from_secs(5),
                }),
            },
            ChannelConfig {
                regex: ".+".to_string(),
                expire: HumanDuration::from_secs(10),
                jwt: Some(ChannelJwtConfig {
                    iss: vec!["https://other.example.com".into()],
                    clock_skew_leeway: HumanDuration::from_secs(30),
                }),
            },
        ])
        .unwrap();

        let channel = provider.get(&id("chat-secure-1")).unwrap();
        assert_eq!(channel.expire(), Duration::from_secs(300));
        assert_eq!(
            channel.jwt().unwrap().issuers,
            vec!["https://issuer.example.com".to_string()]
        );

        let channel = provider.get(&id("chat-1")).unwrap();
        assert_eq!(channel.expire(), Duration::from_secs(60));
        assert_eq!(
            channel.jwt().unwrap().issuers,
            vec!["https://other.example.com".to_string()]
        );

        assert_eq!(provider.jwt_clock_skew_leeway_max(), Duration::from_secs(30));
    }

    #[test]
    fn test_invalid_regex_rejected() {
        let err = ConfigChannelProvider::new(&[atom("chat-(", 60)]).err().unwrap();
        assert!(err.to_string().contains("channels[0].regex"));
    }

    #[test]
    fn test_no_jwt_means_zero_leeway() {
        let provider = ConfigChannelProvider::new(&[ChannelConfig::catch_all()]).unwrap();
        assert_eq!(provider.jwt_clock_skew_leeway_max(), Duration::ZERO);
        assert_eq!(
            provider.get(&id("anything")).unwrap().expire(),
            Duration::from_secs(1800)
        );
    }

    #[test]
    fn test_cache_hits() {
        let (inner, _clock, provider) = cached();
        provider.get(&id("chat-1")).unwrap();
        provider.get(&id("chat-1")).unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(provider.file_descriptor_pressure(), 3);
    }

    #[test]
    fn test_unknown_channels_cached_for_a_while() {
        let (inner, clock, provider) = cached();
        assert!(provider.get(&id("unknown")).is_err());
        assert!(matches!(
            provider.get(&id("unknown")),
            Err(Error::InvalidChannel(_))
        ));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);

        clock.advance(NEGATIVE_CACHE_TTL + Duration::from_secs(1));
        assert!(provider.get(&id("unknown")).is_err());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_other_errors_not_cached() {
        let (inner, _clock, provider) = cached();
        assert!(matches!(
            provider.get(&id("broken-1")),
            Err(Error::Storage(_))
        ));
        assert!(provider.get(&id("broken-1")).is_err());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
        assert!(provider.is_empty());
    }

    #[test]
    fn test_idle_entries_evicted() {
        let (inner, clock, provider) = cached();
        provider.get(&id("chat-1")).unwrap();
        provider.get(&id("chat-2")).unwrap();

        // chat-2 stays in use
        clock.advance(Duration::from_secs(6));
        provider.get(&id("chat-2")).unwrap();
        clock.advance(Duration::from_secs(6));
        provider.get(&id("chat-2")).unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);

        // A miss triggers a sweep, which drops idle chat-1
        provider.get(&id("chat-3")).unwrap();
        assert_eq!(provider.len(), 2);

        provider.get(&id("chat-1")).unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 4);
    }
}
