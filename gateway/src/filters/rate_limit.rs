use crate::context::RequestContext;
use crate::errors::GatewayError;
use crate::filters::Filter;
use crate::metrics_defs::RATE_LIMITED;
use crate::routes::RateLimit;
use lru::LruCache;
use parking_lot::Mutex;
use shared::counter;
use std::hash::{BuildHasher, RandomState};
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Who a bucket is charged to: the token subject when authenticated, else the client address.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Principal {
    User(i64),
    Remote(IpAddr),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub principal: Principal,
    pub prefix: Arc<str>,
}

#[derive(Clone, Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    /// Tokens added per second
    rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(limit: &RateLimit, now: Instant) -> Self {
        let capacity = f64::from(limit.capacity);
        TokenBucket {
            capacity,
            tokens: capacity,
            rate: capacity / limit.window.as_secs_f64().max(f64::EPSILON),
            last_refill: now,
        }
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.rate).min(self.capacity);
        self.last_refill = self.last_refill.max(now);
    }

    /// Takes one token, or returns how long until one is available.
    pub fn try_acquire(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            Err(Duration::from_secs_f64((1.0 - self.tokens) / self.rate))
        }
    }
}

/// Buckets spread over independently locked shards, each an LRU bounded so the
/// whole table never tracks more than roughly `max_buckets` principals.
pub struct BucketTable {
    shards: Box<[Mutex<LruCache<BucketKey, TokenBucket>>]>,
    hasher: RandomState,
}

impl BucketTable {
    pub fn new(max_buckets: usize, shards: usize) -> Self {
        let shards = shards.max(1);
        let per_shard = NonZeroUsize::new(max_buckets.div_ceil(shards)).unwrap_or(NonZeroUsize::MIN);

        BucketTable {
            shards: (0..shards)
                .map(|_| Mutex::new(LruCache::new(per_shard)))
                .collect(),
            hasher: RandomState::new(),
        }
    }

    fn shard(&self, key: &BucketKey) -> &Mutex<LruCache<BucketKey, TokenBucket>> {
        let index = self.hasher.hash_one(&key.principal) as usize % self.shards.len();
        &self.shards[index]
    }

    pub fn check(&self, key: BucketKey, limit: &RateLimit) -> Result<(), Duration> {
        let mut shard = self.shard(&key).lock();
        // Read the clock under the shard lock so refills on one bucket stay monotone.
        let now = Instant::now();
        Self::acquire(&mut shard, key, limit, now)
    }

    pub fn check_at(&self, key: BucketKey, limit: &RateLimit, now: Instant) -> Result<(), Duration> {
        let mut shard = self.shard(&key).lock();
        Self::acquire(&mut shard, key, limit, now)
    }

    fn acquire(
        shard: &mut LruCache<BucketKey, TokenBucket>,
        key: BucketKey,
        limit: &RateLimit,
        now: Instant,
    ) -> Result<(), Duration> {
        if let Some(bucket) = shard.get_mut(&key) {
            return bucket.try_acquire(now);
        }

        let mut bucket = TokenBucket::new(limit, now);
        let result = bucket.try_acquire(now);
        shard.put(key, bucket);
        result
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct RateLimiter {
    table: BucketTable,
}

impl RateLimiter {
    pub fn new(max_buckets: usize, shards: usize) -> Self {
        RateLimiter {
            table: BucketTable::new(max_buckets, shards),
        }
    }
}

/// Whole seconds to advertise in Retry-After, never less than one.
pub fn retry_after_secs(wait: Duration) -> u64 {
    (wait.as_secs_f64().ceil() as u64).max(1)
}

impl Filter for RateLimiter {
    fn name(&self) -> &'static str {
        "rate_limiter"
    }

    fn apply(&self, ctx: &mut RequestContext) -> Result<(), GatewayError> {
        let route = ctx.route()?;
        let Some(limit) = &route.rate_limit else {
            return Ok(());
        };

        let principal = match &ctx.identity {
            Some(identity) => Principal::User(identity.subject_id),
            None => Principal::Remote(ctx.remote_addr.ip()),
        };
        let key = BucketKey {
            principal,
            prefix: route.prefix.clone(),
        };

        self.table.check(key, limit).map_err(|wait| {
            let service = route.upstream().unwrap_or("gateway").to_string();
            tracing::debug!(
                request_id = %ctx.request_id,
                service = %service,
                retry_after_ms = wait.as_millis() as u64,
                "Rate limit exceeded"
            );
            counter!(RATE_LIMITED, "service" => service).increment(1);
            GatewayError::RateLimited {
                retry_after_secs: retry_after_secs(wait),
            }
        })
    }
}
