use crate::backend::{
    AdmissionInput, AdmissionOutput, Backend, Clock, CounterStore, Decision, SystemClock,
};
use crate::policy::PolicyName;
use actix_web::{HttpResponse, ResponseError};
use once_cell::sync::Lazy;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::sync::Arc;
use thiserror::Error;

// KEYS[1] = counter hash, ARGV = now (ms), window (ms), max requests.
// Returns {allowed (0/1), remaining, reset time (ms)}.
static ADMIT_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local max = tonumber(ARGV[3])
local count = tonumber(redis.call('HGET', KEYS[1], 'count'))
local reset = tonumber(redis.call('HGET', KEYS[1], 'reset'))
if count == nil or reset == nil or now >= reset then
    reset = now + window
    redis.call('HSET', KEYS[1], 'count', 1, 'reset', reset)
    redis.call('PEXPIREAT', KEYS[1], reset)
    return {1, max - 1, reset}
end
if count >= max then
    return {0, 0, reset}
end
count = redis.call('HINCRBY', KEYS[1], 'count', 1)
return {1, max - count, reset}
"#,
    )
});

#[derive(Debug, Error)]
pub enum Error {
    #[error("Redis error: {0}")]
    Redis(
        #[source]
        #[from]
        redis::RedisError,
    ),
}

impl ResponseError for Error {
    fn error_response(&self) -> HttpResponse {
        HttpResponse::InternalServerError().finish()
    }
}

/// A fixed window [Backend] that keeps its counters in Redis, so that every instance of the
/// API shares the same limits.
///
/// Each counter is a hash holding the count and reset time, set to expire at the reset time,
/// so Redis removes finished windows on its own.
#[derive(Clone)]
pub struct RedisBackend {
    connection: ConnectionManager,
    key_prefix: Option<String>,
    clock: Arc<dyn Clock>,
}

impl RedisBackend {
    /// Create a RedisBackendBuilder.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use draworld_admission::backend::redis::RedisBackend;
    /// # use redis::aio::ConnectionManager;
    /// # async fn example() {
    /// let client = redis::Client::open("redis://127.0.0.1/").unwrap();
    /// let manager = ConnectionManager::new(client).await.unwrap();
    /// let backend = RedisBackend::builder(manager).build();
    /// # };
    /// ```
    pub fn builder(connection: ConnectionManager) -> Builder {
        Builder {
            connection,
            key_prefix: None,
            clock: Arc::new(SystemClock),
        }
    }

    fn make_key(&self, policy: PolicyName, identifier: &str) -> String {
        match &self.key_prefix {
            None => format!("{policy}:{identifier}"),
            Some(prefix) => format!("{prefix}{policy}:{identifier}"),
        }
    }
}

pub struct Builder {
    connection: ConnectionManager,
    key_prefix: Option<String>,
    clock: Arc<dyn Clock>,
}

impl Builder {
    /// Apply an optional prefix to all rate limit keys given to this backend.
    ///
    /// This may be useful when the Redis instance is being used for other purposes; the prefix is
    /// used as a 'namespace' to avoid collision with other caches or keys inside Redis.
    pub fn key_prefix(mut self, key_prefix: Option<&str>) -> Self {
        self.key_prefix = key_prefix.map(ToOwned::to_owned);
        self
    }

    /// Override the time source used to open and close windows.
    ///
    /// The reset time is also used as the key expiry, so the clock must track real time.
    pub fn with_clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn build(self) -> RedisBackend {
        RedisBackend {
            connection: self.connection,
            key_prefix: self.key_prefix,
            clock: self.clock,
        }
    }
}

impl Backend<AdmissionInput> for RedisBackend {
    type Output = AdmissionOutput;
    type Error = Error;

    async fn request(
        &self,
        input: AdmissionInput,
    ) -> Result<(Decision, Self::Output), Self::Error> {
        let key = self.make_key(input.policy, &input.identifier);
        let max = input.limit.max_requests();
        let window = input.limit.window();

        let now = self.clock.now_ms();
        let mut con = self.connection.clone();
        let (allowed, remaining, reset_time): (u8, u64, u64) = ADMIT_SCRIPT
            .key(key)
            .arg(now)
            .arg(input.limit.window_ms())
            .arg(max)
            .invoke_async(&mut con)
            .await?;

        let output = AdmissionOutput {
            limit: max,
            window,
            remaining,
            reset_time,
            checked_at: now,
        };
        Ok((Decision::from_allowed(allowed == 1), output))
    }
}

impl CounterStore for RedisBackend {
    /// Note that the key prefix (if set) is automatically included.
    async fn remove_key(&self, policy: PolicyName, identifier: &str) -> Result<(), Self::Error> {
        let key = self.make_key(policy, identifier);
        let mut con = self.connection.clone();
        let () = con.del(key).await?;
        Ok(())
    }

    /// Expired counters are dropped by Redis itself.
    async fn cleanup(&self) -> Result<usize, Self::Error> {
        Ok(0)
    }
}
