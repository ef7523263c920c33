use std::collections::HashMap;
use std::time::Duration;

use crate::compression::CompressionEncoding;
use crate::deadline::Deadline;
use crate::framing::DEFAULT_MAX_RECV_MESSAGE_SIZE;
use crate::metadata::Metadata;
use crate::status::Code;

/// Per-call options supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Relative timeout for the call; converted to an absolute deadline when
    /// the call starts. Ignored when `deadline` is set.
    pub timeout: Option<Duration>,

    /// Absolute deadline for the call.
    pub deadline: Option<Deadline>,

    /// User metadata sent with the request. Reserved protocol keys are
    /// stripped.
    pub metadata: Metadata,

    /// Compress request messages with this algorithm, overriding the client
    /// configuration for this call.
    pub compression: Option<CompressionEncoding>,
}

impl CallOptions {
    /// The effective deadline for a call starting now, if any.
    pub(crate) fn effective_deadline(&self) -> Option<Deadline> {
        self.deadline
            .or_else(|| self.timeout.map(Deadline::after))
    }
}

/// Automatic-retry parameters for one method, following the gRPC retry
/// design. Retries are additionally gated by the shared [`RetryThrottle`]
/// (see [`RetryThrottleSettings`]).
///
/// [`RetryThrottle`]: crate::retry::RetryThrottle
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one. `1` disables retries.
    pub max_attempts: u32,

    /// Backoff before the first retry.
    pub initial_backoff: Duration,

    /// Cap on the backoff between attempts.
    pub max_backoff: Duration,

    /// Multiplier applied to the backoff after each attempt.
    pub backoff_multiplier: f64,

    /// Status codes that make a failed attempt eligible for retry.
    pub retryable_codes: Vec<Code>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            retryable_codes: vec![Code::Unavailable],
        }
    }
}

impl RetryPolicy {
    pub fn is_retryable(&self, code: Code) -> bool {
        self.retryable_codes.contains(&code)
    }
}

/// Parameters of the shared retry throttle: a token bucket that pauses
/// automatic retries while the transport is failing.
#[derive(Debug, Clone)]
pub struct RetryThrottleSettings {
    /// Bucket capacity. Retries stop while fewer than half the tokens
    /// remain.
    pub max_tokens: u32,

    /// Tokens restored per successful call, in `(0, 1]`.
    pub token_ratio: f64,
}

impl Default for RetryThrottleSettings {
    fn default() -> Self {
        RetryThrottleSettings {
            max_tokens: 10,
            token_ratio: 0.1,
        }
    }
}

/// Per-method overrides, keyed by the method's full name
/// (`package.Service/Method`).
#[derive(Debug, Clone, Default)]
pub struct MethodConfig {
    /// Timeout applied when the caller does not set one.
    pub timeout: Option<Duration>,

    /// Override of the maximum decoded inbound message size.
    pub max_recv_message_size: Option<usize>,

    /// Override of the maximum outbound message size.
    pub max_send_message_size: Option<usize>,

    /// Retry policy for this method, overriding the client default.
    pub retry_policy: Option<RetryPolicy>,
}

/// Client construction-time configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Custom User-Agent string prepended to the runtime's own.
    pub user_agent: Option<String>,

    /// Default timeout applied when neither the call options nor the method
    /// configuration set one.
    pub default_timeout: Option<Duration>,

    /// Maximum decoded size of an inbound message.
    pub max_recv_message_size: usize,

    /// Maximum size of an outbound message; `None` means unbounded.
    pub max_send_message_size: Option<usize>,

    /// Compression algorithms accepted on responses.
    pub accept_encodings: Vec<CompressionEncoding>,

    /// Compress request messages with this algorithm.
    pub send_encoding: Option<CompressionEncoding>,

    /// Payloads at or below this size are never compressed.
    pub compression_threshold: usize,

    /// Default retry policy; `None` disables automatic retry.
    pub retry: Option<RetryPolicy>,

    /// Shared retry throttle parameters.
    pub retry_throttle: RetryThrottleSettings,

    /// Per-method overrides keyed by full method name.
    pub method_configs: HashMap<String, MethodConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            user_agent: None,
            default_timeout: None,
            max_recv_message_size: DEFAULT_MAX_RECV_MESSAGE_SIZE,
            max_send_message_size: None,
            accept_encodings: vec![CompressionEncoding::Gzip, CompressionEncoding::Deflate],
            send_encoding: None,
            compression_threshold: 0,
            retry: Some(RetryPolicy::default()),
            retry_throttle: RetryThrottleSettings::default(),
            method_configs: HashMap::new(),
        }
    }
}

impl ClientConfig {
    pub(crate) fn method_config(&self, full_name: &str) -> Option<&MethodConfig> {
        self.method_configs.get(full_name)
    }
}

/// Server construction-time configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum decoded size of an inbound message.
    pub max_recv_message_size: usize,

    /// Maximum size of an outbound message; `None` means unbounded.
    pub max_send_message_size: Option<usize>,

    /// Timeout applied to calls that carry no `grpc-timeout`, as if the
    /// client had sent one.
    pub default_timeout: Option<Duration>,

    /// Cap on concurrently executing calls; further streams are refused
    /// with `resource-exhausted`. `None` means unbounded.
    pub max_concurrent_calls: Option<usize>,

    /// Compression algorithms accepted on requests.
    pub accept_encodings: Vec<CompressionEncoding>,

    /// Compress response messages with this algorithm when the client
    /// accepts it.
    pub send_encoding: Option<CompressionEncoding>,

    /// Payloads at or below this size are never compressed.
    pub compression_threshold: usize,

    /// Per-method overrides keyed by full method name.
    pub method_configs: HashMap<String, MethodConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            max_recv_message_size: DEFAULT_MAX_RECV_MESSAGE_SIZE,
            max_send_message_size: None,
            default_timeout: None,
            max_concurrent_calls: None,
            accept_encodings: vec![CompressionEncoding::Gzip, CompressionEncoding::Deflate],
            send_encoding: None,
            compression_threshold: 0,
            method_configs: HashMap::new(),
        }
    }
}

impl ServerConfig {
    pub(crate) fn method_config(&self, full_name: &str) -> Option<&MethodConfig> {
        self.method_configs.get(full_name)
    }
}

/// Build the User-Agent string: the runtime's own identifier, prepended
/// with a custom string when configured.
pub(crate) fn build_user_agent(custom: Option<&str>) -> String {
    let base = concat!("grapnel/", env!("CARGO_PKG_VERSION"));
    match custom {
        Some(custom) => format!("{custom} {base}"),
        None => base.to_string(),
    }
}
