use std::time::Duration;

use tokio::time::Instant;

use crate::status::Status;

/// Largest value representable in the eight-digit `grpc-timeout` field.
const MAX_TIMEOUT_DIGITS: u128 = 99_999_999;

/// An absolute instant by which a call must complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline(Instant);

impl Deadline {
    /// A deadline `duration` from now.
    pub fn after(duration: Duration) -> Self {
        let now = Instant::now();
        Deadline(now.checked_add(duration).unwrap_or_else(far_future))
    }

    /// A deadline at an absolute instant.
    pub fn at(instant: Instant) -> Self {
        Deadline(instant)
    }

    pub fn instant(&self) -> Instant {
        self.0
    }

    /// Time remaining until the deadline; zero if it has already passed.
    pub fn remaining(&self) -> Duration {
        self.0.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining() == Duration::ZERO
    }
}

/// The earlier of two optional deadlines.
pub fn earliest(a: Option<Deadline>, b: Option<Deadline>) -> Option<Deadline> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, b) => b,
    }
}

fn far_future() -> Instant {
    // Matches tokio's internal notion of "effectively never".
    Instant::now() + Duration::from_secs(86400 * 365 * 30)
}

/// Encode a duration as a `grpc-timeout` header value: an integer of at
/// most eight digits followed by a unit. The finest unit that fits is used.
pub fn encode_timeout(duration: Duration) -> String {
    let nanos = duration.as_nanos();
    if nanos <= MAX_TIMEOUT_DIGITS {
        return format!("{nanos}n");
    }
    let micros = duration.as_micros();
    if micros <= MAX_TIMEOUT_DIGITS {
        return format!("{micros}u");
    }
    let millis = duration.as_millis();
    if millis <= MAX_TIMEOUT_DIGITS {
        return format!("{millis}m");
    }
    let secs = duration.as_secs() as u128;
    if secs <= MAX_TIMEOUT_DIGITS {
        return format!("{secs}S");
    }
    let minutes = secs / 60;
    if minutes <= MAX_TIMEOUT_DIGITS {
        return format!("{minutes}M");
    }
    let hours = (minutes / 60).min(MAX_TIMEOUT_DIGITS);
    format!("{hours}H")
}

/// Parse a `grpc-timeout` header value.
///
/// The grammar is `<1-8 digits><H|M|S|m|u|n>`; anything else is a protocol
/// violation.
pub fn parse_timeout(value: &str) -> Result<Duration, Status> {
    let invalid = || Status::internal(format!("protocol violation: invalid grpc-timeout {value:?}"));

    if value.len() < 2 {
        return Err(invalid());
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    if digits.len() > 8 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let amount: u64 = digits.parse().map_err(|_| invalid())?;

    let duration = match unit {
        "H" => Duration::from_secs(amount.saturating_mul(3600)),
        "M" => Duration::from_secs(amount.saturating_mul(60)),
        "S" => Duration::from_secs(amount),
        "m" => Duration::from_millis(amount),
        "u" => Duration::from_micros(amount),
        "n" => Duration::from_nanos(amount),
        _ => return Err(invalid()),
    };
    Ok(duration)
}
