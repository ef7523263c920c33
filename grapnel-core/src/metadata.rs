use std::fmt;
use std::sync::LazyLock;

use base64::Engine;
use bytes::Bytes;

// Reserved protocol header names. These travel inside the same metadata
// blocks as user headers but are owned by the runtime, never by callers.
pub(crate) const PSEUDO_METHOD: &str = ":method";
pub(crate) const PSEUDO_SCHEME: &str = ":scheme";
pub(crate) const PSEUDO_PATH: &str = ":path";
pub(crate) const CONTENT_TYPE: &str = "content-type";
pub(crate) const CONTENT_TYPE_GRPC: &str = "application/grpc";
pub(crate) const TE: &str = "te";
pub(crate) const TE_TRAILERS: &str = "trailers";
pub(crate) const USER_AGENT: &str = "user-agent";
pub(crate) const GRPC_STATUS: &str = "grpc-status";
pub(crate) const GRPC_MESSAGE: &str = "grpc-message";
pub(crate) const GRPC_STATUS_DETAILS_BIN: &str = "grpc-status-details-bin";
pub(crate) const GRPC_ENCODING: &str = "grpc-encoding";
pub(crate) const GRPC_ACCEPT_ENCODING: &str = "grpc-accept-encoding";
pub(crate) const GRPC_TIMEOUT: &str = "grpc-timeout";

/// Base64 engines for lenient binary header decoding.
///
/// Peers differ in which alphabet and padding they emit for `-bin` values,
/// so decoding tries four codecs before giving up.
static BASE64_ENGINES: LazyLock<Vec<base64::engine::GeneralPurpose>> = LazyLock::new(|| {
    use base64::engine::general_purpose;
    vec![
        general_purpose::STANDARD,
        general_purpose::URL_SAFE,
        general_purpose::STANDARD_NO_PAD,
        general_purpose::URL_SAFE_NO_PAD,
    ]
});

/// A single metadata value: printable ASCII, or raw bytes for `-bin` keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataValue {
    Ascii(String),
    Binary(Bytes),
}

impl MetadataValue {
    /// The value as a string, if it is an ASCII value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::Ascii(s) => Some(s),
            MetadataValue::Binary(_) => None,
        }
    }

    /// The value as raw bytes, if it is a binary value.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            MetadataValue::Ascii(_) => None,
            MetadataValue::Binary(b) => Some(b),
        }
    }

    /// Render the value the way it appears on the wire: ASCII values
    /// verbatim, binary values base64-encoded without padding.
    pub fn to_wire_string(&self) -> String {
        match self {
            MetadataValue::Ascii(s) => s.clone(),
            MetadataValue::Binary(b) => {
                base64::engine::general_purpose::STANDARD_NO_PAD.encode(b)
            }
        }
    }
}

/// Error returned when a metadata key or value is not valid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidMetadata {
    reason: String,
}

impl fmt::Display for InvalidMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid metadata: {}", self.reason)
    }
}

impl std::error::Error for InvalidMetadata {}

impl InvalidMetadata {
    fn new(reason: impl Into<String>) -> Self {
        InvalidMetadata {
            reason: reason.into(),
        }
    }
}

/// An ordered list of (key, value) metadata pairs.
///
/// Keys are lower-cased ASCII; keys ending in `-bin` carry binary values
/// (base64 on the wire). A key may appear multiple times and the insertion
/// order is preserved, including across distinct keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: Vec<(String, MetadataValue)>,
}

impl Metadata {
    pub fn new() -> Self {
        Metadata::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append an ASCII value. The key is lower-cased; keys ending in `-bin`
    /// are rejected because they must carry binary values.
    pub fn append(
        &mut self,
        key: impl AsRef<str>,
        value: impl Into<String>,
    ) -> Result<(), InvalidMetadata> {
        let key = normalize_key(key.as_ref())?;
        if key.ends_with("-bin") {
            return Err(InvalidMetadata::new(format!(
                "key {key:?} requires a binary value"
            )));
        }
        let value = value.into();
        if !value.bytes().all(|b| (0x20..=0x7e).contains(&b)) {
            return Err(InvalidMetadata::new(format!(
                "value for {key:?} contains non-printable bytes"
            )));
        }
        self.entries.push((key, MetadataValue::Ascii(value)));
        Ok(())
    }

    /// Append a binary value. The key must end in `-bin`.
    pub fn append_bin(
        &mut self,
        key: impl AsRef<str>,
        value: impl Into<Bytes>,
    ) -> Result<(), InvalidMetadata> {
        let key = normalize_key(key.as_ref())?;
        if !key.ends_with("-bin") {
            return Err(InvalidMetadata::new(format!(
                "binary values require a key ending in \"-bin\", got {key:?}"
            )));
        }
        self.entries.push((key, MetadataValue::Binary(value.into())));
        Ok(())
    }

    /// First ASCII value for `key`, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| v.as_str())
    }

    /// First binary value for `key`, if any.
    pub fn get_bin(&self, key: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| v.as_bytes())
    }

    /// All values for `key`, in insertion order.
    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a MetadataValue> {
        self.entries
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Remove every value for `key`; returns whether anything was removed.
    pub fn remove(&mut self, key: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(k, _)| k != key);
        self.entries.len() != before
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetadataValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Append every entry of `other`, preserving its order.
    pub fn merge(&mut self, other: Metadata) {
        self.entries.extend(other.entries);
    }

    /// Drop entries whose keys are reserved for the protocol: pseudo-headers,
    /// `grpc-*`, `content-type`, `te`, and `user-agent`.
    pub fn strip_reserved(&mut self) {
        self.entries.retain(|(k, _)| !is_reserved_key(k));
    }

    /// A copy of this metadata with reserved protocol keys removed.
    pub fn to_user_metadata(&self) -> Metadata {
        let mut out = self.clone();
        out.strip_reserved();
        out
    }

    pub(crate) fn push_raw(&mut self, key: String, value: MetadataValue) {
        self.entries.push((key, value));
    }

    /// Parse header strings in `"Name: Value"` format.
    ///
    /// Rules:
    /// - Splits on the first `:` in each header string
    /// - Header name is lowercased
    /// - No colon means the value is empty
    /// - Binary headers (name ending in `-bin`) have their value decoded
    ///   from base64, trying 4 codecs before falling back to the raw string
    ///
    /// Invalid headers are dropped with a warning rather than failing the
    /// whole batch.
    pub fn from_header_lines(headers: &[String]) -> Metadata {
        let mut md = Metadata::new();

        for header in headers {
            let (name, value) = match header.split_once(':') {
                Some((n, v)) => (n.trim().to_lowercase(), v.trim().to_string()),
                None => (header.trim().to_lowercase(), String::new()),
            };

            if name.is_empty() {
                continue;
            }

            let result = if name.ends_with("-bin") {
                let bytes = try_base64_decode(&value)
                    .map(Bytes::from)
                    .unwrap_or_else(|| Bytes::from(value.into_bytes()));
                md.append_bin(&name, bytes)
            } else {
                md.append(&name, value)
            };

            if let Err(e) = result {
                tracing::warn!("header {header:?} dropped: {e}");
            }
        }

        md
    }

    /// Format as a human-readable string, one `name: value` pair per line,
    /// sorted by name. Binary values are base64-encoded.
    pub fn to_display_string(&self) -> String {
        if self.is_empty() {
            return "(empty)".to_string();
        }

        let mut lines: Vec<String> = self
            .iter()
            .map(|(k, v)| format!("{k}: {}", v.to_wire_string()))
            .collect();
        lines.sort();
        lines.join("\n")
    }
}

/// Whether a key belongs to the protocol rather than the user.
pub(crate) fn is_reserved_key(key: &str) -> bool {
    key.starts_with(':')
        || key.starts_with("grpc-")
        || key == CONTENT_TYPE
        || key == TE
        || key == USER_AGENT
}

/// Lower-case and validate a metadata key. Pseudo-header keys (leading `:`)
/// are accepted because request heads travel through the same blocks.
fn normalize_key(key: &str) -> Result<String, InvalidMetadata> {
    let key = key.to_lowercase();
    let body = key.strip_prefix(':').unwrap_or(&key);
    if body.is_empty() {
        return Err(InvalidMetadata::new("empty key"));
    }
    let valid = body
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_' || b == b'.');
    if !valid {
        return Err(InvalidMetadata::new(format!(
            "key {key:?} contains invalid characters"
        )));
    }
    Ok(key)
}

/// Try to decode a base64 string using multiple codecs.
///
/// Returns the first successful decode, or None if all fail.
pub(crate) fn try_base64_decode(value: &str) -> Option<Vec<u8>> {
    for engine in BASE64_ENGINES.iter() {
        if let Ok(decoded) = engine.decode(value.trim()) {
            return Some(decoded);
        }
    }
    None
}
