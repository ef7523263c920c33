use std::error::Error;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use percent_encoding::{percent_decode, percent_encode, AsciiSet, CONTROLS};

use crate::metadata::{
    try_base64_decode, Metadata, MetadataValue, GRPC_MESSAGE, GRPC_STATUS, GRPC_STATUS_DETAILS_BIN,
};

/// Byte set percent-encoded in `grpc-message` values.
const ENCODING_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'`')
    .add(b'?')
    .add(b'{')
    .add(b'}');

/// gRPC status codes used by [`Status`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Code {
    /// The operation completed successfully.
    Ok = 0,
    /// The operation was cancelled.
    Cancelled = 1,
    /// Unknown error.
    Unknown = 2,
    /// Client specified an invalid argument.
    InvalidArgument = 3,
    /// Deadline expired before the operation could complete.
    DeadlineExceeded = 4,
    /// Some requested entity was not found.
    NotFound = 5,
    /// Some entity that we attempted to create already exists.
    AlreadyExists = 6,
    /// The caller does not have permission to execute the operation.
    PermissionDenied = 7,
    /// Some resource has been exhausted.
    ResourceExhausted = 8,
    /// The system is not in a state required for the operation's execution.
    FailedPrecondition = 9,
    /// The operation was aborted.
    Aborted = 10,
    /// Operation was attempted past the valid range.
    OutOfRange = 11,
    /// Operation is not implemented or not supported.
    Unimplemented = 12,
    /// Internal error.
    Internal = 13,
    /// The service is currently unavailable.
    Unavailable = 14,
    /// Unrecoverable data loss or corruption.
    DataLoss = 15,
    /// The request does not have valid authentication credentials.
    Unauthenticated = 16,
}

impl Code {
    /// The numeric wire value carried in `grpc-status`.
    pub fn value(self) -> i32 {
        self as i32
    }

    /// The PascalCase name of the code, e.g. `DeadlineExceeded`.
    pub fn name(self) -> &'static str {
        match self {
            Code::Ok => "Ok",
            Code::Cancelled => "Cancelled",
            Code::Unknown => "Unknown",
            Code::InvalidArgument => "InvalidArgument",
            Code::DeadlineExceeded => "DeadlineExceeded",
            Code::NotFound => "NotFound",
            Code::AlreadyExists => "AlreadyExists",
            Code::PermissionDenied => "PermissionDenied",
            Code::ResourceExhausted => "ResourceExhausted",
            Code::FailedPrecondition => "FailedPrecondition",
            Code::Aborted => "Aborted",
            Code::OutOfRange => "OutOfRange",
            Code::Unimplemented => "Unimplemented",
            Code::Internal => "Internal",
            Code::Unavailable => "Unavailable",
            Code::DataLoss => "DataLoss",
            Code::Unauthenticated => "Unauthenticated",
        }
    }

    /// Map a numeric wire value to a code. Unknown values map to
    /// [`Code::Unknown`], as required for forward compatibility.
    pub fn from_value(value: i32) -> Code {
        match value {
            0 => Code::Ok,
            1 => Code::Cancelled,
            2 => Code::Unknown,
            3 => Code::InvalidArgument,
            4 => Code::DeadlineExceeded,
            5 => Code::NotFound,
            6 => Code::AlreadyExists,
            7 => Code::PermissionDenied,
            8 => Code::ResourceExhausted,
            9 => Code::FailedPrecondition,
            10 => Code::Aborted,
            11 => Code::OutOfRange,
            12 => Code::Unimplemented,
            13 => Code::Internal,
            14 => Code::Unavailable,
            15 => Code::DataLoss,
            16 => Code::Unauthenticated,
            _ => Code::Unknown,
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A gRPC status describing the result of an RPC call.
///
/// Values can be created with [`Status::new`] or one of the per-code
/// constructors (`Status::internal(..)`, `Status::unavailable(..)`, ...).
#[derive(Clone)]
pub struct Status(Box<StatusInner>);

// Box the contents to keep Result<_, Status> small.
#[derive(Clone)]
struct StatusInner {
    /// The gRPC status code, carried in the `grpc-status` trailer.
    code: Code,
    /// A relevant error message, carried in the `grpc-message` trailer.
    message: String,
    /// Opaque binary details, carried in `grpc-status-details-bin`.
    details: Bytes,
    /// Custom trailing metadata. Reserved protocol keys are ignored here.
    metadata: Metadata,
    /// Optional underlying error. Local only, never put on the wire.
    source: Option<Arc<dyn Error + Send + Sync + 'static>>,
}

impl Status {
    /// Create a new `Status` with the given code and message.
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Status(Box::new(StatusInner {
            code,
            message: message.into(),
            details: Bytes::new(),
            metadata: Metadata::new(),
            source: None,
        }))
    }

    pub fn ok(message: impl Into<String>) -> Self {
        Status::new(Code::Ok, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Status::new(Code::Cancelled, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Status::new(Code::Unknown, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Status::new(Code::InvalidArgument, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Status::new(Code::DeadlineExceeded, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Status::new(Code::NotFound, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Status::new(Code::AlreadyExists, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Status::new(Code::PermissionDenied, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Status::new(Code::ResourceExhausted, message)
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Status::new(Code::FailedPrecondition, message)
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Status::new(Code::Aborted, message)
    }

    pub fn out_of_range(message: impl Into<String>) -> Self {
        Status::new(Code::OutOfRange, message)
    }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        Status::new(Code::Unimplemented, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Status::new(Code::Internal, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Status::new(Code::Unavailable, message)
    }

    pub fn data_loss(message: impl Into<String>) -> Self {
        Status::new(Code::DataLoss, message)
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Status::new(Code::Unauthenticated, message)
    }

    pub fn code(&self) -> Code {
        self.0.code
    }

    pub fn is_ok(&self) -> bool {
        self.0.code == Code::Ok
    }

    pub fn message(&self) -> &str {
        &self.0.message
    }

    pub fn details(&self) -> &Bytes {
        &self.0.details
    }

    pub fn metadata(&self) -> &Metadata {
        &self.0.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.0.metadata
    }

    pub fn with_details(mut self, details: impl Into<Bytes>) -> Self {
        self.0.details = details.into();
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.0.metadata = metadata;
        self
    }

    pub fn with_source(mut self, source: Arc<dyn Error + Send + Sync + 'static>) -> Self {
        self.0.source = Some(source);
        self
    }

    /// Extract a `Status` from a boxed error, or coerce the error into
    /// `Status(Unknown, "")` keeping it as the source.
    pub fn from_error(err: Box<dyn Error + Send + Sync + 'static>) -> Status {
        match err.downcast::<Status>() {
            Ok(status) => *status,
            Err(err) => Status::unknown("").with_source(Arc::from(err)),
        }
    }

    /// Render this status as a trailing metadata block: `grpc-status`,
    /// `grpc-message` (percent-encoded, omitted when empty),
    /// `grpc-status-details-bin` (omitted when empty), then the custom
    /// trailing metadata with reserved keys stripped.
    pub fn to_trailers(&self) -> Metadata {
        let mut md = Metadata::new();
        md.push_raw(
            GRPC_STATUS.to_string(),
            MetadataValue::Ascii(self.0.code.value().to_string()),
        );
        if !self.0.message.is_empty() {
            md.push_raw(
                GRPC_MESSAGE.to_string(),
                MetadataValue::Ascii(encode_message(&self.0.message)),
            );
        }
        if !self.0.details.is_empty() {
            md.push_raw(
                GRPC_STATUS_DETAILS_BIN.to_string(),
                MetadataValue::Binary(self.0.details.clone()),
            );
        }
        md.merge(strip_status_keys(&self.0.metadata));
        md
    }

    /// Parse a status out of a trailing metadata block.
    ///
    /// A missing or malformed `grpc-status` is a protocol violation and
    /// yields `internal`; otherwise the remaining trailer entries become the
    /// status's trailing metadata.
    pub fn from_trailers(trailers: &Metadata) -> Status {
        let code = match trailers.get(GRPC_STATUS).map(str::parse::<i32>) {
            Some(Ok(value)) => Code::from_value(value),
            Some(Err(_)) => {
                return Status::internal("protocol violation: malformed grpc-status trailer")
            }
            None => return Status::internal("protocol violation: missing grpc-status trailer"),
        };
        let message = trailers
            .get(GRPC_MESSAGE)
            .map(decode_message)
            .unwrap_or_default();
        let details = match trailers
            .get_all(GRPC_STATUS_DETAILS_BIN)
            .next()
        {
            Some(MetadataValue::Binary(b)) => b.clone(),
            Some(MetadataValue::Ascii(s)) => {
                try_base64_decode(s).map(Bytes::from).unwrap_or_default()
            }
            None => Bytes::new(),
        };
        Status::new(code, message)
            .with_details(details)
            .with_metadata(strip_status_keys(trailers))
    }
}

/// Copy a metadata block, dropping the keys owned by the status itself and
/// anything that can only appear in a request head.
fn strip_status_keys(metadata: &Metadata) -> Metadata {
    let mut out = Metadata::new();
    for (key, value) in metadata.iter() {
        if key.starts_with(':')
            || key == GRPC_STATUS
            || key == GRPC_MESSAGE
            || key == GRPC_STATUS_DETAILS_BIN
        {
            continue;
        }
        out.push_raw(key.to_string(), value.clone());
    }
    out
}

/// Percent-encode a `grpc-message` value.
fn encode_message(message: &str) -> String {
    percent_encode(message.as_bytes(), ENCODING_SET).to_string()
}

/// Percent-decode a `grpc-message` value, replacing invalid UTF-8 rather
/// than failing the trailer.
fn decode_message(raw: &str) -> String {
    percent_decode(raw.as_bytes())
        .decode_utf8_lossy()
        .into_owned()
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Status")
            .field("code", &self.0.code)
            .field("message", &self.0.message)
            .field("metadata", &self.0.metadata)
            .finish()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "status: {}, message: {:?}",
            self.0.code.name(),
            self.0.message
        )
    }
}

impl Error for Status {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.0
            .source
            .as_ref()
            .map(|s| s.as_ref() as &(dyn Error + 'static))
    }
}
