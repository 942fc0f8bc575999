//! Error types for the warp-plus client

use thiserror::Error;

/// Top-level error type
#[derive(Error, Debug)]
pub enum WarpError {
    /// Configuration errors (flags, profile files, key material)
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Cryptographic errors
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// WireGuard protocol errors
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Network errors
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// Scanner errors
    #[error("scan error: {0}")]
    Scan(#[from] ScanError),

    /// Psiphon tunnel errors
    #[error("psiphon error: {0}")]
    Psiphon(#[from] PsiphonError),

    /// System I/O errors
    #[error("system error: {0}")]
    System(#[from] std::io::Error),
}

/// Configuration parsing errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("profile not found: {path}")]
    ProfileMissing { path: String },

    #[error("invalid profile at line {line}: {message}")]
    ParseError { line: usize, message: String },

    #[error("invalid base64 key: {field}")]
    InvalidKey { field: String },

    #[error("invalid IP address: {value}")]
    InvalidAddress { value: String },

    #[error("missing required field: {field}")]
    MissingField { field: String },

    #[error("invalid CIDR notation: {value}")]
    InvalidCidr { value: String },

    #[error("invalid flag combination: {message}")]
    InvalidFlags { message: String },

    #[error("invalid uapi directive: {line}")]
    InvalidUapi { line: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("identity file malformed: {0}")]
    IdentityMalformed(#[from] serde_json::Error),
}

/// Cryptographic operation errors
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("encryption failed")]
    Encryption,

    #[error("decryption failed: invalid ciphertext or authentication tag")]
    Decryption,

    #[error("invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },
}

/// WireGuard protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("handshake did not complete within {seconds}s")]
    HandshakeTimeout { seconds: u64 },

    #[error("invalid message type: {msg_type}")]
    InvalidMessageType { msg_type: u8 },

    #[error("invalid message length: expected {expected}, got {got}")]
    InvalidMessageLength { expected: usize, got: usize },

    #[error("mac1 verification failed")]
    MacVerificationFailed,

    #[error("replayed counter {counter}")]
    ReplayDetected { counter: u64 },

    #[error("session expired")]
    SessionExpired,

    #[error("no active session")]
    NoSession,

    #[error("unknown receiver index: {index}")]
    UnknownReceiverIndex { index: u32 },

    #[error("device is down")]
    DeviceDown,
}

/// Network-level errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("connection refused by {endpoint}")]
    ConnectionRefused { endpoint: String },

    #[error("host unreachable: {endpoint}")]
    HostUnreachable { endpoint: String },

    #[error("dns resolution failed for {host}")]
    DnsResolutionFailed { host: String },

    #[error("bind failed on {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    #[error("send failed: {reason}")]
    SendFailed { reason: String },

    #[error("receive failed: {reason}")]
    ReceiveFailed { reason: String },

    #[error("network stack is shut down")]
    StackClosed,

    #[error("unsupported network: {network}")]
    UnsupportedNetwork { network: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Scanner errors
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("no candidate prefixes configured")]
    NoPrefixes,

    #[error("scan deadline reached with {found} result(s), need {want}")]
    NotEnoughResults { found: usize, want: usize },

    #[error("scan canceled")]
    Canceled,
}

/// Psiphon tunnel errors
#[derive(Error, Debug)]
pub enum PsiphonError {
    #[error("tunnel establishment timeout")]
    Timeout,

    #[error("tunnel establishment canceled")]
    Canceled,

    #[error("controller failed: {0}")]
    Controller(String),

    #[error("malformed notice: {0}")]
    MalformedNotice(String),
}

impl WarpError {
    /// Errors that the surrounding loop may retry; everything else is
    /// surfaced to the orchestrator.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) => false,
            Self::Protocol(ProtocolError::HandshakeTimeout { .. }) => true,
            Self::Protocol(ProtocolError::SessionExpired) => true,
            Self::Protocol(ProtocolError::NoSession) => true,
            Self::Protocol(ProtocolError::MacVerificationFailed) => true,
            Self::Protocol(ProtocolError::ReplayDetected { .. }) => true,
            Self::Crypto(CryptoError::Decryption) => true,
            Self::Network(NetworkError::StackClosed) => false,
            Self::Network(_) => true,
            _ => false,
        }
    }
}

/// Result type alias for warp-plus operations
pub type Result<T> = std::result::Result<T, WarpError>;
