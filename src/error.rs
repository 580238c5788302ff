//! Error taxonomy for the agent runtime.
//!
//! Every failure path in the crate maps to exactly one [`AxedaError`] variant, each of
//! which wraps a subsystem-specific `thiserror` enum so `#[from]` conversions compose
//! cleanly up to the top level (§7).

use thiserror::Error;

/// Top-level error type returned by public crate APIs.
#[derive(Debug, Error)]
pub enum AxedaError {
    /// Socket-level and DNS failures.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// HTTP protocol-level failures (malformed responses, auth negotiation).
    #[error(transparent)]
    Http(#[from] HttpError),

    /// TLS handshake and certificate validation failures.
    #[error(transparent)]
    Tls(#[from] TlsError),

    /// SOCKS proxy negotiation failures.
    #[error(transparent)]
    Socks(#[from] SocksError),

    /// File-transfer instruction execution failures.
    #[error(transparent)]
    FileTransfer(#[from] FileTransferError),

    /// Internal invariant violations that are not caused by the network peer.
    #[error(transparent)]
    Internal(#[from] InternalError),
}

/// Transport-layer failures (§7 "Transport").
#[derive(Debug, Error)]
pub enum TransportError {
    /// Generic, unclassified network failure.
    #[error("network error: {0}")]
    General(String),
    /// A request's timeout elapsed before completion.
    #[error("operation timed out")]
    Timeout,
    /// The operation would have blocked; surfaced internally by the readiness loop.
    #[error("operation would block")]
    WouldBlock,
    /// DNS resolution failed for the given host.
    #[error("unknown host: {0}")]
    UnknownHost(String),
    /// The connection was lost mid-transaction.
    #[error("connection lost")]
    ConnectionLost,
    /// The peer actively refused the connection.
    #[error("connection refused")]
    ConnectionRefused,
    /// The peer reset the connection.
    #[error("connection reset")]
    ConnectionReset,
    /// The connection was aborted locally (e.g. by a cancellation).
    #[error("connection aborted")]
    ConnectionAborted,
    /// An operation was attempted on a connection that is not connected.
    #[error("not connected")]
    NotConnected,
    /// The destination network is unreachable.
    #[error("network unreachable")]
    NetworkUnreachable,
    /// The destination host is unreachable.
    #[error("host unreachable")]
    HostUnreachable,
    /// The request's URL could not be parsed.
    #[error("malformed URL: {0}")]
    BadUrl(String),
    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// HTTP protocol-level failures (§7 "HTTP").
#[derive(Debug, Error)]
pub enum HttpError {
    /// The response could not be parsed as a well-formed HTTP head.
    #[error("malformed HTTP response: {0}")]
    BadResponse(String),
    /// Credentials were presented and rejected by the server or proxy.
    #[error("authentication failed")]
    AuthFailed,
    /// The challenge named a scheme we do not implement.
    #[error("unsupported authentication scheme: {0}")]
    AuthUnsupported(String),
}

/// TLS-layer failures (§7 "TLS").
#[derive(Debug, Error)]
pub enum TlsError {
    /// Generic TLS failure not covered by a more specific variant.
    #[error("TLS error: {0}")]
    General(String),
    /// The server negotiated a cipher weaker than the configured minimum.
    #[error("negotiated cipher suite is weaker than the configured minimum")]
    WeakerCipherNegotiated,
    /// The certificate's issuer is not trusted.
    #[error("certificate issuer is unknown")]
    CertUnknownIssuer,
    /// The certificate itself failed structural validation.
    #[error("certificate is invalid")]
    CertInvalid,
    /// Certificate chain validation failed (expiry, hostname mismatch, etc).
    #[error("certificate validation failed: {0}")]
    CertValidationFailed(String),
    /// The TLS handshake itself failed.
    #[error("TLS handshake failed: {0}")]
    HandshakeFailed(String),
}

/// SOCKS proxy negotiation failures (§7 "SOCKS").
#[derive(Debug, Error)]
pub enum SocksError {
    /// The proxy replied with an unexpected SOCKS version byte.
    #[error("unexpected SOCKS version in reply")]
    WrongVersion,
    /// SOCKS authentication was rejected.
    #[error("SOCKS authentication failed")]
    AuthFailed,
    /// Generic SOCKS server failure (general SOCKS server failure reply).
    #[error("SOCKS server failure")]
    General,
    /// The proxy's ruleset does not permit this connection.
    #[error("connection not allowed by proxy ruleset")]
    NotAllowedByRuleset,
    /// The proxy reports the target network is unreachable.
    #[error("network unreachable (via proxy)")]
    NetworkUnreachable,
    /// The proxy reports the target host is unreachable.
    #[error("host unreachable (via proxy)")]
    HostUnreachable,
    /// The proxy reports the target refused the connection.
    #[error("connection refused (via proxy)")]
    ConnectionRefused,
    /// The proxy reports TTL expired.
    #[error("TTL expired (via proxy)")]
    TtlExpired,
    /// The requested SOCKS command is not supported by the proxy.
    #[error("command not supported by proxy")]
    CommandUnsupported,
    /// The requested address type is not supported by the proxy.
    #[error("address type not supported by proxy")]
    AddressTypeUnsupported,
}

/// File-transfer instruction failures (§7 "FileTransfer").
#[derive(Debug, Error)]
pub enum FileTransferError {
    /// The instruction body could not be parsed.
    #[error("malformed file-transfer instruction: {0}")]
    BadFormat(String),
    /// The server requested an operation this agent does not implement.
    #[error("unsupported file-transfer function: {0}")]
    UnsupportedFunction(String),
    /// The named file could not be found.
    #[error("file not found: {0}")]
    NameNotFound(String),
    /// A dependency the instruction requires is invalid or missing.
    #[error("dependency invalid: {0}")]
    DependencyInvalid(String),
    /// No files matched the upload filter.
    #[error("no files found for upload")]
    NoFilesFound,
    /// Some, but not all, requested files were found.
    #[error("some files not found")]
    SomeFilesNotFound,
    /// A download failed irrecoverably (retries exhausted).
    #[error("download failed: {0}")]
    DownloadExecutionFailure(String),
    /// The archive (tar/gzip) stream was malformed.
    #[error("archive error: {0}")]
    ArchiveError(String),
    /// A local file read failed.
    #[error(transparent)]
    ReadError(#[from] std::io::Error),
    /// The server returned a non-success HTTP status for a transfer request.
    #[error("unexpected HTTP status: {0}")]
    HttpStatus(u16),
    /// A per-chunk checksum did not match the server-advertised value.
    #[error("chunk checksum mismatch")]
    ChunkChecksum,
    /// The overall file checksum did not match the server-advertised value.
    #[error("file checksum mismatch")]
    FileChecksum,
    /// The file to upload no longer exists.
    #[error("upload file missing: {0}")]
    UploadFileMissing(String),
    /// The target directory for a download is invalid.
    #[error("invalid directory: {0}")]
    InvalidDirectory(String),
    /// A restart instruction targeted the gateway itself, which is unsupported.
    #[error("restart of gateway device is not supported")]
    RestartOfGateway,
    /// Multi-file transfers must be compressed; an uncompressed multi-file request was seen.
    #[error("multi-file transfers require compression")]
    MultifileUncompressed,
}

/// Internal invariant violations (§7 "Internal").
#[derive(Debug, Error)]
pub enum InternalError {
    /// Memory/allocation-shaped failure (e.g. a bounded pool is exhausted).
    #[error("out of capacity: {0}")]
    Memory(String),
    /// A caller-supplied argument violated a precondition.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The named resource already exists.
    #[error("already exists: {0}")]
    Exists(String),
    /// Any other internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the crate.
pub type AxedaResult<T> = Result<T, AxedaError>;
