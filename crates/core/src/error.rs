//! Error types for the HLS to RTSP bridge.

use std::fmt;

/// Errors that can occur anywhere in the bridge.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Protocol**: [`Parse`](Self::Parse) for malformed RTSP messages.
/// - **Transport**: [`Io`](Self::Io) for socket/network failures.
/// - **Session**: [`SessionNotFound`](Self::SessionNotFound),
///   [`PortRangeExhausted`](Self::PortRangeExhausted).
/// - **Server**: [`NotStarted`](Self::NotStarted),
///   [`AlreadyRunning`](Self::AlreadyRunning).
/// - **Publish**: [`MountNotFound`](Self::MountNotFound),
///   [`MountClosed`](Self::MountClosed).
/// - **Codec**: [`EmptyAccessUnit`](Self::EmptyAccessUnit).
/// - **Ingestion**: [`Http`](Self::Http), [`Url`](Self::Url),
///   [`Playlist`](Self::Playlist), [`Demux`](Self::Demux),
///   [`NoVideoTrack`](Self::NoVideoTrack), [`IngestEnded`](Self::IngestEnded),
///   [`TaskFailed`](Self::TaskFailed), [`Cancelled`](Self::Cancelled).
/// - **Configuration**: [`Config`](Self::Config).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No RTSP session with the given ID exists in the
    /// [`SessionManager`](crate::session::SessionManager).
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// [`Server::start`](crate::Server::start) has not been called yet.
    #[error("server not started")]
    NotStarted,

    /// [`Server::start`](crate::Server::start) was called while already running.
    #[error("server already running")]
    AlreadyRunning,

    /// Failed to parse an RTSP request message (RFC 2326 §6).
    #[error("RTSP parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// Server-side UDP port allocation exhausted the 5000–65534 range.
    #[error("port range exhausted (tried to allocate beyond u16 range)")]
    PortRangeExhausted,

    /// No mount registered at the requested path.
    #[error("mount not found: {0}")]
    MountNotFound(String),

    /// The mount was closed or replaced; packets can no longer be written to it.
    #[error("mount closed: {0}")]
    MountClosed(String),

    /// An access unit contained no non-empty NAL units.
    #[error("access unit has no NAL units")]
    EmptyAccessUnit,

    /// HTTP request to the HLS origin failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A playlist or segment URI could not be resolved.
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// The playlist was not a valid M3U8 document.
    #[error("playlist error: {0}")]
    Playlist(String),

    /// A transport stream segment could not be demuxed.
    #[error("demux error: {0}")]
    Demux(String),

    /// The source advertised no H.264 video track.
    #[error("no H264 track found")]
    NoVideoTrack,

    /// The ingestion session finished without reporting an error.
    #[error("ingestion session ended")]
    IngestEnded,

    /// The ingestion task panicked or was aborted.
    #[error("ingestion task failed: {0}")]
    TaskFailed(String),

    /// The operation was interrupted by a stop request.
    #[error("cancelled")]
    Cancelled,

    /// Configuration could not be read, parsed or validated.
    #[error("config: {0}")]
    Config(String),
}

/// Specific kind of RTSP parse failure.
#[derive(Debug)]
pub enum ParseErrorKind {
    /// Input was empty (no request line).
    EmptyRequest,
    /// Request line did not have the expected `Method URI Version` format.
    InvalidRequestLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyRequest => write!(f, "empty request"),
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidHeader => write!(f, "invalid header"),
        }
    }
}

/// Convenience alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;
