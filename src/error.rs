use nix;

pub type Result<T> = ::std::result::Result<T, Error>;

/// Closed set of error kinds the library can return. Every fallible public
/// operation resolves to one of these rather than a raw `errno`.
#[derive(Debug, Fail, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[fail(display = "permission denied")]
    PermissionDenied,
    #[fail(display = "per-process open file descriptor limit reached")]
    TooManyOpenFilesProcess,
    #[fail(display = "system-wide open file descriptor limit reached")]
    TooManyOpenFilesSystem,
    #[fail(display = "out of memory")]
    NoMemory,
    #[fail(display = "bad file descriptor")]
    BadFd,
    #[fail(display = "operation would block")]
    WouldBlock,
    #[fail(display = "operation already in progress")]
    AlreadyInProgress,
    #[fail(display = "invalid argument")]
    InvalidArgument,
    #[fail(display = "endpoint has no connection")]
    NoConnection,
    #[fail(display = "endpoint is already connected")]
    AlreadyConnected,
    #[fail(display = "socket path exists and is not a socket")]
    FileNotASocket,
    #[fail(display = "peer did not send a shared-memory region file descriptor")]
    MissingShmFd,
    #[fail(display = "ring header cookie did not match the expected magic")]
    BadRingCookie,
    #[fail(display = "ring is full")]
    RingFull,
    #[fail(display = "not enough free rx buffers to satisfy the request")]
    InsufficientRxBuffers,
    #[fail(display = "failed to signal a queue's interrupt file descriptor")]
    InterruptWriteFailure,
    #[fail(display = "received a malformed control message")]
    MalformedMessage,
    #[fail(display = "peer speaks an incompatible protocol version")]
    ProtocolVersionMismatch,
    #[fail(display = "peer's interface id did not match")]
    InterfaceIdMismatch,
    #[fail(display = "a slave endpoint cannot accept connections")]
    SlaveCannotAccept,
    #[fail(display = "both endpoints claim the master role")]
    ModeMismatch,
    #[fail(display = "peer's shared secret did not match")]
    SecretMismatch,
    #[fail(display = "a shared secret is required but was not provided")]
    SecretRequired,
    #[fail(display = "too many shared-memory regions for this endpoint")]
    TooManyRegions,
    #[fail(display = "too many rings requested")]
    TooManyRings,
    #[fail(display = "peer did not send an interrupt file descriptor for a ring")]
    MissingInterruptFd,
    #[fail(display = "peer requested disconnect")]
    DisconnectRequested,
    #[fail(display = "endpoint is disconnected")]
    Disconnected,
    #[fail(display = "received a control message of unknown kind")]
    UnknownMessageType,
    #[fail(display = "an application callback returned an error")]
    CallbackFailure,
    #[fail(display = "unmapped host error: {}", errno)]
    Unknown { errno: i32 },
}

impl Error {
    /// Maps a host `errno` observed during a syscall to a library error kind.
    ///
    /// `ECONNREFUSED` while a slave is attempting to connect is not an error
    /// at all from the library's point of view: the master simply isn't
    /// listening yet, and the reconnect timer will retry. Callers on that
    /// path should check for this case before calling `from_errno`, since
    /// this function has no way to know the caller's context.
    pub fn from_errno(errno: nix::errno::Errno) -> Error {
        use nix::errno::Errno::*;
        match errno {
            EACCES | EPERM => Error::PermissionDenied,
            EMFILE => Error::TooManyOpenFilesProcess,
            ENFILE => Error::TooManyOpenFilesSystem,
            ENOMEM => Error::NoMemory,
            EBADF => Error::BadFd,
            EAGAIN => Error::WouldBlock,
            EALREADY | EINPROGRESS => Error::AlreadyInProgress,
            EINVAL => Error::InvalidArgument,
            ENOTSOCK | ENOTDIR => Error::FileNotASocket,
            other => Error::Unknown { errno: other as i32 },
        }
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Error {
        match e {
            nix::Error::Sys(errno) => Error::from_errno(errno),
            _ => Error::Unknown { errno: -1 },
        }
    }
}

impl From<::std::io::Error> for Error {
    fn from(e: ::std::io::Error) -> Error {
        match e.raw_os_error() {
            Some(code) => Error::from_errno(nix::errno::Errno::from_i32(code)),
            None => Error::Unknown { errno: -1 },
        }
    }
}
