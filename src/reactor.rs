//! Reactor glue (§4.6): the fd-update callback contract, and a built-in
//! level-triggered default loop used when the application doesn't supply its
//! own multiplexer integration.
//!
//! The built-in variant follows the same registration pattern the teacher
//! uses for its own custom-fd `Evented` impl (`src/fd.rs`): wrap a `RawFd` in
//! `mio::unix::EventedFd` and drive everything through one `mio::Poll`.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::time::Duration;

use mio::unix::EventedFd;
use mio::{Events, Poll, PollOpt, Ready, Token};

use crate::error::{Error, Result};

bitflags! {
    /// Readiness bits reported to/consumed by the fd-update callback.
    pub struct FdEvent: u32 {
        const READ = 0b0000_0001;
        const WRITE = 0b0000_0010;
        const ERROR = 0b0000_0100;
        const DELETE = 0b0000_1000;
        const MODIFY = 0b0001_0000;
    }
}

impl FdEvent {
    fn to_ready(self) -> Ready {
        let mut r = Ready::empty();
        if self.contains(FdEvent::READ) {
            r |= Ready::readable();
        }
        if self.contains(FdEvent::WRITE) {
            r |= Ready::writable();
        }
        if self.contains(FdEvent::ERROR) {
            r |= Ready::error();
        }
        r
    }

    fn from_ready(r: Ready) -> FdEvent {
        let mut e = FdEvent::empty();
        if r.is_readable() {
            e |= FdEvent::READ;
        }
        if r.is_writable() {
            e |= FdEvent::WRITE;
        }
        if r.is_error() {
            e |= FdEvent::ERROR;
        }
        e
    }
}

/// Application-supplied callback: told which fds to poll and for what. The
/// application routes readiness back in via `Context::control_fd_handler`.
/// Returning `Err` means the endpoint that produced this fd cannot be
/// installed in the application's multiplexer and is torn down.
pub type OnControlFdUpdate = Box<dyn Fn(RawFd, FdEvent) -> ::std::result::Result<(), ()>>;

/// The default reactor used when no `OnControlFdUpdate` is supplied.
/// Registers every fd the library hands it with `mio::Poll` in
/// level-triggered mode (matching the non-blocking, re-readable-until-
/// drained semantics the control channel and timerfd both rely on).
pub struct BuiltinReactor {
    poll: Poll,
    tokens: std::cell::RefCell<HashMap<RawFd, Token>>,
    next_token: std::cell::Cell<usize>,
}

impl BuiltinReactor {
    pub fn new() -> Result<Self> {
        let poll = Poll::new().map_err(Error::from)?;
        Ok(BuiltinReactor {
            poll,
            tokens: std::cell::RefCell::new(HashMap::new()),
            next_token: std::cell::Cell::new(0),
        })
    }

    pub fn register(&self, fd: RawFd, event: FdEvent) -> Result<()> {
        let mut tokens = self.tokens.borrow_mut();
        if let Some(&token) = tokens.get(&fd) {
            self.poll
                .reregister(&EventedFd(&fd), token, event.to_ready(), PollOpt::level())
                .map_err(Error::from)?;
            return Ok(());
        }

        let token = Token(self.next_token.get());
        self.next_token.set(self.next_token.get() + 1);
        self.poll
            .register(&EventedFd(&fd), token, event.to_ready(), PollOpt::level())
            .map_err(Error::from)?;
        tokens.insert(fd, token);
        Ok(())
    }

    pub fn deregister(&self, fd: RawFd) -> Result<()> {
        let mut tokens = self.tokens.borrow_mut();
        if let Some(_token) = tokens.remove(&fd) {
            self.poll.deregister(&EventedFd(&fd)).map_err(Error::from)?;
        }
        Ok(())
    }

    /// Blocks for up to `timeout_ms` (or indefinitely if `None`), returning
    /// every fd that became ready along with its readiness bits.
    pub fn poll(&self, timeout_ms: Option<u64>) -> Result<Vec<(RawFd, FdEvent)>> {
        let mut events = Events::with_capacity(64);
        let timeout = timeout_ms.map(Duration::from_millis);
        self.poll.poll(&mut events, timeout).map_err(Error::from)?;

        let tokens = self.tokens.borrow();
        let by_token: HashMap<Token, RawFd> = tokens.iter().map(|(&fd, &tok)| (tok, fd)).collect();

        let mut out = Vec::new();
        for ev in events.iter() {
            if let Some(&fd) = by_token.get(&ev.token()) {
                out.push((fd, FdEvent::from_ready(ev.readiness())));
            }
        }
        Ok(out)
    }
}
