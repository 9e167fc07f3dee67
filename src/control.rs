//! The control-channel socket: a non-blocking `SOCK_SEQPACKET` unix socket
//! carrying one `wire::Message` per datagram, plus an outgoing message queue
//! and `SCM_RIGHTS` fd passing for `AddRegion`/`AddRing`.

use std::os::unix::io::RawFd;
use std::os::unix::net::UnixListener;
use std::path::Path;

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::socket::{
    accept, bind, connect, getsockopt, listen, recvmsg, sendmsg, setsockopt, socket,
    sockopt::PassCred, ControlMessage, ControlMessageOwned, MsgFlags, SockAddr, SockFlag,
    SockType,
};
use nix::sys::uio::IoVec;
use nix::unistd::close;

use crate::error::{Error, Result};
use crate::wire::Message;

/// A connected (or about-to-connect) control-channel endpoint.
pub struct ControlSocket {
    fd: RawFd,
    outgoing: Vec<(Vec<u8>, Option<RawFd>)>,
}

impl ControlSocket {
    /// Binds and listens on `path` for a master endpoint. Unlinks a stale
    /// socket file first; refuses to unlink anything that isn't a socket.
    pub fn listen(path: &Path) -> Result<RawFd> {
        if path.exists() {
            let meta = std::fs::symlink_metadata(path)?;
            use std::os::unix::fs::FileTypeExt;
            if !meta.file_type().is_socket() {
                return Err(Error::FileNotASocket);
            }
            let _ = std::fs::remove_file(path);
        }

        let fd = socket(
            nix::sys::socket::AddressFamily::Unix,
            SockType::SeqPacket,
            SockFlag::SOCK_NONBLOCK,
            None,
        )
        .map_err(Error::from)?;

        setsockopt(fd, PassCred, &true).map_err(Error::from)?;

        let addr = SockAddr::new_unix(path).map_err(Error::from)?;
        bind(fd, &addr).map_err(Error::from)?;
        listen(fd, 1).map_err(Error::from)?;

        Ok(fd)
    }

    pub fn accept(listen_fd: RawFd) -> Result<ControlSocket> {
        let fd = accept(listen_fd).map_err(Error::from)?;
        set_nonblocking(fd)?;
        Ok(ControlSocket {
            fd,
            outgoing: Vec::new(),
        })
    }

    /// Attempts a one-shot connect for a slave endpoint. A `ConnectionRefused`
    /// from the kernel is surfaced to the caller, which per the state
    /// machine's contract should treat it as "master not up yet, try again
    /// next tick" rather than a hard failure.
    pub fn connect(path: &Path) -> Result<ControlSocket> {
        let fd = socket(
            nix::sys::socket::AddressFamily::Unix,
            SockType::SeqPacket,
            SockFlag::SOCK_NONBLOCK,
            None,
        )
        .map_err(Error::from)?;

        let addr = SockAddr::new_unix(path).map_err(Error::from)?;
        match connect(fd, &addr) {
            Ok(()) => {}
            Err(nix::Error::Sys(nix::errno::Errno::ECONNREFUSED)) => {
                let _ = close(fd);
                return Err(Error::NoConnection);
            }
            Err(e) => {
                let _ = close(fd);
                return Err(Error::from(e));
            }
        }

        Ok(ControlSocket {
            fd,
            outgoing: Vec::new(),
        })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Queues a message for sending, along with an fd to pass via
    /// `SCM_RIGHTS` if the message kind expects one.
    pub fn enqueue(&mut self, msg: &Message, fd: Option<RawFd>) {
        debug_assert_eq!(msg.expects_fd(), fd.is_some());
        self.outgoing.push((msg.encode(), fd));
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.outgoing.is_empty()
    }

    /// Drains as much of the outgoing queue as the socket will currently
    /// accept. `SOCK_SEQPACKET` sends are atomic, so a message either goes
    /// out whole or we leave it at the head of the queue for next time.
    pub fn flush(&mut self) -> Result<()> {
        while let Some((bytes, fd)) = self.outgoing.first() {
            let iov = [IoVec::from_slice(bytes)];
            let result = match fd {
                Some(fd) => {
                    let cmsgs = [ControlMessage::ScmRights(&[*fd])];
                    sendmsg(self.fd, &iov, &cmsgs, MsgFlags::MSG_NOSIGNAL, None)
                }
                None => sendmsg(self.fd, &iov, &[], MsgFlags::MSG_NOSIGNAL, None),
            };

            match result {
                Ok(_) => {
                    self.outgoing.remove(0);
                }
                Err(nix::Error::Sys(nix::errno::Errno::EAGAIN)) => return Ok(()),
                Err(e) => return Err(Error::from(e)),
            }
        }
        Ok(())
    }

    /// Receives one message, along with an fd if one rode along via
    /// `SCM_RIGHTS`. Returns `Ok(None)` on `EAGAIN` (nothing to read yet) and
    /// `Err(Error::DisconnectRequested)` on peer EOF.
    pub fn recv(&mut self) -> Result<Option<(Message, Option<RawFd>)>> {
        let mut buf = [0u8; 256];
        let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);
        let iov = [IoVec::from_mut_slice(&mut buf)];

        let msg = match recvmsg(self.fd, &iov, Some(&mut cmsg_buf), MsgFlags::empty()) {
            Ok(m) => m,
            Err(nix::Error::Sys(nix::errno::Errno::EAGAIN)) => return Ok(None),
            Err(e) => return Err(Error::from(e)),
        };

        if msg.bytes == 0 {
            return Err(Error::DisconnectRequested);
        }

        let mut fd = None;
        for cmsg in msg.cmsgs() {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                if let Some(first) = fds.first() {
                    fd = Some(*first);
                }
            }
        }

        let decoded = Message::decode(&buf[..msg.bytes])?;
        if decoded.expects_fd() && fd.is_none() {
            return Err(if matches!(decoded, Message::AddRegion(_)) {
                Error::MissingShmFd
            } else {
                Error::MissingInterruptFd
            });
        }

        Ok(Some((decoded, fd)))
    }
}

impl Drop for ControlSocket {
    fn drop(&mut self) {
        for (_, fd) in self.outgoing.drain(..) {
            if let Some(fd) = fd {
                let _ = close(fd);
            }
        }
        let _ = close(self.fd);
    }
}

pub fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(Error::from)?;
    let mut flags = OFlag::from_bits_truncate(flags);
    flags.insert(OFlag::O_NONBLOCK);
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(Error::from)?;
    Ok(())
}

/// Unused but kept as a type-level reminder that the listener side, once
/// accepted from, is a plain `std::os::unix::net::UnixListener`-shaped
/// resource; our own accept loop above uses the raw fd API directly so it
/// can stay non-blocking and mio-registrable without going through `std`.
#[allow(dead_code)]
type _UnusedListenerHint = UnixListener;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{Hello, Message};
    use std::path::PathBuf;

    fn socket_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("memif-test-{}-{}", std::process::id(), name))
    }

    #[test]
    fn master_rejects_non_socket_stale_path() {
        let path = socket_path("non-socket");
        std::fs::write(&path, b"not a socket").unwrap();
        let result = ControlSocket::listen(&path);
        assert_eq!(result.unwrap_err(), Error::FileNotASocket);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn master_then_slave_handshake_exchanges_hello() {
        let path = socket_path("handshake");
        let _ = std::fs::remove_file(&path);
        let listen_fd = ControlSocket::listen(&path).expect("listen");

        let mut slave = ControlSocket::connect(&path);
        // a nonblocking connect() to a listening socket in the same process
        // may return WouldBlock/EINPROGRESS-shaped errors on some kernels;
        // retry a few times before giving up, matching how the reconnect
        // timer in `endpoint.rs` behaves in production.
        for _ in 0..50 {
            if slave.is_ok() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
            slave = ControlSocket::connect(&path);
        }
        let mut slave = slave.expect("connect");

        std::thread::sleep(std::time::Duration::from_millis(20));
        let mut master = ControlSocket::accept(listen_fd).expect("accept");

        master.enqueue(
            &Message::Hello(Hello {
                min_version: 1,
                max_version: 1,
                max_regions: 1,
                max_rings: 2,
                max_log2_ring_size: 10,
                name: "master".into(),
            }),
            None,
        );
        master.flush().expect("flush");

        let mut received = None;
        for _ in 0..50 {
            if let Some(m) = slave.recv().expect("recv") {
                received = Some(m);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }

        match received {
            Some((Message::Hello(h), None)) => assert_eq!(h.name, "master"),
            other => panic!("unexpected message: {:?}", other),
        }

        let _ = close(listen_fd);
        let _ = std::fs::remove_file(&path);
    }
}
