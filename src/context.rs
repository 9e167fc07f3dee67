//! `Context`: the process's explicit handle owning the reconnect timer, the
//! reactor callback, and the table of endpoints. Nothing in this crate keeps
//! process-wide state outside of a `Context` (see DESIGN.md's "global state"
//! note); multiple contexts may coexist in one process.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::path::PathBuf;

use serde_derive::Serialize;

use crate::data_path::{self, Buffer};
use crate::endpoint::{Endpoint, EndpointConfig, EndpointEvent, Role};
use crate::error::{Error, Result};
use crate::queue::Queue;
use crate::reactor::{self, FdEvent, OnControlFdUpdate};

/// Opaque handle to an endpoint owned by a `Context`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EndpointId(usize);

/// Snapshot of an endpoint's negotiated state, returned by `Context::details`.
#[derive(Clone, Debug, Serialize)]
pub struct EndpointDetails {
    pub interface_name: String,
    pub instance_name: String,
    pub remote_interface_name: Option<String>,
    pub remote_instance_name: Option<String>,
    pub id: u32,
    pub secret: Option<String>,
    pub role: Role,
    pub socket_path: PathBuf,
    pub log2_ring_size: u8,
    pub buffer_size: u32,
    pub num_s2m_rings: u16,
    pub num_m2s_rings: u16,
    pub link_up: bool,
}

type ConnectCb = Box<dyn FnMut(EndpointId, *mut std::ffi::c_void)>;
type DisconnectCb = Box<dyn FnMut(EndpointId, *mut std::ffi::c_void)>;
type InterruptCb = Box<dyn FnMut(EndpointId, *mut std::ffi::c_void, u16)>;

struct EndpointSlot {
    endpoint: Endpoint,
    on_connect: ConnectCb,
    on_disconnect: DisconnectCb,
    on_interrupt: InterruptCb,
    private_ctx: *mut std::ffi::c_void,
    /// Guards against the application deleting an endpoint from inside one
    /// of its own callbacks (see DESIGN.md's reentrancy note).
    in_callback: bool,
    pending_delete: bool,
}

/// The reconnect timer, shared by every slave endpoint a context manages,
/// mirroring the original's single process-wide timerfd.
struct ReconnectTimer {
    fd: RawFd,
}

const RECONNECT_PERIOD_SECS: i64 = 2;

impl ReconnectTimer {
    fn create() -> Result<Self> {
        let fd = unsafe { libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK) };
        if fd < 0 {
            return Err(Error::from(std::io::Error::last_os_error()));
        }
        Ok(ReconnectTimer { fd })
    }

    fn arm(&self) -> Result<()> {
        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: RECONNECT_PERIOD_SECS,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: RECONNECT_PERIOD_SECS,
                tv_nsec: 0,
            },
        };
        let ret = unsafe { libc::timerfd_settime(self.fd, 0, &spec, std::ptr::null_mut()) };
        if ret < 0 {
            return Err(Error::from(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    fn disarm(&self) -> Result<()> {
        let spec = unsafe { std::mem::zeroed::<libc::itimerspec>() };
        let ret = unsafe { libc::timerfd_settime(self.fd, 0, &spec, std::ptr::null_mut()) };
        if ret < 0 {
            return Err(Error::from(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Drains the expiration counter. Must be called every time the fd is
    /// reported readable, or it stays readable forever (level-triggered).
    fn consume(&self) {
        let mut buf = [0u8; 8];
        unsafe {
            libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, 8);
        }
    }
}

impl Drop for ReconnectTimer {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

pub struct Context {
    slots: HashMap<usize, EndpointSlot>,
    next_id: usize,
    timer: ReconnectTimer,
    armed_slaves: usize,
    on_control_fd_update: Option<OnControlFdUpdate>,
    builtin: Option<reactor::BuiltinReactor>,
}

impl Context {
    /// Creates a context. With `on_control_fd_update` supplied, the caller
    /// owns fd polling and must route readiness through
    /// `control_fd_handler`. With `None`, a built-in `mio::Poll` loop is used
    /// instead, driven by `poll_event`.
    pub fn new(on_control_fd_update: Option<OnControlFdUpdate>) -> Result<Context> {
        let timer = ReconnectTimer::create()?;
        let builtin = if on_control_fd_update.is_none() {
            Some(reactor::BuiltinReactor::new()?)
        } else {
            None
        };

        let ctx = Context {
            slots: HashMap::new(),
            next_id: 0,
            timer,
            armed_slaves: 0,
            on_control_fd_update,
            builtin,
        };

        ctx.report_fd(ctx.timer.fd, FdEvent::READ)?;

        Ok(ctx)
    }

    fn report_fd(&self, fd: RawFd, event: FdEvent) -> Result<()> {
        match (&self.on_control_fd_update, &self.builtin) {
            (Some(cb), _) => cb(fd, event).map_err(|_| Error::CallbackFailure),
            (None, Some(b)) => b.register(fd, event),
            (None, None) => unreachable!("a context always has exactly one reactor strategy"),
        }
    }

    fn unreport_fd(&self, fd: RawFd) -> Result<()> {
        match (&self.on_control_fd_update, &self.builtin) {
            (Some(cb), _) => cb(fd, FdEvent::DELETE).map_err(|_| Error::CallbackFailure),
            (None, Some(b)) => b.deregister(fd),
            (None, None) => unreachable!(),
        }
    }

    pub fn create_endpoint(
        &mut self,
        config: EndpointConfig,
        on_connect: impl FnMut(EndpointId, *mut std::ffi::c_void) + 'static,
        on_disconnect: impl FnMut(EndpointId, *mut std::ffi::c_void) + 'static,
        on_interrupt: impl FnMut(EndpointId, *mut std::ffi::c_void, u16) + 'static,
        private_ctx: *mut std::ffi::c_void,
    ) -> Result<EndpointId> {
        let role = config.role;
        let endpoint = match role {
            Role::Master => Endpoint::new_master(config)?,
            Role::Slave => Endpoint::new_slave(config)?,
        };

        let id = self.next_id;
        self.next_id += 1;

        if let Some(fd) = endpoint.listen_fd {
            self.report_fd(fd, FdEvent::READ)?;
        }

        self.slots.insert(
            id,
            EndpointSlot {
                endpoint,
                on_connect: Box::new(on_connect),
                on_disconnect: Box::new(on_disconnect),
                on_interrupt: Box::new(on_interrupt),
                private_ctx,
                in_callback: false,
                pending_delete: false,
            },
        );

        if role == Role::Slave {
            self.arm_reconnect_timer()?;
        }

        Ok(EndpointId(id))
    }

    fn arm_reconnect_timer(&mut self) -> Result<()> {
        if self.armed_slaves == 0 {
            self.timer.arm()?;
        }
        self.armed_slaves += 1;
        Ok(())
    }

    fn disarm_reconnect_timer(&mut self) -> Result<()> {
        self.armed_slaves = self.armed_slaves.saturating_sub(1);
        if self.armed_slaves == 0 {
            self.timer.disarm()?;
        }
        Ok(())
    }

    /// Routes one readiness notification for `fd` (as reported by the
    /// application's own multiplexer) into the library.
    pub fn control_fd_handler(&mut self, fd: RawFd, events: FdEvent) -> Result<()> {
        if fd == self.timer.fd {
            self.timer.consume();
            return self.tick_reconnects();
        }

        let ids: Vec<usize> = self.slots.keys().copied().collect();
        for id in ids {
            let matches_listen = self
                .slots
                .get(&id)
                .and_then(|s| s.endpoint.listen_fd)
                .map_or(false, |lfd| lfd == fd);
            let matches_control = self
                .slots
                .get(&id)
                .and_then(|s| s.endpoint.control_fd())
                .map_or(false, |cfd| cfd == fd);

            if matches_listen && events.contains(FdEvent::READ) {
                self.accept_on(id)?;
            } else if matches_control {
                if events.contains(FdEvent::WRITE) {
                    self.flush_writes_on(id)?;
                }
                if events.contains(FdEvent::READ) {
                    self.drain_readable_on(id)?;
                }
            }
        }
        Ok(())
    }

    fn tick_reconnects(&mut self) -> Result<()> {
        let ids: Vec<usize> = self.slots.keys().copied().collect();
        for id in ids {
            let should_try = self
                .slots
                .get(&id)
                .map_or(false, |s| s.endpoint.config.role == Role::Slave && s.endpoint.control_fd().is_none());
            if !should_try {
                continue;
            }
            let connected = {
                let slot = self.slots.get_mut(&id).unwrap();
                slot.endpoint.try_connect()?
            };
            if connected {
                self.disarm_reconnect_timer()?;
                self.sync_control_interest(id)?;
            }
        }
        Ok(())
    }

    fn accept_on(&mut self, id: usize) -> Result<()> {
        let slot = self.slots.get_mut(&id).unwrap();
        slot.endpoint.accept()?;
        self.sync_control_interest(id)?;
        Ok(())
    }

    fn flush_writes_on(&mut self, id: usize) -> Result<()> {
        let slot = self.slots.get_mut(&id).unwrap();
        slot.endpoint.flush_writes()?;
        self.sync_control_interest(id)
    }

    /// Arms `WRITE` on a control fd only while its endpoint actually has
    /// queued outgoing bytes; drops back to `READ`-only once the queue
    /// drains. Keeps the level-triggered built-in reactor (and any
    /// application multiplexer behind `on_control_fd_update`) from reporting
    /// writable every tick on an otherwise-idle connection.
    fn sync_control_interest(&mut self, id: usize) -> Result<()> {
        let slot = match self.slots.get(&id) {
            Some(s) => s,
            None => return Ok(()),
        };
        if let Some(fd) = slot.endpoint.control_fd() {
            let event = if slot.endpoint.wants_write() {
                FdEvent::READ | FdEvent::WRITE
            } else {
                FdEvent::READ
            };
            self.report_fd(fd, event)?;
        }
        Ok(())
    }

    fn drain_readable_on(&mut self, id: usize) -> Result<()> {
        loop {
            let event = {
                let slot = self.slots.get_mut(&id).unwrap();
                slot.endpoint.process_readable()?
            };
            match event {
                EndpointEvent::None => break,
                EndpointEvent::Connected => {
                    self.fire_connected(id)?;
                }
                EndpointEvent::Disconnected { retry } => {
                    self.fire_disconnected(id, retry)?;
                    return Ok(());
                }
            }
        }
        self.sync_control_interest(id)
    }

    fn fire_connected(&mut self, id: usize) -> Result<()> {
        for q in self.rx_interrupt_fds(id) {
            self.report_fd(q, FdEvent::READ)?;
        }
        let slot = self.slots.get_mut(&id).unwrap();
        if slot.in_callback {
            return Ok(());
        }
        slot.in_callback = true;
        (slot.on_connect)(EndpointId(id), slot.private_ctx);
        slot.in_callback = false;
        Ok(())
    }

    fn fire_disconnected(&mut self, id: usize, retry: bool) -> Result<()> {
        let control_fd = self.slots.get(&id).and_then(|s| s.endpoint.control_fd());
        if let Some(fd) = control_fd {
            let _ = self.unreport_fd(fd);
        }
        for q in self.rx_interrupt_fds(id) {
            let _ = self.unreport_fd(q);
        }

        let pending_delete = {
            let slot = self.slots.get_mut(&id).unwrap();
            if !slot.in_callback {
                slot.in_callback = true;
                (slot.on_disconnect)(EndpointId(id), slot.private_ctx);
                slot.in_callback = false;
            }
            slot.pending_delete
        };

        if retry {
            self.arm_reconnect_timer()?;
        }

        if pending_delete {
            self.slots.remove(&id);
        }
        Ok(())
    }

    fn rx_interrupt_fds(&self, id: usize) -> Vec<RawFd> {
        self.slots
            .get(&id)
            .map(|s| s.endpoint.rx_queues.iter().map(|q| q.interrupt_fd).collect())
            .unwrap_or_default()
    }

    /// Polls an interrupt fd directly for applications not using the
    /// callback-driven `on_interrupt` path.
    pub fn queue_event_fd(&self, id: EndpointId, qid: u16) -> Result<RawFd> {
        let slot = self.slots.get(&id.0).ok_or(Error::InvalidArgument)?;
        slot.endpoint
            .rx_queues
            .get(qid as usize)
            .map(|q| q.interrupt_fd)
            .ok_or(Error::InvalidArgument)
    }

    /// Dispatches `on_interrupt` for a given endpoint/queue; called by the
    /// built-in loop, or by the application directly when it polls an
    /// interrupt fd obtained via `queue_event_fd`.
    pub fn notify_interrupt(&mut self, id: EndpointId, qid: u16) {
        if let Some(slot) = self.slots.get_mut(&id.0) {
            if slot.in_callback {
                return;
            }
            slot.in_callback = true;
            (slot.on_interrupt)(id, slot.private_ctx, qid);
            slot.in_callback = false;
        }
    }

    /// Drives one iteration of the built-in reactor. Only valid for a
    /// context created with `on_control_fd_update = None`.
    pub fn poll_event(&mut self, timeout_ms: Option<u64>) -> Result<()> {
        let builtin = self.builtin.as_ref().ok_or(Error::InvalidArgument)?;
        let ready = builtin.poll(timeout_ms)?;
        for (fd, events) in ready {
            if self.is_interrupt_fd(fd) {
                if let Some((id, qid)) = self.find_interrupt(fd) {
                    consume_eventfd(fd);
                    self.notify_interrupt(id, qid);
                }
            } else {
                self.control_fd_handler(fd, events)?;
            }
        }
        Ok(())
    }

    fn is_interrupt_fd(&self, fd: RawFd) -> bool {
        self.find_interrupt(fd).is_some()
    }

    fn find_interrupt(&self, fd: RawFd) -> Option<(EndpointId, u16)> {
        for (&id, slot) in self.slots.iter() {
            for (qid, q) in slot.endpoint.rx_queues.iter().enumerate() {
                if q.interrupt_fd == fd {
                    return Some((EndpointId(id), qid as u16));
                }
            }
        }
        None
    }

    fn queue_mut(&mut self, id: EndpointId, qid: u16, tx: bool) -> Result<&mut Queue> {
        let slot = self.slots.get_mut(&id.0).ok_or(Error::InvalidArgument)?;
        let queues = if tx {
            &mut slot.endpoint.tx_queues
        } else {
            &mut slot.endpoint.rx_queues
        };
        queues.get_mut(qid as usize).ok_or(Error::InvalidArgument)
    }

    pub fn buffer_alloc(&mut self, id: EndpointId, qid: u16, want: u16) -> Result<(Vec<Buffer>, Result<()>)> {
        let q = self.queue_mut(id, qid, true)?;
        Ok(data_path::buffer_alloc(q, want))
    }

    pub fn tx_burst(&mut self, id: EndpointId, qid: u16, bufs: &[Buffer]) -> Result<u16> {
        let q = self.queue_mut(id, qid, true)?;
        data_path::tx_burst(q, bufs)
    }

    pub fn rx_burst(&mut self, id: EndpointId, qid: u16, max: u16) -> Result<Vec<Buffer>> {
        let q = self.queue_mut(id, qid, false)?;
        Ok(data_path::rx_burst(q, max))
    }

    pub fn buffer_free(&mut self, id: EndpointId, qid: u16, bufs: &[Buffer]) -> Result<u16> {
        let q = self.queue_mut(id, qid, false)?;
        Ok(data_path::buffer_free(q, bufs))
    }

    pub fn details(&self, id: EndpointId) -> Result<EndpointDetails> {
        let slot = self.slots.get(&id.0).ok_or(Error::InvalidArgument)?;
        let e = &slot.endpoint;
        Ok(EndpointDetails {
            interface_name: e.config.interface_name.clone(),
            instance_name: e.config.instance_name.clone(),
            remote_interface_name: e.remote_interface_name.clone(),
            remote_instance_name: e.remote_instance_name.clone(),
            id: e.config.interface_id,
            secret: e.config.secret.clone(),
            role: e.config.role,
            socket_path: e.config.socket_path.clone(),
            log2_ring_size: e.config.log2_ring_size,
            buffer_size: e.config.buffer_size,
            num_s2m_rings: e.config.num_s2m_rings,
            num_m2s_rings: e.config.num_m2s_rings,
            link_up: e.state == crate::endpoint::State::Connected,
        })
    }

    /// Tears down an endpoint. Re-entrant calls from within that endpoint's
    /// own callbacks are deferred rather than applied immediately (see
    /// DESIGN.md's reentrancy note) and return `already-in-progress`.
    pub fn delete_endpoint(&mut self, id: EndpointId) -> Result<()> {
        let (in_callback, has_connection) = {
            let slot = self.slots.get(&id.0).ok_or(Error::InvalidArgument)?;
            (
                slot.in_callback,
                slot.endpoint.control_fd().is_some() || slot.endpoint.listen_fd.is_some(),
            )
        };

        if in_callback {
            if let Some(slot) = self.slots.get_mut(&id.0) {
                slot.pending_delete = true;
            }
            return Err(Error::AlreadyInProgress);
        }

        if !has_connection {
            return Err(Error::NoConnection);
        }

        if let Some(fd) = self.slots.get(&id.0).and_then(|s| s.endpoint.control_fd()) {
            let _ = self.unreport_fd(fd);
        }
        if let Some(fd) = self.slots.get(&id.0).and_then(|s| s.endpoint.listen_fd) {
            let _ = self.unreport_fd(fd);
        }
        for q in self.rx_interrupt_fds(id.0) {
            let _ = self.unreport_fd(q);
        }

        let was_slave = self
            .slots
            .get(&id.0)
            .map(|s| s.endpoint.config.role == Role::Slave)
            .unwrap_or(false);

        if let Some(slot) = self.slots.get_mut(&id.0) {
            slot.endpoint.delete();
        }
        self.slots.remove(&id.0);

        if was_slave {
            self.disarm_reconnect_timer()?;
        }
        Ok(())
    }
}

fn consume_eventfd(fd: RawFd) {
    let mut buf = [0u8; 8];
    unsafe {
        libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, 8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointConfig;

    fn socket_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("memif-context-test-{}-{}", std::process::id(), name))
    }

    #[test]
    fn details_on_unknown_endpoint_is_invalid_argument() {
        let ctx = Context::new(None).unwrap();
        let bogus = EndpointId(9999);
        assert_eq!(ctx.details(bogus).unwrap_err(), Error::InvalidArgument);
    }

    #[test]
    fn slave_created_before_any_master_does_not_connect_immediately() {
        let path = socket_path("no-master-yet");
        let _ = std::fs::remove_file(&path);
        let mut ctx = Context::new(None).unwrap();

        let id = ctx
            .create_endpoint(
                EndpointConfig {
                    role: Role::Slave,
                    socket_path: path.clone(),
                    ..EndpointConfig::default()
                },
                |_, _| {},
                |_, _| {},
                |_, _, _| {},
                std::ptr::null_mut(),
            )
            .expect("create slave");

        assert!(!ctx.details(id).unwrap().link_up);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn deleting_an_endpoint_mid_callback_is_deferred() {
        let path = socket_path("delete-reentrant");
        let _ = std::fs::remove_file(&path);
        let mut ctx = Context::new(None).unwrap();

        let id = ctx
            .create_endpoint(
                EndpointConfig {
                    role: Role::Master,
                    socket_path: path.clone(),
                    ..EndpointConfig::default()
                },
                |_, _| {},
                |_, _| {},
                |_, _, _| {},
                std::ptr::null_mut(),
            )
            .expect("create master");

        if let Some(slot) = ctx.slots.get_mut(&id.0) {
            slot.in_callback = true;
        }
        assert_eq!(ctx.delete_endpoint(id).unwrap_err(), Error::AlreadyInProgress);
        assert!(ctx.slots.get(&id.0).unwrap().pending_delete);

        let _ = std::fs::remove_file(&path);
    }
}
