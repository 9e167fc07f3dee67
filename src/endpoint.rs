//! The connection state machine (§4.4): one `Endpoint` per logical
//! interface, carried through `pre-init`/`listening`/`disconnected` ->
//! `handshaking` -> `connected` -> `disconnecting`.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::path::PathBuf;

use nix::sys::eventfd::{eventfd, EfdFlags};
use nix::unistd::close;
use serde_derive::Serialize;
use strum_macros::Display;

use crate::control::ControlSocket;
use crate::error::{Error, Result};
use crate::queue::Queue;
use crate::region::{region_size, Region};
use crate::ring::Direction;
use crate::wire::{
    AddRegion, AddRing, Connect, Connected, Disconnect, Hello, Init, Message, RingDirection,
    MAX_NAME_LEN, MAX_SECRET_LEN, PROTOCOL_VERSION,
};

pub const DEFAULT_SOCKET_PATH: &str = "/run/vpp/memif.sock";
pub const DEFAULT_LOG2_RING_SIZE: u8 = 10;
pub const DEFAULT_BUFFER_SIZE: u32 = 2048;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, Serialize)]
pub enum Role {
    Master,
    Slave,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum Mode {
    Ethernet,
    Ip,
    PuntInject,
}

impl Mode {
    fn wire(self) -> u8 {
        match self {
            Mode::Ethernet => 0,
            Mode::Ip => 1,
            Mode::PuntInject => 2,
        }
    }
}

/// Configuration for one endpoint, supplied to `Context::create_endpoint`.
#[derive(Clone, Debug)]
pub struct EndpointConfig {
    pub role: Role,
    pub interface_id: u32,
    pub interface_name: String,
    pub instance_name: String,
    pub mode: Mode,
    pub secret: Option<String>,
    pub log2_ring_size: u8,
    pub buffer_size: u32,
    pub num_s2m_rings: u16,
    pub num_m2s_rings: u16,
    pub socket_path: PathBuf,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        EndpointConfig {
            role: Role::Slave,
            interface_id: 0,
            interface_name: "memif0".into(),
            instance_name: "memif-app".into(),
            mode: Mode::Ethernet,
            secret: None,
            log2_ring_size: DEFAULT_LOG2_RING_SIZE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            num_s2m_rings: 1,
            num_m2s_rings: 1,
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
        }
    }
}

impl EndpointConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.interface_name.len() >= MAX_NAME_LEN || self.instance_name.len() >= MAX_NAME_LEN {
            return Err(Error::InvalidArgument);
        }
        if let Some(s) = &self.secret {
            if s.len() >= MAX_SECRET_LEN {
                return Err(Error::InvalidArgument);
            }
        }
        if self.log2_ring_size == 0 || self.log2_ring_size > 16 {
            return Err(Error::InvalidArgument);
        }
        if self.num_s2m_rings == 0 && self.num_m2s_rings == 0 {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    PreInit,
    Listening,
    Disconnected,
    Handshaking,
    Connected,
    Disconnecting,
}

/// What happened as a result of feeding the endpoint a readiness
/// notification; `Context` turns these into callback invocations and
/// reactor (de)registrations.
pub enum EndpointEvent {
    None,
    Connected,
    /// Endpoint finished tearing down. If `retry` the owner should re-arm
    /// the reconnect timer (slave only).
    Disconnected { retry: bool },
}

/// Accumulates `AddRegion`/`AddRing` announcements on the master side while
/// waiting for `Connect`.
#[derive(Default)]
struct PendingHandshake {
    region: Option<(u16, u64, RawFd)>,
    rings: HashMap<(RingDirection, u16), AddRing>,
    ring_fds: HashMap<(RingDirection, u16), RawFd>,
}

pub struct Endpoint {
    pub config: EndpointConfig,
    pub state: State,
    pub(crate) listen_fd: Option<RawFd>,
    pub(crate) control: Option<ControlSocket>,
    region: Option<Region>,
    pub tx_queues: Vec<Queue>,
    pub rx_queues: Vec<Queue>,
    pub remote_interface_name: Option<String>,
    pub remote_instance_name: Option<String>,
    pub last_disconnect_reason: Option<String>,
    pending: PendingHandshake,
}

impl Endpoint {
    pub fn new_master(config: EndpointConfig) -> Result<Self> {
        config.validate()?;
        let listen_fd = ControlSocket::listen(&config.socket_path)?;
        Ok(Endpoint {
            config,
            state: State::Listening,
            listen_fd: Some(listen_fd),
            control: None,
            region: None,
            tx_queues: Vec::new(),
            rx_queues: Vec::new(),
            remote_interface_name: None,
            remote_instance_name: None,
            last_disconnect_reason: None,
            pending: PendingHandshake::default(),
        })
    }

    pub fn new_slave(config: EndpointConfig) -> Result<Self> {
        config.validate()?;
        Ok(Endpoint {
            config,
            state: State::Disconnected,
            listen_fd: None,
            control: None,
            region: None,
            tx_queues: Vec::new(),
            rx_queues: Vec::new(),
            remote_interface_name: None,
            remote_instance_name: None,
            last_disconnect_reason: None,
            pending: PendingHandshake::default(),
        })
    }

    pub fn control_fd(&self) -> Option<RawFd> {
        self.control.as_ref().map(ControlSocket::as_raw_fd)
    }

    pub fn wants_write(&self) -> bool {
        self.control
            .as_ref()
            .map(ControlSocket::has_pending_writes)
            .unwrap_or(false)
    }

    /// Slave-side reconnect attempt, invoked by the reconnect timer while
    /// `Disconnected`. `Ok(false)` means "master not up yet, try again next
    /// tick"; it is not an application-visible error.
    pub fn try_connect(&mut self) -> Result<bool> {
        debug_assert_eq!(self.config.role, Role::Slave);
        match ControlSocket::connect(&self.config.socket_path) {
            Ok(sock) => {
                debug!("connected control channel to {:?}", self.config.socket_path);
                self.control = Some(sock);
                self.state = State::Handshaking;
                Ok(true)
            }
            Err(Error::NoConnection) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Master-side accept, invoked when the listen fd is read-ready.
    pub fn accept(&mut self) -> Result<()> {
        debug_assert_eq!(self.config.role, Role::Master);
        let listen_fd = self.listen_fd.ok_or(Error::NoConnection)?;
        let mut sock = ControlSocket::accept(listen_fd)?;
        sock.enqueue(
            &Message::Hello(Hello {
                min_version: PROTOCOL_VERSION,
                max_version: PROTOCOL_VERSION,
                max_regions: 1,
                max_rings: self.config.num_s2m_rings.max(self.config.num_m2s_rings),
                max_log2_ring_size: self.config.log2_ring_size,
                name: self.config.instance_name.clone(),
            }),
            None,
        );
        self.control = Some(sock);
        self.state = State::Handshaking;
        self.pending = PendingHandshake::default();
        Ok(())
    }

    pub fn flush_writes(&mut self) -> Result<()> {
        if let Some(sock) = self.control.as_mut() {
            sock.flush()?;
        }
        Ok(())
    }

    /// Drains and processes every message currently readable on the control
    /// socket, returning the most significant event produced (callers only
    /// need to react to `Connected`/`Disconnected`/`RegisterInterrupt`; data
    /// availability is delivered separately via the ring interrupt fds).
    pub fn process_readable(&mut self) -> Result<EndpointEvent> {
        loop {
            let received = match self.control.as_mut() {
                Some(sock) => sock.recv(),
                None => return Ok(EndpointEvent::None),
            };

            let (msg, fd) = match received {
                Ok(Some(pair)) => pair,
                Ok(None) => return Ok(EndpointEvent::None),
                Err(e) => return Ok(self.begin_disconnect(e)),
            };

            match self.handle_message(msg, fd) {
                Ok(EndpointEvent::None) => continue,
                Ok(other) => return Ok(other),
                Err(e) => return Ok(self.begin_disconnect(e)),
            }
        }
    }

    fn handle_message(&mut self, msg: Message, fd: Option<RawFd>) -> Result<EndpointEvent> {
        match self.config.role {
            Role::Master => self.handle_message_as_master(msg, fd),
            Role::Slave => self.handle_message_as_slave(msg, fd),
        }
    }

    fn handle_message_as_master(&mut self, msg: Message, fd: Option<RawFd>) -> Result<EndpointEvent> {
        match msg {
            Message::Init(init) => {
                if init.version != PROTOCOL_VERSION {
                    return Err(Error::ProtocolVersionMismatch);
                }
                if init.is_master {
                    return Err(Error::ModeMismatch);
                }
                if init.interface_id != self.config.interface_id {
                    return Err(Error::InterfaceIdMismatch);
                }
                if init.mode != self.config.mode.wire() {
                    return Err(Error::ModeMismatch);
                }
                match (&self.config.secret, &init.secret) {
                    (Some(expected), Some(got)) if expected == got => {}
                    (Some(_), None) => return Err(Error::SecretRequired),
                    (None, Some(_)) | (Some(_), Some(_)) => return Err(Error::SecretMismatch),
                    (None, None) => {}
                }
                self.remote_instance_name = Some(init.name);
                Ok(EndpointEvent::None)
            }
            Message::AddRegion(AddRegion {
                region_index,
                region_size,
            }) => {
                let fd = fd.ok_or(Error::MissingShmFd)?;
                if self.pending.region.is_some() {
                    return Err(Error::TooManyRegions);
                }
                self.pending.region = Some((region_index, region_size, fd));
                Ok(EndpointEvent::None)
            }
            Message::AddRing(ring) => {
                let fd = fd.ok_or(Error::MissingInterruptFd)?;
                let key = (ring.direction, ring.ring_index);
                if self.pending.rings.len()
                    >= (self.config.num_s2m_rings + self.config.num_m2s_rings) as usize
                {
                    return Err(Error::TooManyRings);
                }
                self.pending.ring_fds.insert(key, fd);
                self.pending.rings.insert(key, ring);
                Ok(EndpointEvent::None)
            }
            Message::Connect(Connect { name }) => {
                self.remote_interface_name = Some(name);
                self.finish_master_handshake()
            }
            Message::Disconnect(Disconnect { reason, .. }) => {
                self.begin_disconnect_with_reason(reason)
            }
            _ => Err(Error::MalformedMessage),
        }
    }

    fn finish_master_handshake(&mut self) -> Result<EndpointEvent> {
        let (region_index, region_size_bytes, region_fd) =
            self.pending.region.take().ok_or(Error::MissingShmFd)?;

        let expected_rings = self.config.num_s2m_rings as usize + self.config.num_m2s_rings as usize;
        if self.pending.rings.len() != expected_rings {
            return Err(Error::TooManyRings);
        }

        let expected_size = region_size(
            self.config.num_s2m_rings,
            self.config.num_m2s_rings,
            self.config.log2_ring_size,
            self.config.buffer_size,
        ) as u64;
        if region_size_bytes != expected_size {
            return Err(Error::MalformedMessage);
        }

        let region = Region::from_fd(region_fd, region_size_bytes as usize)?;
        let _ = region_index;

        self.install_queues_from_region(region)?;

        self.control.as_mut().unwrap().enqueue(
            &Message::Connected(Connected {
                name: self.config.interface_name.clone(),
            }),
            None,
        );
        self.state = State::Connected;
        Ok(EndpointEvent::Connected)
    }

    fn install_queues_from_region(&mut self, region: Region) -> Result<()> {
        for i in 0..self.config.num_s2m_rings {
            let ring_msg = self
                .pending
                .rings
                .get(&(RingDirection::S2M, i))
                .ok_or(Error::MissingInterruptFd)?
                .clone();
            let fd = *self
                .pending
                .ring_fds
                .get(&(RingDirection::S2M, i))
                .ok_or(Error::MissingInterruptFd)?;
            let ring = unsafe {
                region.ring_at(
                    Direction::S2M,
                    i,
                    self.config.num_s2m_rings,
                    self.config.log2_ring_size,
                )
            };
            if !unsafe { (*ring).cookie_valid() } {
                return Err(Error::BadRingCookie);
            }
            // Master consumes s2m rings.
            self.rx_queues.push(Queue {
                direction: Direction::S2M,
                index: i,
                ring,
                log2_ring_size: ring_msg.log2_ring_size,
                region_index: ring_msg.region_index,
                byte_offset_within_region: ring_msg.byte_offset as usize,
                interrupt_fd: fd,
                last_head: 0,
                alloc_bufs: 0,
            });
        }
        for i in 0..self.config.num_m2s_rings {
            let ring_msg = self
                .pending
                .rings
                .get(&(RingDirection::M2S, i))
                .ok_or(Error::MissingInterruptFd)?
                .clone();
            let fd = *self
                .pending
                .ring_fds
                .get(&(RingDirection::M2S, i))
                .ok_or(Error::MissingInterruptFd)?;
            let ring = unsafe {
                region.ring_at(
                    Direction::M2S,
                    i,
                    self.config.num_s2m_rings,
                    self.config.log2_ring_size,
                )
            };
            if !unsafe { (*ring).cookie_valid() } {
                return Err(Error::BadRingCookie);
            }
            // Master produces m2s rings.
            self.tx_queues.push(Queue {
                direction: Direction::M2S,
                index: i,
                ring,
                log2_ring_size: ring_msg.log2_ring_size,
                region_index: ring_msg.region_index,
                byte_offset_within_region: ring_msg.byte_offset as usize,
                interrupt_fd: fd,
                last_head: 0,
                alloc_bufs: 0,
            });
        }
        self.region = Some(region);
        Ok(())
    }

    fn handle_message_as_slave(&mut self, msg: Message, _fd: Option<RawFd>) -> Result<EndpointEvent> {
        match msg {
            Message::Hello(hello) => self.handle_hello(hello),
            Message::Connected(Connected { name }) => {
                self.remote_interface_name = Some(name);
                self.state = State::Connected;
                Ok(EndpointEvent::Connected)
            }
            Message::Disconnect(Disconnect { reason, .. }) => {
                self.begin_disconnect_with_reason(reason)
            }
            _ => Err(Error::MalformedMessage),
        }
    }

    fn handle_hello(&mut self, hello: Hello) -> Result<EndpointEvent> {
        self.remote_instance_name = Some(hello.name);
        let log2_ring_size = self.config.log2_ring_size.min(hello.max_log2_ring_size);

        let size = region_size(
            self.config.num_s2m_rings,
            self.config.num_m2s_rings,
            log2_ring_size,
            self.config.buffer_size,
        );
        let region = Region::create(size)?;
        unsafe {
            region.init_rings(
                self.config.num_s2m_rings,
                self.config.num_m2s_rings,
                log2_ring_size,
                self.config.buffer_size,
            );
        }

        let sock = self.control.as_mut().expect("handshaking without a socket");
        sock.enqueue(
            &Message::Init(Init {
                version: PROTOCOL_VERSION,
                is_master: false,
                interface_id: self.config.interface_id,
                mode: self.config.mode.wire(),
                name: self.config.instance_name.clone(),
                secret: self.config.secret.clone(),
            }),
            None,
        );
        sock.enqueue(
            &Message::AddRegion(AddRegion {
                region_index: 0,
                region_size: size as u64,
            }),
            Some(region.as_raw_fd_unowned()),
        );

        for i in 0..self.config.num_s2m_rings {
            let fd = eventfd(0, EfdFlags::EFD_NONBLOCK).map_err(Error::from)?;
            let ring = unsafe {
                region.ring_at(Direction::S2M, i, self.config.num_s2m_rings, log2_ring_size)
            };
            let offset = self.offset_of(&region, ring);
            self.control.as_mut().unwrap().enqueue(
                &Message::AddRing(AddRing {
                    direction: RingDirection::S2M,
                    ring_index: i,
                    region_index: 0,
                    byte_offset: offset as u64,
                    log2_ring_size,
                    flags: 0,
                }),
                Some(fd),
            );
            // Slave produces s2m rings.
            self.tx_queues.push(Queue {
                direction: Direction::S2M,
                index: i,
                ring,
                log2_ring_size,
                region_index: 0,
                byte_offset_within_region: offset,
                interrupt_fd: fd,
                last_head: 0,
                alloc_bufs: 0,
            });
        }
        for i in 0..self.config.num_m2s_rings {
            let fd = eventfd(0, EfdFlags::EFD_NONBLOCK).map_err(Error::from)?;
            let ring = unsafe {
                region.ring_at(Direction::M2S, i, self.config.num_s2m_rings, log2_ring_size)
            };
            let offset = self.offset_of(&region, ring);
            self.control.as_mut().unwrap().enqueue(
                &Message::AddRing(AddRing {
                    direction: RingDirection::M2S,
                    ring_index: i,
                    region_index: 0,
                    byte_offset: offset as u64,
                    log2_ring_size,
                    flags: 0,
                }),
                Some(fd),
            );
            // Slave consumes m2s rings.
            self.rx_queues.push(Queue {
                direction: Direction::M2S,
                index: i,
                ring,
                log2_ring_size,
                region_index: 0,
                byte_offset_within_region: offset,
                interrupt_fd: fd,
                last_head: 0,
                alloc_bufs: 0,
            });
        }

        self.control.as_mut().unwrap().enqueue(
            &Message::Connect(Connect {
                name: self.config.interface_name.clone(),
            }),
            None,
        );

        self.region = Some(region);
        Ok(EndpointEvent::None)
    }

    fn offset_of(&self, region: &Region, ring: *mut crate::ring::RingHeader) -> usize {
        // Both pointers come from the same mapping; pointer subtraction is
        // well-defined once cast down to raw addresses.
        let base = unsafe { region.buffer_at(0) } as usize;
        ring as usize - base
    }

    /// A peer-sent `DISCONNECT`'s reason arrived as a plain string (we don't
    /// try to map the peer's numeric error code back into our own enum).
    fn begin_disconnect_with_reason(&mut self, reason: String) -> Result<EndpointEvent> {
        self.last_disconnect_reason = Some(reason);
        self.teardown();
        let retry = self.config.role == Role::Slave;
        self.state = if retry {
            State::Disconnected
        } else {
            State::Disconnecting
        };
        Ok(EndpointEvent::Disconnected { retry })
    }

    /// A locally detected error (protocol violation, syscall failure, peer
    /// EOF) tears the endpoint down, telling the peer why if the control
    /// socket is still writable. Slaves always retry; masters wait for the
    /// next accept.
    fn begin_disconnect(&mut self, reason: Error) -> EndpointEvent {
        if let Some(sock) = self.control.as_mut() {
            sock.enqueue(
                &Message::Disconnect(Disconnect {
                    error_code: error_code(reason),
                    reason: reason.to_string(),
                }),
                None,
            );
            let _ = sock.flush();
        }
        self.last_disconnect_reason = Some(reason.to_string());
        self.teardown();
        let retry = self.config.role == Role::Slave;
        self.state = if retry {
            State::Disconnected
        } else {
            State::Disconnecting
        };
        EndpointEvent::Disconnected { retry }
    }

    fn teardown(&mut self) {
        for q in self.tx_queues.drain(..).chain(self.rx_queues.drain(..)) {
            let _ = close(q.interrupt_fd);
        }
        self.region = None;
        self.control = None;
    }

    pub fn delete(&mut self) {
        self.teardown();
        if let Some(fd) = self.listen_fd.take() {
            let _ = close(fd);
        }
        self.state = State::Disconnecting;
    }
}

fn error_code(e: Error) -> u32 {
    use Error::*;
    match e {
        PermissionDenied => 1,
        TooManyOpenFilesProcess => 2,
        TooManyOpenFilesSystem => 3,
        NoMemory => 4,
        BadFd => 5,
        WouldBlock => 6,
        AlreadyInProgress => 7,
        InvalidArgument => 8,
        NoConnection => 9,
        AlreadyConnected => 10,
        FileNotASocket => 11,
        MissingShmFd => 12,
        BadRingCookie => 13,
        RingFull => 14,
        InsufficientRxBuffers => 15,
        InterruptWriteFailure => 16,
        MalformedMessage => 17,
        ProtocolVersionMismatch => 18,
        InterfaceIdMismatch => 19,
        SlaveCannotAccept => 20,
        ModeMismatch => 21,
        SecretMismatch => 22,
        SecretRequired => 23,
        TooManyRegions => 24,
        TooManyRings => 25,
        MissingInterruptFd => 26,
        DisconnectRequested => 27,
        Disconnected => 28,
        UnknownMessageType => 29,
        CallbackFailure => 30,
        Unknown { .. } => 31,
    }
}
