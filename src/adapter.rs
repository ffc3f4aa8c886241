//! CAN Frame I/O adapter (C1).
//!
//! `CanAdapter` is the seam between the protocol engine and an actual bus.
//! `SocketCanAdapter` talks to a real (or vcan) Linux interface through a
//! raw `AF_CAN`/`CAN_RAW` socket, generalizing the teacher crate's
//! `CANSocket` (`lib.rs`) plus its `async_can::CANSocket` wrapper to carry
//! the kernel's own 8-byte `struct can_frame` instead of this crate's
//! `CanFrame`. `LoopbackAdapter` is an in-memory bus for tests and the
//! doctests, backed by a `tokio::sync::broadcast` channel so that every
//! adapter attached to the same `LoopbackBus` observes every frame sent by
//! any of them, mirroring how a real CAN bus multicasts to all listeners.

use std::mem::size_of;
use std::os::unix::io::RawFd;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::unix::AsyncFd;
use tokio::sync::broadcast;

use crate::frame::CanFrame;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("CAN interface {0:?} could not be resolved")]
    InterfaceLookup(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<AdapterError> for std::io::Error {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::InterfaceLookup(name) => {
                std::io::Error::new(std::io::ErrorKind::NotFound, format!("CAN interface {:?} not found", name))
            }
            AdapterError::Io(e) => e,
        }
    }
}

/// The I/O boundary the network task drives: send one frame, receive the
/// next, release the underlying channel. Implementors need not be `Send +
/// Sync` beyond what `async_trait` already requires, since exactly one task
/// ever owns an adapter (§5).
#[async_trait]
pub trait CanAdapter: Send {
    async fn send(&mut self, frame: CanFrame) -> Result<(), AdapterError>;
    async fn recv(&mut self) -> Result<CanFrame, AdapterError>;

    /// Release the adapter's channel (§4.2/§6: `close()`). Called once by
    /// the network task as it shuts down; a backend whose teardown needs to
    /// flush or can fail (e.g. a TCP-bridge adapter) reports that here
    /// instead of relying on `Drop`, which cannot report an error.
    async fn close(&mut self) -> Result<(), AdapterError>;
}

// ---------------------------------------------------------------- SocketCAN

const PF_CAN: libc::c_int = 29;
const CAN_RAW: libc::c_int = 1;
const EFF_FLAG: u32 = 0x8000_0000;

#[repr(C, align(8))]
struct CanAddr {
    af_can: libc::c_short,
    if_index: libc::c_int,
    rx_id: u32,
    tx_id: u32,
}

/// The kernel's `struct can_frame`: 32-bit id (carrying the `EFF_FLAG` bit),
/// a length byte, three reserved/padding bytes, then 8 data bytes. Layout
/// must match exactly since it crosses the `read`/`write` syscall boundary
/// by raw byte copy.
#[repr(C, align(8))]
#[derive(Clone, Copy)]
struct RawCanFrame {
    id: u32,
    len: u8,
    pad: u8,
    res0: u8,
    res1: u8,
    data: [u8; 8],
}

impl Default for RawCanFrame {
    fn default() -> Self {
        Self {
            id: 0,
            len: 0,
            pad: 0,
            res0: 0,
            res1: 0,
            data: [0; 8],
        }
    }
}

impl From<CanFrame> for RawCanFrame {
    fn from(frame: CanFrame) -> Self {
        let mut id = frame.id();
        if frame.is_extended() {
            id |= EFF_FLAG;
        }
        let mut data = [0u8; 8];
        data[..frame.len()].copy_from_slice(frame.data());
        Self {
            id,
            len: frame.len() as u8,
            pad: 0,
            res0: 0,
            res1: 0,
            data,
        }
    }
}

impl RawCanFrame {
    fn into_frame(self) -> Result<CanFrame, crate::frame::FrameError> {
        let extended = self.id & EFF_FLAG != 0;
        let id = self.id & if extended { 0x1FFF_FFFF } else { 0x7FF };
        CanFrame::new(id, extended, &self.data[..self.len as usize])
    }
}

struct RawSocket {
    fd: RawFd,
}

impl RawSocket {
    fn open(interface_name: &str) -> Result<Self, AdapterError> {
        let if_index = nix::net::if_::if_nametoindex(interface_name)
            .map_err(|_| AdapterError::InterfaceLookup(interface_name.to_string()))?;

        let fd = unsafe { libc::socket(PF_CAN, libc::SOCK_RAW, CAN_RAW) };
        if fd == -1 {
            return Err(AdapterError::Io(std::io::Error::last_os_error()));
        }

        let bind_result = unsafe {
            let addr = CanAddr {
                af_can: PF_CAN as libc::c_short,
                if_index: if_index as libc::c_int,
                rx_id: 0,
                tx_id: 0,
            };
            libc::bind(
                fd,
                &addr as *const CanAddr as *const libc::sockaddr,
                size_of::<CanAddr>() as u32,
            )
        };
        if bind_result == -1 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(AdapterError::Io(err));
        }

        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags == -1 || unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1
        {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(AdapterError::Io(err));
        }

        Ok(Self { fd })
    }

    fn read_frame(&self) -> std::io::Result<RawCanFrame> {
        let mut frame = RawCanFrame::default();
        let n = unsafe {
            libc::read(
                self.fd,
                &mut frame as *mut RawCanFrame as *mut libc::c_void,
                size_of::<RawCanFrame>(),
            )
        };
        if n as usize != size_of::<RawCanFrame>() {
            return Err(std::io::Error::last_os_error());
        }
        Ok(frame)
    }

    fn write_frame(&self, frame: &RawCanFrame) -> std::io::Result<()> {
        let n = unsafe {
            libc::write(
                self.fd,
                frame as *const RawCanFrame as *const libc::c_void,
                size_of::<RawCanFrame>(),
            )
        };
        if n as usize != size_of::<RawCanFrame>() {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    /// Close the fd now and report any error, instead of relying solely on
    /// `Drop` (which cannot fail or be awaited). Marks the fd closed so
    /// `Drop` does not close it a second time.
    fn close(&mut self) -> std::io::Result<()> {
        if self.fd == -1 {
            return Ok(());
        }
        let result = unsafe { libc::close(self.fd) };
        self.fd = -1;
        if result == -1 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }
}

impl std::os::unix::io::AsRawFd for RawSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for RawSocket {
    fn drop(&mut self) {
        if self.fd != -1 {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

/// A `CanAdapter` backed by a real (or `vcan`) Linux SocketCAN interface.
pub struct SocketCanAdapter {
    async_fd: AsyncFd<RawSocket>,
}

impl SocketCanAdapter {
    pub fn open(interface_name: &str) -> Result<Self, AdapterError> {
        let socket = RawSocket::open(interface_name)?;
        Ok(Self {
            async_fd: AsyncFd::new(socket).map_err(AdapterError::Io)?,
        })
    }
}

#[async_trait]
impl CanAdapter for SocketCanAdapter {
    async fn send(&mut self, frame: CanFrame) -> Result<(), AdapterError> {
        let raw = RawCanFrame::from(frame);
        loop {
            let mut guard = self.async_fd.writable().await.map_err(AdapterError::Io)?;
            match guard.try_io(|fd| fd.get_ref().write_frame(&raw)) {
                Ok(result) => return result.map_err(AdapterError::Io),
                Err(_would_block) => continue,
            }
        }
    }

    async fn recv(&mut self) -> Result<CanFrame, AdapterError> {
        loop {
            let mut guard = self.async_fd.readable().await.map_err(AdapterError::Io)?;
            match guard.try_io(|fd| fd.get_ref().read_frame()) {
                Ok(result) => {
                    let raw = result.map_err(AdapterError::Io)?;
                    let frame = raw
                        .into_frame()
                        .map_err(|e| AdapterError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
                    return Ok(frame.with_timestamp(std::time::Instant::now()));
                }
                Err(_would_block) => continue,
            }
        }
    }

    async fn close(&mut self) -> Result<(), AdapterError> {
        self.async_fd.get_mut().close().map_err(AdapterError::Io)
    }
}

// ----------------------------------------------------------------- Loopback

/// A shared in-memory bus: every `LoopbackAdapter` attached to the same
/// `LoopbackBus` receives every frame any of them sends, standing in for a
/// physical bus in tests and doctests.
#[derive(Clone)]
pub struct LoopbackBus {
    tx: broadcast::Sender<CanFrame>,
}

impl LoopbackBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self { tx }
    }

    pub fn adapter(&self) -> LoopbackAdapter {
        LoopbackAdapter {
            tx: self.tx.clone(),
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for LoopbackBus {
    fn default() -> Self {
        Self::new()
    }
}

pub struct LoopbackAdapter {
    tx: broadcast::Sender<CanFrame>,
    rx: broadcast::Receiver<CanFrame>,
}

#[async_trait]
impl CanAdapter for LoopbackAdapter {
    async fn send(&mut self, frame: CanFrame) -> Result<(), AdapterError> {
        self.tx
            .send(frame)
            .map(|_| ())
            .map_err(|_| AdapterError::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "no bus listeners")))
    }

    async fn recv(&mut self) -> Result<CanFrame, AdapterError> {
        loop {
            match self.rx.recv().await {
                Ok(frame) => return Ok(frame.with_timestamp(std::time::Instant::now())),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(AdapterError::Io(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "loopback bus closed",
                    )))
                }
            }
        }
    }

    /// No real channel to release; the shared bus outlives any one
    /// adapter's subscription.
    async fn close(&mut self) -> Result<(), AdapterError> {
        Ok(())
    }
}
