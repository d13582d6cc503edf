//! L2CAP seqpacket sockets for the Bluetooth HID transport.
//!
//! The Switch speaks HID over two L2CAP channels: PSM 17 (control) and
//! PSM 19 (interrupt). Neither libstd nor nix model `sockaddr_l2`, so the
//! socket plumbing goes through libc directly.

use std::fmt;
use std::io;
use std::mem;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::str::FromStr;
use std::time::Duration;

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use thiserror::Error;

/// HID control channel PSM
pub const PSM_HID_CONTROL: u16 = 17;
/// HID interrupt channel PSM
pub const PSM_HID_INTERRUPT: u16 = 19;

const BTPROTO_L2CAP: libc::c_int = 0;

/// `struct sockaddr_l2` from `bluetooth/l2cap.h`
#[repr(C, packed)]
#[derive(Copy, Clone)]
struct SockaddrL2 {
    l2_family: libc::sa_family_t,
    l2_psm: u16,
    l2_bdaddr: [u8; 6],
    l2_cid: u16,
    l2_bdaddr_type: u8,
}

impl SockaddrL2 {
    fn new(addr: BdAddr, psm: u16) -> Self {
        Self {
            l2_family: libc::AF_BLUETOOTH as libc::sa_family_t,
            l2_psm: psm.to_le(),
            l2_bdaddr: addr.to_kernel_order(),
            l2_cid: 0,
            l2_bdaddr_type: 0,
        }
    }
}

/// Errors surfaced by [L2capStream::send]. The server decides how to react;
/// no retries happen at this layer.
#[derive(Error, Debug)]
pub enum SendError {
    #[error("send would block")]
    WouldBlock,
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("i/o error sending report: {0}")]
    Io(io::Error),
}

/// A 6-byte Bluetooth device address in display (big-endian) order.
#[derive(Copy, Clone, PartialEq, Eq, Default)]
pub struct BdAddr(pub [u8; 6]);

impl BdAddr {
    /// The wildcard address `00:00:00:00:00:00` (BDADDR_ANY)
    pub const ANY: BdAddr = BdAddr([0; 6]);

    /// The kernel stores addresses in reversed byte order
    fn to_kernel_order(self) -> [u8; 6] {
        let mut bytes = self.0;
        bytes.reverse();
        bytes
    }

    fn from_kernel_order(mut bytes: [u8; 6]) -> Self {
        bytes.reverse();
        Self(bytes)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl fmt::Debug for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

#[derive(Error, Debug)]
#[error("invalid bluetooth address: {0}")]
pub struct AddrParseError(String);

impl FromStr for BdAddr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut count = 0;
        for part in s.split(':') {
            if count == 6 || part.len() != 2 {
                return Err(AddrParseError(s.to_string()));
            }
            bytes[count] =
                u8::from_str_radix(part, 16).map_err(|_| AddrParseError(s.to_string()))?;
            count += 1;
        }
        if count != 6 {
            return Err(AddrParseError(s.to_string()));
        }
        Ok(Self(bytes))
    }
}

fn new_l2cap_socket() -> io::Result<OwnedFd> {
    let fd = unsafe {
        libc::socket(
            libc::AF_BLUETOOTH,
            libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC,
            BTPROTO_L2CAP,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn sockaddr_ref(addr: &SockaddrL2) -> (*const libc::sockaddr, libc::socklen_t) {
    (
        addr as *const SockaddrL2 as *const libc::sockaddr,
        mem::size_of::<SockaddrL2>() as libc::socklen_t,
    )
}

/// A bound, listening L2CAP server socket.
#[derive(Debug)]
pub struct L2capListener {
    fd: OwnedFd,
}

impl L2capListener {
    /// Bind to the given adapter address and PSM. Falls back to BDADDR_ANY
    /// when the adapter address cannot be bound, which happens on adapters
    /// with a spoofed controller address.
    pub fn bind(addr: BdAddr, psm: u16) -> io::Result<Self> {
        match Self::bind_exact(addr, psm) {
            Ok(listener) => Ok(listener),
            Err(err) => {
                log::debug!("Failed to bind {addr} psm {psm}: {err}, retrying with BDADDR_ANY");
                Self::bind_exact(BdAddr::ANY, psm)
            }
        }
    }

    fn bind_exact(addr: BdAddr, psm: u16) -> io::Result<Self> {
        let fd = new_l2cap_socket()?;
        let sockaddr = SockaddrL2::new(addr, psm);
        let (ptr, len) = sockaddr_ref(&sockaddr);
        if unsafe { libc::bind(fd.as_raw_fd(), ptr, len) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd })
    }

    pub fn listen(&self) -> io::Result<()> {
        if unsafe { libc::listen(self.fd.as_raw_fd(), 1) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Accept one connection, waiting at most `timeout`. Returns None when
    /// the timeout elapses without a peer. Used by the connect loop so that
    /// shutdown requests are observed while advertising.
    pub fn accept_timeout(&self, timeout: Duration) -> io::Result<Option<(L2capStream, BdAddr)>> {
        let mut fds = [PollFd::new(self.fd.as_fd(), PollFlags::POLLIN)];
        let poll_timeout =
            PollTimeout::try_from(timeout).unwrap_or(PollTimeout::MAX);
        let ready = poll(&mut fds, poll_timeout).map_err(io::Error::from)?;
        if ready == 0 {
            return Ok(None);
        }
        self.accept().map(Some)
    }

    pub fn accept(&self) -> io::Result<(L2capStream, BdAddr)> {
        let mut sockaddr = SockaddrL2::new(BdAddr::ANY, 0);
        let mut len = mem::size_of::<SockaddrL2>() as libc::socklen_t;
        let fd = unsafe {
            libc::accept(
                self.fd.as_raw_fd(),
                &mut sockaddr as *mut SockaddrL2 as *mut libc::sockaddr,
                &mut len,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let stream = L2capStream {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        };
        Ok((stream, BdAddr::from_kernel_order(sockaddr.l2_bdaddr)))
    }
}

/// A connected L2CAP channel.
#[derive(Debug)]
pub struct L2capStream {
    fd: OwnedFd,
}

impl L2capStream {
    /// Connect to a peer on the given PSM.
    pub fn connect(peer: BdAddr, psm: u16) -> io::Result<Self> {
        let fd = new_l2cap_socket()?;
        let sockaddr = SockaddrL2::new(peer, psm);
        let (ptr, len) = sockaddr_ref(&sockaddr);
        if unsafe { libc::connect(fd.as_raw_fd(), ptr, len) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd })
    }

    /// Toggle O_NONBLOCK. Non-blocking sockets report would-block instead
    /// of stalling the report cadence.
    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        let raw: RawFd = self.fd.as_raw_fd();
        let flags = fcntl(raw, FcntlArg::F_GETFL).map_err(io::Error::from)?;
        let mut flags = OFlag::from_bits_retain(flags);
        flags.set(OFlag::O_NONBLOCK, nonblocking);
        fcntl(raw, FcntlArg::F_SETFL(flags)).map_err(io::Error::from)?;
        Ok(())
    }

    /// Receive one report. Ok(None) means no data was ready.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        let count = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if count < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock => Ok(None),
                _ => Err(err),
            };
        }
        Ok(Some(count as usize))
    }

    /// Send one report in full.
    pub fn send(&self, buf: &[u8]) -> Result<(), SendError> {
        let count = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                libc::MSG_NOSIGNAL,
            )
        };
        if count < 0 {
            let err = io::Error::last_os_error();
            return Err(match err.kind() {
                io::ErrorKind::WouldBlock => SendError::WouldBlock,
                io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::NotConnected => SendError::PeerClosed,
                _ => SendError::Io(err),
            });
        }
        Ok(())
    }

    /// Address of the connected peer.
    pub fn peer_addr(&self) -> io::Result<BdAddr> {
        let mut sockaddr = SockaddrL2::new(BdAddr::ANY, 0);
        let mut len = mem::size_of::<SockaddrL2>() as libc::socklen_t;
        if unsafe {
            libc::getpeername(
                self.fd.as_raw_fd(),
                &mut sockaddr as *mut SockaddrL2 as *mut libc::sockaddr,
                &mut len,
            )
        } < 0
        {
            return Err(io::Error::last_os_error());
        }
        Ok(BdAddr::from_kernel_order(sockaddr.l2_bdaddr))
    }
}
