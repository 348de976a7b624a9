/// Administrative up/down control of a single network interface.
///
/// Every operation opens a short-lived `AF_INET` datagram socket, issues the
/// interface-flag `ioctl`s against it and closes it again.  Nothing is cached
/// between calls, so the interface does not need to exist when the daemon
/// starts and a later appearance is picked up by the next call.
use std::fmt;
use std::io;

use thiserror::Error;
use tracing::{debug, info};

/// Size of the kernel's interface-name buffer, terminator included.
pub const IFNAMSIZ: usize = 16;

/// `ioctl` direction bits (BSD `<sys/ioccom.h>` layout).
#[cfg_attr(any(target_os = "linux", target_os = "android"), allow(dead_code))]
pub const IOC_OUT: u32 = 0x4000_0000;
#[cfg_attr(any(target_os = "linux", target_os = "android"), allow(dead_code))]
pub const IOC_IN: u32 = 0x8000_0000;
#[cfg_attr(any(target_os = "linux", target_os = "android"), allow(dead_code))]
pub const IOC_INOUT: u32 = IOC_IN | IOC_OUT;
const IOCPARM_MASK: u32 = 0x1fff;

/// The "administratively up" bit of the 16-bit interface flags word.
const IFF_UP: libc::c_short = 0x1;

/// Encodes a BSD `ioctl` request code from its direction, group character,
/// command number and parameter length.
#[cfg_attr(any(target_os = "linux", target_os = "android"), allow(dead_code))]
pub const fn ioctl_code(direction: u32, group: u8, number: u8, length: usize) -> u32 {
    direction
        | (((length as u32) & IOCPARM_MASK) << 16)
        | ((group as u32) << 8)
        | number as u32
}

// ── Interface name ────────────────────────────────────────────────────────────

/// A validated interface name: 1 to 15 printable ASCII characters, so that it
/// always fits a NUL-terminated [`IFNAMSIZ`] buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceName(String);

impl InterfaceName {
    pub fn new(name: &str) -> Result<Self> {
        let valid = !name.is_empty()
            && name.len() < IFNAMSIZ
            && name.bytes().all(|b| b.is_ascii_graphic());
        if !valid {
            return Err(InterfaceError::InvalidName(name.to_string()));
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The name copied into a zeroed kernel-facing buffer.
    fn to_buffer(&self) -> [u8; IFNAMSIZ] {
        let mut buf = [0u8; IFNAMSIZ];
        buf[..self.0.len()].copy_from_slice(self.0.as_bytes());
        buf
    }
}

impl fmt::Display for InterfaceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum InterfaceError {
    #[error("invalid interface name {0:?} (expected 1-15 printable characters)")]
    InvalidName(String),

    #[error("failed to create control socket: {0}")]
    Socket(#[source] io::Error),

    #[error("failed to read flags of {interface}: {source}")]
    ReadFlags {
        interface: InterfaceName,
        #[source]
        source: io::Error,
    },

    #[error("failed to write flags of {interface}: {source}")]
    WriteFlags {
        interface: InterfaceName,
        #[source]
        source: io::Error,
    },

    #[error("interface control is not supported on this platform")]
    Unsupported,
}

impl InterfaceError {
    /// OS error code of the failing call, if the failure came from a syscall.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Socket(e) => e.raw_os_error(),
            Self::ReadFlags { source, .. } | Self::WriteFlags { source, .. } => {
                source.raw_os_error()
            }
            Self::InvalidName(_) | Self::Unsupported => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, InterfaceError>;

// ── Control seam ──────────────────────────────────────────────────────────────

/// The operations the orchestrator needs from an interface.
pub trait InterfaceControl: Send {
    fn name(&self) -> &InterfaceName;

    /// Sets the up flag. Succeeds without writing if it is already set.
    fn bring_up(&self) -> Result<()>;

    /// Clears the up flag. Succeeds without writing if it is already clear.
    fn bring_down(&self) -> Result<()>;

    fn is_up(&self) -> Result<bool>;
}

/// `ioctl`-backed [`InterfaceControl`] for one named interface.
#[derive(Debug, Clone)]
pub struct InterfaceActuator {
    name: InterfaceName,
}

impl InterfaceActuator {
    /// Validates `name`; fails before any socket is opened if it cannot fit
    /// the kernel buffer.
    pub fn new(name: &str) -> Result<Self> {
        Ok(Self {
            name: InterfaceName::new(name)?,
        })
    }

    /// Reads the flags word and rewrites it with the up bit set to `up`.
    /// Returns whether a write was needed.
    fn set_up_flag(&self, up: bool) -> Result<bool> {
        let socket = sys::control_socket()?;
        let flags = sys::get_flags(&socket, &self.name)?;

        if (flags & IFF_UP != 0) == up {
            return Ok(false);
        }

        let flags = if up { flags | IFF_UP } else { flags & !IFF_UP };
        sys::set_flags(&socket, &self.name, flags)?;
        Ok(true)
    }

    fn log_outcome(&self, up: bool, result: &Result<bool>) {
        let direction = if up { "up" } else { "down" };
        match result {
            Ok(true) => info!(interface = %self.name, "brought interface {direction}"),
            Ok(false) => debug!(interface = %self.name, "interface already {direction}"),
            Err(e) => debug!(
                interface = %self.name,
                error = %e,
                os_error = ?e.raw_os_error(),
                "failed to bring interface {direction}"
            ),
        }
    }
}

impl InterfaceControl for InterfaceActuator {
    fn name(&self) -> &InterfaceName {
        &self.name
    }

    fn bring_up(&self) -> Result<()> {
        let result = self.set_up_flag(true);
        self.log_outcome(true, &result);
        result.map(|_| ())
    }

    fn bring_down(&self) -> Result<()> {
        let result = self.set_up_flag(false);
        self.log_outcome(false, &result);
        result.map(|_| ())
    }

    fn is_up(&self) -> Result<bool> {
        let socket = sys::control_socket()?;
        let flags = sys::get_flags(&socket, &self.name)?;
        Ok(flags & IFF_UP != 0)
    }
}

// ── Syscall layer ─────────────────────────────────────────────────────────────

#[cfg(unix)]
mod sys {
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

    use super::{InterfaceError, InterfaceName, Result};

    /// A zeroed `struct ifreq` naming `name`, with `flags` in its union.
    pub(super) fn request(name: &InterfaceName, flags: libc::c_short) -> libc::ifreq {
        // SAFETY: ifreq is plain old data; all zeroes is a valid value.
        let mut req: libc::ifreq = unsafe { std::mem::zeroed() };
        for (dst, src) in req.ifr_name.iter_mut().zip(name.to_buffer()) {
            *dst = src as libc::c_char;
        }
        req.ifr_ifru.ifru_flags = flags;
        req
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    pub(super) const SIOCGIFFLAGS: u32 =
        super::ioctl_code(super::IOC_INOUT, b'i', 17, std::mem::size_of::<libc::ifreq>());
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    pub(super) const SIOCSIFFLAGS: u32 =
        super::ioctl_code(super::IOC_IN, b'i', 16, std::mem::size_of::<libc::ifreq>());

    // Linux numbers its socket ioctls independently of the BSD encoding.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub(super) const SIOCGIFFLAGS: u32 = libc::SIOCGIFFLAGS as u32;
    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub(super) const SIOCSIFFLAGS: u32 = libc::SIOCSIFFLAGS as u32;

    /// Opens an unbound datagram socket used only as an `ioctl` channel.
    /// The descriptor is closed when the returned handle is dropped.
    pub(super) fn control_socket() -> Result<OwnedFd> {
        // SAFETY: plain socket(2) call; ownership of a valid fd moves into OwnedFd.
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        if fd < 0 {
            return Err(InterfaceError::Socket(io::Error::last_os_error()));
        }
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    pub(super) fn get_flags(socket: &OwnedFd, name: &InterfaceName) -> Result<libc::c_short> {
        let mut req = request(name, 0);
        // SAFETY: `req` is a fully initialised ifreq, as this request expects.
        let rc = unsafe { libc::ioctl(socket.as_raw_fd(), SIOCGIFFLAGS as _, &mut req) };
        if rc < 0 {
            return Err(InterfaceError::ReadFlags {
                interface: name.clone(),
                source: io::Error::last_os_error(),
            });
        }
        // SAFETY: a successful SIOCGIFFLAGS fills the flags member.
        Ok(unsafe { req.ifr_ifru.ifru_flags })
    }

    pub(super) fn set_flags(
        socket: &OwnedFd,
        name: &InterfaceName,
        flags: libc::c_short,
    ) -> Result<()> {
        let mut req = request(name, flags);
        // SAFETY: as in `get_flags`.
        let rc = unsafe { libc::ioctl(socket.as_raw_fd(), SIOCSIFFLAGS as _, &mut req) };
        if rc < 0 {
            return Err(InterfaceError::WriteFlags {
                interface: name.clone(),
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }
}

#[cfg(not(unix))]
mod sys {
    use super::{InterfaceError, InterfaceName, Result};

    pub(super) struct NoSocket;

    pub(super) fn control_socket() -> Result<NoSocket> {
        Err(InterfaceError::Unsupported)
    }

    pub(super) fn get_flags(_: &NoSocket, _: &InterfaceName) -> Result<libc::c_short> {
        Err(InterfaceError::Unsupported)
    }

    pub(super) fn set_flags(_: &NoSocket, _: &InterfaceName, _: libc::c_short) -> Result<()> {
        Err(InterfaceError::Unsupported)
    }
}
