//! Tag-length-value message channel over a stream socket pair.
//!
//! Carries the supervisor's control traffic: integers, strings, byte blobs,
//! MessagePack-encoded structs, passed file descriptors (`SCM_RIGHTS`) and
//! peer credentials (`SCM_CREDENTIALS`). One send and one receive each move a
//! whole TLV atomically; concurrent senders and receivers are serialized
//! independently.

use crate::{Result, WardenError};
use nix::sys::socket::{
    AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags, SockFlag, SockType, UnixAddr,
    UnixCredentials, recvmsg, sendmsg, setsockopt, shutdown, socketpair, sockopt, Shutdown,
};
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::{IoSlice, IoSliceMut};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};

/// Well-known descriptor number at which a sandboxee finds its end of the
/// supervisor channel.
pub const CLIENT_COMMS_FD: RawFd = 1023;

/// Tags below this cutoff are free for application protocols; the values
/// above it are reserved for the library itself.
pub const TAG_USER_MAX: u32 = 0x8000_0000;

pub const TAG_BOOL: u32 = 0x8000_0001;
pub const TAG_INT8: u32 = 0x8000_0002;
pub const TAG_UINT8: u32 = 0x8000_0003;
pub const TAG_INT16: u32 = 0x8000_0004;
pub const TAG_UINT16: u32 = 0x8000_0005;
pub const TAG_INT32: u32 = 0x8000_0006;
pub const TAG_UINT32: u32 = 0x8000_0007;
pub const TAG_INT64: u32 = 0x8000_0008;
pub const TAG_UINT64: u32 = 0x8000_0009;
pub const TAG_STRING: u32 = 0x8000_0100;
pub const TAG_BYTES: u32 = 0x8000_0101;
pub const TAG_MSG: u32 = 0x8000_0102;
pub const TAG_FD: u32 = 0x8000_0201;
pub const TAG_CREDS: u32 = 0x8000_0202;

/// Hard refusal threshold; keeps payloads within what a serializer can
/// round-trip safely.
const MAX_MSG_SIZE: u64 = i32::MAX as u64;
/// Payloads above this log a warning.
const WARN_MSG_SIZE: u64 = 256 << 20;

/// A connected, duplex TLV channel.
///
/// The channel has three externally visible states: unconnected (only during
/// construction), connected, terminated. After [`Comms::terminate`] every
/// operation fails without blocking.
#[derive(Debug)]
pub struct Comms {
    fd: OwnedFd,
    send_lock: Mutex<()>,
    recv_lock: Mutex<()>,
    terminated: AtomicBool,
}

impl Comms {
    /// Creates a connected pair of channels backed by a stream socketpair.
    pub fn pair() -> Result<(Self, Self)> {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )?;
        Ok((Self::from_fd(a), Self::from_fd(b)))
    }

    /// Wraps an already-connected socket.
    #[must_use]
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self {
            fd,
            send_lock: Mutex::new(()),
            recv_lock: Mutex::new(()),
            terminated: AtomicBool::new(false),
        }
    }

    /// Wraps a raw descriptor number, taking ownership of it. Used by
    /// sandboxees to attach to [`CLIENT_COMMS_FD`].
    ///
    /// # Safety
    /// `fd` must be an open, connected stream socket not owned elsewhere.
    #[must_use]
    pub unsafe fn from_raw_fd(fd: RawFd) -> Self {
        // SAFETY: ownership contract forwarded to the caller.
        Self::from_fd(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    #[must_use]
    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Enables `SO_PASSCRED` so credentials can be received on this end.
    pub fn enable_cred_passing(&self) -> Result<()> {
        setsockopt(&self.fd, sockopt::PassCred, &true)?;
        Ok(())
    }

    /// Shuts the socket down and marks the channel terminated; any
    /// subsequent or in-flight send/receive fails without blocking.
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::Release);
        let _ = shutdown(self.fd.as_raw_fd(), Shutdown::Both);
    }

    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Moves the underlying descriptor out, consuming the channel.
    #[must_use]
    pub fn into_fd(self) -> OwnedFd {
        self.fd
    }

    fn check_open(&self) -> Result<()> {
        if self.is_terminated() {
            return Err(WardenError::Comms("channel is terminated".into()));
        }
        Ok(())
    }

    fn send_all(&self, mut bytes: &[u8]) -> Result<()> {
        while !bytes.is_empty() {
            match nix::unistd::write(&self.fd, bytes) {
                Ok(0) => return Err(WardenError::Comms("peer closed the channel".into())),
                Ok(n) => bytes = &bytes[n..],
                Err(nix::errno::Errno::EINTR) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn recv_all(&self, mut bytes: &mut [u8]) -> Result<()> {
        while !bytes.is_empty() {
            match nix::unistd::read(&self.fd, bytes) {
                Ok(0) => {
                    self.terminated.store(true, Ordering::Release);
                    return Err(WardenError::Comms("peer closed the channel".into()));
                }
                Ok(n) => bytes = &mut bytes[n..],
                Err(nix::errno::Errno::EINTR) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Sends one complete TLV.
    pub fn send_tlv(&self, tag: u32, value: &[u8]) -> Result<()> {
        self.check_open()?;
        let len = value.len() as u64;
        if len > MAX_MSG_SIZE {
            return Err(WardenError::Comms(format!(
                "message too large to send: {len} bytes"
            )));
        }
        if len > WARN_MSG_SIZE {
            tracing::warn!(len, "sending unusually large message");
        }
        let _guard = self.send_lock.lock();
        let mut header = [0u8; 12];
        header[..4].copy_from_slice(&tag.to_ne_bytes());
        header[4..].copy_from_slice(&len.to_ne_bytes());
        self.send_all(&header)?;
        self.send_all(value)
    }

    /// Receives one complete TLV, allocating the value buffer.
    pub fn recv_tlv(&self) -> Result<(u32, Vec<u8>)> {
        self.check_open()?;
        let _guard = self.recv_lock.lock();
        let mut header = [0u8; 12];
        self.recv_all(&mut header)?;
        let tag = u32::from_ne_bytes(header[..4].try_into().unwrap());
        let len = u64::from_ne_bytes(header[4..].try_into().unwrap());
        if len > MAX_MSG_SIZE {
            self.terminate();
            return Err(WardenError::Comms(format!(
                "message too large to receive: {len} bytes"
            )));
        }
        if len > WARN_MSG_SIZE {
            tracing::warn!(len, "receiving unusually large message");
        }
        let mut value = vec![0u8; usize::try_from(len).expect("checked against cap")];
        self.recv_all(&mut value)?;
        Ok((tag, value))
    }

    fn recv_expect(&self, want_tag: u32) -> Result<Vec<u8>> {
        let (tag, value) = self.recv_tlv()?;
        if tag != want_tag {
            return Err(WardenError::Comms(format!(
                "unexpected tag {tag:#x}, wanted {want_tag:#x}"
            )));
        }
        Ok(value)
    }

    fn recv_fixed<const N: usize>(&self, tag: u32) -> Result<[u8; N]> {
        let value = self.recv_expect(tag)?;
        value.as_slice().try_into().map_err(|_| {
            WardenError::Comms(format!("bad payload size {} for tag {tag:#x}", value.len()))
        })
    }

    pub fn send_bool(&self, v: bool) -> Result<()> {
        self.send_tlv(TAG_BOOL, &[u8::from(v)])
    }

    pub fn recv_bool(&self) -> Result<bool> {
        Ok(self.recv_fixed::<1>(TAG_BOOL)?[0] != 0)
    }

    pub fn send_u32(&self, v: u32) -> Result<()> {
        self.send_tlv(TAG_UINT32, &v.to_ne_bytes())
    }

    pub fn recv_u32(&self) -> Result<u32> {
        Ok(u32::from_ne_bytes(self.recv_fixed::<4>(TAG_UINT32)?))
    }

    pub fn send_i32(&self, v: i32) -> Result<()> {
        self.send_tlv(TAG_INT32, &v.to_ne_bytes())
    }

    pub fn recv_i32(&self) -> Result<i32> {
        Ok(i32::from_ne_bytes(self.recv_fixed::<4>(TAG_INT32)?))
    }

    pub fn send_u64(&self, v: u64) -> Result<()> {
        self.send_tlv(TAG_UINT64, &v.to_ne_bytes())
    }

    pub fn recv_u64(&self) -> Result<u64> {
        Ok(u64::from_ne_bytes(self.recv_fixed::<8>(TAG_UINT64)?))
    }

    pub fn send_i64(&self, v: i64) -> Result<()> {
        self.send_tlv(TAG_INT64, &v.to_ne_bytes())
    }

    pub fn recv_i64(&self) -> Result<i64> {
        Ok(i64::from_ne_bytes(self.recv_fixed::<8>(TAG_INT64)?))
    }

    pub fn send_string(&self, v: &str) -> Result<()> {
        self.send_tlv(TAG_STRING, v.as_bytes())
    }

    pub fn recv_string(&self) -> Result<String> {
        let value = self.recv_expect(TAG_STRING)?;
        String::from_utf8(value).map_err(|_| WardenError::Comms("string is not UTF-8".into()))
    }

    pub fn send_bytes(&self, v: &[u8]) -> Result<()> {
        self.send_tlv(TAG_BYTES, v)
    }

    pub fn recv_bytes(&self) -> Result<Vec<u8>> {
        self.recv_expect(TAG_BYTES)
    }

    /// Sends a MessagePack-encoded structure.
    pub fn send_msg<T: Serialize>(&self, msg: &T) -> Result<()> {
        let bytes = rmp_serde::to_vec(msg)?;
        self.send_tlv(TAG_MSG, &bytes)
    }

    /// Receives a MessagePack-encoded structure.
    pub fn recv_msg<T: DeserializeOwned>(&self) -> Result<T> {
        let value = self.recv_expect(TAG_MSG)?;
        Ok(rmp_serde::from_slice(&value)?)
    }

    /// Passes a file descriptor to the peer.
    pub fn send_fd(&self, fd: RawFd) -> Result<()> {
        self.check_open()?;
        let _guard = self.send_lock.lock();
        let mut header = [0u8; 12];
        header[..4].copy_from_slice(&TAG_FD.to_ne_bytes());
        header[4..].copy_from_slice(&0u64.to_ne_bytes());
        let iov = [IoSlice::new(&header)];
        let fds = [fd];
        let cmsg = [ControlMessage::ScmRights(&fds)];
        loop {
            match sendmsg::<UnixAddr>(
                self.fd.as_raw_fd(),
                &iov,
                &cmsg,
                MsgFlags::empty(),
                None,
            ) {
                Ok(_) => return Ok(()),
                Err(nix::errno::Errno::EINTR) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Receives a passed file descriptor.
    pub fn recv_fd(&self) -> Result<OwnedFd> {
        self.check_open()?;
        let _guard = self.recv_lock.lock();
        let mut header = [0u8; 12];
        let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);
        let received = loop {
            let mut iov = [IoSliceMut::new(&mut header)];
            match recvmsg::<UnixAddr>(
                self.fd.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buf),
                MsgFlags::MSG_WAITALL,
            ) {
                Ok(msg) => {
                    let mut fd = None;
                    for cmsg in msg.cmsgs()? {
                        if let ControlMessageOwned::ScmRights(fds) = cmsg {
                            fd = fds.first().copied();
                        }
                    }
                    break (msg.bytes, fd);
                }
                Err(nix::errno::Errno::EINTR) => {}
                Err(e) => return Err(e.into()),
            }
        };
        let (bytes, fd) = received;
        if bytes == 0 {
            self.terminated.store(true, Ordering::Release);
            return Err(WardenError::Comms("peer closed the channel".into()));
        }
        let tag = u32::from_ne_bytes(header[..4].try_into().unwrap());
        if tag != TAG_FD {
            return Err(WardenError::Comms(format!(
                "unexpected tag {tag:#x}, wanted a file descriptor"
            )));
        }
        let fd = fd.ok_or_else(|| WardenError::Comms("no descriptor attached".into()))?;
        // SAFETY: the kernel installed a fresh descriptor for us.
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    /// Sends this process's credentials to the peer.
    pub fn send_creds(&self) -> Result<()> {
        self.check_open()?;
        let _guard = self.send_lock.lock();
        let mut header = [0u8; 12];
        header[..4].copy_from_slice(&TAG_CREDS.to_ne_bytes());
        header[4..].copy_from_slice(&0u64.to_ne_bytes());
        let iov = [IoSlice::new(&header)];
        let creds = UnixCredentials::new();
        let cmsg = [ControlMessage::ScmCredentials(&creds)];
        loop {
            match sendmsg::<UnixAddr>(
                self.fd.as_raw_fd(),
                &iov,
                &cmsg,
                MsgFlags::empty(),
                None,
            ) {
                Ok(_) => return Ok(()),
                Err(nix::errno::Errno::EINTR) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Receives peer credentials; requires [`Comms::enable_cred_passing`].
    pub fn recv_creds(&self) -> Result<UnixCredentials> {
        self.check_open()?;
        let _guard = self.recv_lock.lock();
        let mut header = [0u8; 12];
        let mut cmsg_buf = nix::cmsg_space!(UnixCredentials);
        loop {
            let mut iov = [IoSliceMut::new(&mut header)];
            match recvmsg::<UnixAddr>(
                self.fd.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buf),
                MsgFlags::MSG_WAITALL,
            ) {
                Ok(msg) => {
                    if msg.bytes == 0 {
                        self.terminated.store(true, Ordering::Release);
                        return Err(WardenError::Comms("peer closed the channel".into()));
                    }
                    for cmsg in msg.cmsgs()? {
                        if let ControlMessageOwned::ScmCredentials(creds) = cmsg {
                            return Ok(creds);
                        }
                    }
                    return Err(WardenError::Comms("no credentials attached".into()));
                }
                Err(nix::errno::Errno::EINTR) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Moves the channel's descriptor to a specific number, closing whatever
    /// occupied it. Used in the sandboxee to pin [`CLIENT_COMMS_FD`].
    pub fn move_to_fd(self, target: RawFd) -> Result<Self> {
        let raw = self.fd.as_raw_fd();
        if raw == target {
            return Ok(self);
        }
        // SAFETY: dup2 atomically closes any previous occupant of `target`;
        // the original descriptor is closed when `self.fd` drops below.
        let ret = unsafe { libc::dup2(raw, target) };
        if ret == -1 {
            return Err(WardenError::Io(std::io::Error::last_os_error()));
        }
        drop(self.fd);
        // SAFETY: `target` is a fresh duplicate we now own.
        Ok(Self::from_fd(unsafe { OwnedFd::from_raw_fd(target) }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsFd;

    #[test]
    fn round_trips_scalars_and_strings() {
        let (a, b) = Comms::pair().unwrap();
        a.send_bool(true).unwrap();
        a.send_u32(0xdead_beef).unwrap();
        a.send_i64(-42).unwrap();
        a.send_string("warden").unwrap();
        a.send_bytes(&[1, 2, 3]).unwrap();
        assert!(b.recv_bool().unwrap());
        assert_eq!(b.recv_u32().unwrap(), 0xdead_beef);
        assert_eq!(b.recv_i64().unwrap(), -42);
        assert_eq!(b.recv_string().unwrap(), "warden");
        assert_eq!(b.recv_bytes().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn tag_mismatch_is_an_error() {
        let (a, b) = Comms::pair().unwrap();
        a.send_u32(7).unwrap();
        assert!(b.recv_string().is_err());
    }

    #[test]
    fn passes_file_descriptors() {
        let (a, b) = Comms::pair().unwrap();
        let file = std::fs::File::open("/proc/self/cmdline").unwrap();
        a.send_fd(file.as_fd().as_raw_fd()).unwrap();
        let received = b.recv_fd().unwrap();
        let mut buf = [0u8; 16];
        // Reads must succeed on the duplicated descriptor.
        nix::unistd::read(&received, &mut buf).unwrap();
    }

    #[test]
    fn passes_credentials() {
        let (a, b) = Comms::pair().unwrap();
        b.enable_cred_passing().unwrap();
        a.send_creds().unwrap();
        let creds = b.recv_creds().unwrap();
        assert_eq!(creds.pid(), nix::unistd::getpid().as_raw());
        assert_eq!(creds.uid(), nix::unistd::getuid().as_raw());
    }

    #[test]
    fn terminate_fails_future_operations() {
        let (a, b) = Comms::pair().unwrap();
        a.terminate();
        assert!(a.send_u32(1).is_err());
        assert!(a.is_terminated());
        // The peer observes EOF and flips to terminated as well.
        assert!(b.recv_u32().is_err());
        assert!(b.is_terminated());
    }

    #[test]
    fn structured_messages_round_trip() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Ping {
            seq: u32,
            payload: Vec<u8>,
        }
        let (a, b) = Comms::pair().unwrap();
        let msg = Ping {
            seq: 9,
            payload: vec![0xab; 32],
        };
        a.send_msg(&msg).unwrap();
        assert_eq!(b.recv_msg::<Ping>().unwrap(), msg);
    }
}
