use std::ffi::CString;
use std::fmt;
use std::io;
use std::mem::size_of;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::str::FromStr;

use libc::{c_int, c_long, key_t};
use tracing::{info, warn};

use crate::error::QueueError;

pub const DEFAULT_ID: u8 = b'b';

/// Where producers find the queue: an identity file plus the id byte
/// written into it, written on the command line as `PATH[:C]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub path: PathBuf,
    pub id: u8,
}

impl FromStr for QueueSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // anything but a single character after the last colon is part of the path
        let (path, id) = match s.rsplit_once(':') {
            Some((path, id)) if id.len() == 1 && id.as_bytes()[0].is_ascii_graphic() => {
                (path, id.as_bytes()[0])
            }
            _ => (s, DEFAULT_ID),
        };
        if path.is_empty() {
            return Err(String::from("queue path is empty"));
        }
        Ok(Self {
            path: PathBuf::from(path),
            id,
        })
    }
}

impl fmt::Display for QueueSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.path.display(), char::from(self.id))
    }
}

impl QueueSpec {
    fn identity_error(&self, source: io::Error) -> QueueError {
        QueueError::Identity {
            path: self.path.clone(),
            source,
        }
    }

    /// Publishes the id byte so producers can derive the same key.
    pub fn write_identity(&self) -> Result<(), QueueError> {
        std::fs::write(&self.path, [self.id]).map_err(|err| self.identity_error(err))?;
        std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o644))
            .map_err(|err| self.identity_error(err))
    }

    pub fn key(&self) -> Result<key_t, QueueError> {
        let path = CString::new(self.path.as_os_str().as_bytes())
            .map_err(|err| self.identity_error(io::Error::new(io::ErrorKind::InvalidInput, err)))?;
        // SAFETY: `path` is a valid NUL terminated string for the whole call
        let key = unsafe { libc::ftok(path.as_ptr(), c_int::from(self.id)) };
        if key == -1 {
            return Err(self.identity_error(io::Error::last_os_error()));
        }
        Ok(key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub kind: i64,
    pub payload: Vec<u8>,
}

/// Handle on a System V message queue. Copies share the same kernel queue.
#[derive(Debug, Clone, Copy)]
pub struct MessageQueue {
    id: c_int,
    capacity: usize,
}

const KIND_LEN: usize = size_of::<c_long>();

fn errno_error(err: io::Error) -> QueueError {
    match err.raw_os_error() {
        Some(libc::EINTR) => QueueError::Interrupted,
        _ => QueueError::Fatal(err),
    }
}

impl MessageQueue {
    /// Blocks until a message arrives. Messages longer than the capacity are
    /// consumed and reported as [`QueueError::Oversized`].
    pub fn receive(&self) -> Result<RawMessage, QueueError> {
        // one spare byte tells a message of exactly `capacity` from a longer one
        let mut buf = vec![0u8; KIND_LEN + self.capacity + 1];
        // SAFETY: `buf` holds the mtype plus `capacity + 1` payload bytes
        let received = unsafe {
            libc::msgrcv(
                self.id,
                buf.as_mut_ptr().cast(),
                self.capacity + 1,
                0,
                libc::MSG_NOERROR,
            )
        };
        if received < 0 {
            return Err(errno_error(io::Error::last_os_error()));
        }
        let received = received as usize;
        if received > self.capacity {
            return Err(QueueError::Oversized {
                limit: self.capacity,
            });
        }

        let mut kind = [0u8; KIND_LEN];
        kind.copy_from_slice(&buf[..KIND_LEN]);
        Ok(RawMessage {
            kind: i64::from(c_long::from_ne_bytes(kind)),
            payload: buf[KIND_LEN..KIND_LEN + received].to_vec(),
        })
    }

    /// Enqueues a message without waiting for room in the queue.
    pub fn send(&self, kind: i64, payload: &[u8]) -> Result<(), QueueError> {
        let kind = c_long::try_from(kind).map_err(|err| {
            QueueError::Fatal(io::Error::new(io::ErrorKind::InvalidInput, err))
        })?;
        let mut buf = Vec::with_capacity(KIND_LEN + payload.len());
        buf.extend_from_slice(&kind.to_ne_bytes());
        buf.extend_from_slice(payload);
        // SAFETY: `buf` starts with the mtype followed by `payload.len()` bytes
        let rc = unsafe {
            libc::msgsnd(
                self.id,
                buf.as_ptr().cast(),
                payload.len(),
                libc::IPC_NOWAIT,
            )
        };
        if rc < 0 {
            return Err(errno_error(io::Error::last_os_error()));
        }
        Ok(())
    }
}

/// The daemon's own queue: removed, along with the identity file, on drop.
///
/// Removing the queue makes a `receive` blocked on another thread fail,
/// which is how the listener thread learns about shutdown.
#[derive(Debug)]
pub struct OwnedQueue {
    queue: MessageQueue,
    identity: PathBuf,
}

impl OwnedQueue {
    pub fn create(spec: &QueueSpec, mode: u32, capacity: usize) -> Result<Self, QueueError> {
        spec.write_identity()?;
        let key = spec.key()?;

        let perms = (mode & 0o777) as c_int;
        // SAFETY: plain syscall on integer arguments
        let mut id = unsafe { libc::msgget(key, libc::IPC_CREAT | libc::IPC_EXCL | perms) };
        if id < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EEXIST) {
                return Err(QueueError::Fatal(err));
            }
            warn!(msg = "Reusing existing message queue", queue = %spec, key);
            // SAFETY: as above
            id = unsafe { libc::msgget(key, 0) };
            if id < 0 {
                return Err(QueueError::Fatal(io::Error::last_os_error()));
            }
        }
        info!(msg = "Message queue ready", queue = %spec, key, id, mode = %format!("{mode:o}"));

        Ok(Self {
            queue: MessageQueue { id, capacity },
            identity: spec.path.clone(),
        })
    }

    pub fn queue(&self) -> MessageQueue {
        self.queue
    }
}

impl Drop for OwnedQueue {
    fn drop(&mut self) {
        // SAFETY: IPC_RMID takes no buffer
        let rc = unsafe { libc::msgctl(self.queue.id, libc::IPC_RMID, std::ptr::null_mut()) };
        if rc < 0 {
            warn!(msg = "Failed to remove message queue", id = self.queue.id, err = %io::Error::last_os_error());
        }
        if let Err(err) = std::fs::remove_file(&self.identity) {
            warn!(msg = "Failed to remove queue identity file", path = %self.identity.display(), %err);
        }
    }
}
