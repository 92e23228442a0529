//! Peer credentials of a Unix socket connection.

use std::io;

use privhelper_core::process;
use tokio::net::UnixStream;

/// Kernel-reported identity of the process on the other end of a socket.
///
/// Taken with `SO_PEERCRED` at accept time, so it describes the process that
/// connected, not whatever it may claim later on the wire. The pid's start
/// time is read at the same moment so later checks can tell whether the pid
/// still names that process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    /// Effective uid of the peer.
    pub uid: u32,
    /// Effective gid of the peer.
    pub gid: u32,
    /// Peer pid, when the platform reports one.
    pub pid: Option<u32>,
    /// Kernel start time of `pid` at accept.
    pub start_time: Option<u64>,
}

impl PeerCredentials {
    /// Read the credentials of the peer connected to `stream`.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the credentials cannot be read.
    pub fn from_stream(stream: &UnixStream) -> io::Result<Self> {
        let cred = stream.peer_cred()?;
        let pid = cred.pid().and_then(|pid| u32::try_from(pid).ok());
        Ok(Self {
            uid: cred.uid(),
            gid: cred.gid(),
            pid,
            start_time: pid.and_then(process::start_time),
        })
    }
}
