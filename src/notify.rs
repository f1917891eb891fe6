//! `sd_notify` client for the systemd `Type=notify` service contract (§6).
//!
//! The protocol is three newline-joined `KEY=VALUE` lines sent as a single
//! datagram to the abstract or filesystem socket named by `$NOTIFY_SOCKET`.
//! No external `sd-notify` crate is pulled in solely for three string
//! writes over a datagram socket — `std::os::unix::net::UnixDatagram`
//! covers it entirely, matching the original's thin wrapper around
//! `systemd.daemon.notify` (itself optional there; here the absence of
//! `$NOTIFY_SOCKET` is the equivalent no-op path).

use std::os::unix::net::UnixDatagram;

use tracing::{debug, warn};

/// Best-effort notifier: every method is a no-op when `$NOTIFY_SOCKET` is
/// unset (not running under systemd, or under `Type=simple`), matching the
/// original's `HAS_SYSTEMD` guard.
pub struct Notifier {
    socket_path: Option<String>,
}

impl Notifier {
    pub fn from_env() -> Self {
        Notifier { socket_path: std::env::var("NOTIFY_SOCKET").ok() }
    }

    pub fn ready(&self) {
        self.send("READY=1");
    }

    pub fn ready_with_status(&self, status: &str) {
        self.send(&format!("READY=1\nSTATUS={status}"));
    }

    pub fn busy(&self, status: &str) {
        self.send(&format!("STATUS={status}"));
    }

    pub fn stopping(&self) {
        self.send("STOPPING=1");
    }

    pub fn watchdog(&self) {
        self.send("WATCHDOG=1");
    }

    fn send(&self, payload: &str) {
        let Some(path) = &self.socket_path else {
            debug!("NOTIFY_SOCKET not set, skipping systemd notification");
            return;
        };

        let addr: &str = if let Some(rest) = path.strip_prefix('@') {
            rest
        } else {
            path.as_str()
        };
        let abstract_ns = path.starts_with('@');

        let result = (|| -> std::io::Result<()> {
            let socket = UnixDatagram::unbound()?;
            if abstract_ns {
                // Abstract namespace sockets are addressed with a leading
                // NUL byte; std's `connect` on `UnixDatagram` only supports
                // pathname sockets directly, so abstract addresses are
                // built via `SocketAddr::from_abstract_name` where
                // available. Fall back to the pathname form otherwise.
                connect_abstract(&socket, addr)?;
            } else {
                socket.connect(addr)?;
            }
            socket.send(payload.as_bytes())?;
            Ok(())
        })();

        match result {
            Ok(()) => debug!(payload = %payload.replace('\n', " "), "sent systemd notification"),
            Err(e) => warn!(error = %e, "failed to send systemd notification"),
        }
    }
}

#[cfg(target_os = "linux")]
fn connect_abstract(socket: &UnixDatagram, name: &str) -> std::io::Result<()> {
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::SocketAddr;
    let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
    socket.connect_addr(&addr)
}

#[cfg(not(target_os = "linux"))]
fn connect_abstract(socket: &UnixDatagram, name: &str) -> std::io::Result<()> {
    // Abstract namespace sockets are a Linux-only concept; on other Unixes
    // `$NOTIFY_SOCKET` never starts with `@`, so this path is unreachable
    // in practice. Attempt a pathname connect as a harmless fallback.
    socket.connect(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_a_noop_without_notify_socket() {
        std::env::remove_var("NOTIFY_SOCKET");
        let notifier = Notifier::from_env();
        // Must not panic or block in the absence of a socket.
        notifier.ready();
        notifier.stopping();
    }

    #[test]
    fn sends_ready_datagram_over_a_real_socket() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("notify.sock");
        let listener = UnixDatagram::bind(&sock_path).unwrap();

        std::env::set_var("NOTIFY_SOCKET", sock_path.to_str().unwrap());
        let notifier = Notifier::from_env();
        notifier.ready_with_status("waiting for scheduled backup");
        std::env::remove_var("NOTIFY_SOCKET");

        let mut buf = [0u8; 256];
        let (n, _) = listener.recv_from(&mut buf).unwrap();
        let received = String::from_utf8_lossy(&buf[..n]);
        assert!(received.contains("READY=1"));
        assert!(received.contains("STATUS=waiting for scheduled backup"));
    }
}
