//! Network utilities

use socket2::SockRef;
use std::io;
use tokio::net::TcpStream;

#[inline]
pub fn configure_tcp_stream(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let sock = SockRef::from(stream);
    let _ = sock.set_keepalive(true);
}

/// Whether an IO error is an expected peer disconnect.
///
/// Clients closing tabs mid-transfer produce resets and broken pipes on
/// every proxied connection; logging them would drown out real failures.
#[inline]
pub fn is_benign_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::TimedOut
            | io::ErrorKind::UnexpectedEof
    )
}
