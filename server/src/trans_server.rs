use log::*;
use std::io::Write;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::str::FromStr;
use std::thread;
use std::time::Instant;
use xchannel::{Channel, ChannelConfig, ErrorKind};

use crate::{BUFFER_SIZE, IDLE_TIMEOUT_MS, READ_TIMEOUT_MS};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerTarget {
    Unix(PathBuf),
    Vsock { cid: u32, port: u32 },
}

impl FromStr for ServerTarget {
    type Err = String;

    /// Accepts `unix:<path>` or `vsock:<cid>:<port>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix("unix:") {
            return Ok(ServerTarget::Unix(PathBuf::from(path)));
        }
        if let Some(rest) = s.strip_prefix("vsock:") {
            let (cid, port) = rest
                .split_once(':')
                .ok_or_else(|| format!("expected vsock:<cid>:<port>, got {}", s))?;
            let cid = cid.parse().map_err(|e| format!("bad cid {}: {}", cid, e))?;
            let port = port.parse().map_err(|e| format!("bad port {}: {}", port, e))?;
            return Ok(ServerTarget::Vsock { cid, port });
        }
        Err(format!("unknown target {}", s))
    }
}

/// How one connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    /// The peer closed its end.
    Remote,
    /// The peer stayed silent past the idle timeout.
    Idle,
    /// A transfer failed.
    Failed(ErrorKind),
}

pub struct TransServer {
    target: ServerTarget,
    config: ChannelConfig,
}

impl TransServer {
    pub fn new(target: ServerTarget, config: ChannelConfig) -> Self {
        Self { target, config }
    }

    pub fn run(&self) -> std::io::Result<()> {
        match &self.target {
            ServerTarget::Unix(path) => {
                if path.exists() {
                    let _ = std::fs::remove_file(path);
                }
                let listener = UnixListener::bind(path)?;
                info!("Server listening on Unix Socket {:?}", path);
                loop {
                    let (stream, _) = listener.accept()?;
                    info!("Accepted Unix connection");
                    self.spawn(OwnedFd::from(stream));
                }
            }
            #[cfg(target_os = "linux")]
            ServerTarget::Vsock { cid, port } => {
                use std::os::fd::{FromRawFd, IntoRawFd};
                let listener = vsock::VsockListener::bind(&vsock::VsockAddr::new(*cid, *port))?;
                info!("Server listening on Vsock CID:{} Port:{}", cid, port);
                loop {
                    let (stream, addr) = listener.accept()?;
                    info!("Accepted Vsock connection from {:?}", addr);
                    // SAFETY: the descriptor was just released by the stream.
                    self.spawn(unsafe { OwnedFd::from_raw_fd(stream.into_raw_fd()) });
                }
            }
            #[cfg(not(target_os = "linux"))]
            ServerTarget::Vsock { .. } => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "vsock is only available on Linux",
            )),
        }
    }

    fn spawn(&self, fd: OwnedFd) {
        let channel = match Channel::with_config(fd, self.config) {
            Ok(channel) => channel,
            Err(e) => {
                error!("Couldn't open channel: {}", e);
                return;
            }
        };
        thread::spawn(move || {
            let reason = Self::handle_connection(&channel);
            info!("Connection handler exiting: {:?}", reason);
        });
    }

    /// Echoes everything the peer sends. After each reply lazy close is
    /// armed, so a peer that goes quiet is dropped after the idle timeout.
    pub fn handle_connection(channel: &Channel) -> Disconnect {
        let mut buf = vec![0u8; BUFFER_SIZE];
        let mut total = 0usize;
        let start = Instant::now();
        let reason = loop {
            match channel.read(&mut buf, READ_TIMEOUT_MS) {
                Ok(0) => {
                    info!("Connection closed by remote");
                    break Disconnect::Remote;
                }
                Ok(n) => {
                    total += n;
                    if let Err(e) = (&*channel).write_all(&buf[..n]) {
                        error!("Couldn't echo {} bytes: {}", n, e);
                        break Disconnect::Failed(ErrorKind::Os);
                    }
                    if let Err(e) = channel.lazy_close(IDLE_TIMEOUT_MS) {
                        warn!("Couldn't arm lazy close: {}", e);
                    }
                }
                Err(e) if e.kind() == ErrorKind::TimedOut && channel.is_closed() => {
                    info!("Peer idle for {}ms, dropping connection", IDLE_TIMEOUT_MS);
                    break Disconnect::Idle;
                }
                Err(e) if e.kind() == ErrorKind::TimedOut => {
                    debug!("No data within {}ms, still waiting", READ_TIMEOUT_MS);
                }
                Err(e) => {
                    error!("Read failed: {}", e);
                    break Disconnect::Failed(e.kind());
                }
            }
        };

        let elapsed = start.elapsed();
        info!("=== Echo Complete ===");
        info!("Total echoed: {} KB", total / 1024);
        info!("Time: {:.2} seconds", elapsed.as_secs_f64());
        reason
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_parse_targets() {
        assert_eq!(
            "unix:/tmp/x.sock".parse::<ServerTarget>().unwrap(),
            ServerTarget::Unix(PathBuf::from("/tmp/x.sock"))
        );
        assert_eq!(
            "vsock:4294967295:1234".parse::<ServerTarget>().unwrap(),
            ServerTarget::Vsock { cid: u32::MAX, port: 1234 }
        );
        assert!("unix".parse::<ServerTarget>().is_err());
    }

    #[test]
    fn test_echo_then_remote_close() {
        let (ours, mut peer) = UnixStream::pair().unwrap();
        let channel = Channel::open(OwnedFd::from(ours)).unwrap();
        let handler = thread::spawn(move || TransServer::handle_connection(&channel));

        peer.write_all(b"ping").unwrap();
        let mut reply = [0u8; 4];
        peer.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"ping");

        drop(peer);
        assert_eq!(handler.join().unwrap(), Disconnect::Remote);
    }

    #[test]
    fn test_idle_peer_is_dropped() {
        let (ours, mut peer) = UnixStream::pair().unwrap();
        let channel = Channel::open(OwnedFd::from(ours)).unwrap();
        let handler = thread::spawn(move || TransServer::handle_connection(&channel));

        peer.write_all(b"once").unwrap();
        let mut reply = [0u8; 4];
        peer.read_exact(&mut reply).unwrap();

        let start = Instant::now();
        assert_eq!(handler.join().unwrap(), Disconnect::Idle);
        assert!(start.elapsed().as_millis() < u128::from(READ_TIMEOUT_MS));
    }
}
