use log::*;
use std::io::{Read, Write};
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Instant;
use xchannel::{Channel, ChannelConfig};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientTarget {
    Unix(PathBuf),
    Vsock { cid: u32, port: u32 },
}

impl FromStr for ClientTarget {
    type Err = String;

    /// Accepts `unix:<path>` or `vsock:<cid>:<port>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix("unix:") {
            return Ok(ClientTarget::Unix(PathBuf::from(path)));
        }
        if let Some(rest) = s.strip_prefix("vsock:") {
            let (cid, port) = rest
                .split_once(':')
                .ok_or_else(|| format!("expected vsock:<cid>:<port>, got {}", s))?;
            let cid = cid.parse().map_err(|e| format!("bad cid {}: {}", cid, e))?;
            let port = port.parse().map_err(|e| format!("bad port {}: {}", port, e))?;
            return Ok(ClientTarget::Vsock { cid, port });
        }
        Err(format!("unknown target {}", s))
    }
}

pub struct TransClient {
    target: ClientTarget,
    config: ChannelConfig,
}

impl TransClient {
    pub fn new(target: ClientTarget, config: ChannelConfig) -> Self {
        Self { target, config }
    }

    fn connect(&self) -> std::io::Result<OwnedFd> {
        info!("Connecting to target: {:?}", self.target);
        match &self.target {
            ClientTarget::Unix(path) => {
                let stream = UnixStream::connect(path)?;
                info!("Unix socket connected.");
                Ok(OwnedFd::from(stream))
            }
            #[cfg(target_os = "linux")]
            ClientTarget::Vsock { cid, port } => {
                use std::os::fd::{FromRawFd, IntoRawFd};
                let stream = vsock::VsockStream::connect(&vsock::VsockAddr::new(*cid, *port))?;
                info!("Vsock socket connected.");
                // SAFETY: the descriptor was just released by the stream.
                Ok(unsafe { OwnedFd::from_raw_fd(stream.into_raw_fd()) })
            }
            #[cfg(not(target_os = "linux"))]
            ClientTarget::Vsock { .. } => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "vsock is only available on Linux",
            )),
        }
    }

    /// Sends `message` and waits for the server to echo it back.
    pub fn send_message(&self, message: &[u8]) -> std::io::Result<Vec<u8>> {
        let channel = Channel::with_config(self.connect()?, self.config)?;
        let reply = exchange(&channel, message)?;
        channel.close()?;
        Ok(reply)
    }
}

/// Writes `message` on its own thread while this one reads the echo, so a
/// payload larger than the socket buffers cannot stall both sides. A failed
/// receive closes the channel to stop the sender.
fn exchange(channel: &Channel, message: &[u8]) -> std::io::Result<Vec<u8>> {
    let start = Instant::now();
    let mut reply = vec![0u8; message.len()];
    std::thread::scope(|s| {
        let sender = s.spawn(|| {
            (&*channel).write_all(message)?;
            let elapsed = start.elapsed();
            let speed = (message.len() as f64 / 1024.0) / elapsed.as_secs_f64();
            info!("=== Send Complete ===");
            info!("Total sent: {} KB", message.len() / 1024);
            info!("Time: {:.2} seconds", elapsed.as_secs_f64());
            info!("Speed: {:.2} KB/s", speed);
            Ok::<_, std::io::Error>(())
        });
        let received = (&*channel).read_exact(&mut reply);
        if received.is_err() {
            // Stop the sender, blocked or between chunks, before joining it.
            if let Err(e) = channel.close() {
                warn!("Couldn't close channel after failed receive: {}", e);
            }
        }
        let sent = sender
            .join()
            .unwrap_or_else(|_| Err(std::io::Error::other("sender thread panicked")));
        received.and(sent)
    })?;
    let elapsed = start.elapsed();
    let speed = (reply.len() as f64 / 1024.0) / elapsed.as_secs_f64();
    info!("=== Receive Complete ===");
    info!("Total received: {} KB", reply.len() / 1024);
    info!("Time: {:.2} seconds", elapsed.as_secs_f64());
    info!("Speed: {:.2} KB/s", speed);
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn channel_pair(timeout_ms: u32) -> (Channel, UnixStream) {
        let _ = env_logger::builder().is_test(true).try_init();
        let (ours, theirs) = UnixStream::pair().unwrap();
        let config = ChannelConfig::new().with_default_timeout_ms(timeout_ms);
        (Channel::with_config(OwnedFd::from(ours), config).unwrap(), theirs)
    }

    #[test]
    fn test_exchange_echo() {
        let (channel, mut peer) = channel_pair(2000);
        let message: Vec<u8> = (0..=255u8).cycle().take(512 * 1024).collect();
        std::thread::scope(|s| {
            s.spawn(move || {
                let mut buf = vec![0u8; 64 * 1024];
                loop {
                    match peer.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => peer.write_all(&buf[..n]).unwrap(),
                    }
                }
            });
            assert_eq!(exchange(&channel, &message).unwrap(), message);
            // Releasing the descriptor ends the peer's loop.
            drop(channel);
        });
    }

    #[test]
    fn test_failed_receive_closes_channel() {
        let (channel, mut peer) = channel_pair(200);
        let message = vec![0xAB; 4 * 1024 * 1024];
        let (done_tx, done_rx) = mpsc::channel::<()>();
        std::thread::scope(|s| {
            s.spawn(move || {
                // Take a little, never echo, and stay connected.
                let mut buf = [0u8; 4096];
                let _ = peer.read(&mut buf);
                let _ = done_rx.recv();
            });
            let start = Instant::now();
            assert!(exchange(&channel, &message).is_err());
            assert!(start.elapsed() < Duration::from_secs(2));
            assert!(channel.is_closed());
            done_tx.send(()).unwrap();
        });
    }

    #[test]
    fn test_parse_targets() {
        assert_eq!(
            "unix:/tmp/x.sock".parse::<ClientTarget>().unwrap(),
            ClientTarget::Unix(PathBuf::from("/tmp/x.sock"))
        );
        assert_eq!(
            "vsock:3:1234".parse::<ClientTarget>().unwrap(),
            ClientTarget::Vsock { cid: 3, port: 1234 }
        );
        assert!("vsock:3".parse::<ClientTarget>().is_err());
        assert!("tcp:1.2.3.4:5".parse::<ClientTarget>().is_err());
    }
}
