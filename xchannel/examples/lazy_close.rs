//! Lazy close over a socket pair.
//!
//! A peer sends a few messages with pauses and then goes quiet. The reading
//! side re-arms lazy close after every message, so the channel closes itself
//! once the peer has been idle longer than the idle window.
//!
//! Run with: cargo run --example lazy_close

#[cfg(unix)]
fn main() {
    use log::info;
    use std::io::Write;
    use std::os::fd::OwnedFd;
    use std::os::unix::net::UnixStream;
    use std::thread;
    use std::time::{Duration, Instant};
    use xchannel::{Channel, ErrorKind};

    const IDLE_TIMEOUT_MS: u32 = 200;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();

    let (ours, mut peer) = UnixStream::pair().expect("Failed to create socket pair");
    let channel = Channel::open(OwnedFd::from(ours)).expect("Failed to open channel");

    let sender = thread::spawn(move || {
        for (i, pause) in [50u64, 100, 150].into_iter().enumerate() {
            thread::sleep(Duration::from_millis(pause));
            let message = format!("message {}", i);
            peer.write_all(message.as_bytes()).expect("Failed to send");
        }
        // Stay connected but silent.
        thread::sleep(Duration::from_secs(2));
    });

    let start = Instant::now();
    let mut buf = [0u8; 64];
    loop {
        match channel.read(&mut buf, 10_000) {
            Ok(0) => {
                info!("Peer closed the stream");
                break;
            }
            Ok(n) => {
                info!("Received {:?}", String::from_utf8_lossy(&buf[..n]));
                channel
                    .lazy_close(IDLE_TIMEOUT_MS)
                    .expect("Failed to arm lazy close");
            }
            Err(err) if err.kind() == ErrorKind::TimedOut && channel.is_closed() => {
                info!(
                    "Channel closed itself after {}ms idle ({:.2}s total)",
                    IDLE_TIMEOUT_MS,
                    start.elapsed().as_secs_f64()
                );
                break;
            }
            Err(err) => {
                info!("Read failed: {}", err);
                break;
            }
        }
    }

    sender.join().expect("Sender panicked");
}

#[cfg(not(unix))]
fn main() {
    eprintln!("This example needs a Unix socket pair");
}
