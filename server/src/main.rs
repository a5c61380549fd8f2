#[cfg(unix)]
mod trans_server;

#[cfg(unix)]
const BUFFER_SIZE: usize = 64 * 1024;
#[cfg(unix)]
const DEFAULT_TARGET: &str = "unix:/tmp/xchannel.sock";
/// A connected peer may stay silent this long between requests.
#[cfg(unix)]
const READ_TIMEOUT_MS: u32 = 30_000;
/// After a reply, the peer is dropped if it stays idle this long.
#[cfg(unix)]
const IDLE_TIMEOUT_MS: u32 = 2_000;
#[cfg(unix)]
const WRITE_TIMEOUT_MS: u32 = 5_000;

#[cfg(unix)]
fn main() {
    use log::{error, info};
    use trans_server::{ServerTarget, TransServer};
    use xchannel::ChannelConfig;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("trace")).init();

    let target = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_TARGET.to_string());
    let target: ServerTarget = match target.parse() {
        Ok(target) => target,
        Err(e) => {
            error!("{}", e);
            std::process::exit(2);
        }
    };

    info!("Starting server on {:?}...", target);
    let server = TransServer::new(
        target,
        ChannelConfig::new().with_default_timeout_ms(WRITE_TIMEOUT_MS),
    );
    if let Err(e) = server.run() {
        error!("Server stopped: {}", e);
        std::process::exit(1);
    }
}

#[cfg(not(unix))]
fn main() {
    eprintln!("server needs Unix domain sockets or vsock");
}
