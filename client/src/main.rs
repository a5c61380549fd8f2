#[cfg(unix)]
mod trans_client;

#[cfg(unix)]
const DATA_SIZE: usize = 200 * 1024; // 200 KB
#[cfg(unix)]
const DEFAULT_TARGET: &str = "unix:/tmp/xchannel.sock";
#[cfg(unix)]
const IO_TIMEOUT_MS: u32 = 5000;

#[cfg(unix)]
fn main() {
    use log::{error, info};
    use trans_client::{ClientTarget, TransClient};
    use xchannel::ChannelConfig;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let target = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_TARGET.to_string());
    let target: ClientTarget = match target.parse() {
        Ok(target) => target,
        Err(e) => {
            error!("{}", e);
            std::process::exit(2);
        }
    };

    let client = TransClient::new(
        target,
        ChannelConfig::new().with_default_timeout_ms(IO_TIMEOUT_MS),
    );
    let data = vec![0xAB; DATA_SIZE];
    match client.send_message(&data) {
        Ok(reply) if reply == data => info!("Echo matches exactly"),
        Ok(_) => error!("Echo does not match"),
        Err(e) => {
            error!("Transfer failed: {}", e);
            std::process::exit(1);
        }
    }
}

#[cfg(not(unix))]
fn main() {
    eprintln!("client needs Unix domain sockets or vsock");
}
