//! SIGINT/SIGTERM (Ctrl+C on Windows) trigger a graceful shutdown.

use std::io;

use tracing::info;
use weft_server::ShutdownHandle;

#[cfg(unix)]
pub fn install(shutdown: ShutdownHandle) -> io::Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    std::thread::Builder::new()
        .name("weft-signals".to_string())
        .spawn(move || {
            if let Some(signal) = signals.forever().next() {
                info!(signal, "shutdown requested");
                shutdown.shutdown();
            }
        })?;
    Ok(())
}

#[cfg(windows)]
pub fn install(shutdown: ShutdownHandle) -> io::Result<()> {
    ctrlc::set_handler(move || {
        info!("shutdown requested");
        shutdown.shutdown();
    })
    .map_err(io::Error::other)
}
