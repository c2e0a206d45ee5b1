//! Serve command - runs the server until a signal asks it to stop.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, info};
use weft_config::WeftConfig;
use weft_reactor::ReactorKind;
use weft_server::{ListenerConfig, Server};

use super::load_config;
use crate::echo::EchoSessions;
use crate::{init_logging, signals};

pub fn run(dir: Option<&Path>, bind: Option<&str>, reactor: Option<ReactorKind>) -> Result<()> {
    let mut config = load_config(dir)?;
    apply_overrides(&mut config, bind, reactor);
    init_logging(&config.logging.level);

    let server_config = config.to_server_config()?;
    let mut server = Server::new(server_config, Box::new(EchoSessions::new()))
        .context("failed to start server")?;

    for addr in server.local_addrs() {
        info!(%addr, reactor = %server.reactor().kind(), "listening");
    }
    signals::install(server.shutdown_handle()).context("failed to install signal handlers")?;

    server.run().context("server error during operation")?;

    info!(
        accepted = server.metrics().connections_accepted.get(),
        "server stopped"
    );
    debug!("final metrics:\n{}", server.metrics().encode());
    Ok(())
}

fn apply_overrides(config: &mut WeftConfig, bind: Option<&str>, reactor: Option<ReactorKind>) {
    if let Some(bind) = bind {
        config.listeners = vec![ListenerConfig::new(bind_address(bind))];
    }
    if let Some(kind) = reactor {
        config.server.reactor = kind;
    }
}

/// Accepts a bare port as shorthand for all interfaces.
fn bind_address(bind: &str) -> String {
    if !bind.is_empty() && bind.bytes().all(|b| b.is_ascii_digit()) {
        format!("0.0.0.0:{bind}")
    } else {
        bind.to_string()
    }
}

#[cfg(test)]
mod tests {
    use weft_server::TlsMode;

    use super::*;

    #[test]
    fn bare_port_binds_all_interfaces() {
        assert_eq!(bind_address("4000"), "0.0.0.0:4000");
        assert_eq!(bind_address("127.0.0.1:23"), "127.0.0.1:23");
        assert_eq!(bind_address("[::1]:23"), "[::1]:23");
    }

    #[test]
    fn bind_replaces_every_listener() {
        let mut config = WeftConfig::default();
        config.listeners.push(ListenerConfig::new("0.0.0.0:4443").with_tls(TlsMode::Implicit));

        apply_overrides(&mut config, Some("5000"), Some(ReactorKind::Poll));

        assert_eq!(config.listeners, vec![ListenerConfig::new("0.0.0.0:5000")]);
        assert_eq!(config.server.reactor, ReactorKind::Poll);
    }

    #[test]
    fn no_overrides_leave_config_alone() {
        let mut config = WeftConfig::default();
        apply_overrides(&mut config, None, None);
        assert_eq!(config.listeners, WeftConfig::default().listeners);
        assert_eq!(config.server.reactor, ReactorKind::Auto);
    }
}
