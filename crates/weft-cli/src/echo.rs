//! Line-echo sessions served by `weft serve`.

use std::collections::HashMap;
use std::net::SocketAddr;

use tracing::info;
use weft_server::{ServerHandle, SessionManager};
use weft_types::{CloseReason, ConnectionHandle, SessionId};

const GREETING: &str = "Connected to weft. Lines are echoed back; type quit to leave.\n";
const PROMPT: &str = "> ";

/// Echoes each line back to its sender. `quit` ends the session.
pub struct EchoSessions {
    server: Option<ServerHandle>,
    next_id: u64,
    sessions: HashMap<SessionId, ConnectionHandle>,
}

impl EchoSessions {
    pub fn new() -> Self {
        Self {
            server: None,
            next_id: 1,
            sessions: HashMap::new(),
        }
    }
}

impl Default for EchoSessions {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager for EchoSessions {
    fn bind_server(&mut self, server: ServerHandle) {
        self.server = Some(server);
    }

    fn on_connection_open(
        &mut self,
        handle: ConnectionHandle,
        remote: Option<SocketAddr>,
    ) -> Option<SessionId> {
        let server = self.server.as_ref()?;
        let session = SessionId::new(self.next_id);
        self.next_id += 1;
        self.sessions.insert(session, handle);

        info!(%session, %handle, remote = ?remote, "session opened");
        server.send(handle, GREETING);
        server.send_prompt(handle, PROMPT);
        Some(session)
    }

    fn on_data_received(&mut self, session: SessionId, line: &str) {
        let (Some(&handle), Some(server)) = (self.sessions.get(&session), &self.server) else {
            return;
        };
        if line.trim().eq_ignore_ascii_case("quit") {
            server.send(handle, "Goodbye.\n");
            server.close(handle, CloseReason::UserQuit);
            return;
        }
        server.send(handle, format!("{line}\n"));
        server.send_prompt(handle, PROMPT);
    }

    fn on_connection_close(&mut self, session: SessionId, reason: CloseReason) {
        self.sessions.remove(&session);
        info!(%session, %reason, "session closed");
    }

    fn send_to_session(&mut self, session: SessionId, text: &str) -> bool {
        match (self.sessions.get(&session), &self.server) {
            (Some(&handle), Some(server)) => server.send(handle, text),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use weft_reactor::{MemoryReactor, Reactor, ReactorKind};
    use weft_server::{Server, ServerConfig};
    use weft_telnet::consts::{DO, IAC, option};

    use super::*;

    const CONFIRM_ESSENTIALS: [u8; 6] = [IAC, DO, option::SGA, IAC, DO, option::EOR];

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }

    fn server() -> (Arc<MemoryReactor>, Server) {
        let reactor = Arc::new(MemoryReactor::readiness());
        let config = ServerConfig::new("127.0.0.1:4000")
            .with_reactor(ReactorKind::Memory)
            .with_tick_interval(Duration::ZERO);
        let server = Server::with_reactor(
            config,
            Arc::clone(&reactor) as Arc<dyn Reactor>,
            Box::new(EchoSessions::new()),
        )
        .unwrap();
        (reactor, server)
    }

    fn pump(server: &mut Server) {
        for _ in 0..6 {
            server.poll_once(Duration::from_millis(1)).unwrap();
        }
    }

    #[test]
    fn lines_are_echoed_and_quit_closes() {
        let (reactor, mut server) = server();
        let listener = server.listener_handles()[0];
        let conn = reactor.connect(listener, "127.0.0.1:50000".parse().unwrap()).unwrap();
        pump(&mut server);

        reactor.inject(conn, &CONFIRM_ESSENTIALS);
        pump(&mut server);
        assert!(contains(&reactor.take_output(conn), b"Connected to weft."));

        reactor.inject(conn, b"hello\r\n");
        pump(&mut server);
        let output = reactor.take_output(conn);
        assert!(contains(&output, b"hello\r\n> "));

        reactor.inject(conn, b"QUIT\r\n");
        pump(&mut server);
        assert!(!reactor.is_open(conn));
        assert_eq!(server.metrics().closed_with(CloseReason::UserQuit), 1);
    }

    #[test]
    fn unknown_session_cannot_be_sent_to() {
        let mut sessions = EchoSessions::new();
        assert!(!sessions.send_to_session(SessionId::new(9), "hi"));
    }
}
