//! The seam between the connection core and the application.

use std::net::SocketAddr;

use weft_types::{CloseReason, ConnectionHandle, SessionId};

use crate::ServerHandle;

/// Application session layer.
///
/// Called only from the event-loop thread, synchronously, in event order for
/// each connection. Implementations must not block. To talk back to a
/// connection, use the [`ServerHandle`] handed to [`bind_server`]; its
/// commands are applied by the loop after the current callback returns.
///
/// [`bind_server`]: SessionManager::bind_server
pub trait SessionManager: Send {
    /// Receives the handle for sending to and closing connections. Called
    /// once, before any connection is opened.
    fn bind_server(&mut self, server: ServerHandle);

    /// A connection was accepted. Returning `None` refuses it: it is closed
    /// with [`CloseReason::LoginFailure`] before any protocol traffic and
    /// `on_connection_close` is never called for it.
    fn on_connection_open(
        &mut self,
        handle: ConnectionHandle,
        remote: Option<SocketAddr>,
    ) -> Option<SessionId>;

    /// One complete input line, without its line terminator.
    fn on_data_received(&mut self, session: SessionId, line: &str);

    /// Called exactly once per session, after the socket is gone.
    fn on_connection_close(&mut self, session: SessionId, reason: CloseReason);

    /// Routes application text to a session's connection. Returns false if
    /// the session is unknown or its connection is closing.
    fn send_to_session(&mut self, session: SessionId, text: &str) -> bool;
}
