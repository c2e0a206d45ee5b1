//! What the peer told us about itself.

use std::collections::BTreeMap;

/// Terminal facts collected through subnegotiation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientInfo {
    /// Every name reported while cycling TTYPE, most preferred first.
    pub terminal_types: Vec<String>,
    /// NAWS width and height.
    pub window_size: Option<(u16, u16)>,
    /// Charset accepted through CHARSET.
    pub charset: Option<String>,
    /// NEW-ENVIRON variables (VAR and USERVAR share one namespace).
    pub environment: BTreeMap<String, String>,
    /// The session runs over TLS.
    pub secure: bool,
}

impl ClientInfo {
    pub fn terminal_type(&self) -> Option<&str> {
        self.terminal_types.first().map(String::as_str)
    }

    /// True when the client reported a terminal that cannot render ANSI.
    pub fn is_dumb_terminal(&self) -> bool {
        self.terminal_type()
            .is_some_and(|name| name.eq_ignore_ascii_case("dumb"))
    }
}
