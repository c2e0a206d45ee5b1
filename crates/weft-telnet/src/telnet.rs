//! The telnet implementation of [`ProtocolNegotiator`].
//!
//! Input runs through a byte-at-a-time state machine:
//!
//! ```text
//!            CR                 IAC             WILL/WONT/DO/DONT
//!   Data ─────────► Cr    Data ─────► Iac ──────────────────────► Command
//!    ▲  ◄─LF/NUL/x─┘       ▲          │ SB                           │ option
//!    │                     │          ▼                              │
//!    │                     │       Subneg ──IAC──► SubnegIac         │
//!    │                     │          ▲  ◄──IAC────┘  │ SE           │
//!    └─────────────────────┴──────────┴───────────────┴──────────────┘
//! ```
//!
//! A CR ends its line at once, so a client that sends a bare CR and then
//! waits still gets its line delivered.
//!
//! Negotiation follows the option table in [`crate::options`]: a reply is
//! sent only when it changes a side's state, so two peers can never loop.

use std::time::Instant;

use tracing::{debug, trace, warn};
use weft_buffer::ByteBuffer;

use crate::consts::{
    self, AO, AYT, BRK, CHARSET_ACCEPTED, CHARSET_REJECTED, CHARSET_REQUEST, CR, DM, DO, DONT, EC,
    EL, ENV_ESC, ENV_USERVAR, ENV_VALUE, ENV_VAR, FOLLOWS, GA, INFO, IP, IS, LF, NOP, NUL, SB, SE,
    SEND, WILL, WONT, option, option_name, verb_name,
};
use crate::format::escape_output;
use crate::options::{NegotiationState, OptionState, Side};
use crate::{
    ClientInfo, NegotiationConfig, NegotiationStatus, ProtocolError, ProtocolNegotiator,
    ProtocolResult, StartTlsPolicy,
};

/// Charsets we can accept, most preferred first.
const CHARSETS: [&str; 3] = ["UTF-8", "ISO-8859-1", "US-ASCII"];

/// Server options we turn on when asked.
const LOCAL_OPTIONS: [u8; 3] = [option::SGA, option::EOR, option::BINARY];

/// Client options we want or accept.
const REMOTE_OPTIONS: [u8; 7] = [
    option::SGA,
    option::EOR,
    option::TTYPE,
    option::NAWS,
    option::NEW_ENVIRON,
    option::CHARSET,
    option::BINARY,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    Data,
    /// A CR just ended a line; an LF or NUL right after it is dropped.
    Cr,
    Iac,
    Command(u8),
    Subneg,
    SubnegIac,
}

/// Telnet negotiator for one connection.
#[derive(Debug)]
pub struct TelnetNegotiator {
    config: NegotiationConfig,
    parse: ParseState,
    line: Vec<u8>,
    subneg: Vec<u8>,
    state: NegotiationState,
    client: ClientInfo,
    /// A TTYPE SEND is outstanding.
    ttype_pending: bool,
    upgrade_requested: bool,
}

impl TelnetNegotiator {
    pub fn new(config: NegotiationConfig) -> Self {
        Self {
            config,
            parse: ParseState::Data,
            line: Vec::new(),
            subneg: Vec::new(),
            state: NegotiationState::default(),
            client: ClientInfo::default(),
            ttype_pending: false,
            upgrade_requested: false,
        }
    }

    pub fn config(&self) -> &NegotiationConfig {
        &self.config
    }

    pub fn state(&self) -> &NegotiationState {
        &self.state
    }

    fn supports_local(&self, opt: u8) -> bool {
        LOCAL_OPTIONS.contains(&opt)
    }

    fn supports_remote(&self, opt: u8) -> bool {
        REMOTE_OPTIONS.contains(&opt) || (opt == option::START_TLS && self.config.start_tls.is_offered())
    }

    fn start_tls_settled(&self) -> bool {
        match self.state.get(option::START_TLS, Side::Remote) {
            OptionState::RejectedDo => true,
            state if state.is_enabled() => self.client.secure,
            _ => false,
        }
    }

    fn start_tls_refused(&self) -> bool {
        self.state.get(option::START_TLS, Side::Remote) == OptionState::RejectedDo
    }

    /// Either peer may settle SGA and EOR: the client confirming our
    /// `WILL`, or us answering its own `WILL` with `DO`/`DONT`.
    fn either_side_settled(&self, opt: u8) -> bool {
        let entry = self.state.entry(opt);
        entry.local.is_settled() || entry.remote.is_settled()
    }

    fn essentials_settled(&self) -> bool {
        self.either_side_settled(option::SGA)
            && self.either_side_settled(option::EOR)
            && (!self.config.start_tls.is_offered() || self.start_tls_settled())
    }

    // ------------------------------------------------------------------------
    // Line assembly
    // ------------------------------------------------------------------------

    fn push_data(&mut self, byte: u8, app_out: &mut ByteBuffer) {
        self.line.push(byte);
        if self.line.len() >= self.config.max_line_length {
            trace!(limit = self.config.max_line_length, "line flushed at length limit");
            self.end_line(app_out);
        }
    }

    fn end_line(&mut self, app_out: &mut ByteBuffer) {
        self.line.push(LF);
        app_out.append(&self.line);
        self.line.clear();
    }

    // ------------------------------------------------------------------------
    // Commands and option negotiation
    // ------------------------------------------------------------------------

    fn command(&mut self, cmd: u8, app_out: &mut ByteBuffer, responses: &mut ByteBuffer) {
        match cmd {
            consts::IAC => self.push_data(consts::IAC, app_out),
            EC => {
                self.line.pop();
            }
            EL => self.line.clear(),
            AYT => responses.append(b"[Yes]\r\n"),
            NOP | GA | DM | BRK | IP | AO | consts::EOR => trace!(command = cmd, "ignored command"),
            SE => trace!("SE outside subnegotiation"),
            other => trace!(command = other, "unknown command"),
        }
    }

    fn negotiate(&mut self, verb: u8, opt: u8, responses: &mut ByteBuffer) {
        trace!(verb = verb_name(verb), option = option_name(opt), code = opt, "received");
        match verb {
            WILL => self.on_will(opt, responses),
            WONT => self.on_wont(opt, responses),
            DO => self.on_do(opt, responses),
            DONT => self.on_dont(opt, responses),
            _ => {}
        }
    }

    fn on_will(&mut self, opt: u8, responses: &mut ByteBuffer) {
        match self.state.get(opt, Side::Remote) {
            OptionState::SentDo => {
                self.state.set(opt, Side::Remote, OptionState::ActiveDo);
                self.remote_enabled(opt, responses);
            }
            OptionState::Idle if self.supports_remote(opt) => {
                send(responses, DO, opt);
                self.state.set(opt, Side::Remote, OptionState::ReceivedWill);
                self.remote_enabled(opt, responses);
            }
            OptionState::Idle => {
                send(responses, DONT, opt);
                self.state.set(opt, Side::Remote, OptionState::RejectedDo);
            }
            OptionState::SentDont => {
                self.state.set(opt, Side::Remote, OptionState::RejectedDo);
            }
            // Already settled: repeating ourselves could loop.
            _ => {}
        }
    }

    fn on_wont(&mut self, opt: u8, responses: &mut ByteBuffer) {
        match self.state.get(opt, Side::Remote) {
            OptionState::SentDo | OptionState::SentDont => {
                self.state.set(opt, Side::Remote, OptionState::RejectedDo);
            }
            OptionState::ActiveDo | OptionState::ReceivedWill => {
                send(responses, DONT, opt);
                self.state.set(opt, Side::Remote, OptionState::RejectedDo);
            }
            OptionState::Idle => {
                self.state.set(opt, Side::Remote, OptionState::RejectedDo);
            }
            _ => {}
        }
        if opt == option::START_TLS && self.config.start_tls == StartTlsPolicy::Required {
            warn!("client refused required START_TLS");
        }
    }

    fn on_do(&mut self, opt: u8, responses: &mut ByteBuffer) {
        match self.state.get(opt, Side::Local) {
            OptionState::SentWill => {
                self.state.set(opt, Side::Local, OptionState::ActiveWill);
            }
            OptionState::Idle if self.supports_local(opt) => {
                send(responses, WILL, opt);
                self.state.set(opt, Side::Local, OptionState::ReceivedDo);
            }
            OptionState::Idle => {
                send(responses, WONT, opt);
                self.state.set(opt, Side::Local, OptionState::RejectedWill);
            }
            OptionState::SentWont => {
                self.state.set(opt, Side::Local, OptionState::RejectedWill);
            }
            _ => {}
        }
    }

    fn on_dont(&mut self, opt: u8, responses: &mut ByteBuffer) {
        match self.state.get(opt, Side::Local) {
            OptionState::SentWill | OptionState::SentWont | OptionState::Idle => {
                self.state.set(opt, Side::Local, OptionState::RejectedWill);
            }
            OptionState::ActiveWill | OptionState::ReceivedDo => {
                send(responses, WONT, opt);
                self.state.set(opt, Side::Local, OptionState::RejectedWill);
            }
            _ => {}
        }
    }

    /// Follow-up once the client agreed to one of its options.
    fn remote_enabled(&mut self, opt: u8, responses: &mut ByteBuffer) {
        debug!(option = option_name(opt), "client enabled option");
        match opt {
            option::TTYPE => self.request_terminal_type(responses),
            option::NEW_ENVIRON => send_subneg(responses, option::NEW_ENVIRON, &[SEND]),
            option::CHARSET => {
                let mut payload = vec![CHARSET_REQUEST];
                for name in CHARSETS {
                    payload.push(b';');
                    payload.extend_from_slice(name.as_bytes());
                }
                send_subneg(responses, option::CHARSET, &payload);
            }
            option::START_TLS => send_subneg(responses, option::START_TLS, &[FOLLOWS]),
            _ => {}
        }
    }

    fn request_terminal_type(&mut self, responses: &mut ByteBuffer) {
        self.ttype_pending = true;
        send_subneg(responses, option::TTYPE, &[SEND]);
    }

    // ------------------------------------------------------------------------
    // Subnegotiation
    // ------------------------------------------------------------------------

    /// Handles a complete `SB ... SE` frame. Returns true when the peer
    /// announced a TLS upgrade.
    fn subnegotiation(&mut self, responses: &mut ByteBuffer) -> bool {
        let frame = std::mem::take(&mut self.subneg);
        let Some((&opt, payload)) = frame.split_first() else {
            trace!("empty subnegotiation");
            return false;
        };

        match opt {
            option::NAWS => self.naws(payload),
            option::TTYPE => self.terminal_type(payload, responses),
            option::CHARSET => self.charset(payload, responses),
            option::NEW_ENVIRON => self.environment(payload, responses),
            option::START_TLS if payload.first() == Some(&FOLLOWS) => {
                if self.state.is_enabled(option::START_TLS, Side::Remote) {
                    debug!("client follows with TLS");
                    self.upgrade_requested = true;
                    return true;
                }
                warn!("START_TLS FOLLOWS without an accepted offer; ignoring");
            }
            other => trace!(option = option_name(other), code = other, "ignored subnegotiation"),
        }
        false
    }

    fn naws(&mut self, payload: &[u8]) {
        let [w0, w1, h0, h1] = payload else {
            debug!(len = payload.len(), "NAWS payload not 4 bytes; ignoring");
            return;
        };
        let size = (u16::from_be_bytes([*w0, *w1]), u16::from_be_bytes([*h0, *h1]));
        trace!(width = size.0, height = size.1, "window size");
        self.client.window_size = Some(size);
    }

    fn terminal_type(&mut self, payload: &[u8], responses: &mut ByteBuffer) {
        let Some((&IS, name)) = payload.split_first() else {
            return;
        };
        self.ttype_pending = false;
        let name = String::from_utf8_lossy(name).trim().to_string();
        if name.is_empty() {
            return;
        }

        // Clients cycle through their list and repeat the last entry when
        // they run out.
        let repeated = self
            .client
            .terminal_types
            .iter()
            .any(|seen| seen.eq_ignore_ascii_case(&name));
        if repeated {
            debug!(types = ?self.client.terminal_types, "terminal type cycle complete");
            return;
        }
        debug!(terminal = %name, "terminal type");
        self.client.terminal_types.push(name);
        if self.client.terminal_types.len() < self.config.max_terminal_types {
            self.request_terminal_type(responses);
        }
    }

    fn charset(&mut self, payload: &[u8], responses: &mut ByteBuffer) {
        let Some((&cmd, rest)) = payload.split_first() else {
            return;
        };
        match cmd {
            CHARSET_ACCEPTED => {
                let name = String::from_utf8_lossy(rest).trim().to_string();
                debug!(charset = %name, "charset accepted");
                self.client.charset = Some(name);
            }
            CHARSET_REJECTED => debug!("client rejected every offered charset"),
            CHARSET_REQUEST => {
                let offered = parse_charset_request(rest);
                let choice = CHARSETS.iter().find(|ours| {
                    offered.iter().any(|theirs| theirs.eq_ignore_ascii_case(ours))
                });
                match choice {
                    Some(name) => {
                        let mut reply = vec![CHARSET_ACCEPTED];
                        reply.extend_from_slice(name.as_bytes());
                        send_subneg(responses, option::CHARSET, &reply);
                        self.client.charset = Some((*name).to_string());
                    }
                    None => send_subneg(responses, option::CHARSET, &[CHARSET_REJECTED]),
                }
            }
            _ => {}
        }
    }

    fn environment(&mut self, payload: &[u8], responses: &mut ByteBuffer) {
        let Some((&cmd, rest)) = payload.split_first() else {
            return;
        };
        match cmd {
            IS | INFO => {
                for (name, value) in parse_environment(rest) {
                    trace!(var = %name, "environment variable");
                    self.client.environment.insert(name, value);
                }
            }
            // We publish no variables of our own.
            SEND => send_subneg(responses, option::NEW_ENVIRON, &[IS]),
            _ => {}
        }
    }
}

impl ProtocolNegotiator for TelnetNegotiator {
    fn start_negotiation(&mut self, out: &mut ByteBuffer, now: Instant) {
        self.state.started_at = Some(now);
        self.state.deadline = Some(now + self.config.timeout);

        for opt in [option::SGA, option::EOR] {
            send(out, WILL, opt);
            self.state.set(opt, Side::Local, OptionState::SentWill);
        }
        for opt in [option::TTYPE, option::NAWS, option::NEW_ENVIRON, option::CHARSET] {
            send(out, DO, opt);
            self.state.set(opt, Side::Remote, OptionState::SentDo);
        }
        if self.config.start_tls.is_offered() && !self.client.secure {
            send(out, DO, option::START_TLS);
            self.state.set(option::START_TLS, Side::Remote, OptionState::SentDo);
        }
        debug!(start_tls = ?self.config.start_tls, "negotiation started");
    }

    fn process_input(
        &mut self,
        input: &[u8],
        app_out: &mut ByteBuffer,
        responses: &mut ByteBuffer,
    ) -> ProtocolResult<usize> {
        for (i, &byte) in input.iter().enumerate() {
            match self.parse {
                ParseState::Data => match byte {
                    consts::IAC => self.parse = ParseState::Iac,
                    CR => {
                        self.end_line(app_out);
                        self.parse = ParseState::Cr;
                    }
                    LF => self.end_line(app_out),
                    _ => self.push_data(byte, app_out),
                },
                ParseState::Cr => match byte {
                    LF | NUL => self.parse = ParseState::Data,
                    CR => self.end_line(app_out),
                    consts::IAC => self.parse = ParseState::Iac,
                    _ => {
                        self.parse = ParseState::Data;
                        self.push_data(byte, app_out);
                    }
                },
                ParseState::Iac => {
                    self.parse = ParseState::Data;
                    match byte {
                        WILL | WONT | DO | DONT => self.parse = ParseState::Command(byte),
                        SB => {
                            self.subneg.clear();
                            self.parse = ParseState::Subneg;
                        }
                        cmd => self.command(cmd, app_out, responses),
                    }
                }
                ParseState::Command(verb) => {
                    self.parse = ParseState::Data;
                    self.negotiate(verb, byte, responses);
                }
                ParseState::Subneg => {
                    if byte == consts::IAC {
                        self.parse = ParseState::SubnegIac;
                    } else {
                        self.push_subneg(byte)?;
                    }
                }
                ParseState::SubnegIac => match byte {
                    consts::IAC => {
                        self.parse = ParseState::Subneg;
                        self.push_subneg(byte)?;
                    }
                    SE => {
                        self.parse = ParseState::Data;
                        if self.subnegotiation(responses) {
                            return Ok(i + 1);
                        }
                    }
                    other => {
                        let option = self.subneg.first().copied().unwrap_or_default();
                        self.parse = ParseState::Data;
                        self.subneg.clear();
                        return Err(ProtocolError::MalformedSubnegotiation { option, byte: other });
                    }
                },
            }
        }
        Ok(input.len())
    }

    fn negotiation_status(&mut self, now: Instant) -> NegotiationStatus {
        let Some(deadline) = self.state.deadline else {
            return NegotiationStatus::InProgress;
        };
        if self.config.start_tls == StartTlsPolicy::Required && self.start_tls_refused() {
            return NegotiationStatus::Failed;
        }
        if self.state.settled || self.state.timed_out {
            return NegotiationStatus::Completed;
        }
        if self.essentials_settled() {
            self.state.settled = true;
            debug!(elapsed = ?self.state.started_at.map(|t| now.saturating_duration_since(t)), "negotiation settled");
            return NegotiationStatus::Completed;
        }
        if now < deadline {
            return NegotiationStatus::InProgress;
        }

        if self.config.start_tls == StartTlsPolicy::Required && !self.client.secure {
            warn!("negotiation timed out before required START_TLS");
            return NegotiationStatus::Failed;
        }
        self.state.timed_out = true;
        warn!(unsettled = ?self.state.pending(), "negotiation timed out; proceeding");
        NegotiationStatus::Completed
    }

    fn timed_out(&self) -> bool {
        self.state.timed_out
    }

    fn format_output(&self, text: &[u8], out: &mut ByteBuffer) {
        escape_output(text, self.client.is_dumb_terminal(), out);
    }

    fn format_prompt(&self, text: &[u8], out: &mut ByteBuffer) {
        self.format_output(text, out);
        if self.state.is_enabled(option::EOR, Side::Local) {
            out.append(&[consts::IAC, consts::EOR]);
        } else if !self.state.is_enabled(option::SGA, Side::Local) {
            out.append(&[consts::IAC, GA]);
        }
    }

    fn client_info(&self) -> &ClientInfo {
        &self.client
    }

    fn take_upgrade_request(&mut self) -> bool {
        std::mem::take(&mut self.upgrade_requested)
    }

    fn set_secure(&mut self, secure: bool) {
        self.client.secure = secure;
    }

    fn set_echo(&mut self, client_echo: bool, out: &mut ByteBuffer) {
        let current = self.state.get(option::ECHO, Side::Local);
        let server_echoing = current.is_enabled() || current == OptionState::SentWill;
        if client_echo && server_echoing {
            send(out, WONT, option::ECHO);
            self.state.set(option::ECHO, Side::Local, OptionState::SentWont);
        } else if !client_echo && !server_echoing {
            send(out, WILL, option::ECHO);
            self.state.set(option::ECHO, Side::Local, OptionState::SentWill);
        }
    }
}

impl TelnetNegotiator {
    fn push_subneg(&mut self, byte: u8) -> ProtocolResult<()> {
        if self.subneg.len() >= self.config.max_subnegotiation_length {
            let option = self.subneg.first().copied().unwrap_or_default();
            self.subneg.clear();
            self.parse = ParseState::Data;
            return Err(ProtocolError::SubnegotiationTooLong {
                option,
                limit: self.config.max_subnegotiation_length,
            });
        }
        self.subneg.push(byte);
        Ok(())
    }
}

fn send(out: &mut ByteBuffer, verb: u8, opt: u8) {
    trace!(verb = verb_name(verb), option = option_name(opt), "sent");
    out.append(&[consts::IAC, verb, opt]);
}

/// Writes `IAC SB opt payload IAC SE`, doubling IAC in the payload.
fn send_subneg(out: &mut ByteBuffer, opt: u8, payload: &[u8]) {
    let mut frame = Vec::with_capacity(payload.len() + 6);
    frame.extend_from_slice(&[consts::IAC, SB, opt]);
    for &byte in payload {
        frame.push(byte);
        if byte == consts::IAC {
            frame.push(consts::IAC);
        }
    }
    frame.extend_from_slice(&[consts::IAC, SE]);
    out.append(&frame);
}

/// Splits `<sep>name<sep>name...`, skipping an optional `[TTABLE]` marker.
fn parse_charset_request(rest: &[u8]) -> Vec<String> {
    let rest = rest
        .strip_prefix(b"[TTABLE]")
        .map_or(rest, |after| after.get(1..).unwrap_or_default());
    let Some((&sep, names)) = rest.split_first() else {
        return Vec::new();
    };
    names
        .split(|b| *b == sep)
        .filter(|name| !name.is_empty())
        .map(|name| String::from_utf8_lossy(name).trim().to_string())
        .collect()
}

/// Parses `(VAR|USERVAR) name [VALUE value]` items, honoring ESC.
fn parse_environment(data: &[u8]) -> Vec<(String, String)> {
    let mut vars = Vec::new();
    let mut name: Option<Vec<u8>> = None;
    let mut value: Option<Vec<u8>> = None;
    let mut bytes = data.iter().copied();

    let flush = |vars: &mut Vec<(String, String)>, name: &mut Option<Vec<u8>>, value: &mut Option<Vec<u8>>| {
        if let Some(n) = name.take() {
            let v = value.take().unwrap_or_default();
            if !n.is_empty() {
                vars.push((
                    String::from_utf8_lossy(&n).into_owned(),
                    String::from_utf8_lossy(&v).into_owned(),
                ));
            }
        }
        *value = None;
    };

    while let Some(byte) = bytes.next() {
        match byte {
            ENV_VAR | ENV_USERVAR => {
                flush(&mut vars, &mut name, &mut value);
                name = Some(Vec::new());
            }
            ENV_VALUE if name.is_some() => value = Some(Vec::new()),
            ENV_ESC => {
                if let Some(escaped) = bytes.next() {
                    push_env_byte(&mut name, &mut value, escaped);
                }
            }
            other => push_env_byte(&mut name, &mut value, other),
        }
    }
    flush(&mut vars, &mut name, &mut value);
    vars
}

fn push_env_byte(name: &mut Option<Vec<u8>>, value: &mut Option<Vec<u8>>, byte: u8) {
    match (value.as_mut(), name.as_mut()) {
        (Some(value), _) => value.push(byte),
        (None, Some(name)) => name.push(byte),
        (None, None) => {}
    }
}
