//! Telnet command and option codes (RFC 854, RFC 855 and option RFCs).

pub const IAC: u8 = 255;
pub const DONT: u8 = 254;
pub const DO: u8 = 253;
pub const WONT: u8 = 252;
pub const WILL: u8 = 251;
pub const SB: u8 = 250;
pub const GA: u8 = 249;
pub const EL: u8 = 248;
pub const EC: u8 = 247;
pub const AYT: u8 = 246;
pub const AO: u8 = 245;
pub const IP: u8 = 244;
pub const BRK: u8 = 243;
pub const DM: u8 = 242;
pub const NOP: u8 = 241;
pub const SE: u8 = 240;
pub const EOR: u8 = 239;

pub const NUL: u8 = 0;
pub const LF: u8 = b'\n';
pub const CR: u8 = b'\r';
pub const ESC: u8 = 0x1b;

pub mod option {
    pub const BINARY: u8 = 0;
    pub const ECHO: u8 = 1;
    pub const SGA: u8 = 3;
    pub const TTYPE: u8 = 24;
    pub const EOR: u8 = 25;
    pub const NAWS: u8 = 31;
    pub const NEW_ENVIRON: u8 = 39;
    pub const CHARSET: u8 = 42;
    pub const START_TLS: u8 = 46;
}

/// TTYPE and NEW-ENVIRON subcommands (RFC 1091, RFC 1572).
pub const IS: u8 = 0;
pub const SEND: u8 = 1;
pub const INFO: u8 = 2;

/// NEW-ENVIRON item tags.
pub const ENV_VAR: u8 = 0;
pub const ENV_VALUE: u8 = 1;
pub const ENV_ESC: u8 = 2;
pub const ENV_USERVAR: u8 = 3;

/// CHARSET subcommands (RFC 2066).
pub const CHARSET_REQUEST: u8 = 1;
pub const CHARSET_ACCEPTED: u8 = 2;
pub const CHARSET_REJECTED: u8 = 3;

/// START_TLS subcommand.
pub const FOLLOWS: u8 = 1;

pub fn option_name(code: u8) -> &'static str {
    match code {
        option::BINARY => "BINARY",
        option::ECHO => "ECHO",
        option::SGA => "SGA",
        option::TTYPE => "TTYPE",
        option::EOR => "EOR",
        option::NAWS => "NAWS",
        option::NEW_ENVIRON => "NEW-ENVIRON",
        option::CHARSET => "CHARSET",
        option::START_TLS => "START_TLS",
        _ => "UNKNOWN",
    }
}

pub fn verb_name(verb: u8) -> &'static str {
    match verb {
        WILL => "WILL",
        WONT => "WONT",
        DO => "DO",
        DONT => "DONT",
        _ => "?",
    }
}
