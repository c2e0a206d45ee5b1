//! Negotiator scenarios driven byte-for-byte.

use std::time::{Duration, Instant};

use proptest::prelude::*;
use test_case::test_case;
use weft_buffer::ByteBuffer;

use crate::consts::{
    CHARSET_ACCEPTED, CHARSET_REQUEST, DO, DONT, EC, EL, ENV_ESC, ENV_USERVAR, ENV_VALUE, ENV_VAR,
    FOLLOWS, GA, IAC, IS, NOP, SB, SE, SEND, WILL, WONT, option,
};
use crate::options::Side;
use crate::{
    NegotiationConfig, NegotiationStatus, OptionState, ProtocolError, ProtocolNegotiator,
    StartTlsPolicy, TelnetNegotiator,
};

struct Output {
    app: Vec<u8>,
    responses: Vec<u8>,
    consumed: usize,
}

fn negotiator(policy: StartTlsPolicy) -> TelnetNegotiator {
    TelnetNegotiator::new(NegotiationConfig::default().with_start_tls(policy))
}

fn started(policy: StartTlsPolicy, now: Instant) -> TelnetNegotiator {
    let mut n = negotiator(policy);
    n.start_negotiation(&mut ByteBuffer::new(), now);
    n
}

fn feed(n: &mut TelnetNegotiator, input: &[u8]) -> Output {
    let mut app = ByteBuffer::new();
    let mut responses = ByteBuffer::new();
    let consumed = n.process_input(input, &mut app, &mut responses).unwrap();
    Output {
        app: app.consume_all(),
        responses: responses.consume_all(),
        consumed,
    }
}

fn sb(opt: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![IAC, SB, opt];
    frame.extend_from_slice(payload);
    frame.extend_from_slice(&[IAC, SE]);
    frame
}

/// Client agrees to everything the server opened with.
fn settle_essentials(n: &mut TelnetNegotiator) {
    feed(n, &[IAC, DO, option::SGA, IAC, DO, option::EOR]);
}

// ============================================================================
// Opening
// ============================================================================

#[test]
fn opening_offers_without_start_tls() {
    let mut n = negotiator(StartTlsPolicy::Disabled);
    let mut out = ByteBuffer::new();
    n.start_negotiation(&mut out, Instant::now());

    assert_eq!(
        out.consume_all(),
        vec![
            IAC, WILL, option::SGA,
            IAC, WILL, option::EOR,
            IAC, DO, option::TTYPE,
            IAC, DO, option::NAWS,
            IAC, DO, option::NEW_ENVIRON,
            IAC, DO, option::CHARSET,
        ]
    );
    assert_eq!(n.state().get(option::SGA, Side::Local), OptionState::SentWill);
    assert_eq!(n.state().get(option::NAWS, Side::Remote), OptionState::SentDo);
}

#[test]
fn opening_offers_start_tls_when_enabled() {
    let mut n = negotiator(StartTlsPolicy::Offered);
    let mut out = ByteBuffer::new();
    n.start_negotiation(&mut out, Instant::now());
    assert!(out.readable().ends_with(&[IAC, DO, option::START_TLS]));
}

#[test]
fn status_is_in_progress_before_start() {
    let mut n = negotiator(StartTlsPolicy::Disabled);
    assert_eq!(
        n.negotiation_status(Instant::now() + Duration::from_secs(60)),
        NegotiationStatus::InProgress
    );
}

// ============================================================================
// Line framing
// ============================================================================

#[test_case(b"look\r\n"; "crlf")]
#[test_case(b"look\r\0"; "cr nul")]
#[test_case(b"look\n"; "bare lf")]
fn line_endings_normalize(input: &[u8]) {
    let mut n = negotiator(StartTlsPolicy::Disabled);
    let out = feed(&mut n, input);
    assert_eq!(out.app, b"look\n");
    assert_eq!(out.consumed, input.len());
}

#[test]
fn bare_cr_ends_line_and_keeps_next_byte() {
    let mut n = negotiator(StartTlsPolicy::Disabled);
    assert_eq!(feed(&mut n, b"north\rsouth\n").app, b"north\nsouth\n");
}

#[test]
fn line_split_across_reads_is_reassembled() {
    let mut n = negotiator(StartTlsPolicy::Disabled);
    assert!(feed(&mut n, b"lo").app.is_empty());
    assert_eq!(feed(&mut n, b"ok\r").app, b"look\n");
    assert!(feed(&mut n, b"\n").app.is_empty(), "LF after CR is part of the same ending");
}

#[test]
fn bare_cr_then_silence_still_delivers_the_line() {
    let mut n = negotiator(StartTlsPolicy::Disabled);
    let out = feed(&mut n, b"look\r");
    assert_eq!(out.app, b"look\n");
    assert_eq!(out.consumed, 5);
}

#[test]
fn cr_cr_lf_is_a_line_then_an_empty_line() {
    let mut n = negotiator(StartTlsPolicy::Disabled);
    assert_eq!(feed(&mut n, b"look\r\r\n").app, b"look\n\n");
}

#[test]
fn formatted_iac_parses_back_once() {
    let mut n = negotiator(StartTlsPolicy::Disabled);
    let mut wire = ByteBuffer::new();
    n.format_output(b"a\xffb\n", &mut wire);
    assert_eq!(wire.readable(), b"a\xff\xffb\r\n");

    let wire = wire.consume_all();
    assert_eq!(feed(&mut n, &wire).app, b"a\xffb\n");
}

#[test]
fn doubled_iac_is_literal_data() {
    let mut n = negotiator(StartTlsPolicy::Disabled);
    assert_eq!(feed(&mut n, &[b'a', IAC, IAC, b'b', b'\n']).app, vec![b'a', 0xff, b'b', b'\n']);
}

#[test]
fn erase_character_and_erase_line_edit_pending_line() {
    let mut n = negotiator(StartTlsPolicy::Disabled);
    let out = feed(&mut n, &[b'l', b'o', b'x', IAC, EC, b'o', b'k', b'\n']);
    assert_eq!(out.app, b"look\n");

    let out = feed(&mut n, &[b'o', b'o', b'p', b's', IAC, EL, b'h', b'i', b'\n']);
    assert_eq!(out.app, b"hi\n");
}

#[test]
fn are_you_there_is_answered() {
    let mut n = negotiator(StartTlsPolicy::Disabled);
    let out = feed(&mut n, &[IAC, crate::consts::AYT]);
    assert_eq!(out.responses, b"[Yes]\r\n");
    assert!(out.app.is_empty());
}

#[test]
fn ignored_commands_leave_no_trace() {
    let mut n = negotiator(StartTlsPolicy::Disabled);
    let out = feed(&mut n, &[b'h', IAC, NOP, b'i', IAC, GA, b'\n']);
    assert_eq!(out.app, b"hi\n");
    assert!(out.responses.is_empty());
}

#[test]
fn overlong_line_is_flushed_at_limit() {
    let mut n = TelnetNegotiator::new(NegotiationConfig::default().with_max_line_length(4));
    let out = feed(&mut n, b"abcdefg\n");
    assert_eq!(out.app, b"abcd\nefg\n");
}

// ============================================================================
// Option negotiation
// ============================================================================

#[test]
fn confirmation_of_our_offer_gets_no_reply() {
    let mut n = started(StartTlsPolicy::Disabled, Instant::now());
    let out = feed(&mut n, &[IAC, DO, option::SGA]);
    assert!(out.responses.is_empty());
    assert_eq!(n.state().get(option::SGA, Side::Local), OptionState::ActiveWill);

    // A repeat must not be answered either.
    assert!(feed(&mut n, &[IAC, DO, option::SGA]).responses.is_empty());
}

#[test]
fn client_offers_of_sga_and_eor_are_accepted() {
    let t0 = Instant::now();
    let mut n = started(StartTlsPolicy::Disabled, t0);

    let out = feed(&mut n, &[IAC, WILL, option::SGA, IAC, WILL, option::EOR]);
    assert_eq!(out.responses, vec![IAC, DO, option::SGA, IAC, DO, option::EOR]);
    assert_eq!(n.state().get(option::SGA, Side::Remote), OptionState::ReceivedWill);
    assert_eq!(n.state().get(option::EOR, Side::Remote), OptionState::ReceivedWill);

    assert_eq!(n.negotiation_status(t0), NegotiationStatus::Completed);
    assert!(!n.timed_out());

    // Repeated offers are not answered again.
    assert!(feed(&mut n, &[IAC, WILL, option::SGA]).responses.is_empty());
}

#[test]
fn unsupported_option_is_refused_once() {
    let mut n = started(StartTlsPolicy::Disabled, Instant::now());
    assert_eq!(feed(&mut n, &[IAC, WILL, 99]).responses, vec![IAC, DONT, 99]);
    assert!(feed(&mut n, &[IAC, WILL, 99]).responses.is_empty());

    assert_eq!(feed(&mut n, &[IAC, DO, 98]).responses, vec![IAC, WONT, 98]);
    assert!(feed(&mut n, &[IAC, DO, 98]).responses.is_empty());
}

#[test]
fn start_tls_is_refused_when_disabled() {
    let mut n = started(StartTlsPolicy::Disabled, Instant::now());
    assert_eq!(
        feed(&mut n, &[IAC, WILL, option::START_TLS]).responses,
        vec![IAC, DONT, option::START_TLS]
    );
}

#[test]
fn disabling_an_active_option_is_acknowledged() {
    let mut n = started(StartTlsPolicy::Disabled, Instant::now());
    settle_essentials(&mut n);
    assert_eq!(
        feed(&mut n, &[IAC, DONT, option::EOR]).responses,
        vec![IAC, WONT, option::EOR]
    );
    assert_eq!(n.state().get(option::EOR, Side::Local), OptionState::RejectedWill);
}

#[test]
fn set_echo_toggles_server_echo() {
    let mut n = started(StartTlsPolicy::Disabled, Instant::now());
    let mut out = ByteBuffer::new();

    n.set_echo(false, &mut out);
    assert_eq!(out.consume_all(), vec![IAC, WILL, option::ECHO]);
    n.set_echo(false, &mut out);
    assert!(out.is_empty(), "already requested");

    feed(&mut n, &[IAC, DO, option::ECHO]);
    n.set_echo(true, &mut out);
    assert_eq!(out.consume_all(), vec![IAC, WONT, option::ECHO]);
}

// ============================================================================
// Subnegotiation
// ============================================================================

#[test]
fn naws_reports_window_size_with_escaped_bytes() {
    let mut n = started(StartTlsPolicy::Disabled, Instant::now());
    feed(&mut n, &[IAC, WILL, option::NAWS]);
    // Width 255 arrives as IAC IAC inside the frame.
    feed(&mut n, &[IAC, SB, option::NAWS, 0, IAC, IAC, 0, 40, IAC, SE]);
    assert_eq!(n.client_info().window_size, Some((255, 40)));
}

#[test]
fn naws_with_wrong_length_is_ignored() {
    let mut n = started(StartTlsPolicy::Disabled, Instant::now());
    feed(&mut n, &sb(option::NAWS, &[0, 80, 0]));
    assert_eq!(n.client_info().window_size, None);
}

#[test]
fn terminal_type_cycles_until_repeat() {
    let mut n = started(StartTlsPolicy::Disabled, Instant::now());
    let send = sb(option::TTYPE, &[SEND]);

    assert_eq!(feed(&mut n, &[IAC, WILL, option::TTYPE]).responses, send);
    assert_eq!(feed(&mut n, &sb(option::TTYPE, b"\0MUDLET")).responses, send);
    assert_eq!(feed(&mut n, &sb(option::TTYPE, b"\0ANSI-TRUECOLOR")).responses, send);
    assert!(feed(&mut n, &sb(option::TTYPE, b"\0ANSI-TRUECOLOR")).responses.is_empty());

    assert_eq!(n.client_info().terminal_type(), Some("MUDLET"));
    assert_eq!(n.client_info().terminal_types.len(), 2);
}

#[test]
fn terminal_type_cycle_stops_at_limit() {
    let mut n = TelnetNegotiator::new(NegotiationConfig::default().with_max_terminal_types(2));
    n.start_negotiation(&mut ByteBuffer::new(), Instant::now());
    feed(&mut n, &[IAC, WILL, option::TTYPE]);
    feed(&mut n, &sb(option::TTYPE, b"\0A"));
    let out = feed(&mut n, &sb(option::TTYPE, b"\0B"));
    assert!(out.responses.is_empty());
    assert_eq!(n.client_info().terminal_types, vec!["A", "B"]);
}

#[test]
fn charset_offer_and_acceptance() {
    let mut n = started(StartTlsPolicy::Disabled, Instant::now());
    let out = feed(&mut n, &[IAC, WILL, option::CHARSET]);
    assert_eq!(out.responses, sb(option::CHARSET, b"\x01;UTF-8;ISO-8859-1;US-ASCII"));

    let mut accepted = vec![CHARSET_ACCEPTED];
    accepted.extend_from_slice(b"UTF-8");
    feed(&mut n, &sb(option::CHARSET, &accepted));
    assert_eq!(n.client_info().charset.as_deref(), Some("UTF-8"));
}

#[test_case(b" latin1 utf-8", Some("UTF-8"); "prefers utf8")]
#[test_case(b";US-ASCII", Some("US-ASCII"); "ascii only")]
#[test_case(b"[TTABLE]\x01;UTF-8", Some("UTF-8"); "ttable marker")]
#[test_case(b";KOI8-R", None; "nothing in common")]
fn client_charset_request(offer: &[u8], expected: Option<&str>) {
    let mut n = started(StartTlsPolicy::Disabled, Instant::now());
    let mut payload = vec![CHARSET_REQUEST];
    payload.extend_from_slice(offer);
    let out = feed(&mut n, &sb(option::CHARSET, &payload));

    let mut reply = match expected {
        Some(name) => {
            let mut r = vec![CHARSET_ACCEPTED];
            r.extend_from_slice(name.as_bytes());
            r
        }
        None => vec![crate::consts::CHARSET_REJECTED],
    };
    reply = sb(option::CHARSET, &reply);
    assert_eq!(out.responses, reply);
    assert_eq!(n.client_info().charset.as_deref(), expected);
}

#[test]
fn environment_variables_are_collected() {
    let mut n = started(StartTlsPolicy::Disabled, Instant::now());
    let out = feed(&mut n, &[IAC, WILL, option::NEW_ENVIRON]);
    assert_eq!(out.responses, sb(option::NEW_ENVIRON, &[SEND]));

    let mut payload = vec![IS, ENV_VAR];
    payload.extend_from_slice(b"USER");
    payload.push(ENV_VALUE);
    payload.extend_from_slice(b"ada");
    payload.push(ENV_USERVAR);
    payload.extend_from_slice(b"CLIENT_NAME");
    payload.push(ENV_VALUE);
    payload.extend_from_slice(b"a");
    payload.extend_from_slice(&[ENV_ESC, ENV_VAR]);
    payload.extend_from_slice(b"b");
    payload.push(ENV_VAR);
    payload.extend_from_slice(b"EMPTY");
    feed(&mut n, &sb(option::NEW_ENVIRON, &payload));

    let env = &n.client_info().environment;
    assert_eq!(env.get("USER").map(String::as_str), Some("ada"));
    assert_eq!(env.get("CLIENT_NAME").map(String::as_str), Some("a\0b"));
    assert_eq!(env.get("EMPTY").map(String::as_str), Some(""));
}

#[test]
fn malformed_subnegotiation_is_an_error() {
    let mut n = started(StartTlsPolicy::Disabled, Instant::now());
    let err = n
        .process_input(
            &[IAC, SB, option::NAWS, 0, IAC, b'x'],
            &mut ByteBuffer::new(),
            &mut ByteBuffer::new(),
        )
        .unwrap_err();
    assert_eq!(
        err,
        ProtocolError::MalformedSubnegotiation {
            option: option::NAWS,
            byte: b'x'
        }
    );
}

#[test]
fn oversized_subnegotiation_is_an_error() {
    let mut n = TelnetNegotiator::new(NegotiationConfig::default().with_max_subnegotiation_length(8));
    let mut input = vec![IAC, SB, option::TTYPE, IS];
    input.extend_from_slice(&[b'x'; 16]);
    let err = n
        .process_input(&input, &mut ByteBuffer::new(), &mut ByteBuffer::new())
        .unwrap_err();
    assert!(matches!(err, ProtocolError::SubnegotiationTooLong { limit: 8, .. }));
}

// ============================================================================
// Completion and timeouts
// ============================================================================

#[test]
fn completes_when_essentials_settle() {
    let t0 = Instant::now();
    let mut n = started(StartTlsPolicy::Disabled, t0);
    assert_eq!(n.negotiation_status(t0), NegotiationStatus::InProgress);

    feed(&mut n, &[IAC, DO, option::SGA]);
    assert_eq!(n.negotiation_status(t0), NegotiationStatus::InProgress);
    feed(&mut n, &[IAC, DONT, option::EOR]);
    assert_eq!(n.negotiation_status(t0), NegotiationStatus::Completed);
    assert!(!n.timed_out());
}

#[test]
fn silent_peer_completes_at_timeout() {
    let t0 = Instant::now();
    let mut n = started(StartTlsPolicy::Disabled, t0);
    assert_eq!(
        n.negotiation_status(t0 + Duration::from_millis(9_999)),
        NegotiationStatus::InProgress
    );
    assert_eq!(
        n.negotiation_status(t0 + Duration::from_secs(10)),
        NegotiationStatus::Completed
    );
    assert!(n.timed_out());
    assert!(!n.state().pending().is_empty());
}

#[test]
fn start_tls_upgrade_stops_parsing_after_follows() {
    let t0 = Instant::now();
    let mut n = started(StartTlsPolicy::Offered, t0);
    settle_essentials(&mut n);

    let out = feed(&mut n, &[IAC, WILL, option::START_TLS]);
    assert_eq!(out.responses, sb(option::START_TLS, &[FOLLOWS]));
    assert_eq!(n.negotiation_status(t0), NegotiationStatus::InProgress);

    let mut input = sb(option::START_TLS, &[FOLLOWS]);
    let frame_len = input.len();
    input.extend_from_slice(&[0x16, 0x03, 0x01]); // start of a ClientHello
    let out = feed(&mut n, &input);
    assert_eq!(out.consumed, frame_len);
    assert!(n.take_upgrade_request());
    assert!(!n.take_upgrade_request());

    assert_eq!(n.negotiation_status(t0), NegotiationStatus::InProgress);
    n.set_secure(true);
    assert_eq!(n.negotiation_status(t0), NegotiationStatus::Completed);
    assert!(n.client_info().secure);
}

#[test]
fn offered_start_tls_refusal_stays_plaintext() {
    let t0 = Instant::now();
    let mut n = started(StartTlsPolicy::Offered, t0);
    settle_essentials(&mut n);
    let out = feed(&mut n, &[IAC, WONT, option::START_TLS]);
    assert!(out.responses.is_empty());
    assert_eq!(n.negotiation_status(t0), NegotiationStatus::Completed);
}

#[test]
fn required_start_tls_refusal_fails() {
    let t0 = Instant::now();
    let mut n = started(StartTlsPolicy::Required, t0);
    settle_essentials(&mut n);
    feed(&mut n, &[IAC, WONT, option::START_TLS]);
    assert_eq!(n.negotiation_status(t0), NegotiationStatus::Failed);
}

#[test]
fn required_start_tls_silence_fails_at_timeout() {
    let t0 = Instant::now();
    let mut n = started(StartTlsPolicy::Required, t0);
    settle_essentials(&mut n);
    assert_eq!(
        n.negotiation_status(t0 + Duration::from_secs(11)),
        NegotiationStatus::Failed
    );
}

#[test]
fn follows_without_accepted_offer_is_ignored() {
    let mut n = started(StartTlsPolicy::Disabled, Instant::now());
    let input = sb(option::START_TLS, &[FOLLOWS]);
    let out = feed(&mut n, &input);
    assert_eq!(out.consumed, input.len());
    assert!(!n.take_upgrade_request());
}

// ============================================================================
// Output
// ============================================================================

#[test]
fn prompt_ends_with_eor_when_active() {
    let mut n = started(StartTlsPolicy::Disabled, Instant::now());
    settle_essentials(&mut n);
    let mut out = ByteBuffer::new();
    n.format_prompt(b"> ", &mut out);
    assert_eq!(out.consume_all(), vec![b'>', b' ', IAC, crate::consts::EOR]);
}

#[test]
fn prompt_ends_with_ga_without_sga_or_eor() {
    let n = negotiator(StartTlsPolicy::Disabled);
    let mut out = ByteBuffer::new();
    n.format_prompt(b"> ", &mut out);
    assert_eq!(out.consume_all(), vec![b'>', b' ', IAC, GA]);
}

#[test]
fn prompt_has_no_marker_with_sga_only() {
    let mut n = started(StartTlsPolicy::Disabled, Instant::now());
    feed(&mut n, &[IAC, DO, option::SGA, IAC, DONT, option::EOR]);
    let mut out = ByteBuffer::new();
    n.format_prompt(b"> ", &mut out);
    assert_eq!(out.consume_all(), b"> ");
}

#[test]
fn dumb_terminal_gets_ansi_stripped() {
    let mut n = started(StartTlsPolicy::Disabled, Instant::now());
    let mut out = ByteBuffer::new();
    n.format_output(b"\x1b[32mok\x1b[0m\n", &mut out);
    assert_eq!(out.consume_all(), b"\x1b[32mok\x1b[0m\r\n");

    feed(&mut n, &[IAC, WILL, option::TTYPE]);
    feed(&mut n, &sb(option::TTYPE, b"\0dumb"));
    n.format_output(b"\x1b[32mok\x1b[0m\n", &mut out);
    assert_eq!(out.consume_all(), b"ok\r\n");
}

proptest! {
    #[test]
    fn arbitrary_input_yields_clean_lines(input in proptest::collection::vec(any::<u8>(), 0..512)) {
        let mut n = negotiator(StartTlsPolicy::Disabled);
        let mut app = ByteBuffer::new();
        let mut responses = ByteBuffer::new();
        if let Ok(consumed) = n.process_input(&input, &mut app, &mut responses) {
            prop_assert_eq!(consumed, input.len());
        }
        let app = app.consume_all();
        prop_assert!(!app.contains(&b'\r'));
        prop_assert!(app.is_empty() || app.ends_with(b"\n"));
    }

    #[test]
    fn formatted_text_parses_back_to_its_lines(body in proptest::collection::vec(any::<u8>(), 0..256)) {
        let mut text = body;
        text.push(b'\n');

        let n = negotiator(StartTlsPolicy::Disabled);
        let mut wire = ByteBuffer::new();
        n.format_output(&text, &mut wire);

        let mut parser = negotiator(StartTlsPolicy::Disabled);
        let out = feed(&mut parser, &wire.consume_all());
        prop_assert!(out.responses.is_empty());

        // CR LF, bare CR and bare LF each end one line.
        let mut expected = Vec::with_capacity(text.len());
        let mut i = 0;
        while i < text.len() {
            match text[i] {
                b'\r' if text.get(i + 1) == Some(&b'\n') => {
                    expected.push(b'\n');
                    i += 1;
                }
                b'\r' | b'\n' => expected.push(b'\n'),
                byte => expected.push(byte),
            }
            i += 1;
        }
        prop_assert_eq!(out.app, expected);
    }
}
