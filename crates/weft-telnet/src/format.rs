//! Output escaping: NVT line endings, IAC doubling and ANSI stripping.

use weft_buffer::ByteBuffer;

use crate::consts::{CR, ESC, IAC, LF, NUL};

const BEL: u8 = 0x07;

/// Appends `text` to `out` in wire form.
///
/// `\n` becomes CR LF (an existing CR LF is kept as is), a bare CR becomes
/// CR NUL, and 0xFF is doubled. With `strip_ansi` escape sequences are
/// dropped.
pub fn escape_output(text: &[u8], strip_ansi: bool, out: &mut ByteBuffer) {
    let mut escaped = Vec::with_capacity(text.len() + text.len() / 16 + 2);
    let mut i = 0;

    while i < text.len() {
        match text[i] {
            ESC if strip_ansi => {
                i = skip_escape(text, i);
                continue;
            }
            LF => escaped.extend_from_slice(&[CR, LF]),
            CR if text.get(i + 1) == Some(&LF) => {
                escaped.extend_from_slice(&[CR, LF]);
                i += 1;
            }
            CR => escaped.extend_from_slice(&[CR, NUL]),
            IAC => escaped.extend_from_slice(&[IAC, IAC]),
            byte => escaped.push(byte),
        }
        i += 1;
    }

    out.append(&escaped);
}

/// Returns the index just past the escape sequence starting at `start`.
fn skip_escape(text: &[u8], start: usize) -> usize {
    let Some(&kind) = text.get(start + 1) else {
        return text.len();
    };
    match kind {
        // CSI: parameters and intermediates, then one final byte.
        b'[' => text[start + 2..]
            .iter()
            .position(|b| (0x40..=0x7e).contains(b))
            .map_or(text.len(), |p| start + 2 + p + 1),
        // OSC: terminated by BEL or ST (ESC \).
        b']' => {
            let mut i = start + 2;
            while i < text.len() {
                if text[i] == BEL {
                    return i + 1;
                }
                if text[i] == ESC && text.get(i + 1) == Some(&b'\\') {
                    return i + 2;
                }
                i += 1;
            }
            text.len()
        }
        _ => start + 2,
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use test_case::test_case;

    use super::*;

    fn escape(text: &[u8], strip: bool) -> Vec<u8> {
        let mut out = ByteBuffer::new();
        escape_output(text, strip, &mut out);
        out.consume_all()
    }

    #[test_case(b"hi\n", b"hi\r\n"; "bare lf")]
    #[test_case(b"hi\r\n", b"hi\r\n"; "crlf kept")]
    #[test_case(b"a\rb", b"a\r\0b"; "bare cr")]
    #[test_case(b"x\xffy", b"x\xff\xffy"; "iac doubled")]
    #[test_case(b"\x1b[1;31mred\x1b[0m", b"\x1b[1;31mred\x1b[0m"; "ansi kept")]
    fn escapes(input: &[u8], expected: &[u8]) {
        assert_eq!(escape(input, false), expected);
    }

    #[test_case(b"\x1b[1;31mred\x1b[0m\n", b"red\r\n"; "sgr")]
    #[test_case(b"\x1b]0;title\x07text", b"text"; "osc bel")]
    #[test_case(b"\x1b]0;title\x1b\\text", b"text"; "osc st")]
    #[test_case(b"a\x1b(Bb", b"aBb"; "two byte escape")]
    #[test_case(b"cut\x1b[12", b"cut"; "truncated csi")]
    fn strips_ansi(input: &[u8], expected: &[u8]) {
        assert_eq!(escape(input, true), expected);
    }

    proptest! {
        #[test]
        fn wire_form_is_nvt_clean(text in proptest::collection::vec(any::<u8>(), 0..256)) {
            let wire = escape(&text, false);

            let mut i = 0;
            while i < wire.len() {
                match wire[i] {
                    LF => prop_assert!(i > 0 && wire[i - 1] == CR, "bare LF at {}", i),
                    CR => prop_assert!(matches!(wire.get(i + 1), Some(&LF) | Some(&NUL))),
                    IAC => {
                        prop_assert_eq!(wire.get(i + 1), Some(&IAC));
                        i += 1;
                    }
                    _ => {}
                }
                i += 1;
            }
        }
    }
}
