use bytes::{BufMut, Bytes, BytesMut};

/// Separator placed between payloads that share one outgoing frame.
pub const DELIMITER: u8 = b'\n';

/// Sanitizes an inbound payload before it is fanned out.
///
/// Each run of line breaks, together with the whitespace around it, becomes a
/// single space, and the outer whitespace margin is stripped. A multi-line
/// paste therefore travels as one line and never splits into several frames
/// on the receiving side.
///
/// UTF-8 payloads are trimmed of any Unicode whitespace (`U+3000`, `U+00A0`,
/// ...). Other payloads only lose ASCII whitespace.
pub fn normalize(payload: &[u8]) -> Bytes {
    match std::str::from_utf8(payload) {
        Ok(text) => normalize_text(text),
        Err(_) => normalize_raw(payload),
    }
}

fn normalize_text(text: &str) -> Bytes {
    let mut out = String::with_capacity(text.len());
    let mut pending_break = false;

    for ch in text.chars() {
        if ch == '\n' || ch == '\r' {
            out.truncate(out.trim_end().len());
            pending_break = true;
        } else if ch.is_whitespace() {
            if !pending_break {
                out.push(ch);
            }
        } else {
            if pending_break && !out.is_empty() {
                out.push(' ');
            }
            pending_break = false;
            out.push(ch);
        }
    }

    out.truncate(out.trim_end().len());
    let start = out.len() - out.trim_start().len();
    Bytes::from(out).slice(start..)
}

fn normalize_raw(payload: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(payload.len());
    let mut pending_break = false;

    for &byte in payload {
        if is_line_break(byte) {
            trim_trailing_whitespace(&mut out);
            pending_break = true;
        } else if byte.is_ascii_whitespace() {
            if !pending_break {
                out.push(byte);
            }
        } else {
            if pending_break && !out.is_empty() {
                out.push(b' ');
            }
            pending_break = false;
            out.push(byte);
        }
    }

    trim_trailing_whitespace(&mut out);
    let start = out
        .iter()
        .position(|byte| !byte.is_ascii_whitespace())
        .unwrap_or(out.len());
    Bytes::from(out).slice(start..)
}

/// Joins payloads into one frame body, separated by [`DELIMITER`].
pub fn coalesce<I>(first: Bytes, rest: I) -> Bytes
where
    I: IntoIterator<Item = Bytes>,
{
    let mut rest = rest.into_iter().peekable();
    if rest.peek().is_none() {
        return first;
    }

    let mut frame = BytesMut::from(&first[..]);
    for payload in rest {
        frame.put_u8(DELIMITER);
        frame.extend_from_slice(&payload);
    }
    frame.freeze()
}

fn is_line_break(byte: u8) -> bool {
    byte == b'\n' || byte == b'\r'
}

fn trim_trailing_whitespace(buf: &mut Vec<u8>) {
    while buf.last().is_some_and(u8::is_ascii_whitespace) {
        buf.pop();
    }
}
