//! Controller line-protocol codec.
//!
//! Requests are one or more `ID.CMD [ARG…]` items joined by `;` and
//! terminated by `\n`. The single-letter ID is chosen by the caller and
//! echoed by the device, correlating each reply with a response class:
//!
//! | ID | class |
//! |----|-------|
//! | a  | serial number |
//! | b  | free-form log (version) |
//! | c  | no reply needed (side effects) |
//! | d  | ADC read (unused server-side) |
//! | e  | operator echo, may span lines |
//! | f  | motor feedback |
//! | g  | limit-switch bitfield |
//! | z  | watchdog-disable acknowledge |
//!
//! Replies are `ID.OK RESP` / `ID.BAD RESP` lines. Packets may carry NUL
//! terminators; lines missing the `ID.` prefix continue the previous `e.`
//! reply.

/// Join `cmds` into one request frame, prepending `id` to every item.
///
/// The firmware assigns the echoed prefix strictly per command, so a
/// multi-command poll needs the class letter on each item for all replies
/// to come back in that class.
pub fn encode_class(id: char, cmds: &[&str]) -> String {
    let mut out = String::new();
    for (i, cmd) in cmds.iter().enumerate() {
        if i > 0 {
            out.push(';');
        }
        out.push(id);
        out.push('.');
        out.push_str(cmd);
    }
    out.push('\n');
    out
}

/// Join pre-tagged `(id, cmd)` items into one request frame.
pub fn encode(items: &[(char, &str)]) -> String {
    let mut out = String::new();
    for (i, (id, cmd)) in items.iter().enumerate() {
        if i > 0 {
            out.push(';');
        }
        out.push(*id);
        out.push('.');
        out.push_str(cmd);
    }
    out.push('\n');
    out
}

/// One parsed response line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseLine {
    Reply { id: char, ok: bool, body: String },
    /// No `ID.` prefix: continuation of the previous `e.` reply.
    Continuation(String),
}

/// Parse a single non-empty line (already NUL-stripped).
pub fn parse_line(line: &str) -> ResponseLine {
    let bytes = line.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_lowercase() && bytes[1] == b'.' {
        let rest = &line[2..];
        let (status, body) = match rest.split_once(' ') {
            Some((s, b)) => (s, b),
            None => (rest, ""),
        };
        let ok = match status {
            "OK" => true,
            "BAD" => false,
            _ => return ResponseLine::Continuation(line.to_string()),
        };
        return ResponseLine::Reply {
            id: bytes[0] as char,
            ok,
            body: body.to_string(),
        };
    }
    ResponseLine::Continuation(line.to_string())
}

/// Reassembles complete lines from arbitrary transport chunks.
///
/// Splits on `\n`, strips each line at the first NUL, and drops empty
/// lines, so packet-padding terminators and truncated startup fragments
/// never reach the parser.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: String,
}

/// Partial-line data older than this is considered garbage and dropped.
const MAX_PARTIAL: usize = 4096;

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns the complete lines it finished.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.push_str(&String::from_utf8_lossy(bytes));
        let mut lines = Vec::new();
        while let Some(nl) = self.buf.find('\n') {
            let mut line: String = self.buf.drain(..=nl).collect();
            line.pop();
            let line = match line.find('\0') {
                Some(z) => &line[..z],
                None => &line[..],
            };
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }
        if self.buf.len() > MAX_PARTIAL {
            self.buf.clear();
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_prepends_class_to_every_item() {
        let frame = encode_class('f', &["m0", "m1", "m2"]);
        assert_eq!(frame, "f.m0;f.m1;f.m2\n");
    }

    #[test]
    fn encode_mixed_ids() {
        let frame = encode(&[('a', "ser"), ('b', "ver")]);
        assert_eq!(frame, "a.ser;b.ver\n");
    }

    #[test]
    fn parse_ok_and_bad() {
        assert_eq!(
            parse_line("a.OK ffffffff3850313339302020ff0e20"),
            ResponseLine::Reply {
                id: 'a',
                ok: true,
                body: "ffffffff3850313339302020ff0e20".into()
            }
        );
        assert_eq!(
            parse_line("f.BAD unknown cmd"),
            ResponseLine::Reply {
                id: 'f',
                ok: false,
                body: "unknown cmd".into()
            }
        );
        assert_eq!(
            parse_line("z.OK"),
            ResponseLine::Reply {
                id: 'z',
                ok: true,
                body: String::new()
            }
        );
    }

    #[test]
    fn unprefixed_line_is_continuation() {
        assert_eq!(
            parse_line("second line of an operator echo"),
            ResponseLine::Continuation("second line of an operator echo".into())
        );
        // A dot in the wrong place is not a prefix either.
        assert_eq!(
            parse_line("A.OK shouty"),
            ResponseLine::Continuation("A.OK shouty".into())
        );
    }

    #[test]
    fn line_buffer_strips_nuls_and_empties() {
        let mut lb = LineBuffer::new();
        let lines = lb.push(b"a.OK 1234\0\n\nb.OK Version 1.08 (CUTE)\n");
        assert_eq!(lines, vec!["a.OK 1234", "b.OK Version 1.08 (CUTE)"]);
    }

    #[test]
    fn line_buffer_reassembles_split_chunks() {
        let mut lb = LineBuffer::new();
        assert!(lb.push(b"f.OK m0 SPD=+10").is_empty());
        let lines = lb.push(b"0 POS=42\ng.OK ");
        assert_eq!(lines, vec!["f.OK m0 SPD=+100 POS=42"]);
        let lines = lb.push(b"pa0-5 VAL=111111\n");
        assert_eq!(lines, vec!["g.OK pa0-5 VAL=111111"]);
    }
}
