//! Bounded line assembly for raw telnet input. Bytes arrive in arbitrary
//! chunks; this folds them into complete lines with backspace editing,
//! a printable-ASCII filter, and a hard per-line cap. Anything beyond the
//! cap is dropped until the next line break, so a hostile client cannot
//! grow a line without bound.

use bytes::BytesMut;

const BACKSPACE: u8 = 0x08;
const DELETE: u8 = 0x7f;

/// One finished line. `Truncated` means the cap was hit and the tail of the
/// client's line was discarded; callers usually echo the kept portion back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assembled {
    Line(String),
    Truncated(String),
}

impl Assembled {
    pub fn text(&self) -> &str {
        match self {
            Assembled::Line(s) | Assembled::Truncated(s) => s,
        }
    }
}

pub struct LineAssembler {
    buf: BytesMut,
    max_len: usize,
    /// Dropping input until the next line break after a cap hit.
    discard: bool,
    /// The last byte was a CR; exactly one following LF belongs to it.
    swallow_lf: bool,
}

impl LineAssembler {
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_len,
            discard: false,
            swallow_lf: false,
        }
    }

    /// Fold `data` into the pending line, pushing finished lines onto `out`.
    /// CRLF ends one line; a lone CR or LF also ends one, so a bare Enter
    /// comes through as an empty line rather than disappearing.
    pub fn feed(&mut self, data: &[u8], out: &mut Vec<Assembled>) {
        for &b in data {
            if b == b'\n' && self.swallow_lf {
                self.swallow_lf = false;
                continue;
            }
            self.swallow_lf = false;
            if b == b'\r' || b == b'\n' {
                self.swallow_lf = b == b'\r';
                if self.discard {
                    // The truncated line was already emitted.
                    self.discard = false;
                } else {
                    out.push(Assembled::Line(self.take_line()));
                }
                continue;
            }
            if self.discard {
                continue;
            }
            match b {
                BACKSPACE | DELETE => {
                    let len = self.buf.len();
                    self.buf.truncate(len.saturating_sub(1));
                }
                0x20..=0x7e => {
                    if self.buf.len() >= self.max_len {
                        out.push(Assembled::Truncated(self.take_line()));
                        self.discard = true;
                    } else {
                        self.buf.extend_from_slice(&[b]);
                    }
                }
                // Control bytes and high-bit noise are dropped.
                _ => {}
            }
        }
    }

    fn take_line(&mut self) -> String {
        let bytes = self.buf.split().freeze();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Bytes currently buffered toward an unfinished line.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(a: &mut LineAssembler, data: &[u8]) -> Vec<Assembled> {
        let mut out = Vec::new();
        a.feed(data, &mut out);
        out
    }

    #[test]
    fn assembles_a_simple_line() {
        let mut a = LineAssembler::new(80);
        assert_eq!(
            feed(&mut a, b"look\r\n"),
            vec![Assembled::Line("look".into())]
        );
    }

    #[test]
    fn reassembles_across_chunks() {
        let mut a = LineAssembler::new(80);
        assert!(feed(&mut a, b"say hel").is_empty());
        assert_eq!(
            feed(&mut a, b"lo\r\nnor"),
            vec![Assembled::Line("say hello".into())]
        );
        assert_eq!(feed(&mut a, b"th\n"), vec![Assembled::Line("north".into())]);
    }

    #[test]
    fn crlf_counts_as_one_break() {
        let mut a = LineAssembler::new(80);
        assert_eq!(
            feed(&mut a, b"hi\r\n\r\n"),
            vec![Assembled::Line("hi".into()), Assembled::Line("".into())]
        );
        assert_eq!(feed(&mut a, b"yo\n"), vec![Assembled::Line("yo".into())]);
    }

    #[test]
    fn bare_enter_after_a_line_comes_through_empty() {
        let mut a = LineAssembler::new(80);
        assert_eq!(
            feed(&mut a, b"look\r\n"),
            vec![Assembled::Line("look".into())]
        );
        // A later Enter on its own is a real (empty) line, not noise.
        assert_eq!(feed(&mut a, b"\r\n"), vec![Assembled::Line("".into())]);
    }

    #[test]
    fn crlf_split_across_feeds_is_still_one_break() {
        let mut a = LineAssembler::new(80);
        assert_eq!(feed(&mut a, b"who\r"), vec![Assembled::Line("who".into())]);
        assert_eq!(feed(&mut a, b"\n"), vec![]);
    }

    #[test]
    fn applies_backspace_editing() {
        let mut a = LineAssembler::new(80);
        assert_eq!(
            feed(&mut a, b"nortj\x08h\r\n"),
            vec![Assembled::Line("north".into())]
        );
    }

    #[test]
    fn backspace_on_empty_line_is_harmless() {
        let mut a = LineAssembler::new(80);
        assert_eq!(
            feed(&mut a, b"\x08\x08ok\r\n"),
            vec![Assembled::Line("ok".into())]
        );
    }

    #[test]
    fn drops_unprintable_bytes() {
        let mut a = LineAssembler::new(80);
        assert_eq!(
            feed(&mut a, b"l\x01o\x02ok\t\r\n"),
            vec![Assembled::Line("look".into())]
        );
    }

    #[test]
    fn truncates_overlong_line_and_discards_tail() {
        let mut a = LineAssembler::new(5);
        let out = feed(&mut a, b"abcdefghij\r\nnext\r\n");
        assert_eq!(
            out,
            vec![
                Assembled::Truncated("abcde".into()),
                Assembled::Line("next".into()),
            ]
        );
    }

    #[test]
    fn truncation_split_across_chunks() {
        let mut a = LineAssembler::new(4);
        assert_eq!(feed(&mut a, b"abcd"), vec![]);
        assert_eq!(feed(&mut a, b"ef"), vec![Assembled::Truncated("abcd".into())]);
        assert_eq!(feed(&mut a, b"gh\r\nok\r\n"), vec![Assembled::Line("ok".into())]);
    }
}
