//! Interactive pager for long text. The text is split into display lines,
//! wrapped to the page width, and shown one page at a time; while a pager
//! is active it captures the session's input for navigation. The retained
//! text is byte-capped so one command cannot pin unbounded memory, with a
//! banner reporting how many lines were dropped.

use crate::color::visible_width;

pub const PAGE_WIDTH: usize = 120;
pub const DEFAULT_PAGE_LENGTH: usize = 22;
pub const MAX_PAGE_BYTES: usize = 80 * 1024;

/// Result of feeding one line of navigation input.
#[derive(Debug, PartialEq, Eq)]
pub enum Step {
    /// Display the (possibly moved-to) current page.
    Show,
    /// The session quit the pager; show nothing.
    Quit,
}

pub struct Pager {
    lines: Vec<String>,
    page: usize,
    page_len: usize,
    skipped: usize,
}

impl Pager {
    pub fn new(text: &str, page_len: usize, width: usize, max_bytes: usize) -> Self {
        let mut lines = Vec::new();
        let mut skipped = 0usize;
        let mut bytes = 0usize;
        // A trailing newline terminates the last line, it does not open
        // an empty one.
        let text = text.strip_suffix('\n').unwrap_or(text);
        for raw in text.split('\n') {
            let raw = raw.strip_suffix('\r').unwrap_or(raw);
            for piece in wrap_line(raw, width) {
                if bytes + piece.len() + 2 > max_bytes {
                    skipped += 1;
                } else {
                    bytes += piece.len() + 2;
                    lines.push(piece);
                }
            }
        }
        if lines.is_empty() {
            lines.push(String::new());
        }
        Self {
            lines,
            page: 0,
            page_len: page_len.max(1),
            skipped,
        }
    }

    /// Total page count, always at least one.
    pub fn pages(&self) -> usize {
        self.lines.len().div_ceil(self.page_len)
    }

    /// Current page, 1-based for display.
    pub fn current(&self) -> usize {
        self.page + 1
    }

    pub fn on_last_page(&self) -> bool {
        self.page + 1 >= self.pages()
    }

    /// Banner shown once at pager start when the byte cap dropped lines.
    pub fn overflow_banner(&self) -> Option<String> {
        if self.skipped == 0 {
            return None;
        }
        Some(format!(
            "***   OVERFLOW  {} line{} skipped   ***\r\n\r\n",
            self.skipped,
            if self.skipped == 1 { "" } else { "s" }
        ))
    }

    /// The current page's text, newline terminated.
    pub fn page_text(&self) -> String {
        let start = self.page * self.page_len;
        let end = (start + self.page_len).min(self.lines.len());
        let mut out = String::new();
        for line in &self.lines[start..end] {
            out.push_str(line);
            out.push_str("\r\n");
        }
        out
    }

    pub fn prompt(&self) -> String {
        format!(
            "\r[ Return to continue, (q)uit, (r)efresh, (b)ack, or page number ({}/{}) ]\r\n",
            self.current(),
            self.pages()
        )
    }

    /// Interpret one line of navigation input. Empty input advances, `q`
    /// quits, `r` refreshes, `b` goes back, a number jumps to that page
    /// (clamped), and anything else quits. Page moves clamp to range.
    pub fn handle_input(&mut self, input: &str) -> Step {
        let word = input.split_whitespace().next().unwrap_or("");
        let target = if word.is_empty() {
            self.page as i64 + 1
        } else if word.chars().next().is_some_and(|c| c.is_ascii_digit()) {
            word.parse::<i64>().unwrap_or(1) - 1
        } else {
            match word.chars().next().map(|c| c.to_ascii_lowercase()) {
                Some('q') => return Step::Quit,
                Some('r') => self.page as i64,
                Some('b') => self.page as i64 - 1,
                _ => return Step::Quit,
            }
        };
        self.page = target.clamp(0, self.pages() as i64 - 1) as usize;
        Step::Show
    }
}

/// Split one logical line at `width` visible columns, keeping color markup
/// and ANSI escapes out of the column count.
fn wrap_line(line: &str, width: usize) -> Vec<String> {
    if visible_width(line) <= width {
        return vec![line.to_string()];
    }
    let mut out = Vec::new();
    let mut piece: Vec<u8> = Vec::new();
    let mut col = 0;
    let bytes = line.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let (len, cols) = match bytes[i] {
            b'&' if i + 1 < bytes.len() => (2, if bytes[i + 1] == b'&' { 1 } else { 0 }),
            0x1b if bytes.get(i + 1) == Some(&b'[') => {
                let mut j = i + 2;
                while j < bytes.len() && !bytes[j].is_ascii_alphabetic() {
                    j += 1;
                }
                ((j + 1).min(bytes.len()) - i, 0)
            }
            _ => (1, 1),
        };
        if col + cols > width {
            out.push(String::from_utf8_lossy(&std::mem::take(&mut piece)).into_owned());
            col = 0;
        }
        piece.extend_from_slice(&bytes[i..i + len]);
        col += cols;
        i += len;
    }
    if !piece.is_empty() {
        out.push(String::from_utf8_lossy(&piece).into_owned());
    }
    out
}
