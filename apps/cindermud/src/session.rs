//! One connected client. A session owns its socket, protocol parser, line
//! assembler, input queue, and output buffer; everything else about it
//! (its character, pending events) lives elsewhere keyed by `SessionId`.

use std::collections::VecDeque;
use std::io;

use cinderio::line::{Assembled, LineAssembler};
use cinderio::telnet::{TelnetEvent, TelnetParser};
use tokio::net::TcpStream;

use crate::output::OutputBuffer;
use crate::pager::Pager;
use crate::world::CharId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a connection is in its lifecycle. Input routing dispatches on
/// this, so a session can only ever be in exactly one mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Fresh connection answering the terminal questions.
    Negotiating,
    /// Choosing a name.
    Authenticating,
    /// At the account menu.
    InMenu,
    /// In the game proper.
    Playing,
    /// Composing multi-line text in the editor.
    EditingText,
    /// Marked for teardown at the end of the tick.
    Closing,
}

/// What queueing one input line wants the caller to do.
#[derive(Debug, PartialEq, Eq)]
pub enum QueueNote {
    Queued,
    /// History substitution succeeded; echo the resulting command first.
    Echo(String),
    /// `^old^new` where `old` was not in the previous command.
    BadSubst,
}

/// Everything one socket read produced.
pub struct ReadResult {
    pub events: Vec<TelnetEvent>,
    pub lines: Vec<Assembled>,
    pub eof: bool,
}

pub struct Session {
    pub stream: TcpStream,
    pub host: String,
    pub state: ConnState,
    parser: TelnetParser,
    assembler: LineAssembler,
    pub inq: VecDeque<String>,
    pub last_input: String,
    pub output: OutputBuffer,
    /// Bytes ready for the socket; drained by `try_flush_tx`.
    pub tx: Vec<u8>,
    /// The last thing on the wire was a prompt, so fresh output needs a
    /// leading line break.
    pub has_prompt: bool,
    /// A prompt should be written at the end of this tick.
    pub prompt_due: bool,
    /// Pulses to skip before the next queued command runs.
    pub wait: u32,
    pub color: bool,
    pub gmcp: bool,
    pub char_id: Option<CharId>,
    pub pending_name: Option<String>,
    /// Session this one is watching, and the one watching this one.
    pub snooping: Option<SessionId>,
    pub snooped_by: Option<SessionId>,
    pub pager: Option<Pager>,
    pub editor: Option<Editor>,
    pub idle_pulses: u64,
    pub connected_pulse: u64,
    pub commands: u64,
}

impl Session {
    pub fn new(
        stream: TcpStream,
        host: String,
        small_buf: usize,
        max_line: usize,
        max_subneg: usize,
        connected_pulse: u64,
    ) -> Self {
        Self {
            stream,
            host,
            state: ConnState::Negotiating,
            parser: TelnetParser::new(max_subneg),
            assembler: LineAssembler::new(max_line),
            inq: VecDeque::new(),
            last_input: String::new(),
            output: OutputBuffer::new(small_buf),
            tx: Vec::new(),
            has_prompt: false,
            prompt_due: false,
            wait: 0,
            color: false,
            gmcp: false,
            char_id: None,
            pending_name: None,
            snooping: None,
            snooped_by: None,
            pager: None,
            editor: None,
            idle_pulses: 0,
            connected_pulse,
            commands: 0,
        }
    }

    /// Drain whatever the socket has right now without blocking. A clean
    /// remote close surfaces as `eof`; transient emptiness is just an
    /// empty result.
    pub fn read_available(&mut self) -> io::Result<ReadResult> {
        let mut events = Vec::new();
        let mut lines = Vec::new();
        let mut eof = false;
        let mut chunk = [0u8; 2048];
        loop {
            match self.stream.try_read(&mut chunk) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(n) => {
                    let mut data = Vec::with_capacity(n);
                    self.parser.feed(&chunk[..n], &mut data, &mut events);
                    self.assembler.feed(&data, &mut lines);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(ReadResult { events, lines, eof })
    }

    /// Queue one assembled line as a command, applying history expansion
    /// first: a bare `!` repeats the previous command, `^old^new` edits
    /// it. The stored form has `$` doubled so user text survives the
    /// message formatter untouched.
    pub fn queue_command(&mut self, line: &str) -> QueueNote {
        let mut note = QueueNote::Queued;
        let expanded = if line == "!" {
            self.last_input.clone()
        } else if let Some(rest) = line.strip_prefix('^') {
            let (old, new) = match rest.split_once('^') {
                Some((o, n)) => (o, n),
                None => (rest, ""),
            };
            if old.is_empty() || !self.last_input.contains(old) {
                return QueueNote::BadSubst;
            }
            let subst = self.last_input.replacen(old, new, 1);
            note = QueueNote::Echo(subst.clone());
            subst
        } else {
            line.to_string()
        };
        if !expanded.is_empty() {
            self.last_input = expanded.clone();
        }
        self.inq.push_back(expanded.replace('$', "$$"));
        note
    }

    /// Push as much of the pending output as the socket will take. Leftover
    /// bytes stay queued for the next tick.
    pub fn try_flush_tx(&mut self) -> io::Result<()> {
        let mut written = 0;
        while written < self.tx.len() {
            match self.stream.try_write(&self.tx[written..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        self.tx.drain(..written);
        Ok(())
    }
}

/// Multi-line text editor. Lines accumulate until a lone `@`; the caller
/// decides what the finished text is for.
pub struct Editor {
    lines: Vec<String>,
    max_lines: usize,
}

/// Editor response to one input line.
#[derive(Debug, PartialEq, Eq)]
pub enum EditStep {
    More,
    Done(String),
}

impl Editor {
    pub fn new(max_lines: usize) -> Self {
        Self {
            lines: Vec::new(),
            max_lines,
        }
    }

    pub fn feed(&mut self, line: &str) -> EditStep {
        if line.trim() == "@" {
            return EditStep::Done(self.lines.join("\r\n"));
        }
        self.lines.push(line.to_string());
        if self.lines.len() >= self.max_lines {
            return EditStep::Done(self.lines.join("\r\n"));
        }
        EditStep::More
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn wired_session() -> (Session, TcpStream) {
        // A connected pair just to satisfy the struct; tests below never
        // touch the socket.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server_side, _) = listener.accept().await.unwrap();
        let s = Session::new(server_side, "test".into(), 1024, 512, 256, 0);
        (s, client)
    }

    #[tokio::test]
    async fn read_available_splits_protocol_from_lines() {
        use tokio::io::AsyncWriteExt;
        let (mut s, mut client) = wired_session().await;
        client
            .write_all(&[255, 253, 201, b'h', b'i', b'\r', b'\n'])
            .await
            .unwrap();
        s.stream.readable().await.unwrap();
        let r = s.read_available().unwrap();
        assert!(!r.eof);
        assert_eq!(r.events, vec![TelnetEvent::Do(201)]);
        assert_eq!(r.lines, vec![Assembled::Line("hi".into())]);
    }

    #[tokio::test]
    async fn read_available_reports_eof() {
        let (mut s, client) = wired_session().await;
        drop(client);
        s.stream.readable().await.unwrap();
        let r = s.read_available().unwrap();
        assert!(r.eof);
    }

    #[tokio::test]
    async fn bang_repeats_last_command() {
        let (mut s, _client) = wired_session().await;
        assert_eq!(s.queue_command("say hi"), QueueNote::Queued);
        assert_eq!(s.queue_command("!"), QueueNote::Queued);
        assert_eq!(s.inq.pop_front().unwrap(), "say hi");
        assert_eq!(s.inq.pop_front().unwrap(), "say hi");
    }

    #[tokio::test]
    async fn caret_substitutes_into_last_command() {
        let (mut s, _client) = wired_session().await;
        s.queue_command("tell bob heya");
        assert_eq!(
            s.queue_command("^bob^ann"),
            QueueNote::Echo("tell ann heya".into())
        );
        s.inq.pop_front();
        assert_eq!(s.inq.pop_front().unwrap(), "tell ann heya");
        // The substituted form becomes the new history entry.
        s.queue_command("!");
        assert_eq!(s.inq.pop_front().unwrap(), "tell ann heya");
    }

    #[tokio::test]
    async fn bad_substitution_is_reported_not_queued() {
        let (mut s, _client) = wired_session().await;
        s.queue_command("look");
        assert_eq!(s.queue_command("^zzz^yyy"), QueueNote::BadSubst);
        s.inq.pop_front();
        assert!(s.inq.is_empty());
    }

    #[tokio::test]
    async fn empty_line_does_not_clobber_history() {
        let (mut s, _client) = wired_session().await;
        s.queue_command("score");
        s.queue_command("");
        s.queue_command("!");
        s.inq.pop_front();
        s.inq.pop_front();
        assert_eq!(s.inq.pop_front().unwrap(), "score");
    }

    #[tokio::test]
    async fn dollar_signs_are_doubled_on_queue() {
        let (mut s, _client) = wired_session().await;
        s.queue_command("say costs 5$ now");
        assert_eq!(s.inq.pop_front().unwrap(), "say costs 5$$ now");
    }

    #[test]
    fn editor_finishes_on_at_sign() {
        let mut e = Editor::new(10);
        assert_eq!(e.feed("first"), EditStep::More);
        assert_eq!(e.feed("second"), EditStep::More);
        assert_eq!(e.feed("@"), EditStep::Done("first\r\nsecond".into()));
    }

    #[test]
    fn editor_caps_line_count() {
        let mut e = Editor::new(2);
        assert_eq!(e.feed("one"), EditStep::More);
        assert!(matches!(e.feed("two"), EditStep::Done(_)));
    }
}
