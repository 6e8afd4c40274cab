//! Telnet IAC parser. Splits an inbound byte stream into clean application
//! data plus protocol events (option negotiation and subnegotiation
//! payloads). Policy lives in the caller; this module only recognizes the
//! framing and never decides how to answer.

pub const IAC: u8 = 255;
pub const DONT: u8 = 254;
pub const DO: u8 = 253;
pub const WONT: u8 = 252;
pub const WILL: u8 = 251;
pub const SB: u8 = 250;
pub const GA: u8 = 249;
pub const SE: u8 = 240;

pub const OPT_ECHO: u8 = 1;
/// Generic MUD Communication Protocol, carried in telnet option 201.
pub const OPT_GMCP: u8 = 201;

/// Protocol event surfaced to the caller alongside clean data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelnetEvent {
    Will(u8),
    Wont(u8),
    Do(u8),
    Dont(u8),
    /// A complete `IAC SB <opt> ... IAC SE` frame. `truncated` is set when
    /// the payload exceeded the parser cap and the tail was discarded.
    Subneg {
        opt: u8,
        payload: Vec<u8>,
        truncated: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Data,
    Iac,
    Negotiate(u8),
    SubnegOpt,
    Subneg,
    SubnegIac,
}

/// Incremental telnet parser. Safe to feed arbitrary chunk boundaries;
/// sequences split across reads are reassembled.
pub struct TelnetParser {
    state: State,
    sub_opt: u8,
    sub_buf: Vec<u8>,
    sub_truncated: bool,
    max_subneg: usize,
}

impl TelnetParser {
    pub fn new(max_subneg: usize) -> Self {
        Self {
            state: State::Data,
            sub_opt: 0,
            sub_buf: Vec::new(),
            sub_truncated: false,
            max_subneg,
        }
    }

    /// Consume `chunk`, appending clean application bytes to `data` and
    /// protocol events to `events`, in stream order relative to each other.
    pub fn feed(&mut self, chunk: &[u8], data: &mut Vec<u8>, events: &mut Vec<TelnetEvent>) {
        let mut i = 0;
        while i < chunk.len() {
            let b = chunk[i];
            i += 1;
            match self.state {
                State::Data => {
                    if b == IAC {
                        self.state = State::Iac;
                    } else {
                        // Plain data runs to the next IAC in one copy.
                        let start = i - 1;
                        let end = memchr::memchr(IAC, &chunk[i..])
                            .map(|off| i + off)
                            .unwrap_or(chunk.len());
                        data.extend_from_slice(&chunk[start..end]);
                        i = end;
                    }
                }
                State::Iac => match b {
                    IAC => {
                        // Escaped 0xFF is literal data.
                        data.push(IAC);
                        self.state = State::Data;
                    }
                    WILL | WONT | DO | DONT => self.state = State::Negotiate(b),
                    SB => self.state = State::SubnegOpt,
                    // NOP, GA, and other two-byte commands are dropped.
                    _ => self.state = State::Data,
                },
                State::Negotiate(cmd) => {
                    events.push(match cmd {
                        WILL => TelnetEvent::Will(b),
                        WONT => TelnetEvent::Wont(b),
                        DO => TelnetEvent::Do(b),
                        _ => TelnetEvent::Dont(b),
                    });
                    self.state = State::Data;
                }
                State::SubnegOpt => {
                    self.sub_opt = b;
                    self.sub_buf.clear();
                    self.sub_truncated = false;
                    self.state = State::Subneg;
                }
                State::Subneg => {
                    if b == IAC {
                        self.state = State::SubnegIac;
                    } else {
                        self.push_sub(b);
                    }
                }
                State::SubnegIac => match b {
                    SE => {
                        events.push(TelnetEvent::Subneg {
                            opt: self.sub_opt,
                            payload: std::mem::take(&mut self.sub_buf),
                            truncated: self.sub_truncated,
                        });
                        self.state = State::Data;
                    }
                    IAC => {
                        self.push_sub(IAC);
                        self.state = State::Subneg;
                    }
                    // Malformed frame; drop it and resync on data.
                    _ => {
                        self.sub_buf.clear();
                        self.state = State::Data;
                    }
                },
            }
        }
    }

    fn push_sub(&mut self, b: u8) {
        if self.sub_buf.len() < self.max_subneg {
            self.sub_buf.push(b);
        } else {
            self.sub_truncated = true;
        }
    }
}

/// `IAC WILL <opt>`, the server offering an option.
pub fn will(opt: u8) -> [u8; 3] {
    [IAC, WILL, opt]
}

pub fn wont(opt: u8) -> [u8; 3] {
    [IAC, WONT, opt]
}

/// `IAC DONT <opt>`, refusing an option the peer offered.
pub fn dont(opt: u8) -> [u8; 3] {
    [IAC, DONT, opt]
}

/// `IAC GA`, sent after a prompt for clients that track it.
pub const GA_SEQ: [u8; 2] = [IAC, GA];

/// Frame a subnegotiation payload, escaping embedded 0xFF bytes.
pub fn subneg_frame(opt: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 5);
    out.extend_from_slice(&[IAC, SB, opt]);
    for &b in payload {
        if b == IAC {
            out.push(IAC);
        }
        out.push(b);
    }
    out.extend_from_slice(&[IAC, SE]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(parser: &mut TelnetParser, input: &[u8]) -> (Vec<u8>, Vec<TelnetEvent>) {
        let mut data = Vec::new();
        let mut events = Vec::new();
        parser.feed(input, &mut data, &mut events);
        (data, events)
    }

    #[test]
    fn passes_plain_data() {
        let mut p = TelnetParser::new(256);
        let (data, events) = run(&mut p, b"look north\r\n");
        assert_eq!(data, b"look north\r\n");
        assert!(events.is_empty());
    }

    #[test]
    fn unescapes_doubled_iac() {
        let mut p = TelnetParser::new(256);
        let (data, events) = run(&mut p, &[b'a', IAC, IAC, b'b']);
        assert_eq!(data, &[b'a', IAC, b'b']);
        assert!(events.is_empty());
    }

    #[test]
    fn reports_negotiation() {
        let mut p = TelnetParser::new(256);
        let (data, events) = run(&mut p, &[IAC, DO, OPT_GMCP, IAC, WONT, OPT_ECHO]);
        assert!(data.is_empty());
        assert_eq!(
            events,
            vec![TelnetEvent::Do(OPT_GMCP), TelnetEvent::Wont(OPT_ECHO)]
        );
    }

    #[test]
    fn handles_split_negotiation_across_calls() {
        let mut p = TelnetParser::new(256);
        let (data, events) = run(&mut p, &[b'x', IAC]);
        assert_eq!(data, b"x");
        assert!(events.is_empty());
        let (data, events) = run(&mut p, &[DO]);
        assert!(data.is_empty());
        assert!(events.is_empty());
        let (data, events) = run(&mut p, &[OPT_GMCP, b'y']);
        assert_eq!(data, b"y");
        assert_eq!(events, vec![TelnetEvent::Do(OPT_GMCP)]);
    }

    #[test]
    fn collects_subnegotiation_payload() {
        let mut p = TelnetParser::new(256);
        let mut input = vec![IAC, SB, OPT_GMCP];
        input.extend_from_slice(b"Core.Hello {}");
        input.extend_from_slice(&[IAC, SE]);
        let (data, events) = run(&mut p, &input);
        assert!(data.is_empty());
        assert_eq!(
            events,
            vec![TelnetEvent::Subneg {
                opt: OPT_GMCP,
                payload: b"Core.Hello {}".to_vec(),
                truncated: false,
            }]
        );
    }

    #[test]
    fn unescapes_iac_inside_subnegotiation() {
        let mut p = TelnetParser::new(256);
        let input = [IAC, SB, OPT_GMCP, 1, IAC, IAC, 2, IAC, SE];
        let (_, events) = run(&mut p, &input);
        assert_eq!(
            events,
            vec![TelnetEvent::Subneg {
                opt: OPT_GMCP,
                payload: vec![1, IAC, 2],
                truncated: false,
            }]
        );
    }

    #[test]
    fn caps_oversized_subnegotiation() {
        let mut p = TelnetParser::new(4);
        let input = [IAC, SB, OPT_GMCP, 1, 2, 3, 4, 5, 6, IAC, SE];
        let (_, events) = run(&mut p, &input);
        assert_eq!(
            events,
            vec![TelnetEvent::Subneg {
                opt: OPT_GMCP,
                payload: vec![1, 2, 3, 4],
                truncated: true,
            }]
        );
    }

    #[test]
    fn swallows_ga_and_nop() {
        let mut p = TelnetParser::new(256);
        let (data, events) = run(&mut p, &[b'a', IAC, GA, b'b', IAC, 241, b'c']);
        assert_eq!(data, b"abc");
        assert!(events.is_empty());
    }

    #[test]
    fn frames_payload_with_escaping() {
        let framed = subneg_frame(OPT_GMCP, &[b'x', IAC, b'y']);
        assert_eq!(framed, vec![IAC, SB, OPT_GMCP, b'x', IAC, IAC, b'y', IAC, SE]);
    }
}
