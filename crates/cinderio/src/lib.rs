//! Low-level connection plumbing shared by cindermud binaries: a telnet
//! IAC/subnegotiation parser and a bounded line assembler. No sockets here,
//! only byte-in, byte-out state machines, so everything is unit testable.

pub mod line;
pub mod telnet;
