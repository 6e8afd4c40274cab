//! The service core: one single-threaded loop that owns every session, the
//! world, the buffer pool, and the event queue. Each pass through the loop
//! is one pulse; within a pulse the phases always run in the same order,
//! so there is no cross-session interleaving to reason about. Socket I/O
//! is non-blocking; a socket that is not ready simply waits for the next
//! pulse.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use futures::FutureExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use cinderio::line::Assembled;
use cinderio::telnet::{self, TelnetEvent, OPT_GMCP};

use crate::act::{act, ActParams, Scope};
use crate::color;
use crate::config::Config;
use crate::events::{EventQueue, Outcome, Owner};
use crate::gmcp;
use crate::interp;
use crate::output::BufferPool;
use crate::pager::{Pager, MAX_PAGE_BYTES, PAGE_WIDTH};
use crate::session::{ConnState, QueueNote, Session, SessionId};
use crate::world::{Character, Sex, World};

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Shutdown,
    /// Re-exec while keeping client sockets open.
    Hotboot,
}

#[derive(Default)]
pub struct Stats {
    pub accepted: u64,
    pub closed: u64,
    pub commands: u64,
}

pub struct Server {
    pub cfg: Config,
    pub listener: TcpListener,
    pub sessions: HashMap<SessionId, Session>,
    next_session: u64,
    pub pool: BufferPool,
    pub events: EventQueue<Server>,
    pub world: World,
    /// Monotonic pulse counter; one heartbeat per pulse.
    pub pulse: u64,
    /// Pulse at which a scheduled shutdown fires.
    pub shutdown_at: Option<u64>,
    /// Refusing mortal logins, either from the command line or because a
    /// shutdown is imminent.
    pub restrict: bool,
    pub exit: Option<Exit>,
    pub stats: Stats,
    shutdown_rx: watch::Receiver<bool>,
}

const GREETING: &str = "\r\n\
    &1   c i n d e r m u d&0\r\n\
    &3   embers never quite go out&0\r\n\r\n";

impl Server {
    pub fn new(cfg: Config, listener: TcpListener, shutdown_rx: watch::Receiver<bool>) -> Self {
        let world = World::build(cfg.mini);
        let pool = BufferPool::new(cfg.large_buf);
        let restrict = cfg.restrict;
        let mut srv = Self {
            cfg,
            listener,
            sessions: HashMap::new(),
            next_session: 1,
            pool,
            events: EventQueue::new(),
            world,
            pulse: 0,
            shutdown_at: None,
            restrict,
            exit: None,
            stats: Stats::default(),
            shutdown_rx,
        };
        if !srv.cfg.no_specials {
            srv.spawn_specials();
        }
        srv
    }

    /// NPC ambience, driven entirely by the event queue.
    fn spawn_specials(&mut self) {
        if self.cfg.mini {
            return;
        }
        let start = self.world.start;
        let keeper = self
            .world
            .create_char("the tavernkeeper", Sex::Male, start, true);
        self.events.schedule(
            self.pulse,
            150,
            Some(Owner::Char(keeper)),
            "tavernkeeper_ambience",
            Box::new(move |srv: &mut Server| {
                act(
                    srv,
                    "$n wipes down the bar and mutters about the ash.",
                    true,
                    ActParams::from(keeper),
                    false,
                    Scope::ToRoom,
                );
                Outcome::Redeliver(300)
            }),
        );
    }

    pub async fn run(&mut self) -> anyhow::Result<Exit> {
        let tick = self.cfg.tick();
        let mut next_pulse = Instant::now() + tick;
        info!(port = self.cfg.port, tick_ms = self.cfg.tick_ms, "entering game loop");
        loop {
            if let Some(exit) = self.exit {
                self.flush_phase();
                return Ok(exit);
            }
            if *self.shutdown_rx.borrow() {
                self.broadcast("\r\n&1The server is going down now. Goodbye.&0\r\n");
                self.flush_phase();
                return Ok(Exit::Shutdown);
            }
            if self.sessions.is_empty() && self.shutdown_at.is_none() {
                debug!("no connections, blocking on accept");
                let accepted = {
                    let mut rx = self.shutdown_rx.clone();
                    tokio::select! {
                        res = self.listener.accept() => Some(res),
                        _ = rx.changed() => None,
                    }
                };
                if let Some(res) = accepted {
                    let (stream, addr) = res.context("accept failed")?;
                    self.new_session(stream, addr);
                }
                next_pulse = Instant::now() + tick;
                continue;
            }

            {
                let mut rx = self.shutdown_rx.clone();
                tokio::select! {
                    _ = tokio::time::sleep_until(next_pulse) => {}
                    _ = rx.changed() => continue,
                }
            }
            let now = Instant::now();
            let missed = missed_pulses(
                now.duration_since(next_pulse),
                tick,
                self.cfg.pulses_per_sec(),
            );
            next_pulse += tick * (missed as u32 + 1);
            if next_pulse <= now {
                // The cap dropped time on the floor; restart the grid.
                next_pulse = now + tick;
            }

            self.accept_new();
            self.read_phase();
            self.command_phase();
            for _ in 0..=missed {
                self.pulse += 1;
                self.heartbeat();
                self.process_events();
            }
            self.flush_phase();
            self.prompt_phase();
            self.close_phase();
        }
    }

    fn accept_new(&mut self) {
        loop {
            match self.listener.accept().now_or_never() {
                Some(Ok((stream, addr))) => {
                    self.new_session(stream, addr);
                }
                Some(Err(e)) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
                None => break,
            }
        }
    }

    pub fn new_session(&mut self, stream: TcpStream, addr: SocketAddr) -> SessionId {
        stream.set_nodelay(true).ok();
        let id = SessionId(self.next_session);
        self.next_session += 1;
        let host = addr.ip().to_string();
        let mut session = Session::new(
            stream,
            host.clone(),
            self.cfg.small_buf,
            self.cfg.max_line,
            self.cfg.max_subneg,
            self.pulse,
        );
        session.tx.extend_from_slice(&telnet::will(OPT_GMCP));
        self.stats.accepted += 1;
        self.sessions.insert(id, session);
        info!(session = %id, host = %host, "new connection");
        self.send(id, GREETING);
        self.send(id, "Do you want ANSI color? (Y/n) ");
        id
    }

    /// Attach a socket inherited across a hot restart. The session skips
    /// the front door entirely: it is already a known player.
    pub fn adopt_session(&mut self, stream: TcpStream, meta: crate::hotboot::HotbootSession) -> SessionId {
        stream.set_nodelay(true).ok();
        let id = SessionId(self.next_session);
        self.next_session += 1;
        let mut session = Session::new(
            stream,
            meta.host.clone(),
            self.cfg.small_buf,
            self.cfg.max_line,
            self.cfg.max_subneg,
            self.pulse,
        );
        session.state = ConnState::Playing;
        session.color = meta.color;
        session.gmcp = meta.gmcp;
        session.prompt_due = true;
        self.stats.accepted += 1;
        self.sessions.insert(id, session);
        let cid = self
            .world
            .find_player(&meta.name)
            .unwrap_or_else(|| self.world.create_char(&meta.name, Sex::Neuter, self.world.start, false));
        if let Some(ch) = self.world.char_mut(cid) {
            ch.session = Some(id);
            ch.wizard = ch.wizard || self.cfg.is_admin(&meta.name);
        }
        if let Some(s) = self.sessions.get_mut(&id) {
            s.char_id = Some(cid);
        }
        info!(session = %id, name = %meta.name, "session re-adopted after hot restart");
        self.send(id, "\r\n&2The world re-forms around you.&0\r\n");
        id
    }

    fn read_phase(&mut self) {
        for id in self.session_ids() {
            let result = match self.sessions.get_mut(&id) {
                Some(s) if s.state != ConnState::Closing => s.read_available(),
                _ => continue,
            };
            match result {
                Ok(r) => {
                    for ev in r.events {
                        self.handle_telnet_event(id, ev);
                    }
                    for line in r.lines {
                        self.handle_assembled(id, line);
                    }
                    if r.eof {
                        self.close_session(id, "peer closed");
                    }
                }
                Err(e) => {
                    debug!(session = %id, error = %e, "read error");
                    self.close_session(id, "read error");
                }
            }
        }
    }

    fn handle_telnet_event(&mut self, id: SessionId, ev: TelnetEvent) {
        match ev {
            TelnetEvent::Do(OPT_GMCP) => {
                let newly = self
                    .sessions
                    .get_mut(&id)
                    .map(|s| !std::mem::replace(&mut s.gmcp, true))
                    .unwrap_or(false);
                if newly {
                    debug!(session = %id, "gmcp enabled");
                    for payload in gmcp::enable_payloads() {
                        self.send_frame(id, &payload);
                    }
                }
            }
            TelnetEvent::Dont(OPT_GMCP) => {
                if let Some(s) = self.sessions.get_mut(&id) {
                    if std::mem::replace(&mut s.gmcp, false) {
                        debug!(session = %id, "gmcp disabled");
                    }
                }
            }
            // Anything else the client asks for is declined.
            TelnetEvent::Do(opt) => self.send_frame(id, &telnet::wont(opt)),
            TelnetEvent::Will(opt) => self.send_frame(id, &telnet::dont(opt)),
            TelnetEvent::Wont(_) | TelnetEvent::Dont(_) => {}
            TelnetEvent::Subneg {
                opt: OPT_GMCP,
                payload,
                truncated,
            } => {
                if truncated {
                    warn!(session = %id, "oversized gmcp frame truncated");
                }
                // Parsed for the log, deliberately not acted on.
                match gmcp::parse_incoming(&payload) {
                    Some((module, value)) => {
                        debug!(session = %id, module = %module, value = %value, "gmcp message ignored")
                    }
                    None => debug!(session = %id, "unparseable gmcp frame dropped"),
                }
            }
            TelnetEvent::Subneg { .. } => {}
        }
    }

    fn handle_assembled(&mut self, id: SessionId, line: Assembled) {
        let truncated = matches!(line, Assembled::Truncated(_));
        let text = line.text().to_string();
        if truncated {
            self.send(id, &format!("Line too long. Truncated to:\r\n{text}\r\n"));
        }
        let watcher = self.sessions.get(&id).and_then(|s| s.snooped_by);
        if let Some(w) = watcher {
            self.send(w, &format!("&6>>&0 {text}\r\n"));
        }
        if interp::busy_shortcut(self, id, &text) {
            if let Some(s) = self.sessions.get_mut(&id) {
                s.idle_pulses = 0;
            }
            return;
        }
        let note = match self.sessions.get_mut(&id) {
            Some(s) => {
                s.idle_pulses = 0;
                s.queue_command(&text)
            }
            None => return,
        };
        match note {
            QueueNote::Queued => {}
            QueueNote::Echo(cmd) => self.send(id, &format!("{cmd}\r\n")),
            QueueNote::BadSubst => self.send(id, "Invalid substitution.\r\n"),
        }
    }

    /// Run at most one queued command per session per pulse. The event
    /// queue is drained again after every command so zero-delay work fires
    /// before the next session's command.
    fn command_phase(&mut self) {
        for id in self.session_ids() {
            let line = {
                let Some(s) = self.sessions.get_mut(&id) else {
                    continue;
                };
                if s.state == ConnState::Closing {
                    continue;
                }
                s.wait = s.wait.saturating_sub(1);
                if s.wait > 0 {
                    continue;
                }
                let Some(line) = s.inq.pop_front() else {
                    continue;
                };
                s.wait = 1;
                s.commands += 1;
                s.prompt_due = true;
                line
            };
            self.stats.commands += 1;
            interp::handle_line(self, id, &line);
            self.process_events();
        }
    }

    pub fn process_events(&mut self) {
        while let Some(mut ev) = self.events.pop_due(self.pulse) {
            if let Some(owner) = ev.owner {
                if !self.owner_alive(owner) {
                    self.events.dropped += 1;
                    debug!(label = ev.label, "event dropped, owner gone");
                    continue;
                }
            }
            self.events.executed += 1;
            match (ev.run)(self) {
                Outcome::Finished => {}
                Outcome::Redeliver(delay) => {
                    let due = self.pulse + delay.max(1);
                    self.events.requeue(ev, due);
                }
            }
        }
    }

    fn owner_alive(&self, owner: Owner) -> bool {
        match owner {
            Owner::Session(id) => self
                .sessions
                .get(&id)
                .is_some_and(|s| s.state != ConnState::Closing),
            Owner::Char(id) => self.world.chars.contains_key(&id),
        }
    }

    /// Per-pulse world upkeep: idle policing, regeneration, and the
    /// shutdown countdown.
    fn heartbeat(&mut self) {
        let pps = self.cfg.pulses_per_sec();
        for id in self.session_ids() {
            let (state, idle) = {
                let Some(s) = self.sessions.get_mut(&id) else {
                    continue;
                };
                s.idle_pulses += 1;
                (s.state, s.idle_pulses)
            };
            match state {
                ConnState::Negotiating | ConnState::Authenticating | ConnState::InMenu => {
                    let limit = self.cfg.idle_login_secs * pps;
                    if idle > limit {
                        self.send(id, "\r\nTimed out waiting for input.\r\n");
                        self.close_session(id, "login timeout");
                    } else if idle == limit / 2 {
                        self.send(id, "\r\nAre you still there? Type something soon.\r\n");
                    }
                }
                ConnState::Playing | ConnState::EditingText => {
                    if idle > self.cfg.idle_play_secs * pps {
                        self.send(id, "\r\n&3You have been idle too long.&0\r\n");
                        self.close_session(id, "idle timeout");
                    }
                }
                ConnState::Closing => {}
            }
        }
        if self.pulse % (10 * pps) == 0 {
            for ch in self.world.chars.values_mut() {
                ch.hp = (ch.hp + 1).min(ch.max_hp);
                ch.moves = (ch.moves + 2).min(ch.max_moves);
            }
        }
        if let Some(at) = self.shutdown_at {
            let remaining = at.saturating_sub(self.pulse);
            if remaining == 0 {
                self.broadcast("\r\n&1The world fades to embers. Goodbye.&0\r\n");
                self.shutdown_at = None;
                self.exit = Some(Exit::Shutdown);
            } else if remaining % (60 * pps) == 0 {
                let mins = remaining / (60 * pps);
                self.broadcast(&format!(
                    "\r\n&1&8ATTENTION:&0 the server shuts down in {mins} minute{}.\r\n",
                    if mins == 1 { "" } else { "s" }
                ));
                if mins <= 2 && !self.restrict {
                    self.restrict = true;
                    info!("logins restricted ahead of shutdown");
                }
            }
        }
    }

    fn flush_phase(&mut self) {
        // Mirror snooped output first so the watcher's copy joins this
        // pulse's flush even when the watcher's id sorts lower.
        let mut mirrors = Vec::new();
        for s in self.sessions.values() {
            if let Some(watcher) = s.snooped_by {
                let pending = s.output.pending();
                if !pending.is_empty() {
                    mirrors.push((watcher, String::from_utf8_lossy(pending).into_owned()));
                }
            }
        }
        for (watcher, text) in mirrors {
            self.send(watcher, &format!("&6((&0 {} &6))&0\r\n", text.trim_end()));
        }
        for id in self.session_ids() {
            {
                let Some(s) = self.sessions.get_mut(&id) else {
                    continue;
                };
                let mut chunk = Vec::new();
                if s.output.flush_into(&mut self.pool, &mut chunk) {
                    if s.has_prompt {
                        s.tx.extend_from_slice(b"\r\n");
                        s.has_prompt = false;
                    }
                    s.tx.extend_from_slice(&chunk);
                    if matches!(s.state, ConnState::Playing | ConnState::EditingText) {
                        s.prompt_due = true;
                    }
                }
            }
            let res = self.sessions.get_mut(&id).map(|s| s.try_flush_tx());
            if let Some(Err(e)) = res {
                debug!(session = %id, error = %e, "write error");
                self.close_session(id, "write error");
            }
        }
    }

    /// Write prompts after output has settled. Prompts bypass the output
    /// buffer so they never re-trigger the leading-newline logic.
    fn prompt_phase(&mut self) {
        for id in self.session_ids() {
            let prompt = {
                let Some(s) = self.sessions.get(&id) else {
                    continue;
                };
                if !s.prompt_due
                    || !s.output.is_empty()
                    || !matches!(s.state, ConnState::Playing | ConnState::EditingText)
                {
                    continue;
                }
                if let Some(p) = &s.pager {
                    p.prompt()
                } else if s.editor.is_some() || s.state == ConnState::EditingText {
                    "] ".to_string()
                } else {
                    match s.char_id.and_then(|cid| self.world.char(cid)) {
                        Some(ch) => render_prompt(ch),
                        None => "> ".to_string(),
                    }
                }
            };
            let frames = {
                let Some(s) = self.sessions.get(&id) else {
                    continue;
                };
                (s.gmcp)
                    .then(|| s.char_id.and_then(|cid| self.world.char(cid)))
                    .flatten()
                    .map(|ch| (gmcp::char_vitals(ch), gmcp::char_combat(ch)))
            };
            let res = {
                let Some(s) = self.sessions.get_mut(&id) else {
                    continue;
                };
                if let Some((vitals, combat)) = frames {
                    s.tx.extend_from_slice(&vitals);
                    s.tx.extend_from_slice(&combat);
                }
                let rendered = color::process(&prompt, s.color);
                s.tx.extend_from_slice(rendered.as_bytes());
                s.tx.extend_from_slice(&telnet::GA_SEQ);
                s.has_prompt = true;
                s.prompt_due = false;
                s.try_flush_tx()
            };
            if let Err(e) = res {
                debug!(session = %id, error = %e, "write error at prompt");
                self.close_session(id, "write error");
            }
        }
    }

    /// Tear down every session marked Closing. Each teardown happens
    /// exactly once: the session leaves the map here and nowhere else.
    pub(crate) fn close_phase(&mut self) {
        let doomed: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.state == ConnState::Closing)
            .map(|(id, _)| *id)
            .collect();
        for id in doomed {
            let (snooping, snooped_by, char_id) = match self.sessions.get(&id) {
                Some(s) => (s.snooping, s.snooped_by, s.char_id),
                None => continue,
            };
            if let Some(target) = snooping {
                if let Some(ts) = self.sessions.get_mut(&target) {
                    ts.snooped_by = None;
                }
            }
            if let Some(watcher) = snooped_by {
                if let Some(ws) = self.sessions.get_mut(&watcher) {
                    ws.snooping = None;
                }
                self.send(watcher, "Your snoop target is gone.\r\n");
            }
            if let Some(cid) = char_id {
                act(
                    self,
                    "$n has left the game.",
                    true,
                    ActParams::from(cid),
                    false,
                    Scope::ToRoom,
                );
                self.events.cancel_owner(Owner::Char(cid));
                self.world.remove_char(cid);
            }
            self.events.cancel_owner(Owner::Session(id));
            if let Some(mut s) = self.sessions.remove(&id) {
                s.output.release(&mut self.pool);
                let _ = s.try_flush_tx();
                self.stats.closed += 1;
                info!(
                    session = %id,
                    host = %s.host,
                    commands = s.commands,
                    online_pulses = self.pulse.saturating_sub(s.connected_pulse),
                    "connection closed"
                );
            }
        }
    }

    /// Mark a session for teardown; the actual close happens once, at the
    /// end of the pulse.
    pub fn close_session(&mut self, id: SessionId, reason: &'static str) {
        if let Some(s) = self.sessions.get_mut(&id) {
            if s.state != ConnState::Closing {
                s.state = ConnState::Closing;
                debug!(session = %id, reason, "closing session");
            }
        }
    }

    fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Queue text for a session, rendered through its color preference.
    pub fn send(&mut self, id: SessionId, text: &str) {
        let Some(s) = self.sessions.get_mut(&id) else {
            return;
        };
        let rendered = color::process(text, s.color);
        s.output.write(&mut self.pool, rendered.as_bytes());
    }

    /// Queue raw protocol bytes, skipping color rendering.
    pub fn send_frame(&mut self, id: SessionId, bytes: &[u8]) {
        if let Some(s) = self.sessions.get_mut(&id) {
            s.output.write(&mut self.pool, bytes);
        }
    }

    pub fn send_to_char(&mut self, cid: crate::world::CharId, text: &str) {
        if let Some(sid) = self.world.char(cid).and_then(|c| c.session) {
            self.send(sid, text);
        }
    }

    pub fn broadcast(&mut self, text: &str) {
        for id in self.session_ids() {
            let playing = self
                .sessions
                .get(&id)
                .is_some_and(|s| matches!(s.state, ConnState::Playing | ConnState::EditingText));
            if playing {
                self.send(id, text);
            }
        }
    }

    /// Send long text through the pager. Short text goes out directly; the
    /// pager only engages when there is more than one page.
    pub fn page(&mut self, id: SessionId, text: &str) {
        let pager = Pager::new(text, self.cfg.page_length, PAGE_WIDTH, MAX_PAGE_BYTES);
        if let Some(banner) = pager.overflow_banner() {
            self.send(id, &banner);
        }
        self.send(id, &pager.page_text());
        if !pager.on_last_page() {
            if let Some(s) = self.sessions.get_mut(&id) {
                s.pager = Some(pager);
            }
        }
    }
}

/// Render a character's prompt template. `%n` is the name, `%h/%H` hit
/// points, `%v/%V` movement, `%p` position, `%%` a literal percent.
pub fn render_prompt(ch: &Character) -> String {
    let mut out = String::with_capacity(ch.prompt.len() + 8);
    let mut chars = ch.prompt.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push_str(&ch.name),
            Some('h') => out.push_str(&ch.hp.to_string()),
            Some('H') => out.push_str(&ch.max_hp.to_string()),
            Some('v') => out.push_str(&ch.moves.to_string()),
            Some('V') => out.push_str(&ch.max_moves.to_string()),
            Some('p') => out.push_str(ch.position.as_str()),
            Some('%') => out.push('%'),
            // Unknown codes are dropped.
            Some(_) => {}
            None => break,
        }
    }
    out
}

/// How many pulses beyond the scheduled one have elapsed, any fraction
/// counting as a whole pulse. More than 30 seconds worth of backlog is
/// abandoned rather than replayed.
pub fn missed_pulses(behind: Duration, tick: Duration, pulses_per_sec: u64) -> u64 {
    let missed = behind.as_millis().div_ceil(tick.as_millis().max(1)) as u64;
    let cap = 30 * pulses_per_sec;
    if missed > cap {
        warn!(missed, "missed more than 30 seconds of pulses, abandoning the backlog");
        cap
    } else {
        missed
    }
}
