//! Input routing and the command table. Every line a session produces
//! lands in `handle_line`, which sends it wherever the session's state
//! says it belongs: the login flow, the menu, the pager, the editor, or
//! the in-game command interpreter.
//!
//! Commands are plain values in a table. Lookup is exact name first, then
//! first prefix match in table order, which is why the movement commands
//! sit at the top.

use tracing::info;

use crate::act::{act, ActParams, Scope};
use crate::events::{Outcome, Owner};
use crate::gmcp;
use crate::pager::Step;
use crate::server::{Exit, Server};
use crate::session::{ConnState, EditStep, Editor, SessionId};
use crate::world::{CharId, Sex, DIR_NAMES};

pub struct Command {
    pub name: &'static str,
    /// Allowed while a multi-pulse activity is in progress.
    pub while_busy: bool,
    pub wizard: bool,
    pub run: fn(&mut Server, SessionId, &str),
}

const fn cmd(
    name: &'static str,
    while_busy: bool,
    wizard: bool,
    run: fn(&mut Server, SessionId, &str),
) -> Command {
    Command {
        name,
        while_busy,
        wizard,
        run,
    }
}

pub static COMMANDS: &[Command] = &[
    cmd("north", false, false, |s, id, _| do_move(s, id, 0)),
    cmd("east", false, false, |s, id, _| do_move(s, id, 1)),
    cmd("south", false, false, |s, id, _| do_move(s, id, 2)),
    cmd("west", false, false, |s, id, _| do_move(s, id, 3)),
    cmd("up", false, false, |s, id, _| do_move(s, id, 4)),
    cmd("down", false, false, |s, id, _| do_move(s, id, 5)),
    cmd("look", true, false, do_look),
    cmd("say", true, false, do_say),
    cmd("emote", false, false, do_emote),
    cmd("tell", false, false, do_tell),
    cmd("who", false, false, do_who),
    cmd("score", false, false, do_score),
    cmd("help", false, false, do_help),
    cmd("prompt", false, false, do_prompt),
    cmd("ansi", false, false, do_ansi),
    cmd("write", false, false, do_write),
    cmd("channel", false, false, do_channel),
    cmd("abort", true, false, do_abort),
    cmd("quit", false, false, do_quit),
    cmd("snoop", false, true, do_snoop),
    cmd("echo", false, true, do_echo),
    cmd("shutdown", false, true, do_shutdown),
    cmd("copyover", false, true, do_copyover),
    cmd("usage", false, true, do_usage),
];

/// Exact name match wins; otherwise the first prefix match in table order.
pub fn find_command(word: &str) -> Option<&'static Command> {
    let lower = word.to_ascii_lowercase();
    if lower.is_empty() {
        return None;
    }
    COMMANDS
        .iter()
        .find(|c| c.name == lower)
        .or_else(|| COMMANDS.iter().find(|c| c.name.starts_with(&lower)))
}

/// Route one input line according to the session's state.
pub fn handle_line(srv: &mut Server, id: SessionId, line: &str) {
    let Some(s) = srv.sessions.get(&id) else { return };
    if s.pager.is_some() {
        pager_input(srv, id, line);
        return;
    }
    match s.state {
        ConnState::Negotiating => nanny_ansi(srv, id, line),
        ConnState::Authenticating => nanny_name(srv, id, line),
        ConnState::InMenu => nanny_menu(srv, id, line),
        ConnState::Playing => dispatch(srv, id, line),
        ConnState::EditingText => editor_input(srv, id, line),
        ConnState::Closing => {}
    }
}

/// A busy character's whitelisted commands run the moment the line
/// arrives instead of waiting in the input queue behind other commands.
/// Returns true when the line was consumed here.
pub fn busy_shortcut(srv: &mut Server, id: SessionId, line: &str) -> bool {
    let Some(s) = srv.sessions.get(&id) else {
        return false;
    };
    if s.state != ConnState::Playing || s.pager.is_some() {
        return false;
    }
    let busy = s
        .char_id
        .and_then(|cid| srv.world.char(cid))
        .is_some_and(|ch| ch.busy.is_some());
    if !busy {
        return false;
    }
    let (word, _) = split_word(line.trim());
    if !find_command(word).is_some_and(|c| c.while_busy) {
        return false;
    }
    if let Some(s) = srv.sessions.get_mut(&id) {
        s.prompt_due = true;
    }
    dispatch(srv, id, &line.replace('$', "$$"));
    true
}

fn dispatch(srv: &mut Server, id: SessionId, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    let (word, arg) = split_word(line);
    let Some(command) = find_command(word) else {
        srv.send(id, "Huh?!?\r\n");
        return;
    };
    let Some(cid) = char_of(srv, id) else { return };
    let (is_wizard, busy) = match srv.world.char(cid) {
        Some(ch) => (ch.wizard, ch.busy),
        None => return,
    };
    if command.wizard && !is_wizard {
        srv.send(id, "Huh?!?\r\n");
        return;
    }
    if let Some(activity) = busy {
        if !command.while_busy {
            srv.send(id, &format!("You can't do that while {activity}!\r\n"));
            return;
        }
    }
    (command.run)(srv, id, arg);
}

fn split_word(line: &str) -> (&str, &str) {
    match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim_start()),
        None => (line, ""),
    }
}

fn char_of(srv: &Server, id: SessionId) -> Option<CharId> {
    srv.sessions.get(&id).and_then(|s| s.char_id)
}

/* ---------- login flow ---------- */

const NAME_PROMPT: &str = "By what name do you wish to be known? ";

fn menu_text(name: &str) -> String {
    format!(
        "\r\nWelcome, {name}.\r\n\r\n\
         1) Enter the realm\r\n\
         0) Leave\r\n\r\n\
         Make your choice: "
    )
}

fn nanny_ansi(srv: &mut Server, id: SessionId, line: &str) {
    let answer = line.trim().to_ascii_lowercase();
    let color = match answer.as_str() {
        "" | "y" | "yes" => true,
        "n" | "no" => false,
        _ => {
            srv.send(id, "Please answer yes or no: ");
            return;
        }
    };
    if let Some(s) = srv.sessions.get_mut(&id) {
        s.color = color;
        s.state = ConnState::Authenticating;
    }
    srv.send(id, NAME_PROMPT);
}

fn valid_name(name: &str) -> bool {
    (2..=12).contains(&name.len()) && name.chars().all(|c| c.is_ascii_alphabetic())
}

fn nanny_name(srv: &mut Server, id: SessionId, line: &str) {
    let name = line.trim();
    if name.is_empty() {
        srv.send(id, NAME_PROMPT);
        return;
    }
    if !valid_name(name) {
        srv.send(id, "Illegal name, please try another.\r\nName: ");
        return;
    }
    let mut proper = name.to_ascii_lowercase();
    if let Some(first) = proper.get_mut(0..1) {
        first.make_ascii_uppercase();
    }
    if srv.restrict && !srv.cfg.is_admin(&proper) {
        srv.send(id, "The realm is closed to mortals right now. Come back later.\r\n");
        srv.close_session(id, "restricted");
        return;
    }
    let menu = menu_text(&proper);
    if let Some(s) = srv.sessions.get_mut(&id) {
        s.pending_name = Some(proper);
        s.state = ConnState::InMenu;
    }
    srv.send(id, &menu);
}

fn nanny_menu(srv: &mut Server, id: SessionId, line: &str) {
    match line.trim() {
        "1" => enter_realm(srv, id),
        "0" => {
            srv.send(id, "Come back soon.\r\n");
            srv.close_session(id, "left at menu");
        }
        _ => {
            let name = srv
                .sessions
                .get(&id)
                .and_then(|s| s.pending_name.clone())
                .unwrap_or_default();
            srv.send(id, &menu_text(&name));
        }
    }
}

fn enter_realm(srv: &mut Server, id: SessionId) {
    let Some(name) = srv.sessions.get(&id).and_then(|s| s.pending_name.clone()) else {
        srv.close_session(id, "no name at menu");
        return;
    };
    let cid = if let Some(existing) = srv.world.find_player(&name) {
        // The name is already in the game: the new connection takes the
        // body over and the old one is cut loose without touching the
        // character.
        let old = srv.world.char(existing).and_then(|c| c.session);
        if let Some(old_sid) = old {
            if old_sid != id {
                srv.send(old_sid, "&1This body has been taken over!&0\r\n");
                if let Some(os) = srv.sessions.get_mut(&old_sid) {
                    os.char_id = None;
                }
                srv.close_session(old_sid, "usurped");
            }
        }
        info!(session = %id, name = %name, "existing character taken over");
        srv.send(id, "You seize hold of your body, already in play!\r\n");
        existing
    } else {
        let start = srv.world.start;
        let new_cid = srv.world.create_char(&name, Sex::Neuter, start, false);
        if srv.cfg.is_admin(&name) {
            if let Some(ch) = srv.world.char_mut(new_cid) {
                ch.wizard = true;
            }
        }
        info!(session = %id, name = %name, "character entered the game");
        srv.send(id, "&2Welcome to the embers. May your fire never die.&0\r\n");
        act(
            srv,
            "$n steps out of the haze.",
            true,
            ActParams::from(new_cid),
            false,
            Scope::ToRoom,
        );
        new_cid
    };
    if let Some(ch) = srv.world.char_mut(cid) {
        ch.session = Some(id);
    }
    if let Some(s) = srv.sessions.get_mut(&id) {
        s.char_id = Some(cid);
        s.state = ConnState::Playing;
        s.prompt_due = true;
    }
    do_look(srv, id, "");
    push_room_gmcp(srv, id);
}

/* ---------- captured-input modes ---------- */

fn pager_input(srv: &mut Server, id: SessionId, line: &str) {
    let page = {
        let Some(s) = srv.sessions.get_mut(&id) else { return };
        let Some(p) = s.pager.as_mut() else { return };
        match p.handle_input(line) {
            Step::Quit => {
                s.pager = None;
                None
            }
            Step::Show => {
                let text = p.page_text();
                if p.on_last_page() {
                    s.pager = None;
                }
                Some(text)
            }
        }
    };
    if let Some(text) = page {
        srv.send(id, &text);
    }
}

fn editor_input(srv: &mut Server, id: SessionId, line: &str) {
    let finished = {
        let Some(s) = srv.sessions.get_mut(&id) else { return };
        let Some(e) = s.editor.as_mut() else {
            s.state = ConnState::Playing;
            return;
        };
        match e.feed(line) {
            EditStep::More => None,
            EditStep::Done(text) => {
                s.editor = None;
                s.state = ConnState::Playing;
                Some(text)
            }
        }
    };
    let Some(text) = finished else { return };
    let Some(cid) = char_of(srv, id) else { return };
    if text.trim().is_empty() {
        srv.send(id, "You crumple the blank page.\r\n");
        return;
    }
    srv.send(id, "You pin your note to the board.\r\n");
    act(
        srv,
        "$n pins a note to the board.",
        true,
        ActParams::from(cid),
        false,
        Scope::ToRoom,
    );
}

/* ---------- commands ---------- */

fn do_move(srv: &mut Server, id: SessionId, dir: usize) {
    let Some(cid) = char_of(srv, id) else { return };
    let (room, exhausted) = match srv.world.char(cid) {
        Some(ch) => (ch.room, ch.moves <= 0),
        None => return,
    };
    let Some(dest) = srv.world.room(room).exits[dir] else {
        srv.send(id, "You can't go that way.\r\n");
        return;
    };
    if exhausted {
        srv.send(id, "You are too exhausted.\r\n");
        return;
    }
    act(
        srv,
        &format!("$n leaves {}.", DIR_NAMES[dir]),
        true,
        ActParams::from(cid),
        false,
        Scope::ToRoom,
    );
    srv.world.move_char(cid, dest);
    if let Some(ch) = srv.world.char_mut(cid) {
        ch.moves -= 1;
    }
    act(
        srv,
        "$n has arrived.",
        true,
        ActParams::from(cid),
        false,
        Scope::ToRoom,
    );
    do_look(srv, id, "");
    push_room_gmcp(srv, id);
}

fn push_room_gmcp(srv: &mut Server, id: SessionId) {
    let wants = srv.sessions.get(&id).is_some_and(|s| s.gmcp);
    if !wants {
        return;
    }
    let frame = char_of(srv, id)
        .and_then(|cid| srv.world.char(cid))
        .map(|ch| gmcp::room_info(srv.world.room(ch.room)));
    if let Some(frame) = frame {
        srv.send_frame(id, &frame);
    }
}

fn do_look(srv: &mut Server, id: SessionId, _arg: &str) {
    let Some(cid) = char_of(srv, id) else { return };
    let Some(room_id) = srv.world.char(cid).map(|c| c.room) else {
        return;
    };
    let mut out = String::new();
    {
        let room = srv.world.room(room_id);
        out.push_str(&format!("&6{}&0\r\n{}\r\n", room.name, room.description));
        let exits: Vec<&str> = room
            .exits
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_some())
            .map(|(i, _)| DIR_NAMES[i])
            .collect();
        out.push_str(&format!("&3Exits: {}&0\r\n", exits.join(" ")));
        for &other in &room.people {
            if other == cid || !srv.world.can_see(cid, other) {
                continue;
            }
            if let Some(oc) = srv.world.char(other) {
                out.push_str(&format!("{} is {} here.\r\n", oc.name, oc.position.as_str()));
            }
        }
    }
    srv.send(id, &out);
}

fn do_say(srv: &mut Server, id: SessionId, arg: &str) {
    let Some(cid) = char_of(srv, id) else { return };
    if arg.trim().is_empty() {
        srv.send(id, "Say what?\r\n");
        return;
    }
    act(
        srv,
        &format!("You say, '{arg}'"),
        false,
        ActParams::from(cid),
        false,
        Scope::ToChar,
    );
    act(
        srv,
        &format!("$n says, '{arg}'"),
        true,
        ActParams::from(cid),
        false,
        Scope::ToRoom,
    );
}

fn do_emote(srv: &mut Server, id: SessionId, arg: &str) {
    let Some(cid) = char_of(srv, id) else { return };
    if arg.trim().is_empty() {
        srv.send(id, "Emote what?\r\n");
        return;
    }
    let template = format!("$n {arg}");
    act(srv, &template, false, ActParams::from(cid), false, Scope::ToChar);
    act(srv, &template, true, ActParams::from(cid), false, Scope::ToRoom);
}

fn do_tell(srv: &mut Server, id: SessionId, arg: &str) {
    let Some(cid) = char_of(srv, id) else { return };
    let (target, msg) = split_word(arg);
    if target.is_empty() || msg.is_empty() {
        srv.send(id, "Tell whom what?\r\n");
        return;
    }
    let Some(vict) = srv.world.find_player(target).filter(|&v| srv.world.can_see(cid, v))
    else {
        srv.send(id, "They aren't here.\r\n");
        return;
    };
    if vict == cid {
        srv.send(id, "You mutter to yourself.\r\n");
        return;
    }
    if !srv.world.char(vict).is_some_and(|c| c.awake()) {
        srv.send(id, "They can't hear you right now.\r\n");
        return;
    }
    act(
        srv,
        &format!("You tell $N, '{msg}'"),
        false,
        ActParams::from(cid).victim(vict),
        false,
        Scope::ToChar,
    );
    act(
        srv,
        &format!("$n tells you, '{msg}'"),
        true,
        ActParams::from(cid).victim(vict),
        false,
        Scope::ToVict,
    );
}

fn do_who(srv: &mut Server, id: SessionId, _arg: &str) {
    let mut out = String::from("&6Souls among the embers&0\r\n----------------------\r\n");
    let mut count = 0;
    let mut names: Vec<String> = srv
        .world
        .chars
        .values()
        .filter(|c| !c.npc && c.session.is_some())
        .map(|c| {
            if c.wizard {
                format!("  {} &3(wizard)&0", c.name)
            } else {
                format!("  {}", c.name)
            }
        })
        .collect();
    names.sort();
    for name in names {
        out.push_str(&name);
        out.push_str("\r\n");
        count += 1;
    }
    out.push_str(&format!("\r\n{count} visible.\r\n"));
    srv.send(id, &out);
}

fn do_score(srv: &mut Server, id: SessionId, _arg: &str) {
    let Some(cid) = char_of(srv, id) else { return };
    let (text, frame) = match srv.world.char(cid) {
        Some(ch) => (
            format!(
                "You are {}, {}.\r\nHit points: {}/{}   Movement: {}/{}\r\n",
                ch.name,
                ch.position.as_str(),
                ch.hp,
                ch.max_hp,
                ch.moves,
                ch.max_moves
            ),
            gmcp::char_vitals(ch),
        ),
        None => return,
    };
    srv.send(id, &text);
    let wants = srv.sessions.get(&id).is_some_and(|s| s.gmcp);
    if wants {
        srv.send_frame(id, &frame);
    }
}

fn do_help(srv: &mut Server, id: SessionId, _arg: &str) {
    srv.page(id, HELP_TEXT);
}

fn do_prompt(srv: &mut Server, id: SessionId, arg: &str) {
    let Some(cid) = char_of(srv, id) else { return };
    if arg.trim().is_empty() {
        let current = srv
            .world
            .char(cid)
            .map(|c| c.prompt.clone())
            .unwrap_or_default();
        srv.send(id, &format!("Your prompt is: {current}\r\n"));
        return;
    }
    if let Some(ch) = srv.world.char_mut(cid) {
        ch.prompt = format!("{} ", arg.trim_end());
    }
    srv.send(id, "Ok.\r\n");
}

fn do_ansi(srv: &mut Server, id: SessionId, arg: &str) {
    let on = match arg.trim().to_ascii_lowercase().as_str() {
        "on" => true,
        "off" => false,
        _ => {
            srv.send(id, "Usage: ansi <on|off>\r\n");
            return;
        }
    };
    if let Some(s) = srv.sessions.get_mut(&id) {
        s.color = on;
    }
    srv.send(id, if on { "&2Color is on.&0\r\n" } else { "Color is off.\r\n" });
}

fn do_write(srv: &mut Server, id: SessionId, _arg: &str) {
    if let Some(s) = srv.sessions.get_mut(&id) {
        s.editor = Some(Editor::new(40));
        s.state = ConnState::EditingText;
    }
    srv.send(
        id,
        "Write your note. End with '@' on a line by itself.\r\n",
    );
}

fn do_channel(srv: &mut Server, id: SessionId, _arg: &str) {
    let Some(cid) = char_of(srv, id) else { return };
    match srv.world.char_mut(cid) {
        Some(ch) if ch.busy.is_some() => {
            srv.send(id, "You are already channeling!\r\n");
            return;
        }
        Some(ch) => ch.busy = Some("channeling"),
        None => return,
    }
    act(
        srv,
        "You cup your hands and begin channeling the hearth's warmth.",
        false,
        ActParams::from(cid),
        false,
        Scope::ToChar,
    );
    act(
        srv,
        "$n cups $s hands; the air around $m begins to shimmer.",
        true,
        ActParams::from(cid),
        false,
        Scope::ToRoom,
    );
    srv.events.schedule(
        srv.pulse,
        50,
        Some(Owner::Char(cid)),
        "channel_complete",
        Box::new(move |srv: &mut Server| {
            let still = srv
                .world
                .char_mut(cid)
                .map(|ch| {
                    let was = ch.busy.take().is_some();
                    if was {
                        ch.hp = (ch.hp + 10).min(ch.max_hp);
                    }
                    was
                })
                .unwrap_or(false);
            if still {
                act(
                    srv,
                    "Warmth floods through you.",
                    false,
                    ActParams::from(cid),
                    false,
                    Scope::ToChar,
                );
                act(
                    srv,
                    "The shimmer around $n fades.",
                    true,
                    ActParams::from(cid),
                    false,
                    Scope::ToRoom,
                );
            }
            Outcome::Finished
        }),
    );
}

fn do_abort(srv: &mut Server, id: SessionId, _arg: &str) {
    let Some(cid) = char_of(srv, id) else { return };
    let was_busy = srv
        .world
        .char_mut(cid)
        .map(|ch| ch.busy.take().is_some())
        .unwrap_or(false);
    if was_busy {
        srv.events.cancel_owner(Owner::Char(cid));
        srv.send(id, "You let the warmth slip away.\r\n");
    } else {
        srv.send(id, "You aren't concentrating on anything.\r\n");
    }
}

fn do_quit(srv: &mut Server, id: SessionId, _arg: &str) {
    srv.send(id, "The embers dim behind you. Come back soon.\r\n");
    srv.close_session(id, "quit");
}

fn do_snoop(srv: &mut Server, id: SessionId, arg: &str) {
    let target = arg.trim();
    if target.is_empty() || target.eq_ignore_ascii_case("off") {
        let old = srv.sessions.get(&id).and_then(|s| s.snooping);
        if let Some(t) = old {
            if let Some(ts) = srv.sessions.get_mut(&t) {
                ts.snooped_by = None;
            }
            if let Some(s) = srv.sessions.get_mut(&id) {
                s.snooping = None;
            }
            srv.send(id, "You stop snooping.\r\n");
        } else {
            srv.send(id, "Snoop whom?\r\n");
        }
        return;
    }
    let Some(vict_sid) = srv
        .world
        .find_player(target)
        .and_then(|cid| srv.world.char(cid))
        .and_then(|c| c.session)
    else {
        srv.send(id, "They aren't here.\r\n");
        return;
    };
    if vict_sid == id {
        srv.send(id, "You watch yourself intently. Fascinating.\r\n");
        return;
    }
    let already = srv
        .sessions
        .get(&vict_sid)
        .is_some_and(|s| s.snooped_by.is_some());
    if already {
        srv.send(id, "Someone is already snooping them.\r\n");
        return;
    }
    let loops = srv
        .sessions
        .get(&vict_sid)
        .is_some_and(|s| s.snooping == Some(id));
    if loops {
        srv.send(id, "No snoop loops.\r\n");
        return;
    }
    // Drop any previous target first.
    let old = srv.sessions.get(&id).and_then(|s| s.snooping);
    if let Some(t) = old {
        if let Some(ts) = srv.sessions.get_mut(&t) {
            ts.snooped_by = None;
        }
    }
    if let Some(s) = srv.sessions.get_mut(&id) {
        s.snooping = Some(vict_sid);
    }
    if let Some(ts) = srv.sessions.get_mut(&vict_sid) {
        ts.snooped_by = Some(id);
    }
    srv.send(id, "Ok.\r\n");
}

fn do_echo(srv: &mut Server, id: SessionId, arg: &str) {
    let Some(cid) = char_of(srv, id) else { return };
    if arg.trim().is_empty() {
        srv.send(id, "Echo what?\r\n");
        return;
    }
    act(srv, arg, false, ActParams::from(cid), true, Scope::ToChar);
    act(srv, arg, false, ActParams::from(cid), true, Scope::ToRoom);
}

fn do_shutdown(srv: &mut Server, id: SessionId, arg: &str) {
    let minutes: u64 = arg.trim().parse().unwrap_or(0);
    if minutes == 0 {
        info!(session = %id, "immediate shutdown ordered");
        srv.broadcast("\r\n&1The world fades to embers. Goodbye.&0\r\n");
        srv.exit = Some(Exit::Shutdown);
        return;
    }
    let pps = srv.cfg.pulses_per_sec();
    srv.shutdown_at = Some(srv.pulse + minutes * 60 * pps);
    info!(session = %id, minutes, "shutdown scheduled");
    srv.broadcast(&format!(
        "\r\n&1&8ATTENTION:&0 the server shuts down in {minutes} minute{}.\r\n",
        if minutes == 1 { "" } else { "s" }
    ));
}

fn do_copyover(srv: &mut Server, id: SessionId, _arg: &str) {
    info!(session = %id, "hot restart ordered");
    srv.broadcast("\r\n&3The world holds its breath as its bones are replaced...&0\r\n");
    srv.exit = Some(Exit::Hotboot);
}

fn do_usage(srv: &mut Server, id: SessionId, _arg: &str) {
    let uptime_secs = srv.pulse / srv.cfg.pulses_per_sec();
    let text = format!(
        "Uptime: {}s   Pulse: {}\r\n\
         Sessions: {} open, {} accepted, {} closed\r\n\
         Commands interpreted: {}\r\n\
         Events: {} pending, {} scheduled, {} run, {} dropped\r\n\
         Large buffers: {} allocated, {} reused, {} idle, {} overflows\r\n",
        uptime_secs,
        srv.pulse,
        srv.sessions.len(),
        srv.stats.accepted,
        srv.stats.closed,
        srv.stats.commands,
        srv.events.len(),
        srv.events.scheduled,
        srv.events.executed,
        srv.events.dropped,
        srv.pool.allocated,
        srv.pool.reused,
        srv.pool.idle(),
        srv.pool.overflows,
    );
    srv.send(id, &text);
}

const HELP_TEXT: &str = "\
&6cindermud commands&0\r\n\
------------------\r\n\
Movement:\r\n\
  north, east, south, west, up, down\r\n\
      Walk between rooms. Each step costs a little movement.\r\n\
\r\n\
Information:\r\n\
  look      Show the room you are in.\r\n\
  who       List everyone in the game.\r\n\
  score     Your vital statistics.\r\n\
  help      This text.\r\n\
\r\n\
Communication:\r\n\
  say <text>        Speak to the room.\r\n\
  emote <action>    Act out something, in third person.\r\n\
  tell <who> <text> Speak privately to someone, anywhere.\r\n\
  write             Compose a note; end with '@' on its own line.\r\n\
\r\n\
Settings:\r\n\
  prompt <template> Set your prompt. %h/%H hit points, %v/%V movement,\r\n\
                    %p position, %% a literal percent sign.\r\n\
  ansi <on|off>     Toggle color.\r\n\
\r\n\
Activity:\r\n\
  channel   Draw on the hearth's warmth. Takes a few seconds; most\r\n\
            commands are blocked until it completes.\r\n\
  abort     Stop channeling early.\r\n\
\r\n\
Input shortcuts:\r\n\
  !             Repeat your previous command.\r\n\
  ^old^new      Repeat it with 'old' replaced by 'new'.\r\n\
\r\n\
Leaving:\r\n\
  quit      Return to the world outside.\r\n\
\r\n\
While reading long text like this one, the pager is in control:\r\n\
  return          next page\r\n\
  b               back one page\r\n\
  r               redraw the current page\r\n\
  <number>        jump to that page\r\n\
  q or anything   stop reading\r\n\
";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::watch;

    async fn test_server() -> Server {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (tx, rx) = watch::channel(false);
        std::mem::forget(tx);
        let mut cfg = Config::default();
        cfg.mini = true;
        cfg.no_specials = true;
        Server::new(cfg, listener, rx)
    }

    async fn enter(srv: &mut Server, name: &str) -> (SessionId, TcpStream) {
        let client = TcpStream::connect(srv.listener.local_addr().unwrap())
            .await
            .unwrap();
        let (stream, addr) = srv.listener.accept().await.unwrap();
        let id = srv.new_session(stream, addr);
        handle_line(srv, id, "n");
        handle_line(srv, id, name);
        handle_line(srv, id, "1");
        (id, client)
    }

    fn drain(srv: &mut Server, id: SessionId) -> String {
        let mut chunk = Vec::new();
        let s = srv.sessions.get_mut(&id).unwrap();
        s.output.flush_into(&mut srv.pool, &mut chunk);
        String::from_utf8_lossy(&chunk).into_owned()
    }

    #[test]
    fn exact_name_beats_prefix() {
        // "e" finds east by prefix; "echo" must find echo exactly even
        // though east sits earlier in the table.
        assert_eq!(find_command("e").unwrap().name, "east");
        assert_eq!(find_command("echo").unwrap().name, "echo");
        assert_eq!(find_command("n").unwrap().name, "north");
        assert_eq!(find_command("LOOK").unwrap().name, "look");
        assert!(find_command("frobnicate").is_none());
        assert!(find_command("").is_none());
    }

    #[tokio::test]
    async fn nanny_walks_to_playing() {
        let mut srv = test_server().await;
        let client = TcpStream::connect(srv.listener.local_addr().unwrap())
            .await
            .unwrap();
        let (stream, addr) = srv.listener.accept().await.unwrap();
        let id = srv.new_session(stream, addr);
        assert_eq!(srv.sessions[&id].state, ConnState::Negotiating);
        handle_line(&mut srv, id, "nonsense");
        assert_eq!(srv.sessions[&id].state, ConnState::Negotiating);
        handle_line(&mut srv, id, "y");
        assert_eq!(srv.sessions[&id].state, ConnState::Authenticating);
        assert!(srv.sessions[&id].color);
        handle_line(&mut srv, id, "x9!");
        assert_eq!(srv.sessions[&id].state, ConnState::Authenticating);
        handle_line(&mut srv, id, "testa");
        assert_eq!(srv.sessions[&id].state, ConnState::InMenu);
        handle_line(&mut srv, id, "1");
        assert_eq!(srv.sessions[&id].state, ConnState::Playing);
        let ch = srv.world.char(srv.sessions[&id].char_id.unwrap()).unwrap();
        assert_eq!(ch.name, "Testa");
        drop(client);
    }

    #[tokio::test]
    async fn restricted_server_turns_mortals_away() {
        let mut srv = test_server().await;
        srv.restrict = true;
        let client = TcpStream::connect(srv.listener.local_addr().unwrap())
            .await
            .unwrap();
        let (stream, addr) = srv.listener.accept().await.unwrap();
        let id = srv.new_session(stream, addr);
        handle_line(&mut srv, id, "y");
        handle_line(&mut srv, id, "Testa");
        assert_eq!(srv.sessions[&id].state, ConnState::Closing);
        // Admins still get in.
        let client2 = TcpStream::connect(srv.listener.local_addr().unwrap())
            .await
            .unwrap();
        let (stream, addr) = srv.listener.accept().await.unwrap();
        let id2 = srv.new_session(stream, addr);
        handle_line(&mut srv, id2, "y");
        handle_line(&mut srv, id2, "Vesta");
        assert_eq!(srv.sessions[&id2].state, ConnState::InMenu);
        drop((client, client2));
    }

    #[tokio::test]
    async fn busy_blocks_all_but_the_whitelist() {
        let mut srv = test_server().await;
        let (id, _client) = enter(&mut srv, "Testa").await;
        drain(&mut srv, id);
        handle_line(&mut srv, id, "channel");
        drain(&mut srv, id);
        handle_line(&mut srv, id, "who");
        assert!(drain(&mut srv, id).contains("You can't do that while channeling!"));
        handle_line(&mut srv, id, "look");
        assert!(drain(&mut srv, id).contains("The Cinder Tavern"));
        handle_line(&mut srv, id, "abort");
        assert!(drain(&mut srv, id).contains("You let the warmth slip away."));
        handle_line(&mut srv, id, "who");
        assert!(drain(&mut srv, id).contains("Souls among the embers"));
    }

    #[tokio::test]
    async fn channel_completes_through_the_event_queue() {
        let mut srv = test_server().await;
        let (id, _client) = enter(&mut srv, "Testa").await;
        let cid = srv.sessions[&id].char_id.unwrap();
        srv.world.char_mut(cid).unwrap().hp = 50;
        handle_line(&mut srv, id, "channel");
        assert!(srv.world.char(cid).unwrap().busy.is_some());
        srv.pulse += 50;
        srv.process_events();
        assert!(srv.world.char(cid).unwrap().busy.is_none());
        assert_eq!(srv.world.char(cid).unwrap().hp, 60);
    }

    #[tokio::test]
    async fn pager_captures_input_until_done() {
        let mut srv = test_server().await;
        let (id, _client) = enter(&mut srv, "Testa").await;
        drain(&mut srv, id);
        handle_line(&mut srv, id, "help");
        assert!(srv.sessions[&id].pager.is_some());
        let first = drain(&mut srv, id);
        assert!(first.contains("cindermud commands"));
        // While paging, ordinary commands are navigation, not commands.
        handle_line(&mut srv, id, "q");
        assert!(srv.sessions[&id].pager.is_none());
        assert!(drain(&mut srv, id).is_empty());
    }

    #[tokio::test]
    async fn unknown_command_gets_huh() {
        let mut srv = test_server().await;
        let (id, _client) = enter(&mut srv, "Testa").await;
        drain(&mut srv, id);
        handle_line(&mut srv, id, "frobnicate the bar");
        assert!(drain(&mut srv, id).contains("Huh?!?"));
    }

    #[tokio::test]
    async fn wizard_commands_hide_from_mortals() {
        let mut srv = test_server().await;
        let (id, _client) = enter(&mut srv, "Testa").await;
        drain(&mut srv, id);
        handle_line(&mut srv, id, "shutdown 5");
        assert!(drain(&mut srv, id).contains("Huh?!?"));
        assert!(srv.shutdown_at.is_none());
        let (wiz, _client2) = enter(&mut srv, "Vesta").await;
        drain(&mut srv, wiz);
        handle_line(&mut srv, wiz, "shutdown 5");
        assert!(srv.shutdown_at.is_some());
    }

    #[tokio::test]
    async fn snoop_mirrors_target_io() {
        let mut srv = test_server().await;
        let (wiz, _c1) = enter(&mut srv, "Vesta").await;
        let (tgt, _c2) = enter(&mut srv, "Testa").await;
        drain(&mut srv, wiz);
        drain(&mut srv, tgt);
        handle_line(&mut srv, wiz, "snoop testa");
        assert!(drain(&mut srv, wiz).contains("Ok."));
        assert_eq!(srv.sessions[&wiz].snooping, Some(tgt));
        assert_eq!(srv.sessions[&tgt].snooped_by, Some(wiz));
        // Closing the target unlinks the pair.
        srv.close_session(tgt, "test");
        srv.close_phase();
        assert_eq!(srv.sessions[&wiz].snooping, None);
        assert!(drain(&mut srv, wiz).contains("Your snoop target is gone."));
    }

    #[tokio::test]
    async fn editor_collects_note_lines() {
        let mut srv = test_server().await;
        let (id, _client) = enter(&mut srv, "Testa").await;
        drain(&mut srv, id);
        handle_line(&mut srv, id, "write");
        assert_eq!(srv.sessions[&id].state, ConnState::EditingText);
        handle_line(&mut srv, id, "meet me at the arena");
        handle_line(&mut srv, id, "@");
        assert_eq!(srv.sessions[&id].state, ConnState::Playing);
        assert!(drain(&mut srv, id).contains("You pin your note to the board."));
    }
}
