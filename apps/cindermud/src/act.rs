//! Message templating and room delivery. Templates carry `$`-codes that
//! expand per recipient, so each onlooker gets a line phrased for what
//! they can actually see. Delivery scopes pick the audience; arena rooms
//! additionally mirror room-scoped messages into adjacent observatory
//! rooms with a tag naming where the action happened.

use tracing::warn;

use crate::server::Server;
use crate::session::ConnState;
use crate::world::{CharId, World};

/// Who a message goes to, relative to the actor's room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// The actor only.
    ToChar,
    /// The victim only.
    ToVict,
    /// Everyone in the room except actor and victim.
    ToNotVict,
    /// Everyone in the room except the actor.
    ToRoom,
}

#[derive(Clone, Copy)]
pub struct ActParams<'a> {
    pub actor: CharId,
    pub victim: Option<CharId>,
    pub item: Option<&'a str>,
    pub item2: Option<&'a str>,
}

impl<'a> ActParams<'a> {
    pub fn from(actor: CharId) -> Self {
        Self {
            actor,
            victim: None,
            item: None,
            item2: None,
        }
    }

    pub fn victim(mut self, v: CharId) -> Self {
        self.victim = Some(v);
        self
    }

    pub fn item(mut self, i: &'a str) -> Self {
        self.item = Some(i);
        self
    }
}

/// Expand one template for one viewer. `$$` collapses to a literal `$`,
/// so user-typed text that was escaped on input round-trips unchanged.
pub fn format_act(world: &World, template: &str, params: &ActParams, viewer: CharId) -> String {
    let mut out = String::with_capacity(template.len() + 16);
    let mut upnext = false;
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            push_char(&mut out, c, &mut upnext);
            continue;
        }
        let Some(code) = chars.next() else { break };
        let expansion: String = match code {
            'n' => world.pers(viewer, params.actor),
            'N' => opt_pers(world, viewer, params.victim),
            'm' => actor_sex(world, params.actor).him_her().into(),
            'M' => victim_sex(world, params.victim).him_her().into(),
            's' => actor_sex(world, params.actor).his_her().into(),
            'S' => victim_sex(world, params.victim).his_her().into(),
            'e' => actor_sex(world, params.actor).he_she().into(),
            'E' => victim_sex(world, params.victim).he_she().into(),
            'o' | 'p' => params.item.unwrap_or("something").into(),
            'O' | 'P' => params.item2.unwrap_or("something").into(),
            'u' => {
                uppercase_last_word(&mut out);
                String::new()
            }
            'U' => {
                upnext = true;
                String::new()
            }
            '$' => "$".into(),
            other => {
                warn!(code = %other, template, "unknown $-code in message template");
                String::new()
            }
        };
        for ec in expansion.chars() {
            push_char(&mut out, ec, &mut upnext);
        }
    }
    capitalize_first(&mut out);
    out.push_str("\r\n");
    out
}

fn push_char(out: &mut String, c: char, upnext: &mut bool) {
    if *upnext && !c.is_whitespace() {
        out.extend(c.to_uppercase());
        *upnext = false;
    } else {
        out.push(c);
    }
}

fn opt_pers(world: &World, viewer: CharId, victim: Option<CharId>) -> String {
    match victim {
        Some(v) => world.pers(viewer, v),
        None => "someone".into(),
    }
}

fn actor_sex(world: &World, id: CharId) -> crate::world::Sex {
    world.char(id).map_or(crate::world::Sex::Neuter, |c| c.sex)
}

fn victim_sex(world: &World, victim: Option<CharId>) -> crate::world::Sex {
    victim
        .and_then(|v| world.char(v))
        .map_or(crate::world::Sex::Neuter, |c| c.sex)
}

fn uppercase_last_word(out: &mut String) {
    let start = out
        .rfind(char::is_whitespace)
        .map(|i| i + 1)
        .unwrap_or(0);
    if let Some(c) = out[start..].chars().next() {
        let upper: String = c.to_uppercase().collect();
        out.replace_range(start..start + c.len_utf8(), &upper);
    }
}

/// Uppercase the first visible letter, skipping leading color markup.
fn capitalize_first(out: &mut String) {
    let bytes = out.as_bytes();
    let mut i = 0;
    while i + 1 < bytes.len() && bytes[i] == b'&' && bytes[i + 1] != b'&' {
        i += 2;
    }
    if let Some(c) = out[i..].chars().next() {
        let upper: String = c.to_uppercase().collect();
        out.replace_range(i..i + c.len_utf8(), &upper);
    }
}

/// Expand and deliver a template to its audience. `hide_invisible` drops
/// recipients who cannot see the actor entirely; `to_sleeping` lets the
/// message through to sleeping recipients.
pub fn act(
    srv: &mut Server,
    template: &str,
    hide_invisible: bool,
    params: ActParams<'_>,
    to_sleeping: bool,
    scope: Scope,
) {
    match scope {
        Scope::ToChar => {
            if receives(srv, params.actor, to_sleeping) {
                let text = format_act(&srv.world, template, &params, params.actor);
                srv.send_to_char(params.actor, &text);
            }
        }
        Scope::ToVict => {
            let Some(vict) = params.victim else { return };
            if receives(srv, vict, to_sleeping)
                && !(hide_invisible && !srv.world.can_see(vict, params.actor))
            {
                let text = format_act(&srv.world, template, &params, vict);
                srv.send_to_char(vict, &text);
            }
        }
        Scope::ToNotVict | Scope::ToRoom => {
            let Some(actor) = srv.world.char(params.actor) else {
                return;
            };
            let room_id = actor.room;
            let audience = srv.world.room(room_id).people.clone();
            for to in audience {
                if to == params.actor || (scope == Scope::ToNotVict && Some(to) == params.victim) {
                    continue;
                }
                if !receives(srv, to, to_sleeping)
                    || (hide_invisible && !srv.world.can_see(to, params.actor))
                {
                    continue;
                }
                let text = format_act(&srv.world, template, &params, to);
                srv.send_to_char(to, &text);
            }
            mirror_to_observers(srv, template, hide_invisible, &params, to_sleeping, scope, room_id);
        }
    }
}

/// Arena rooms reflect room-scoped messages into observatory rooms behind
/// their exits, tagged with the arena's name.
fn mirror_to_observers(
    srv: &mut Server,
    template: &str,
    hide_invisible: bool,
    params: &ActParams<'_>,
    to_sleeping: bool,
    scope: Scope,
    room_id: crate::world::RoomId,
) {
    if !srv.world.room(room_id).arena {
        return;
    }
    let arena_name = srv.world.room(room_id).name.clone();
    let exits = srv.world.room(room_id).exits;
    for exit in exits.into_iter().flatten() {
        if !srv.world.room(exit).observatory {
            continue;
        }
        let watchers = srv.world.room(exit).people.clone();
        for to in watchers {
            if to == params.actor || (scope == Scope::ToNotVict && Some(to) == params.victim) {
                continue;
            }
            if !receives(srv, to, to_sleeping)
                || (hide_invisible && !srv.world.can_see(to, params.actor))
            {
                continue;
            }
            let text = format_act(&srv.world, template, params, to);
            let tagged = format!("&4&8<&0{arena_name}&0&4&8>&0 {text}");
            srv.send_to_char(to, &tagged);
        }
    }
}

/// A character is in a state to receive messages at all: attached to a
/// live in-game session, and awake unless the message pierces sleep.
fn receives(srv: &Server, id: CharId, to_sleeping: bool) -> bool {
    let Some(ch) = srv.world.char(id) else {
        return false;
    };
    let Some(sid) = ch.session else { return false };
    let playing = srv
        .sessions
        .get(&sid)
        .is_some_and(|s| s.state == ConnState::Playing || s.state == ConnState::EditingText);
    playing && (ch.awake() || to_sleeping)
}
