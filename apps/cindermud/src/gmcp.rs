//! GMCP support, carried in telnet option 201. The server offers the
//! option at connect; if the client turns it on, structured JSON messages
//! ride subnegotiation frames alongside the normal text stream. Inbound
//! GMCP is parsed and logged but intentionally not acted on.

use serde_json::{json, Value};

use cinderio::telnet::{subneg_frame, OPT_GMCP};

use crate::world::{Character, Room};

/// Frame one `Module.Name {json}` message for the wire.
pub fn frame(module: &str, payload: &Value) -> Vec<u8> {
    let mut body = Vec::with_capacity(module.len() + 64);
    body.extend_from_slice(module.as_bytes());
    body.push(b' ');
    body.extend_from_slice(payload.to_string().as_bytes());
    subneg_frame(OPT_GMCP, &body)
}

/// Messages announcing what the server can drive on the client side, sent
/// once when the client enables the option.
pub fn enable_payloads() -> Vec<Vec<u8>> {
    vec![
        frame("Client.GUI", &json!({ "version": env!("CARGO_PKG_VERSION") })),
        frame("Client.Map", &json!({ "url": "" })),
    ]
}

pub fn char_vitals(ch: &Character) -> Vec<u8> {
    frame(
        "Char.Vitals",
        &json!({
            "hp": ch.hp,
            "max_hp": ch.max_hp,
            "mv": ch.moves,
            "max_mv": ch.max_moves,
            "position": ch.position.as_str(),
        }),
    )
}

/// Combat scoreboard for the client. There is no fighting engine behind
/// it yet, so the opponent slot stays null and only the stance changes.
pub fn char_combat(ch: &Character) -> Vec<u8> {
    frame(
        "Char.Combat",
        &json!({
            "opponent": Value::Null,
            "stance": ch.position.as_str(),
        }),
    )
}

pub fn room_info(room: &Room) -> Vec<u8> {
    let exits: Vec<&str> = room
        .exits
        .iter()
        .enumerate()
        .filter(|(_, e)| e.is_some())
        .map(|(i, _)| crate::world::DIR_NAMES[i])
        .collect();
    frame(
        "Room.Info",
        &json!({
            "name": room.name,
            "exits": exits,
        }),
    )
}

/// Split an inbound frame into module name and JSON body. A missing body
/// parses as null; a malformed body rejects the frame.
pub fn parse_incoming(payload: &[u8]) -> Option<(String, Value)> {
    let text = std::str::from_utf8(payload).ok()?;
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    match text.split_once(' ') {
        Some((module, body)) => {
            let value = serde_json::from_str(body.trim()).ok()?;
            Some((module.to_string(), value))
        }
        None => Some((text.to_string(), Value::Null)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinderio::telnet::{IAC, SB, SE};

    #[test]
    fn frames_module_and_json() {
        let f = frame("Char.Vitals", &json!({ "hp": 10 }));
        assert_eq!(&f[..3], &[IAC, SB, OPT_GMCP]);
        assert_eq!(&f[f.len() - 2..], &[IAC, SE]);
        let body = std::str::from_utf8(&f[3..f.len() - 2]).unwrap();
        assert_eq!(body, "Char.Vitals {\"hp\":10}");
    }

    #[test]
    fn combat_frame_has_a_null_opponent() {
        use crate::world::{RoomId, Sex, World};
        let mut w = World::build(true);
        let id = w.create_char("Testa", Sex::Female, RoomId(0), false);
        let f = char_combat(w.char(id).unwrap());
        let body = std::str::from_utf8(&f[3..f.len() - 2]).unwrap();
        let (module, json) = body.split_once(' ').unwrap();
        assert_eq!(module, "Char.Combat");
        let v: Value = serde_json::from_str(json).unwrap();
        assert!(v["opponent"].is_null());
        assert_eq!(v["stance"], "standing");
    }

    #[test]
    fn parses_module_with_body() {
        let (module, value) = parse_incoming(b"Core.Hello {\"client\":\"mudlet\"}").unwrap();
        assert_eq!(module, "Core.Hello");
        assert_eq!(value["client"], "mudlet");
    }

    #[test]
    fn parses_bare_module() {
        let (module, value) = parse_incoming(b"Core.Ping").unwrap();
        assert_eq!(module, "Core.Ping");
        assert!(value.is_null());
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_incoming(b"").is_none());
        assert!(parse_incoming(b"Core.Hello {not json").is_none());
        assert!(parse_incoming(&[0xff, 0xfe]).is_none());
    }
}
