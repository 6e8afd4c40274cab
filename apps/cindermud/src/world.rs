//! The game world: rooms, characters, and who can see whom. The built-in
//! area is deliberately small; it exists to exercise the service core
//! (movement, visibility, arena spectating, NPC activity) rather than to
//! be a game in itself.

use std::collections::HashMap;

use crate::session::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CharId(pub u64);

impl std::fmt::Display for CharId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoomId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sex {
    Neuter,
    Male,
    Female,
}

impl Sex {
    /// Objective pronoun: him/her/it.
    pub fn him_her(self) -> &'static str {
        match self {
            Sex::Male => "him",
            Sex::Female => "her",
            Sex::Neuter => "it",
        }
    }

    /// Possessive pronoun: his/her/its.
    pub fn his_her(self) -> &'static str {
        match self {
            Sex::Male => "his",
            Sex::Female => "her",
            Sex::Neuter => "its",
        }
    }

    /// Subjective pronoun: he/she/it.
    pub fn he_she(self) -> &'static str {
        match self {
            Sex::Male => "he",
            Sex::Female => "she",
            Sex::Neuter => "it",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    Sleeping,
    Resting,
    Standing,
}

impl Position {
    pub fn as_str(self) -> &'static str {
        match self {
            Position::Sleeping => "sleeping",
            Position::Resting => "resting",
            Position::Standing => "standing",
        }
    }
}

pub const NUM_DIRS: usize = 6;
pub const DIR_NAMES: [&str; NUM_DIRS] = ["north", "east", "south", "west", "up", "down"];
pub const REV_DIR: [usize; NUM_DIRS] = [2, 3, 0, 1, 5, 4];

pub struct Character {
    pub id: CharId,
    pub name: String,
    pub sex: Sex,
    pub room: RoomId,
    pub hp: i32,
    pub max_hp: i32,
    pub moves: i32,
    pub max_moves: i32,
    pub position: Position,
    pub invisible: bool,
    pub wizard: bool,
    pub npc: bool,
    pub session: Option<SessionId>,
    /// Prompt template rendered with `%`-codes before each prompt.
    pub prompt: String,
    /// Label of a multi-pulse activity in progress, if any.
    pub busy: Option<&'static str>,
}

impl Character {
    pub fn awake(&self) -> bool {
        self.position != Position::Sleeping
    }
}

pub struct Room {
    pub name: String,
    pub description: String,
    pub exits: [Option<RoomId>; NUM_DIRS],
    pub people: Vec<CharId>,
    /// Room-level act() mirroring: events here reflect into adjacent
    /// observatory rooms.
    pub arena: bool,
    pub observatory: bool,
}

impl Room {
    fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            exits: [None; NUM_DIRS],
            people: Vec::new(),
            arena: false,
            observatory: false,
        }
    }
}

pub struct World {
    pub rooms: Vec<Room>,
    pub chars: HashMap<CharId, Character>,
    next_char: u64,
    pub start: RoomId,
}

impl World {
    /// Build the built-in area. `mini` keeps only the first two rooms for
    /// quick smoke runs.
    pub fn build(mini: bool) -> Self {
        let mut rooms = vec![
            Room::new(
                "The Cinder Tavern",
                "Soot-stained beams hold up a low ceiling. A fire smolders in the\r\n\
                 hearth, and the smell of old ale hangs in the air.",
            ),
            Room::new(
                "Dusty Lane",
                "A narrow lane of packed ash runs between leaning buildings.",
            ),
        ];
        if !mini {
            rooms.push(Room::new(
                "The Ashen Arena",
                "A wide ring of scorched sand, walled by cracked stone. Scuff marks\r\n\
                 and old bloodstains tell of past bouts.",
            ));
            rooms.push(Room::new(
                "Observatory Balcony",
                "A railed balcony overlooks the arena floor below. Everything that\r\n\
                 happens down there can be watched from here in safety.",
            ));
            rooms[2].arena = true;
            rooms[3].observatory = true;
        }
        let mut world = Self {
            rooms,
            chars: HashMap::new(),
            next_char: 1,
            start: RoomId(0),
        };
        world.link(RoomId(0), 0, RoomId(1));
        if !mini {
            world.link(RoomId(1), 1, RoomId(2));
            world.link(RoomId(2), 4, RoomId(3));
        }
        world
    }

    /// Two-way exit between rooms.
    fn link(&mut self, from: RoomId, dir: usize, to: RoomId) {
        self.rooms[from.0].exits[dir] = Some(to);
        self.rooms[to.0].exits[REV_DIR[dir]] = Some(from);
    }

    pub fn room(&self, id: RoomId) -> &Room {
        &self.rooms[id.0]
    }

    pub fn char(&self, id: CharId) -> Option<&Character> {
        self.chars.get(&id)
    }

    pub fn char_mut(&mut self, id: CharId) -> Option<&mut Character> {
        self.chars.get_mut(&id)
    }

    pub fn create_char(&mut self, name: &str, sex: Sex, room: RoomId, npc: bool) -> CharId {
        let id = CharId(self.next_char);
        self.next_char += 1;
        self.chars.insert(
            id,
            Character {
                id,
                name: name.to_string(),
                sex,
                room,
                hp: 100,
                max_hp: 100,
                moves: 100,
                max_moves: 100,
                position: Position::Standing,
                invisible: false,
                wizard: false,
                npc,
                session: None,
                prompt: "&2%h/%Hhp %v/%Vmv&0> ".to_string(),
                busy: None,
            },
        );
        self.rooms[room.0].people.push(id);
        id
    }

    /// Detach a character from its room and drop it from the world.
    pub fn remove_char(&mut self, id: CharId) {
        if let Some(ch) = self.chars.remove(&id) {
            self.rooms[ch.room.0].people.retain(|&p| p != id);
        }
    }

    pub fn move_char(&mut self, id: CharId, to: RoomId) {
        if let Some(ch) = self.chars.get_mut(&id) {
            let from = ch.room;
            ch.room = to;
            self.rooms[from.0].people.retain(|&p| p != id);
            self.rooms[to.0].people.push(id);
        }
    }

    /// Whether `viewer` perceives `target` at all. Everyone sees
    /// themselves; immortal sight pierces invisibility.
    pub fn can_see(&self, viewer: CharId, target: CharId) -> bool {
        let Some(t) = self.chars.get(&target) else {
            return false;
        };
        if viewer == target {
            return true;
        }
        if !t.invisible {
            return true;
        }
        self.chars.get(&viewer).is_some_and(|v| v.wizard)
    }

    /// How `viewer` names `target`: the real name, or "someone" when the
    /// target cannot be seen.
    pub fn pers(&self, viewer: CharId, target: CharId) -> String {
        if self.can_see(viewer, target) {
            self.chars
                .get(&target)
                .map_or_else(|| "someone".to_string(), |c| c.name.clone())
        } else {
            "someone".to_string()
        }
    }

    /// Case-insensitive lookup among player characters.
    pub fn find_player(&self, name: &str) -> Option<CharId> {
        self.chars
            .values()
            .find(|c| !c.npc && c.name.eq_ignore_ascii_case(name))
            .map(|c| c.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exits_are_two_way() {
        let w = World::build(false);
        assert_eq!(w.room(RoomId(0)).exits[0], Some(RoomId(1)));
        assert_eq!(w.room(RoomId(1)).exits[2], Some(RoomId(0)));
        assert_eq!(w.room(RoomId(2)).exits[4], Some(RoomId(3)));
        assert_eq!(w.room(RoomId(3)).exits[5], Some(RoomId(2)));
    }

    #[test]
    fn mini_world_has_no_arena() {
        let w = World::build(true);
        assert_eq!(w.rooms.len(), 2);
        assert!(!w.rooms.iter().any(|r| r.arena));
    }

    #[test]
    fn movement_updates_occupancy() {
        let mut w = World::build(false);
        let id = w.create_char("Testa", Sex::Female, RoomId(0), false);
        assert!(w.room(RoomId(0)).people.contains(&id));
        w.move_char(id, RoomId(1));
        assert!(!w.room(RoomId(0)).people.contains(&id));
        assert!(w.room(RoomId(1)).people.contains(&id));
        w.remove_char(id);
        assert!(w.room(RoomId(1)).people.is_empty());
    }

    #[test]
    fn invisibility_hides_from_mortals_only() {
        let mut w = World::build(true);
        let hidden = w.create_char("Ghost", Sex::Neuter, RoomId(0), false);
        let mortal = w.create_char("Mort", Sex::Male, RoomId(0), false);
        let wiz = w.create_char("Wiz", Sex::Female, RoomId(0), false);
        w.char_mut(hidden).unwrap().invisible = true;
        w.char_mut(wiz).unwrap().wizard = true;
        assert!(!w.can_see(mortal, hidden));
        assert!(w.can_see(wiz, hidden));
        // Invisibility never hides a character from themselves.
        assert!(w.can_see(hidden, hidden));
        assert_eq!(w.pers(mortal, hidden), "someone");
        assert_eq!(w.pers(wiz, hidden), "Ghost");
        assert_eq!(w.pers(hidden, hidden), "Ghost");
    }
}
