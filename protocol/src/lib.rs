//! The reserved JSON vocabulary shared between transports and game sessions.
//!
//! Wire messages are plain JSON objects. Only a handful of keys carry
//! server-interpreted meaning (`msg`, `lock`, `join`, `playerId`, `step`,
//! `disconnected`); everything else in a message is opaque application
//! payload that the relay forwards untouched. [`Frame`] wraps a decoded
//! object and gives typed access to that reserved vocabulary.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// Reserved keys / values. Kept as named constants rather than inline
// literals since they are cross-checked against the wire in several places
// (handshake, topic routing, stamping).
pub const MSG_KEY: &str = "msg";
pub const LOCK_KEY: &str = "lock";
pub const JOIN_KEY: &str = "join";
pub const SYNCER_KEY: &str = "syncer";
pub const NEW_GAME_KEY: &str = "newGame";
pub const SEED_KEY: &str = "seed";
pub const PLAYER_ID_KEY: &str = "playerId";
pub const STEP_KEY: &str = "step";
pub const DISCONNECTED_KEY: &str = "disconnected";
pub const ID_KEY: &str = "id";

pub const WELCOME_MSG: &str = "Welcome!";
pub const SYNC_MSG: &str = "sync";
pub const ALIVE_MSG: &str = "alive";
pub const JOIN_MSG: &str = "join";

const GAME_TYPE_KEYS: [&str; 2] = ["gameType", "game-type"];
const MAX_PLAYERS_KEYS: [&str; 2] = ["maxPlayers", "max-players"];
const STEP_TIME_KEYS: [&str; 2] = ["stepTime", "step-time"];

/// A decoded message: a flat JSON object, possibly carrying any opaque
/// application fields alongside the reserved ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Frame(pub Map<String, Value>);

/// The four publication buckets a message can be routed into on egress.
/// See spec §4.5: lock presence wins, then `msg`, else `:other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Lock,
    Sync,
    Join,
    Other,
}

/// The canonical handshake payload, after alternate-key normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameInfo {
    pub game_type: String,
    pub max_players: u32,
    pub step_time: u64,
}

impl Frame {
    pub fn new() -> Self {
        Frame(Map::new())
    }

    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Frame(map)),
            _ => None,
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn msg(&self) -> Option<&str> {
        self.get_str(MSG_KEY)
    }

    /// msg == "sync": a donor's authoritative state reply.
    pub fn is_sync(&self) -> bool {
        self.msg() == Some(SYNC_MSG)
    }

    /// msg == "alive": a heartbeat, never broadcast.
    pub fn is_alive(&self) -> bool {
        self.msg() == Some(ALIVE_MSG)
    }

    /// Presence of the `lock` key identifies a tick-barrier message.
    pub fn has_lock(&self) -> bool {
        self.0.contains_key(LOCK_KEY)
    }

    pub fn lock_step(&self) -> Option<u64> {
        self.0.get(LOCK_KEY).and_then(Value::as_u64)
    }

    /// Topic routing per spec §4.5: lock beats msg, msg=="join" beats the
    /// opaque fallback.
    pub fn topic(&self) -> Topic {
        if self.has_lock() {
            Topic::Lock
        } else if self.is_sync() {
            Topic::Sync
        } else if self.msg() == Some(JOIN_MSG) {
            Topic::Join
        } else {
            Topic::Other
        }
    }

    /// Attempts to read the three handshake fields, accepting either the
    /// camelCase or kebab-case spellings spec §4.3 allows.
    pub fn parse_handshake(&self) -> Option<GameInfo> {
        let game_type = first_str(&self.0, &GAME_TYPE_KEYS)?.to_owned();
        let max_players = first_u64(&self.0, &MAX_PLAYERS_KEYS)?;
        let step_time = first_u64(&self.0, &STEP_TIME_KEYS)?;
        Some(GameInfo {
            game_type,
            max_players: max_players as u32,
            step_time,
        })
    }

    /// Stamps (overrides) the `playerId` field, per spec's invariant that
    /// the server-assigned slot always wins over client-supplied values.
    pub fn stamp_player_id(&mut self, player_id: u32) {
        self.0
            .insert(PLAYER_ID_KEY.to_string(), Value::from(player_id));
    }

    pub fn stamp_step(&mut self, step: u64) {
        self.0.insert(STEP_KEY.to_string(), Value::from(step));
    }

    pub fn welcome(id: &str) -> Frame {
        let mut m = Map::new();
        m.insert(MSG_KEY.to_string(), Value::from(WELCOME_MSG));
        m.insert(ID_KEY.to_string(), Value::from(id));
        Frame(m)
    }

    pub fn admission(new_game: bool, player_id: u32, seed: i64) -> Frame {
        let mut m = Map::new();
        m.insert(JOIN_KEY.to_string(), Value::from(true));
        m.insert(NEW_GAME_KEY.to_string(), Value::from(new_game));
        m.insert(PLAYER_ID_KEY.to_string(), Value::from(player_id));
        m.insert(SEED_KEY.to_string(), Value::from(seed));
        Frame(m)
    }

    pub fn lock(step: u64) -> Frame {
        let mut m = Map::new();
        m.insert(LOCK_KEY.to_string(), Value::from(step));
        Frame(m)
    }

    /// Builds a bare join announcement with no `step` field. The stepped
    /// pipeline attaches one afterwards via [`Frame::stamp_step`] once the
    /// ticker knows which lock it is batched alongside; the stepless
    /// pipeline never attaches one at all.
    pub fn join_announce(syncer_id: u32) -> Frame {
        let mut m = Map::new();
        m.insert(MSG_KEY.to_string(), Value::from(JOIN_MSG));
        m.insert(SYNCER_KEY.to_string(), Value::from(syncer_id));
        Frame(m)
    }

    pub fn disconnected(player_id: u32) -> Frame {
        let mut m = Map::new();
        m.insert(DISCONNECTED_KEY.to_string(), Value::from(player_id));
        Frame(m)
    }

    pub fn to_json_line(&self) -> String {
        // Objects serialize infallibly; a Frame can never contain a
        // non-JSON-representable value since it is built from decoded JSON.
        serde_json::to_string(&Value::Object(self.0.clone()))
            .unwrap_or_else(|_| "{}".to_string())
    }
}

impl Default for Frame {
    fn default() -> Self {
        Frame::new()
    }
}

fn first_str<'a>(map: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| map.get(*k)).and_then(Value::as_str)
}

fn first_u64(map: &Map<String, Value>, keys: &[&str]) -> Option<u64> {
    keys.iter().find_map(|k| map.get(*k)).and_then(Value::as_u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_from(json: &str) -> Frame {
        let value: Value = serde_json::from_str(json).unwrap();
        Frame::from_value(value).unwrap()
    }

    #[test]
    fn parses_camel_case_handshake() {
        let f = frame_from(r#"{"gameType":"chess","maxPlayers":2,"stepTime":100}"#);
        let info = f.parse_handshake().unwrap();
        assert_eq!(info.game_type, "chess");
        assert_eq!(info.max_players, 2);
        assert_eq!(info.step_time, 100);
    }

    #[test]
    fn parses_kebab_case_handshake() {
        let f = frame_from(r#"{"game-type":"go","max-players":4,"step-time":0}"#);
        let info = f.parse_handshake().unwrap();
        assert_eq!(info.game_type, "go");
        assert_eq!(info.max_players, 4);
        assert_eq!(info.step_time, 0);
    }

    #[test]
    fn incomplete_handshake_is_none() {
        let f = frame_from(r#"{"gameType":"chess"}"#);
        assert!(f.parse_handshake().is_none());
    }

    #[test]
    fn topic_routing_prefers_lock_over_msg() {
        let f = frame_from(r#"{"lock":3,"msg":"sync"}"#);
        assert_eq!(f.topic(), Topic::Lock);
    }

    #[test]
    fn topic_routing_sync_then_join_then_other() {
        assert_eq!(frame_from(r#"{"msg":"sync"}"#).topic(), Topic::Sync);
        assert_eq!(frame_from(r#"{"msg":"join","syncer":1}"#).topic(), Topic::Join);
        assert_eq!(frame_from(r#"{"chat":"hi"}"#).topic(), Topic::Other);
    }

    #[test]
    fn alive_is_never_a_protocol_topic() {
        // alive frames are filtered out of the pipeline before topic
        // routing even applies; routing itself just sees them as :other.
        let f = frame_from(r#"{"msg":"alive"}"#);
        assert!(f.is_alive());
        assert_eq!(f.topic(), Topic::Other);
    }

    #[test]
    fn stamping_overrides_client_supplied_player_id() {
        let mut f = frame_from(r#"{"action":"move","playerId":999}"#);
        f.stamp_player_id(3);
        assert_eq!(f.0.get(PLAYER_ID_KEY).and_then(Value::as_u64), Some(3));
    }

    #[test]
    fn admission_round_trips_through_json() {
        let f = Frame::admission(true, 0, 12345);
        let line = f.to_json_line();
        let parsed: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["join"], true);
        assert_eq!(parsed["newGame"], true);
        assert_eq!(parsed["playerId"], 0);
        assert_eq!(parsed["seed"], 12345);
    }
}
