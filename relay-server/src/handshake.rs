//! Handshake (spec §4.3): greet the client, wait for its game selection,
//! hand the resulting [`Player`] to the dispatcher.

use std::time::Instant;

use protocol::Frame;

use crate::player::Player;
use crate::transport::{ConnReadHalf, ConnWriteHalf};

/// Runs the handshake on an unsplit connection. Returns `None` if the
/// client disconnects before sending a valid handshake message; such a
/// player is discarded without ever reaching the dispatcher.
pub async fn perform(
    player_id: String,
    reader: &mut ConnReadHalf,
    writer: &mut ConnWriteHalf,
    epoch: Instant,
) -> Option<Player> {
    if !writer.write_frame(&Frame::welcome(&player_id)).await {
        tracing::warn!(%player_id, "failed to send welcome, abandoning handshake");
        return None;
    }

    loop {
        let frame = reader.read_frame().await?;
        match frame.parse_handshake() {
            Some(game_info) => {
                tracing::debug!(%player_id, game_type = %game_info.game_type, "handshake complete");
                return Some(Player::new(player_id, game_info, epoch));
            }
            None => {
                // Not a handshake message; per spec §4.3 it is silently
                // dropped, never forwarded anywhere (the player is not in
                // a session yet).
                tracing::trace!(%player_id, "non-handshake message dropped before session join");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::GameInfo;
    use serde_json::json;

    #[test]
    fn handshake_game_info_matches_player_session_fields() {
        // Regression guard for the field names the live handshake loop
        // depends on; keeps protocol::Frame and this module in lockstep.
        let frame = Frame::from_value(json!({
            "gameType": "chess",
            "maxPlayers": 2,
            "stepTime": 100
        }))
        .unwrap();
        assert_eq!(
            frame.parse_handshake(),
            Some(GameInfo {
                game_type: "chess".to_string(),
                max_players: 2,
                step_time: 100,
            })
        );
    }
}
