//! In-memory win/loss aggregates, updated on every resolution and served
//! read-only over HTTP. Durable stats live with the relational collaborator.

use std::collections::HashMap;
use std::sync::Mutex;

use arena_shared::PlayerId;
use serde::Serialize;

#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerTotals {
    pub player_id: String,
    pub wins: u64,
    pub losses: u64,
    pub draws: u64,
    pub wagered: u64,
}

#[derive(Default)]
pub struct Leaderboard {
    totals: Mutex<HashMap<PlayerId, PlayerTotals>>,
}

impl Leaderboard {
    pub fn record_resolution(
        &self,
        participants: &[PlayerId],
        winner: Option<&PlayerId>,
        wager: u32,
    ) {
        let mut totals = self.totals.lock().unwrap();
        for player in participants {
            if player.is_house() {
                continue;
            }
            let entry = totals.entry(player.clone()).or_insert_with(|| PlayerTotals {
                player_id: player.to_string(),
                ..PlayerTotals::default()
            });
            entry.wagered += u64::from(wager);
            match winner {
                Some(w) if w == player => entry.wins += 1,
                Some(_) => entry.losses += 1,
                None => entry.draws += 1,
            }
        }
    }

    pub fn top(&self, limit: usize, sort_by: &str) -> Vec<PlayerTotals> {
        let totals = self.totals.lock().unwrap();
        let mut rows: Vec<PlayerTotals> = totals.values().cloned().collect();
        match sort_by {
            "wagered" => rows.sort_by(|a, b| b.wagered.cmp(&a.wagered)),
            _ => rows.sort_by(|a, b| b.wins.cmp(&a.wins).then(a.losses.cmp(&b.losses))),
        }
        rows.truncate(limit);
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregates_and_sorts() {
        let board = Leaderboard::default();
        let a = PlayerId::new("u_a");
        let b = PlayerId::new("u_b");
        board.record_resolution(&[a.clone(), b.clone()], Some(&a), 5);
        board.record_resolution(&[a.clone(), b.clone()], Some(&a), 3);
        board.record_resolution(&[a.clone(), b.clone()], None, 0);

        let rows = board.top(10, "wins");
        assert_eq!(rows[0].player_id, "u_a");
        assert_eq!(rows[0].wins, 2);
        assert_eq!(rows[0].draws, 1);
        assert_eq!(rows[0].wagered, 8);
        assert_eq!(rows[1].losses, 2);

        let rows = board.top(1, "wagered");
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn house_games_only_count_the_player() {
        let board = Leaderboard::default();
        let a = PlayerId::new("u_a");
        board.record_resolution(&[a.clone(), PlayerId::house()], Some(&PlayerId::house()), 2);
        let rows = board.top(10, "wins");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].losses, 1);
    }
}
