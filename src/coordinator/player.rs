//! Players and the match roster

use std::collections::HashMap;

use crate::network::UserPresence;
use crate::protocol::PlayerRecord;

/// Mesh address of a player. The host always holds [`HOST_PEER_ID`].
pub type PeerId = u32;

/// Peer id reserved for the match host
pub const HOST_PEER_ID: PeerId = 1;

/// Connectivity of a player as seen from this client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerStatus {
    /// Link negotiation still in progress
    Connecting,
    /// Mesh link established
    Connected,
}

/// One match participant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Player {
    pub session_id: String,
    pub username: String,
    pub peer_id: PeerId,
    pub status: PlayerStatus,
}

impl Player {
    pub fn new(session_id: impl Into<String>, username: impl Into<String>, peer_id: PeerId) -> Self {
        Self {
            session_id: session_id.into(),
            username: username.into(),
            peer_id,
            status: PlayerStatus::Connecting,
        }
    }

    pub fn record(&self) -> PlayerRecord {
        PlayerRecord {
            session_id: self.session_id.clone(),
            username: self.username.clone(),
            peer_id: self.peer_id,
        }
    }

    pub fn from_record(record: &PlayerRecord) -> Self {
        Self::new(&record.session_id, &record.username, record.peer_id)
    }

    pub fn is_host(&self) -> bool {
        self.peer_id == HOST_PEER_ID
    }
}

/// All players of the current match, keyed by session id
#[derive(Debug, Clone, Default)]
pub struct Roster {
    players: HashMap<String, Player>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seat matchmade participants: ascending session id order gives peer
    /// ids 1..=N, so every participant computes the same assignment.
    pub fn from_matchmade(users: &[UserPresence]) -> Self {
        let mut sorted: Vec<&UserPresence> = users.iter().collect();
        sorted.sort_by(|a, b| a.session_id.cmp(&b.session_id));

        let mut roster = Self::new();
        for (i, user) in sorted.into_iter().enumerate() {
            roster.insert(Player::new(
                &user.session_id,
                &user.username,
                (i + 1) as PeerId,
            ));
        }
        roster
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.players.contains_key(session_id)
    }

    pub fn get(&self, session_id: &str) -> Option<&Player> {
        self.players.get(session_id)
    }

    pub fn get_mut(&mut self, session_id: &str) -> Option<&mut Player> {
        self.players.get_mut(session_id)
    }

    pub fn by_peer_id(&self, peer_id: PeerId) -> Option<&Player> {
        self.players.values().find(|p| p.peer_id == peer_id)
    }

    pub fn host(&self) -> Option<&Player> {
        self.by_peer_id(HOST_PEER_ID)
    }

    pub fn insert(&mut self, player: Player) -> Option<Player> {
        debug_assert!(
            self.players
                .values()
                .all(|p| p.peer_id != player.peer_id || p.session_id == player.session_id),
            "peer id {} already seated",
            player.peer_id
        );
        self.players.insert(player.session_id.clone(), player)
    }

    pub fn remove(&mut self, session_id: &str) -> Option<Player> {
        self.players.remove(session_id)
    }

    pub fn clear(&mut self) {
        self.players.clear();
    }

    /// Smallest unused peer id starting at 2. Seats freed by leavers are
    /// reused before new ids are handed out.
    pub fn next_free_peer_id(&self) -> PeerId {
        let mut candidate = HOST_PEER_ID + 1;
        while self.by_peer_id(candidate).is_some() {
            candidate += 1;
        }
        candidate
    }

    /// Players ordered by peer id
    pub fn players(&self) -> Vec<Player> {
        let mut list: Vec<Player> = self.players.values().cloned().collect();
        list.sort_by_key(|p| p.peer_id);
        list
    }

    /// Wire records ordered by peer id
    pub fn records(&self) -> Vec<PlayerRecord> {
        self.players().iter().map(Player::record).collect()
    }

    /// Merge a roster broadcast, keeping players we already track.
    /// Returns the newly seated players.
    pub fn merge_records(&mut self, records: &[PlayerRecord]) -> Vec<Player> {
        let mut added = Vec::new();
        for record in records {
            if self.contains(&record.session_id) {
                continue;
            }
            let player = Player::from_record(record);
            self.insert(player.clone());
            added.push(player);
        }
        added
    }

    pub fn all_connected(&self) -> bool {
        self.players
            .values()
            .all(|p| p.status == PlayerStatus::Connected)
    }
}
