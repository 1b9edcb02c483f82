//! Round and score lifecycle on top of a connected match
//!
//! [`SessionCoordinator`] tracks per-player cumulative scores across rounds
//! and decides when the match is over. It never touches the network: the
//! authority computes [`RoundResults`] once and hands them back to the
//! caller to broadcast, and every participant (authority included) applies
//! the broadcast record identically. Replicas never recompute a score.
//!
//! The results display delay runs on a tokio timer, so the coordinator has
//! to live inside a runtime.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::coordinator::{PeerId, Player};
use crate::protocol::{RoundResults, ScoreEntry, ScoreSync};

/// Session event channel depth
const EVENT_CAPACITY: usize = 16;

/// Who computes round results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Computes results and is the single source of truth for scores
    Authority,
    /// Applies broadcast results verbatim
    Replica,
}

/// Scoring and pacing rules for one session
#[derive(Debug, Clone)]
pub struct SessionRules {
    /// Cumulative score that ends the match
    pub winning_score: u32,
    /// How long results stay up before the round is considered finished
    pub results_delay: std::time::Duration,
}

impl Default for SessionRules {
    fn default() -> Self {
        Self {
            winning_score: 5,
            results_delay: std::time::Duration::from_secs(2),
        }
    }
}

/// One participant and their cumulative score
#[derive(Debug, Clone)]
pub struct SessionPlayer {
    pub player: Player,
    pub score: u32,
    /// Finished per-round setup, see [`SessionCoordinator::mark_set_up`]
    pub is_set_up: bool,
}

/// Where the session currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Between rounds, or no session at all
    Idle,
    RoundActive,
    /// Round over, results on display until the delay elapses
    ShowingResults,
}

/// Gameplay collaborator driven by the session
///
/// The session tells the driver when rounds start and stop and which
/// in-round actors to drop; the driver reports winners back through the
/// embedding code, which calls [`SessionCoordinator::round_won_by`].
pub trait GameDriver: Send + 'static {
    fn start_round(&mut self, players: &[Player]);
    fn remove_player(&mut self, peer_id: PeerId);
    fn stop_round(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The results delay elapsed; loop into a new round or stop
    RoundFinished { is_match_over: bool },
    SessionStopped,
}

struct SessionInner<G> {
    role: Role,
    rules: SessionRules,
    driver: G,
    players: Vec<SessionPlayer>,
    phase: SessionPhase,
    /// Bumped on every round start and reset; stale result timers check it
    round_epoch: u64,
}

/// Round/score coordinator for one match
///
/// Cheap to clone; all clones share the same session.
pub struct SessionCoordinator<G: GameDriver> {
    inner: Arc<Mutex<SessionInner<G>>>,
    events: mpsc::Sender<SessionEvent>,
}

impl<G: GameDriver> Clone for SessionCoordinator<G> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            events: self.events.clone(),
        }
    }
}

impl<G: GameDriver> SessionCoordinator<G> {
    /// Build a session and the channel its events arrive on
    pub fn new(role: Role, rules: SessionRules, driver: G) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        (
            Self {
                inner: Arc::new(Mutex::new(SessionInner {
                    role,
                    rules,
                    driver,
                    players: Vec::new(),
                    phase: SessionPhase::Idle,
                    round_epoch: 0,
                })),
                events: event_tx,
            },
            event_rx,
        )
    }

    pub fn role(&self) -> Role {
        self.inner.lock().role
    }

    pub fn phase(&self) -> SessionPhase {
        self.inner.lock().phase
    }

    /// Seat a player. Returns false if the seat was already taken,
    /// making repeated adds harmless.
    pub fn add_player(&self, player: Player) -> bool {
        let mut inner = self.inner.lock();
        if inner
            .players
            .iter()
            .any(|p| p.player.peer_id == player.peer_id)
        {
            return false;
        }
        debug!("Session seats {} (peer {})", player.username, player.peer_id);
        inner.players.push(SessionPlayer {
            player,
            score: 0,
            is_set_up: false,
        });
        inner.players.sort_by_key(|p| p.player.peer_id);
        true
    }

    pub fn add_players(&self, players: &[Player]) {
        for player in players {
            self.add_player(player.clone());
        }
    }

    /// Unseat a player; also drops their in-round actor while a round is
    /// active.
    pub fn remove_player(&self, peer_id: PeerId) -> Option<SessionPlayer> {
        let mut inner = self.inner.lock();
        let index = inner
            .players
            .iter()
            .position(|p| p.player.peer_id == peer_id)?;
        let removed = inner.players.remove(index);
        if inner.phase == SessionPhase::RoundActive {
            inner.driver.remove_player(peer_id);
        }
        info!(
            "Session drops {} (peer {})",
            removed.player.username, peer_id
        );
        Some(removed)
    }

    /// Players ordered by peer id
    pub fn players(&self) -> Vec<SessionPlayer> {
        self.inner.lock().players.clone()
    }

    pub fn score_of(&self, peer_id: PeerId) -> Option<u32> {
        self.inner
            .lock()
            .players
            .iter()
            .find(|p| p.player.peer_id == peer_id)
            .map(|p| p.score)
    }

    /// Start a round with whoever is seated. Scores carry over; setup
    /// flags do not.
    pub fn start_game(&self) {
        let mut inner = self.inner.lock();
        inner.round_epoch += 1;
        inner.phase = SessionPhase::RoundActive;
        for p in &mut inner.players {
            p.is_set_up = false;
        }
        let players: Vec<Player> = inner.players.iter().map(|p| p.player.clone()).collect();
        info!("Round starting with {} players", players.len());
        inner.driver.start_round(&players);
    }

    /// Same as [`start_game`](Self::start_game); rounds restart with the
    /// players present now, not the ones the last round had.
    pub fn restart_game(&self) {
        self.start_game();
    }

    /// A participant finished its per-round setup
    pub fn mark_set_up(&self, peer_id: PeerId) {
        let mut inner = self.inner.lock();
        match inner
            .players
            .iter_mut()
            .find(|p| p.player.peer_id == peer_id)
        {
            Some(p) => p.is_set_up = true,
            None => warn!("Setup report from unseated peer {}", peer_id),
        }
    }

    pub fn is_set_up(&self, peer_id: PeerId) -> bool {
        self.inner
            .lock()
            .players
            .iter()
            .find(|p| p.player.peer_id == peer_id)
            .map(|p| p.is_set_up)
            .unwrap_or(false)
    }

    pub fn all_set_up(&self) -> bool {
        let inner = self.inner.lock();
        !inner.players.is_empty() && inner.players.iter().all(|p| p.is_set_up)
    }

    /// Authority only: record a round win and build the results record to
    /// broadcast. Replicas get a warning and `None`; they must wait for
    /// the broadcast instead.
    pub fn round_won_by(&self, winner: PeerId) -> Option<RoundResults> {
        let mut inner = self.inner.lock();
        if inner.role != Role::Authority {
            warn!("Only the authority computes round results");
            return None;
        }
        if inner.phase != SessionPhase::RoundActive {
            warn!("Round win reported outside an active round");
            return None;
        }
        let winning_score = inner.rules.winning_score;
        let Some(player) = inner
            .players
            .iter_mut()
            .find(|p| p.player.peer_id == winner)
        else {
            warn!("Round won by unseated peer {}", winner);
            return None;
        };
        player.score += 1;
        let score = player.score;
        info!("Peer {} wins the round, score {}", winner, score);
        Some(RoundResults {
            winner,
            score,
            is_match_over: score >= winning_score,
        })
    }

    /// Apply a results record: overwrite the winner's score with the
    /// broadcast value, show results, and finish the round after the
    /// display delay. Duplicate records while results are showing are
    /// dropped.
    pub fn apply_results(&self, results: &RoundResults) {
        let mut inner = self.inner.lock();
        if inner.phase == SessionPhase::ShowingResults {
            debug!("Duplicate round results dropped");
            return;
        }

        match inner
            .players
            .iter_mut()
            .find(|p| p.player.peer_id == results.winner)
        {
            Some(p) => p.score = results.score,
            None => warn!("Round results for unseated peer {}", results.winner),
        }

        if inner.phase != SessionPhase::RoundActive {
            // No round running here (late joiner); the score still counts
            return;
        }
        inner.phase = SessionPhase::ShowingResults;

        let epoch = inner.round_epoch;
        let delay = inner.rules.results_delay;
        let is_match_over = results.is_match_over;
        drop(inner);

        let shared = self.inner.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut inner = shared.lock();
                if inner.round_epoch != epoch || inner.phase != SessionPhase::ShowingResults {
                    return;
                }
                inner.phase = SessionPhase::Idle;
            }
            if events
                .send(SessionEvent::RoundFinished { is_match_over })
                .await
                .is_err()
            {
                debug!("Session observer gone before the round finished");
            }
        });
    }

    /// Cumulative scores, for replaying to a player that joined between
    /// rounds
    pub fn score_snapshot(&self) -> ScoreSync {
        let inner = self.inner.lock();
        ScoreSync {
            entries: inner
                .players
                .iter()
                .map(|p| ScoreEntry {
                    peer_id: p.player.peer_id,
                    score: p.score,
                })
                .collect(),
        }
    }

    pub fn apply_score_snapshot(&self, sync: &ScoreSync) {
        let mut inner = self.inner.lock();
        for entry in &sync.entries {
            match inner
                .players
                .iter_mut()
                .find(|p| p.player.peer_id == entry.peer_id)
            {
                Some(p) => p.score = entry.score,
                None => debug!("Score replay for unseated peer {}", entry.peer_id),
            }
        }
    }

    /// Clear every seat and stop any active round. No event fires; use
    /// [`stop_session`](Self::stop_session) to tell observers.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        if inner.phase != SessionPhase::Idle {
            inner.driver.stop_round();
        }
        inner.players.clear();
        inner.phase = SessionPhase::Idle;
        inner.round_epoch += 1;
    }

    /// Reset and announce the end of the session
    pub fn stop_session(&self) {
        self.reset();
        if self.events.try_send(SessionEvent::SessionStopped).is_err() {
            warn!("Dropping session stopped event");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[derive(Default)]
    struct DriverLog {
        started: Vec<Vec<PeerId>>,
        removed: Vec<PeerId>,
        stopped: usize,
    }

    #[derive(Clone, Default)]
    struct RecordingDriver {
        log: Arc<Mutex<DriverLog>>,
    }

    impl GameDriver for RecordingDriver {
        fn start_round(&mut self, players: &[Player]) {
            self.log
                .lock()
                .started
                .push(players.iter().map(|p| p.peer_id).collect());
        }

        fn remove_player(&mut self, peer_id: PeerId) {
            self.log.lock().removed.push(peer_id);
        }

        fn stop_round(&mut self) {
            self.log.lock().stopped += 1;
        }
    }

    fn player(peer_id: PeerId) -> Player {
        Player::new(format!("session-{}", peer_id), format!("p{}", peer_id), peer_id)
    }

    fn quick_rules() -> SessionRules {
        SessionRules {
            winning_score: 5,
            results_delay: Duration::from_millis(10),
        }
    }

    fn session(role: Role) -> (SessionCoordinator<RecordingDriver>, mpsc::Receiver<SessionEvent>, RecordingDriver) {
        let driver = RecordingDriver::default();
        let (session, events) = SessionCoordinator::new(role, quick_rules(), driver.clone());
        (session, events, driver)
    }

    #[test]
    fn test_add_player_is_idempotent() {
        let (session, _events, _driver) = session(Role::Authority);

        assert!(session.add_player(player(1)));
        assert!(!session.add_player(player(1)));
        assert_eq!(session.players().len(), 1);
    }

    #[tokio::test]
    async fn test_wins_accumulate_until_match_over() {
        let (session, mut events, _driver) = session(Role::Authority);
        session.add_players(&[player(1), player(2), player(3)]);

        let mut match_over_count = 0;
        for round in 1..=5 {
            session.start_game();
            let results = session.round_won_by(2).expect("authority computes");
            assert_eq!(results.score, round);
            assert_eq!(results.is_match_over, round == 5);
            session.apply_results(&results);

            let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
                .await
                .expect("round should finish")
                .expect("channel open");
            match event {
                SessionEvent::RoundFinished { is_match_over } => {
                    if is_match_over {
                        match_over_count += 1;
                    }
                }
                other => panic!("Expected RoundFinished, got {:?}", other),
            }
        }

        assert_eq!(match_over_count, 1);
        assert_eq!(session.score_of(2), Some(5));
        assert_eq!(session.score_of(1), Some(0));
    }

    #[tokio::test]
    async fn test_replica_overwrites_score_from_broadcast() {
        let (session, mut events, _driver) = session(Role::Replica);
        session.add_players(&[player(1), player(2)]);
        session.start_game();

        // The broadcast value wins even if it disagrees with local history
        session.apply_results(&RoundResults {
            winner: 2,
            score: 4,
            is_match_over: false,
        });

        assert_eq!(session.score_of(2), Some(4));
        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("round should finish")
            .expect("channel open");
        assert_eq!(
            event,
            SessionEvent::RoundFinished {
                is_match_over: false
            }
        );
    }

    #[test]
    fn test_replica_never_computes_results() {
        let (session, _events, _driver) = session(Role::Replica);
        session.add_players(&[player(1), player(2)]);
        session.start_game();

        assert!(session.round_won_by(2).is_none());
        assert_eq!(session.score_of(2), Some(0));
    }

    #[tokio::test]
    async fn test_duplicate_results_are_dropped() {
        let (session, mut events, _driver) = session(Role::Authority);
        session.add_players(&[player(1), player(2)]);
        session.start_game();

        let results = session.round_won_by(1).expect("authority computes");
        session.apply_results(&results);
        session.apply_results(&results);

        assert_eq!(session.score_of(1), Some(1));
        let first = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("round should finish");
        assert!(first.is_some());
        // Only one finish fires for the two applies
        let second = tokio::time::timeout(Duration::from_millis(50), events.recv()).await;
        assert!(second.is_err());
    }

    #[test]
    fn test_setup_barrier() {
        let (session, _events, _driver) = session(Role::Authority);
        session.add_players(&[player(1), player(2)]);
        session.start_game();

        assert!(!session.all_set_up());
        session.mark_set_up(1);
        assert!(session.is_set_up(1));
        assert!(!session.all_set_up());
        session.mark_set_up(2);
        assert!(session.all_set_up());

        // Restarting clears the barrier
        session.restart_game();
        assert!(!session.all_set_up());
    }

    #[test]
    fn test_remove_during_round_reaches_driver() {
        let (session, _events, driver) = session(Role::Authority);
        session.add_players(&[player(1), player(2), player(3)]);
        session.start_game();

        session.remove_player(3);
        assert_eq!(driver.log.lock().removed, vec![3]);

        // Off-round removals do not touch the driver
        session.reset();
        session.add_player(player(4));
        session.remove_player(4);
        assert_eq!(driver.log.lock().removed, vec![3]);
    }

    #[test]
    fn test_round_start_hands_current_players_to_driver() {
        let (session, _events, driver) = session(Role::Authority);
        session.add_players(&[player(2), player(1)]);
        session.start_game();

        session.add_player(player(3));
        session.restart_game();

        let log = driver.log.lock();
        assert_eq!(log.started, vec![vec![1, 2], vec![1, 2, 3]]);
    }

    #[tokio::test]
    async fn test_snapshot_replays_scores() {
        let (authority, _ev_a, _driver_a) = session(Role::Authority);
        authority.add_players(&[player(1), player(2)]);
        authority.start_game();
        let results = authority.round_won_by(2).expect("authority computes");
        authority.apply_results(&results);

        let (joiner, _ev_b, _driver_b) = session(Role::Replica);
        joiner.add_players(&[player(1), player(2)]);
        joiner.apply_score_snapshot(&authority.score_snapshot());

        assert_eq!(joiner.score_of(2), Some(1));
        assert_eq!(joiner.score_of(1), Some(0));
    }

    #[tokio::test]
    async fn test_stop_session_emits_and_clears() {
        let (session, mut events, driver) = session(Role::Authority);
        session.add_players(&[player(1), player(2)]);
        session.start_game();

        session.stop_session();

        assert!(session.players().is_empty());
        assert_eq!(session.phase(), SessionPhase::Idle);
        assert_eq!(driver.log.lock().stopped, 1);
        assert_eq!(events.recv().await, Some(SessionEvent::SessionStopped));
    }

    #[tokio::test]
    async fn test_reset_cancels_pending_round_finish() {
        let (session, mut events, _driver) = session(Role::Authority);
        session.add_players(&[player(1), player(2)]);
        session.start_game();

        let results = session.round_won_by(1).expect("authority computes");
        session.apply_results(&results);
        session.reset();

        let outcome = tokio::time::timeout(Duration::from_millis(50), events.recv()).await;
        assert!(outcome.is_err(), "stale results timer should be cancelled");
    }
}
