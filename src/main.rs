//! huddle - Peer-to-peer match and session coordination for small games

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use huddle::coordinator::{
    MatchConfig, MatchCoordinator, MatchError, MatchEvent, MatchMode, MatchState, PeerId, Player,
};
use huddle::network::{LoopbackNet, MatchmakerArgs, WsConnector};
use huddle::protocol::{decode, encode, SessionMessage};
use huddle::session::{GameDriver, Role, SessionCoordinator, SessionEvent, SessionRules};

type Coordinator = MatchCoordinator<WsConnector, LoopbackNet>;

#[derive(Parser)]
#[command(name = "huddle")]
#[command(about = "Peer-to-peer match and session coordination for small games")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Relay server URL (e.g., wss://example.com)
    #[arg(short, long, global = true, default_value = "ws://127.0.0.1:9440")]
    server: String,

    /// Your display name
    #[arg(short, long, global = true, default_value = "Player")]
    name: String,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Host a new match and print its join code
    Create {
        /// Spawn this many in-process companions that join the match.
        /// The bundled peer transport links participants of one process,
        /// so bots make a full mesh you can play against locally.
        #[arg(long, default_value = "0")]
        bots: u32,
    },

    /// Join a hosted match by its code
    Join {
        /// Match code shown by the host
        code: String,
    },

    /// Queue in the matchmaking pool
    Matchmake {
        /// Minimum players to match with
        #[arg(long, default_value = "2")]
        min: u32,

        /// Maximum players to match with
        #[arg(long, default_value = "4")]
        max: u32,
    },
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

/// Stand-in gameplay for the interactive client: rounds are announced on
/// the console and the authority reports winners by hand.
struct ConsoleGame;

impl GameDriver for ConsoleGame {
    fn start_round(&mut self, players: &[Player]) {
        println!("\n🎮 Round started with {} players.", players.len());
        println!("The authority reports the winner with /win <peer-id>.");
    }

    fn remove_player(&mut self, peer_id: PeerId) {
        println!("Peer {} dropped out of the round.", peer_id);
    }

    fn stop_round(&mut self) {}
}

/// Bots play along without printing
struct SilentGame;

impl GameDriver for SilentGame {
    fn start_round(&mut self, _players: &[Player]) {}

    fn remove_player(&mut self, _peer_id: PeerId) {}

    fn stop_round(&mut self) {}
}

fn print_scores<G: GameDriver>(session: &SessionCoordinator<G>) {
    println!("\n📊 Scores:");
    for p in session.players() {
        println!("  {:<16} {}", p.player.username, p.score);
    }
}

/// Mark ourselves set up and tell the mesh
async fn announce_set_up<G: GameDriver>(
    coordinator: &Coordinator,
    session: &SessionCoordinator<G>,
) {
    let Some(me) = coordinator.my_peer_id().await else {
        return;
    };
    session.mark_set_up(me);
    match encode(&SessionMessage::PlayerSetUp { peer_id: me }) {
        Ok(bytes) => {
            if let Err(e) = coordinator.broadcast_reliable(bytes).await {
                warn!("Failed to report setup: {}", e);
            }
        }
        Err(e) => warn!("Failed to encode setup report: {}", e),
    }
}

/// React to one payload off the reliable mesh channel
async fn handle_mesh_message<G: GameDriver>(
    coordinator: &Coordinator,
    session: &Option<SessionCoordinator<G>>,
    from: PeerId,
    payload: &[u8],
    interactive: bool,
) {
    let message: SessionMessage = match decode(payload) {
        Ok(message) => message,
        Err(e) => {
            warn!("Undecodable mesh message from peer {}: {}", from, e);
            return;
        }
    };
    let Some(session) = session else {
        debug!("Mesh message before the session exists, ignoring");
        return;
    };

    match message {
        SessionMessage::StartGame => {
            if coordinator.state().await == MatchState::Ready {
                coordinator.start_playing().await;
            }
            session.start_game();
            announce_set_up(coordinator, session).await;
        }
        SessionMessage::PlayerSetUp { peer_id } => {
            session.mark_set_up(peer_id);
            if interactive && session.all_set_up() {
                println!("✨ All players are set up.");
            }
        }
        SessionMessage::RoundResults(results) => {
            if interactive {
                let winner = coordinator
                    .players()
                    .await
                    .into_iter()
                    .find(|p| p.peer_id == results.winner);
                match winner {
                    Some(p) => println!("\n🏆 {} wins the round!", p.username),
                    None => println!("\n🏆 Peer {} wins the round!", results.winner),
                }
            }
            session.apply_results(&results);
        }
        SessionMessage::ScoreSync(sync) => {
            session.apply_score_snapshot(&sync);
        }
        SessionMessage::Game(bytes) => {
            if interactive {
                let text = String::from_utf8_lossy(&bytes);
                let sender = coordinator
                    .players()
                    .await
                    .into_iter()
                    .find(|p| p.peer_id == from);
                match sender {
                    Some(p) => println!("💬 {}: {}", p.username, text),
                    None => println!("💬 peer {}: {}", from, text),
                }
            }
        }
    }
}

/// Host-side `/start`: announce the round, then start it locally
async fn handle_start(
    coordinator: &Coordinator,
    session: &Option<SessionCoordinator<ConsoleGame>>,
) {
    let Some(session) = session else {
        println!("The match is not ready yet.");
        return;
    };
    if !coordinator.is_host().await {
        println!("Only the host starts rounds.");
        return;
    }
    if coordinator.state().await != MatchState::Ready {
        println!("The match is not ready yet.");
        return;
    }

    let bytes = match encode(&SessionMessage::StartGame) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Failed to encode round start: {}", e);
            return;
        }
    };
    if let Err(e) = coordinator.broadcast_reliable(bytes).await {
        warn!("Failed to announce the round: {}", e);
        return;
    }
    coordinator.start_playing().await;
    session.start_game();
    announce_set_up(coordinator, session).await;
}

/// Authority-side `/win <peer>`: record the win and broadcast the results
async fn handle_win(
    coordinator: &Coordinator,
    session: &Option<SessionCoordinator<ConsoleGame>>,
    arg: &str,
) {
    let Some(session) = session else {
        println!("No round is running.");
        return;
    };
    let Ok(peer_id) = arg.parse::<PeerId>() else {
        println!("Usage: /win <peer-id>");
        return;
    };
    let Some(results) = session.round_won_by(peer_id) else {
        println!("Round win not recorded. Only the authority reports wins, during a round.");
        return;
    };

    match encode(&SessionMessage::RoundResults(results)) {
        Ok(bytes) => {
            if let Err(e) = coordinator.broadcast_reliable(bytes).await {
                warn!("Failed to broadcast round results: {}", e);
            }
        }
        Err(e) => warn!("Failed to encode round results: {}", e),
    }
    session.apply_results(&results);
}

async fn send_chat(coordinator: &Coordinator, line: &str) {
    match encode(&SessionMessage::Game(line.as_bytes().to_vec())) {
        Ok(bytes) => {
            if coordinator.broadcast_reliable(bytes).await.is_ok() {
                println!("💬 You: {}", line);
            } else {
                println!("Not connected to any peers yet.");
            }
        }
        Err(e) => warn!("Failed to encode chat: {}", e),
    }
}

/// Between rounds: hosted matches reopen the lobby, matchmade matches end
/// once the group falls below the minimum. Returns false when it is time
/// to leave.
async fn round_intermission(coordinator: &Coordinator, min_players: u32) -> bool {
    if coordinator.mode().await == MatchMode::Matchmaker {
        let players = coordinator.players().await;
        if (players.len() as u32) < min_players {
            println!("\nNot enough players to continue.");
            return false;
        }
    }
    coordinator.reopen_match().await;
    if coordinator.is_host().await {
        println!("\n🏟  Lobby reopened. /start begins the next round.");
    } else {
        println!("\n🏟  Lobby reopened. Waiting for the next round.");
    }
    true
}

async fn next_session_event(
    rx: &mut Option<mpsc::Receiver<SessionEvent>>,
) -> Option<SessionEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Scripted in-process companion: joins by code, follows the host through
/// rounds, never prints.
async fn bot_loop(server: String, name: String, code: String, net: LoopbackNet) {
    let (coordinator, mut events) =
        MatchCoordinator::new(WsConnector::new(&server, &name), net, MatchConfig::default());
    if let Err(e) = coordinator.join_match(&code).await {
        warn!("{} could not join: {}", name, e);
        return;
    }

    let (session, mut session_events) =
        SessionCoordinator::new(Role::Replica, SessionRules::default(), SilentGame);
    let session = Some(session);

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    MatchEvent::MatchReady { players } => {
                        if let Some(s) = &session {
                            s.add_players(&players);
                        }
                    }
                    MatchEvent::PlayerLeft(player) => {
                        if let Some(s) = &session {
                            s.remove_player(player.peer_id);
                        }
                    }
                    MatchEvent::MessageReceived { from, payload } => {
                        handle_mesh_message(&coordinator, &session, from, &payload, false).await;
                    }
                    MatchEvent::Error(MatchError::HostDisconnected) => break,
                    MatchEvent::Disconnected => break,
                    _ => {}
                }
            }
            event = session_events.recv() => {
                match event {
                    Some(SessionEvent::RoundFinished { is_match_over }) => {
                        if is_match_over {
                            coordinator.leave(true).await;
                            break;
                        }
                        coordinator.reopen_match().await;
                    }
                    Some(SessionEvent::SessionStopped) | None => break,
                }
            }
        }
    }
    debug!("{} is done", name);
}

/// Interactive loop shared by all subcommands
async fn event_loop(
    coordinator: Coordinator,
    mut events: mpsc::Receiver<MatchEvent>,
    net: LoopbackNet,
    server: String,
    bots: u32,
    min_players: u32,
) -> Result<()> {
    println!("\nCommands: /start, /win <peer-id>, /scores, /quit. Anything else is chat.");

    // The session exists once the first MatchReady tells us our role
    let mut session: Option<SessionCoordinator<ConsoleGame>> = None;
    let mut session_events: Option<mpsc::Receiver<SessionEvent>> = None;

    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                coordinator.leave(true).await;
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    MatchEvent::MatchCreated { match_id } => {
                        println!("\n🎟  Match code: {}", match_id);
                        for i in 1..=bots {
                            tokio::spawn(bot_loop(
                                server.clone(),
                                format!("Bot-{}", i),
                                match_id.clone(),
                                net.clone(),
                            ));
                        }
                    }
                    MatchEvent::MatchJoined { match_id } => {
                        println!("\n✅ Joined match {}", match_id);
                    }
                    MatchEvent::MatchmakerMatched { players } => {
                        println!("\n🤝 Matched with {} players:", players.len());
                        for p in &players {
                            println!("  - {} (peer {})", p.username, p.peer_id);
                        }
                    }
                    MatchEvent::PlayerJoined(player) => {
                        println!("📥 {} joined as peer {}", player.username, player.peer_id);
                    }
                    MatchEvent::PlayerLeft(player) => {
                        println!("📤 {} left", player.username);
                        if let Some(s) = &session {
                            s.remove_player(player.peer_id);
                        }
                    }
                    MatchEvent::PlayerStatusChanged(player) => {
                        println!("🔗 {} is {:?}", player.username, player.status);
                    }
                    MatchEvent::MatchReady { players } => {
                        let s = match &session {
                            Some(s) => s.clone(),
                            None => {
                                let role = if coordinator.is_host().await {
                                    Role::Authority
                                } else {
                                    Role::Replica
                                };
                                let (s, rx) = SessionCoordinator::new(
                                    role,
                                    SessionRules::default(),
                                    ConsoleGame,
                                );
                                session = Some(s.clone());
                                session_events = Some(rx);
                                s
                            }
                        };
                        s.add_players(&players);
                        println!("\n🟢 Match ready: {} players connected.", players.len());
                        if coordinator.is_host().await {
                            println!("Type /start to begin a round.");
                            // Replay scores to anyone who joined between rounds
                            let snapshot = s.score_snapshot();
                            if snapshot.entries.iter().any(|e| e.score > 0) {
                                match encode(&SessionMessage::ScoreSync(snapshot)) {
                                    Ok(bytes) => {
                                        if let Err(e) = coordinator.broadcast_reliable(bytes).await {
                                            warn!("Failed to replay scores: {}", e);
                                        }
                                    }
                                    Err(e) => warn!("Failed to encode score replay: {}", e),
                                }
                            }
                        }
                    }
                    MatchEvent::MatchNotReady => {
                        println!("⏳ Waiting for players...");
                    }
                    MatchEvent::Disconnected => {
                        println!("\n🔌 Connection to the relay lost.");
                        break;
                    }
                    MatchEvent::MessageReceived { from, payload } => {
                        handle_mesh_message(&coordinator, &session, from, &payload, true).await;
                    }
                    MatchEvent::Error(e) => {
                        println!("\n⚠️  {}", e);
                        if matches!(e, MatchError::HostDisconnected) {
                            coordinator.leave(true).await;
                            break;
                        }
                    }
                }
            }
            event = next_session_event(&mut session_events) => {
                match event {
                    Some(SessionEvent::RoundFinished { is_match_over }) => {
                        if let Some(s) = &session {
                            print_scores(s);
                        }
                        if is_match_over {
                            println!("\n🏁 Match over!");
                            if let Some(s) = &session {
                                s.stop_session();
                            }
                        } else if !round_intermission(&coordinator, min_players).await {
                            if let Some(s) = &session {
                                s.stop_session();
                            }
                        }
                    }
                    Some(SessionEvent::SessionStopped) => {
                        coordinator.leave(true).await;
                        break;
                    }
                    None => {
                        session_events = None;
                    }
                }
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        if line == "/quit" {
                            coordinator.leave(true).await;
                            break;
                        } else if line == "/start" {
                            handle_start(&coordinator, &session).await;
                        } else if line == "/scores" {
                            if let Some(s) = &session {
                                print_scores(s);
                            } else {
                                println!("No session yet.");
                            }
                        } else if let Some(arg) = line.strip_prefix("/win ") {
                            handle_win(&coordinator, &session, arg.trim()).await;
                        } else if line.starts_with('/') {
                            println!("Commands: /start, /win <peer-id>, /scores, /quit");
                        } else {
                            send_chat(&coordinator, line).await;
                        }
                    }
                    Ok(None) => {
                        info!("stdin closed");
                    }
                    Err(e) => {
                        warn!("stdin error: {}", e);
                    }
                }
            }
        }
    }

    println!("Bye!");
    Ok(())
}

async fn run_create(server: String, name: String, bots: u32) -> Result<()> {
    let net = LoopbackNet::new();
    let config = MatchConfig::default();
    let min_players = config.min_players;
    let (coordinator, events) =
        MatchCoordinator::new(WsConnector::new(&server, &name), net.clone(), config);

    info!("Creating a match on {}", server);
    coordinator.create_match().await?;

    event_loop(coordinator, events, net, server, bots, min_players).await
}

async fn run_join(server: String, name: String, code: String) -> Result<()> {
    let net = LoopbackNet::new();
    let config = MatchConfig::default();
    let min_players = config.min_players;
    let (coordinator, events) =
        MatchCoordinator::new(WsConnector::new(&server, &name), net.clone(), config);

    info!("Joining match {} on {}", code, server);
    coordinator.join_match(&code).await?;

    event_loop(coordinator, events, net, server, 0, min_players).await
}

async fn run_matchmake(server: String, name: String, min: u32, max: u32) -> Result<()> {
    let net = LoopbackNet::new();
    let config = MatchConfig::default();
    let (coordinator, events) =
        MatchCoordinator::new(WsConnector::new(&server, &name), net.clone(), config);

    info!("Queueing for a match on {}", server);
    let args = MatchmakerArgs {
        min_count: min,
        max_count: max,
        ..MatchmakerArgs::default()
    };
    coordinator.start_matchmaking(args).await?;
    println!("🔎 Queued for a {}-{} player match...", min, max);

    event_loop(coordinator, events, net, server, 0, min).await
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    match cli.command {
        Commands::Create { bots } => {
            run_create(cli.server, cli.name, bots).await?;
        }
        Commands::Join { code } => {
            run_join(cli.server, cli.name, code).await?;
        }
        Commands::Matchmake { min, max } => {
            run_matchmake(cli.server, cli.name, min, max).await?;
        }
    }

    Ok(())
}
