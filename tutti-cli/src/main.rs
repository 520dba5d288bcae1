//! Tutti - Listening Session CLI
//!
//! Attaches to a listening room on the local network and keeps the
//! local player in sync with whoever hosts it.
//!
//! Usage:
//!   tutti --room playlist-9 --user 1 --name ana
//!   tutti --room jam-night --user 2 --name bo --simulate
//!
//! Without `--simulate` a desktop player must be reachable on
//! localhost (port via `--port`, API token via `--token` or the
//! TUTTI_TOKEN environment variable).

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

use tutti_core::channel::{GossipChannel, GossipConfig};
use tutti_core::player::DEFAULT_PORT;
use tutti_core::session::{EntryKey, JoinPhase};
use tutti_core::{
    HttpPlayer, Player, RoomClient, RoomEvent, RoomId, SessionChannel, SimulatedPlayer, SongId,
    UserId,
};

const USAGE: &str = "usage: tutti --room <id> --user <id> --name <name> [--simulate] [--port <port>] [--token <token>]";

const HELP: &str = "commands:
  host             start hosting with the local player's state
  stop             end the hosted session for everyone
  leave            leave the session (sticks until it changes)
  suggest <song>   add a song to the room queue
  queue            list the queue in playback order
  play <n>         host: play queue entry n
  drop <n>         host: discard queue entry n
  load <song>      local player: load a song
  seek <ms>        local player: seek
  pause / resume   local player: transport control
  state            print the room snapshot
  quit             detach and exit";

struct Args {
    room: RoomId,
    user: UserId,
    name: String,
    simulate: bool,
    port: u16,
    token: Option<String>,
}

fn parse_args() -> Result<Args, String> {
    let raw: Vec<String> = std::env::args().skip(1).collect();
    let mut room = None;
    let mut user = None;
    let mut name = None;
    let mut simulate = false;
    let mut port = DEFAULT_PORT;
    let mut token = std::env::var("TUTTI_TOKEN").ok();

    let mut iter = raw.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--room" => {
                let value = iter.next().ok_or("--room needs a value")?;
                room = Some(RoomId::parse(value).ok_or_else(|| format!("invalid room id: {}", value))?);
            }
            "--user" => {
                let value = iter.next().ok_or("--user needs a value")?;
                user = Some(UserId(value.parse().map_err(|_| format!("invalid user id: {}", value))?));
            }
            "--name" => {
                name = Some(iter.next().ok_or("--name needs a value")?.clone());
            }
            "--simulate" => simulate = true,
            "--port" => {
                let value = iter.next().ok_or("--port needs a value")?;
                port = value.parse().map_err(|_| format!("invalid port: {}", value))?;
            }
            "--token" => {
                token = Some(iter.next().ok_or("--token needs a value")?.clone());
            }
            other => return Err(format!("unknown argument: {}", other)),
        }
    }

    Ok(Args {
        room: room.ok_or(USAGE)?,
        user: user.ok_or(USAGE)?,
        name: name.ok_or(USAGE)?,
        simulate,
        port,
        token,
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tutti=info,tutti_core=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{}", message);
            eprintln!("{}", USAGE);
            std::process::exit(2);
        }
    };

    let player: Arc<dyn Player> = if args.simulate {
        println!("using a simulated player");
        Arc::new(SimulatedPlayer::new())
    } else {
        let mut http = HttpPlayer::with_port(args.port);
        if let Some(token) = &args.token {
            http = http.with_token(token.clone());
        }
        if let Err(e) = http.probe().await {
            eprintln!("player not reachable: {} (try --simulate)", e);
            std::process::exit(1);
        }
        Arc::new(http)
    };

    let gossip = GossipChannel::start(args.user, GossipConfig::default());
    let channel: Arc<dyn SessionChannel> = Arc::new(gossip.clone());

    let (client, mut events) = RoomClient::attach(
        channel,
        player.clone(),
        args.room.clone(),
        args.user,
        args.name.clone(),
    )
    .await?;

    println!(
        "attached to {} as {} (user {}), peer {}",
        args.room, args.name, args.user, gossip.local_peer_id
    );
    println!("{}", HELP);

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                RoomEvent::SessionStarted { host_id } => println!("* session started by user {}", host_id),
                RoomEvent::SessionEnded => println!("* session ended"),
                RoomEvent::Joined => println!("* joined the session"),
                RoomEvent::Left => println!("* left the session"),
                RoomEvent::ParticipantJoined { user_id } => println!("* user {} joined", user_id),
                RoomEvent::ParticipantLeft { user_id } => println!("* user {} left", user_id),
                RoomEvent::SyncStatus { drift_ms, corrected } => {
                    if corrected {
                        println!("* corrected drift of {:+}ms", drift_ms);
                    }
                }
                RoomEvent::StateChanged(_) => {}
                RoomEvent::Error(message) => eprintln!("! {}", message),
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let mut parts = line.split_whitespace();
        let command = match parts.next() {
            Some(command) => command,
            None => continue,
        };

        let result = match command {
            "host" => client.start_hosting().await,
            "stop" => client.stop_hosting().await,
            "leave" => client.leave().await,
            "suggest" => match parse_song(parts.next()) {
                Some(song) => client.suggest(song).await.map(|key| {
                    println!("suggested as entry {}", key);
                }),
                None => {
                    println!("usage: suggest <song>");
                    continue;
                }
            },
            "queue" => {
                print_queue(&client);
                continue;
            }
            "play" => match queue_key(&client, parts.next()) {
                Some(key) => client.play_suggestion(&key).await,
                None => continue,
            },
            "drop" => match queue_key(&client, parts.next()) {
                Some(key) => client.discard_suggestion(&key).await,
                None => continue,
            },
            "load" => match parse_song(parts.next()) {
                Some(song) => player.load(song).await.map_err(Into::into),
                None => {
                    println!("usage: load <song>");
                    continue;
                }
            },
            "seek" => match parts.next().and_then(|v| v.parse().ok()) {
                Some(position_ms) => player.seek(position_ms).await.map_err(Into::into),
                None => {
                    println!("usage: seek <ms>");
                    continue;
                }
            },
            "pause" => player.pause().await.map_err(Into::into),
            "resume" => player.play().await.map_err(Into::into),
            "state" => {
                print_state(&client);
                continue;
            }
            "help" => {
                println!("{}", HELP);
                continue;
            }
            "quit" | "exit" => break,
            other => {
                println!("unknown command: {} (try help)", other);
                continue;
            }
        };

        if let Err(e) = result {
            eprintln!("! {}", e);
        }
    }

    if client.join_phase() == JoinPhase::Joined {
        if let Err(e) = client.leave().await {
            warn!("leave on exit failed: {}", e);
        }
    }
    if client.is_hosting() {
        if let Err(e) = client.stop_hosting().await {
            warn!("stop on exit failed: {}", e);
        }
    }
    client.detach();
    gossip.shutdown();

    Ok(())
}

fn parse_song(value: Option<&str>) -> Option<SongId> {
    value.and_then(|v| v.parse().ok()).map(SongId)
}

/// Resolve a 1-based queue index from `queue` output to its entry key
fn queue_key(client: &RoomClient, value: Option<&str>) -> Option<EntryKey> {
    let index: usize = match value.and_then(|v| v.parse().ok()) {
        Some(index) => index,
        None => {
            println!("usage: play|drop <n> (see queue)");
            return None;
        }
    };
    let queue = client.queue();
    match index.checked_sub(1).and_then(|i| queue.into_iter().nth(i)) {
        Some((key, _)) => Some(key),
        None => {
            println!("no queue entry {}", index);
            None
        }
    }
}

fn print_queue(client: &RoomClient) {
    let queue = client.queue();
    if queue.is_empty() {
        println!("queue is empty");
        return;
    }
    for (index, (_, entry)) in queue.iter().enumerate() {
        println!(
            "{:>3}. song {} (suggested by user {})",
            index + 1,
            entry.song_id,
            entry.suggested_by
        );
    }
}

fn print_state(client: &RoomClient) {
    let state = client.state();
    match &state.session {
        Some(document) => {
            println!(
                "session: host {} song {:?} at {}ms ({})",
                document.host_id,
                document.song_id,
                document.position_ms,
                if document.is_playing { "playing" } else { "paused" }
            );
        }
        None => println!("no active session"),
    }
    for (user_id, record) in state.participant_list() {
        println!("  - {} (user {})", record.display_name, user_id);
    }
    println!(
        "hosting: {}, membership: {:?}, queue entries: {}",
        client.is_hosting(),
        client.join_phase(),
        state.queue.len()
    );
}
