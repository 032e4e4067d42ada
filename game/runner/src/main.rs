use clap::{App, Arg};
use courier::net::udp::UdpTransport;
use flux::logging;
use flux::time::{TickClock, TICKS_PER_SECOND};
use flux::{FrameNo, Tick};
use gamecore::config::GameConfig;
use gamecore::session::{PeerState, Session, SessionError};
use slog::{crit, debug, info, Logger};
use std::process;

/// Ticks between look-ahead negotiations.
const NEGOTIATION_PERIOD: Tick = TICKS_PER_SECOND * 5;

fn main() {
    let matches = App::new("Game Runner")
        .version("1.0")
        .author("Bush Hammer Industries")
        .about("Runs a lock-step multiplayer session.")
        .arg(
            Arg::with_name("CONFIG_FILE")
                .help("Path to the game config file")
                .required(true),
        )
        .arg(
            Arg::with_name("LOG_CONFIG")
                .help("Path to the logger config file"),
        )
        .arg(
            Arg::with_name("FRAMES")
                .long("frames")
                .takes_value(true)
                .help("Number of frames to run, unlimited if omitted"),
        )
        .get_matches();

    let log = match matches.value_of("LOG_CONFIG") {
        Some(path) => logging::load(path),
        None => logging::init(),
    };

    let log = match log {
        Ok(log) => log,
        Err(error) => {
            eprintln!("Failed to set up logging: {}", error);
            process::exit(1);
        }
    };

    let config_path = matches.value_of("CONFIG_FILE").unwrap_or("game_config.toml");

    let config = match GameConfig::load(config_path) {
        Ok(config) => config,
        Err(error) => {
            crit!(log, "Failed to load configuration"; "path" => config_path, "error" => %error);
            process::exit(1);
        }
    };

    let frames = match matches.value_of("FRAMES").map(str::parse::<FrameNo>) {
        Some(Ok(frames)) => Some(frames),
        Some(Err(error)) => {
            crit!(log, "Invalid frame count"; "error" => %error);
            process::exit(1);
        }
        None => None,
    };

    if let Err(error) = run(config, frames, &log) {
        crit!(log, "Session stopped"; "error" => %error);
        process::exit(1);
    }
}

fn run(config: GameConfig, frames: Option<FrameNo>, log: &Logger) -> Result<(), SessionError> {
    let transport = UdpTransport::new(config.network.bind, config.network.broadcast_port)?;
    let peers = config.peer_infos()?;

    let mut session = Session::new(
        transport,
        config.network.connections,
        config.session,
        config.transfer,
        log,
    );

    session.open()?;
    info!(log, "Session open"; "address" => %session.local_address(), "peers" => peers.len());

    if !peers.is_empty() {
        session.create_connections(&peers)?;
    } else if !session.settings().host {
        session.query_games()?;
    }

    let clock = TickClock::new();
    let mut frame: FrameNo = 0;
    let mut next_frame: Tick = 0;
    let mut next_negotiation: Tick = NEGOTIATION_PERIOD;

    while frames.map_or(true, |frames| frame < frames) {
        let now = clock.now();
        session.service(now)?;

        let gone = session
            .peers()
            .iter()
            .all(|peer| peer.state == PeerState::TimedOut || peer.state == PeerState::SignedOff);

        if !peers.is_empty() && gone {
            info!(log, "All peers gone"; "frame" => frame);
            break;
        }

        if now >= next_negotiation {
            session.report_response_time();
            let response_times = session.response_times();
            session.negotiate_max_ahead(&response_times);
            next_negotiation = now + NEGOTIATION_PERIOD;
        }

        if now >= next_frame {
            session.process_send_period(frame)?;

            for event in session.pull_inbound(frame)? {
                debug!(log, "Event"; "frame" => frame, "player" => event.player, "kind" => event.kind.tag());
            }

            frame += 1;
            next_frame += TICKS_PER_SECOND / Tick::from(session.desired_frame_rate().max(1));
        }

        session.transport_mut().wait(clock.until(next_frame))?;
    }

    session.sign_off(clock.now())
}
