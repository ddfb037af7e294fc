use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;

use warroom::audio::AlsaDevices;
use warroom::net_link::NetLink;
use warroom::{Config, LiveSession, SessionState};

const METER_BARS: usize = 12;

fn config_path() -> PathBuf {
    std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("WARROOM_CONFIG").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("config.toml"))
}

fn render_meter(level: f32) -> String {
    let lit = ((level / 100.0) * METER_BARS as f32).round() as usize;
    let lit = lit.min(METER_BARS);
    format!(
        "[{}{}] {:>3.0}",
        "#".repeat(lit),
        " ".repeat(METER_BARS - lit),
        level
    )
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // .env is optional
    let _ = dotenvy::dotenv();

    // 初始化日志
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::load(&config_path())?;
    config.api_key()?;

    let devices = AlsaDevices::new(config.audio.clone());
    let connector = NetLink::new(config.live.clone(), config.audio.outbound_queue);
    let mut session = LiveSession::new(
        devices,
        connector,
        config.audio.frame_size,
        config.audio.input_sample_rate,
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut meter_tick = tokio::time::interval(Duration::from_millis(200));

    println!("War Room ready. Commands: start | stop | status | quit");
    println!("Status: {}", session.status());

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                log::info!("Received Ctrl+C, shutting down...");
                session.stop();
                break;
            }

            line = lines.next_line() => {
                match line {
                    Ok(Some(cmd)) => match cmd.trim() {
                        "start" | "go" => {
                            if !session.state().can_start() {
                                println!("Already {}", session.state());
                                continue;
                            }
                            if let Err(e) = session.start().await {
                                log::warn!("Could not go live: {}", e);
                            }
                            println!("Status: {}", session.status());
                        }
                        "stop" => {
                            session.stop();
                            println!("Status: {}", session.status());
                        }
                        "status" => {
                            println!(
                                "Status: {} ({}), buffers playing: {}",
                                session.status(),
                                session.state(),
                                session.active_buffers()
                            );
                        }
                        "quit" | "exit" => {
                            session.stop();
                            break;
                        }
                        "" => {}
                        other => println!("Unknown command: {}", other),
                    },
                    Ok(None) => {
                        session.stop();
                        break;
                    }
                    Err(e) => {
                        log::error!("Failed to read stdin: {}", e);
                        session.stop();
                        break;
                    }
                }
            }

            event = session.next_event() => {
                let before = session.state();
                session.handle_event(event);
                if session.state() != before {
                    println!("\nStatus: {}", session.status());
                }
            }

            _ = meter_tick.tick(), if session.state() == SessionState::Live => {
                print!("\r{}", render_meter(session.level()));
                let _ = std::io::stdout().flush();
            }
        }
    }

    Ok(())
}
