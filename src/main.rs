//! # support-session
//!
//! Terminal front end for the support chat session core. Connects as one user,
//! prints the conversation to stdout and sends each stdin line as a message.
//!
//! ## Commands
//!
//! - `/reconnect`: force a reconnect (also leaves the `failed` state)
//! - `/quit`: release the connection and exit
//!
//! Logs go to stderr; set `RUST_LOG` or `[logging] level` to adjust.

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use support_session::config::Config;
use support_session::driver;
use support_session::model::Message;
use support_session::SessionEvent;

#[derive(Parser)]
#[command(name = "support-session", version, about = "Real-time support chat client")]
struct Cli {
    /// Path to config file (default: support-session.toml)
    #[arg(long)]
    config: Option<String>,

    /// User identifier to chat as
    #[arg(long, env = "SUPPORT_SESSION_USER_ID")]
    user_id: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("support-session: {e}");
            std::process::exit(1);
        }
    };

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_writer(std::io::stderr)
        .init();

    info!("support-session v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Backend: {}", config.backend.url);

    let (session, mut events) = match driver::spawn(&config, &cli.user_id) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("support-session: {e}");
            std::process::exit(1);
        }
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => match line.trim() {
                        "/quit" => break,
                        "/reconnect" => {
                            session.force_reconnect();
                        }
                        "" => {}
                        text => {
                            session.send(text);
                        }
                    },
                    // EOF or unreadable stdin
                    Ok(None) | Err(_) => break,
                }
            }
            event = events.recv() => {
                match event {
                    Some(event) => print_event(&event),
                    None => break,
                }
            }
        }
    }

    session.shutdown().await;
    info!("support-session stopped");
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::Status(text) => println!("* {text}"),
        SessionEvent::Phase(_) | SessionEvent::Sending(_) => {}
        SessionEvent::ActiveConversation(Some(id)) => println!("* conversation {id}"),
        SessionEvent::ActiveConversation(None) => println!("* no active conversation"),
        SessionEvent::MessageAppended(message) => print_message(message),
        SessionEvent::MessageConfirmed { .. } => {}
        SessionEvent::MessageDiscarded { local_id } => println!("* message {local_id} was not sent"),
        SessionEvent::HistoryReplaced(messages) => {
            println!("* --- history ({} messages) ---", messages.len());
            for message in messages {
                print_message(message);
            }
        }
    }
}

fn print_message(message: &Message) {
    println!(
        "[{}] {}: {}",
        message.timestamp.format("%H:%M:%S"),
        message.sender.as_str(),
        message.body
    );
}
