use std::path::PathBuf;
use std::sync::Arc;

use hearth_crypto::signal::{MemoryPreKeyStore, MemorySessionStore};
use hearth_crypto::KeyBundleStore;
use hearth_protocol::transport::WebSocketConnector;
use hearth_protocol::{ChatClient, ClientConfig, ClientObserver, HttpDirectory, Message};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "\
usage: hearth [--config FILE] [--server URL] [--directory URL] [--user ID]

commands once running:
  /to USER     send following lines to USER
  /status      show connection metrics and presence
  /quit        disconnect and exit
  anything else is sent to the current recipient";

/// Command-line arguments. Flags override values from the config file.
#[derive(Default)]
struct Args {
    config: Option<PathBuf>,
    server: Option<String>,
    directory: Option<String>,
    user: Option<String>,
    help: bool,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Args, String> {
    let mut parsed = Args::default();
    while let Some(arg) = args.next() {
        let mut value = |flag: &str| args.next().ok_or_else(|| format!("{flag} needs a value"));
        match arg.as_str() {
            "--config" => parsed.config = Some(PathBuf::from(value("--config")?)),
            "--server" => parsed.server = Some(value("--server")?),
            "--directory" => parsed.directory = Some(value("--directory")?),
            "--user" => parsed.user = Some(value("--user")?),
            "-h" | "--help" => parsed.help = true,
            other => return Err(format!("unknown argument {other}")),
        }
    }
    Ok(parsed)
}

fn load_config(args: Args) -> Result<ClientConfig, String> {
    let mut config = match &args.config {
        Some(path) => {
            let data = std::fs::read_to_string(path)
                .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
            // validated below, once flags have filled in what the file left out
            ClientConfig::from_json(&data).map_err(|e| format!("{}: {e}", path.display()))?
        }
        None => ClientConfig::default(),
    };
    if let Some(server) = args.server {
        config.server_url = server;
    }
    if let Some(directory) = args.directory {
        config.directory_url = directory;
    }
    if let Some(user) = args.user {
        config.user_id = user;
    }
    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

/// Prints everything the client reports.
struct Terminal;

impl ClientObserver for Terminal {
    fn on_connect(&self) {
        println!("* connected");
    }

    fn on_disconnect(&self) {
        println!("* connection lost, reconnecting");
    }

    fn on_message_received(&self, message: &Message) {
        println!("[{}] {}", message.sender_id, message.content);
    }

    fn on_peer_connected(&self, user_id: &str) {
        println!("* {user_id} is online");
    }

    fn on_peer_disconnected(&self, user_id: &str) {
        println!("* {user_id} went offline");
    }

    fn on_reconnect_exhausted(&self, attempts: u32) {
        println!("* gave up after {attempts} reconnect attempts; /quit and try again later");
    }
}

async fn run(config: ClientConfig) -> Result<(), String> {
    let keys = KeyBundleStore::open(
        Box::new(MemoryPreKeyStore::new()),
        config.crypto.signed_prekey_grace_secs,
    )
    .map_err(|e| e.to_string())?;
    let directory = HttpDirectory::new(config.directory_url.clone()).map_err(|e| e.to_string())?;

    let client = ChatClient::new(
        config,
        Arc::new(keys),
        Box::new(MemorySessionStore::new()),
        Arc::new(directory),
        Arc::new(WebSocketConnector),
    )
    .map_err(|e| e.to_string())?;
    client.add_observer(Arc::new(Terminal));

    if let Err(e) = client.start().await {
        // transport errors are retried in the background; directory ones are not
        if matches!(e, hearth_protocol::ProtocolError::TransportDropped(_)) {
            tracing::warn!(error = %e, "initial connect failed; retrying");
        } else {
            return Err(e.to_string());
        }
    }
    println!("signed in as {}. /to USER to pick a recipient, /quit to leave.", client.user_id());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut recipient: Option<String> = None;
    while let Some(line) = lines.next_line().await.map_err(|e| e.to_string())? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.split_once(' ').unwrap_or((line, "")) {
            ("/quit", _) => break,
            ("/to", user) if !user.trim().is_empty() => {
                recipient = Some(user.trim().to_string());
                println!("* talking to {}", user.trim());
            }
            ("/status", _) => print_status(&client),
            (command, _) if command.starts_with('/') => println!("{USAGE}"),
            _ => match &recipient {
                Some(to) => {
                    if let Err(e) = client.send(line, to).await {
                        println!("* not sent: {e}");
                    }
                }
                None => println!("* pick a recipient with /to USER first"),
            },
        }
    }

    client.disconnect().await.map_err(|e| e.to_string())
}

fn print_status(client: &ChatClient) {
    let metrics = client.metrics();
    println!(
        "* {:?}; connections {}, reconnections {}, stability {:.2}, uptime {:.0}%",
        client.state(),
        metrics.total_connections,
        metrics.total_reconnections,
        metrics.stability,
        metrics.uptime_ratio * 100.0,
    );
    for record in client.presence_snapshot() {
        println!("*   {:<16} {:?}", record.user_id, record.status);
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("hearth: {e}\n{USAGE}");
            std::process::exit(2);
        }
    };
    if args.help {
        println!("{USAGE}");
        return;
    }

    let result = match load_config(args) {
        Ok(config) => run(config).await,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        eprintln!("hearth: {e}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Result<Args, String> {
        parse_args(list.iter().map(ToString::to_string))
    }

    #[test]
    fn flags_override_defaults() {
        let config = load_config(args(&["--user", "alice", "--server", "ws://relay/ws"]).unwrap()).unwrap();
        assert_eq!(config.user_id, "alice");
        assert_eq!(config.server_url, "ws://relay/ws");
        assert_eq!(config.directory_url, ClientConfig::default().directory_url);
    }

    #[test]
    fn missing_value_and_unknown_flag_rejected() {
        assert!(args(&["--user"]).is_err());
        assert!(args(&["--bogus"]).is_err());
        assert!(args(&["--help"]).unwrap().help);
    }

    #[test]
    fn user_is_required() {
        assert!(load_config(args(&[]).unwrap()).is_err());
    }
}
