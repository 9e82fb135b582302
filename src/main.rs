use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use url::Url;

use peercall::config::{default_ice_servers, parse_ice_server, DATA_CHANNEL_LABEL, DEFAULT_RELAY_URL};
use peercall::logger::{self, LogConfig, LogLevel};
use peercall::media::{LoggingSink, MediaConstraints, SyntheticSource};
use peercall::peer::RtcPeerFactory;
use peercall::signaling::WebSocketConnector;
use peercall::{Client, ClientConfig, ClientEvent, PeerIds};

#[derive(Parser, Debug)]
#[command(name = "peercall")]
#[command(about = "Relay-signaled WebRTC call client")]
struct Cli {
    /// Identifier this client registers under
    #[arg(long, env = "PEERCALL_LOCAL")]
    local: String,

    /// Identifier of the peer to call
    #[arg(long, env = "PEERCALL_REMOTE")]
    remote: String,

    /// Relay server URL
    #[arg(long, env = "PEERCALL_RELAY", default_value = DEFAULT_RELAY_URL)]
    relay: String,

    /// STUN/TURN server as `url[,username,credential]`; repeatable
    #[arg(long = "ice-server", value_name = "SPEC")]
    ice_servers: Vec<String>,

    /// Open the data channel when offering
    #[arg(long)]
    data_channel: bool,

    #[arg(long, default_value = DATA_CHANNEL_LABEL)]
    data_channel_label: String,

    #[arg(long)]
    no_audio: bool,

    #[arg(long)]
    no_video: bool,

    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,
}

impl Cli {
    fn client_config(&self) -> Result<ClientConfig> {
        let ice_servers = if self.ice_servers.is_empty() {
            default_ice_servers()
        } else {
            self.ice_servers
                .iter()
                .map(|spec| parse_ice_server(spec))
                .collect::<Result<Vec<_>, _>>()?
        };
        Ok(ClientConfig {
            relay_url: self.relay.clone(),
            ice_servers,
            data_channel_label: self.data_channel_label.clone(),
            open_data_channel: self.data_channel,
            constraints: MediaConstraints {
                audio: !self.no_audio,
                video: !self.no_video,
            },
            ..ClientConfig::default()
        })
    }
}

fn print_event(event: &ClientEvent) {
    match event {
        ClientEvent::Message(text) => println!("< {text}"),
        ClientEvent::State(state) => println!("* call {state:?}"),
        ClientEvent::SignalingError(err) => println!("! signaling error: {err}"),
        ClientEvent::DeviceError(err) => println!("! device error: {err}"),
        other => println!("* {other:?}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logger::init(&LogConfig {
        level: cli.log_level,
    })?;

    let ids = PeerIds::new(&cli.local, &cli.remote)?;
    let config = cli.client_config()?;
    config.validate()?;
    let relay = Url::parse(&config.relay_url).context("relay url")?;

    let factory = RtcPeerFactory::new(&config.ice_servers)?;
    let (events, mut event_rx) = peercall::EventSink::channel();
    let (client, handle) = Client::new(
        ids,
        config,
        Arc::new(WebSocketConnector::new(relay)),
        Arc::new(factory),
        Box::new(SyntheticSource::default()),
        Box::new(LoggingSink::default()),
        events,
    );

    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            print_event(&event);
        }
    });

    let stdin_handle = handle.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            if !line.is_empty() && !stdin_handle.send_message(line) {
                break;
            }
        }
    });

    let ctrl_c_handle = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, shutting down");
            ctrl_c_handle.shutdown();
        }
    });

    if let Err(err) = client.run().await {
        error!("client stopped: {err}");
        return Err(err.into());
    }
    Ok(())
}
