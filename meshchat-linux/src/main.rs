// meshchat: flood mesh chat over TCP links with LAN discovery and a line console.

mod commands;
mod config;
mod discovery;
mod logging;
mod service;
mod transport;

use std::path::PathBuf;

use anyhow::{bail, Context};
use meshchat_core::MeshEvent;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

use crate::commands::Input;
use crate::service::{MeshService, ServiceOptions, DEFAULT_ROOM};
use crate::transport::{TcpOptions, TcpTransport};

const VERSION: &str = env!("CARGO_PKG_VERSION");

struct Args {
    config: Option<PathBuf>,
    json: bool,
}

fn parse_args() -> anyhow::Result<Option<Args>> {
    let mut args = Args {
        config: None,
        json: false,
    };
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("meshchat {}", VERSION);
                return Ok(None);
            }
            "--config" | "-c" => match it.next() {
                Some(p) => args.config = Some(PathBuf::from(p)),
                None => bail!("--config was provided without a path"),
            },
            "--json" => args.json = true,
            other => bail!("unknown argument: {other}"),
        }
    }
    Ok(Some(args))
}

fn main() -> anyhow::Result<()> {
    let Some(args) = parse_args()? else {
        return Ok(());
    };
    let cfg = config::load(args.config.as_deref())?;
    logging::init(&cfg.log_level, cfg.log_json);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg, args.json))
}

async fn run(cfg: config::Config, json: bool) -> anyhow::Result<()> {
    let transport = TcpTransport::new(TcpOptions {
        listen_port: cfg.listen_port,
        discovery_port: cfg.discovery.then_some(cfg.discovery_port),
        redial_interval: cfg.redial_interval(),
    });
    let service = MeshService::start(transport, ServiceOptions::from(&cfg))
        .context("starting mesh service")?;

    let printer = tokio::spawn(print_events(service.subscribe(), json));
    println!(
        "Welcome to meshchat, {}. Type /help for commands.",
        service.nickname().await?
    );

    tokio::select! {
        r = console(&service) => r?,
        r = shutdown_signal() => r?,
    }
    service.stop().await;
    printer.abort();
    Ok(())
}

async fn console(service: &MeshService) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut room = DEFAULT_ROOM.to_string();
    while let Some(line) = lines.next_line().await? {
        match commands::parse(&line) {
            Input::Empty => {}
            Input::Chat(text) => {
                if let Err(e) = service.send_message(&text, Some(&room), false).await {
                    println!("* not sent: {e}");
                }
            }
            Input::Private { target, text } => {
                let content = commands::private_content(&target, &text);
                if let Err(e) = service.send_message(&content, None, true).await {
                    println!("* not sent: {e}");
                }
            }
            Input::Join(name) => match service.join_room(&name).await {
                Ok(_) => {
                    println!("* joined room #{name}");
                    room = name;
                }
                Err(e) => println!("* cannot join: {e}"),
            },
            Input::Nick(nick) => match service.set_nickname(&nick).await {
                Ok(()) => println!("* nickname changed to: {nick}"),
                Err(e) => println!("* nickname not changed: {e}"),
            },
            Input::Who => {
                let users = service.active_peers().await?;
                if users.is_empty() {
                    println!("* no other users online");
                } else {
                    println!("* online users: {}", users.join(", "));
                }
            }
            Input::Rooms => println!("* rooms: {}", service.rooms().await?.join(", ")),
            Input::Ping(nick) => match service.ping(&nick).await {
                Ok(_) => println!("* ping sent to {nick}"),
                Err(e) => println!("* {e}"),
            },
            Input::Clear => print!("\x1b[2J\x1b[H"),
            Input::Help => println!("{}", commands::HELP),
            Input::Usage(usage) => println!("* usage: {usage}"),
            Input::Unknown(cmd) => {
                println!("* unknown command: {cmd}. Type /help for available commands.")
            }
            Input::Quit => break,
        }
    }
    Ok(())
}

async fn print_events(mut events: broadcast::Receiver<MeshEvent>, json: bool) {
    loop {
        let event = match events.recv().await {
            Ok(e) => e,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "console fell behind");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if json {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => tracing::warn!(error = %e, "cannot serialize event"),
            }
            continue;
        }
        match event {
            MeshEvent::MessageReceived { message } | MeshEvent::MessageSent { message } => {
                let place = match (&message.room, message.is_private()) {
                    (_, true) => "[private, unencrypted] ".to_string(),
                    (Some(room), false) => format!("#{room} "),
                    (None, false) => String::new(),
                };
                println!("{place}<{}> {}", message.sender, message.content);
            }
            MeshEvent::PeerJoined { nickname } => println!("* {nickname} joined the mesh"),
            MeshEvent::PeerLeft { nickname } => println!("* {nickname} left the mesh"),
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
