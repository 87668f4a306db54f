// ZRE daemon: LAN peer discovery and group chat over UDP beacons + TCP.

use tokio::io::AsyncBufReadExt;
use tracing::info;

use zre_node::{Config, Event, Zre};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_help() {
    println!("zre-node {} — ZRE (RFC 36) discovery and messaging daemon", VERSION);
    println!();
    println!("USAGE:");
    println!("    zre-node [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help       Print this help message and exit");
    println!("    -V, --version    Print version and exit");
    println!();
    println!("DESCRIPTION:");
    println!("    Starts a ZRE node: announces itself with UDP beacons on port");
    println!("    5670, discovers nearby nodes, joins a group and relays chat.");
    println!("    Lines typed on stdin are shouted to the group; peer events");
    println!("    and incoming messages are logged.");
    println!();
    println!("    Stop with Ctrl+C or SIGTERM.");
    println!();
    println!("CONFIGURATION:");
    println!("    Config file (optional, first found wins):");
    println!("      ~/.config/zre/config.toml");
    println!("      /etc/zre/config.toml");
    println!();
    println!("    Example config.toml:");
    println!("      name = \"kitchen-pi\"");
    println!("      group = \"chat\"");
    println!("      interval_ms = 1000");
    println!();
    println!("      [headers]");
    println!("      X-ROOM = \"kitchen\"");
    println!();
    println!("ENVIRONMENT VARIABLES (override config file):");
    println!("    ZRE_NAME          Node name");
    println!("    ZRE_GROUP         Group to join (default: chat)");
    println!("    ZRE_PORT          TCP inbox port (default: ephemeral)");
    println!("    ZRE_BEACON_PORT   Discovery UDP port (default: 5670)");
    println!("    ZRE_INTERVAL_MS   Beacon interval (default: 1000)");
    println!("    ZRE_HOST          Advertised address (default: autodetect)");
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Some(arg) = std::env::args().nth(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("zre-node {}", VERSION);
                return Ok(());
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            other => {
                eprintln!("zre-node: unknown option '{}'\n", other);
                print_help();
                std::process::exit(1);
            }
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cfg = zre_node::config::load();
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg))
}

async fn run(cfg: Config) -> Result<(), Box<dyn std::error::Error>> {
    let group = cfg.group.clone();
    let (node, mut events) = Zre::new(cfg);
    let endpoint = node.start().await?;
    let name = node.name().await?;
    info!(%endpoint, %name, "node up");
    node.join(&group).await?;

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            print_event(event);
        }
    });

    let chat = node.clone();
    let chat_group = group.clone();
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.is_empty() {
                continue;
            }
            let _ = chat.shout(&chat_group, vec![line.into_bytes()]).await;
        }
    });

    shutdown_signal().await?;
    node.leave(&group).await?;
    node.stop().await?;
    Ok(())
}

fn print_event(event: Event) {
    match event {
        Event::Enter { name, endpoint, .. } => info!(%name, %endpoint, "peer entered"),
        Event::Exit { name, .. } => info!(%name, "peer exited"),
        Event::Evasive { name, .. } => info!(%name, "peer evasive"),
        Event::Join { name, group, .. } => info!(%name, %group, "peer joined group"),
        Event::Leave { name, group, .. } => info!(%name, %group, "peer left group"),
        Event::Whisper { name, content, .. } => {
            let text = content
                .first()
                .map(|f| String::from_utf8_lossy(f).into_owned())
                .unwrap_or_default();
            info!(%name, %text, "whisper");
        }
        Event::Shout {
            name,
            group,
            content,
            ..
        } => {
            let text = content
                .first()
                .map(|f| String::from_utf8_lossy(f).into_owned())
                .unwrap_or_default();
            info!(%name, %group, %text, "shout");
        }
        Event::Stop { name, .. } => info!(%name, "node stopped"),
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).map_err(std::io::Error::other)?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
