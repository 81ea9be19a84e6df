mod input;
mod render;

use horus_device::{ClientCommand, Config, HorusClient, HttpTransport, WsConnector};
use input::{Input, LocalCommand, HELP};
use render::{stamp, View};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();
    init_tracing();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_path);
    let config = Config::load_or_default(&config_path).with_env_overrides();
    tracing::info!(
        host = %config.device.host,
        config = %config_path.display(),
        "Starting horus"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(config))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("horus=info,horus_device=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(config: Config) -> color_eyre::Result<()> {
    let connector = WsConnector::new(config.connection.connect_timeout());
    let transport = HttpTransport::from_config(&config)?;
    let (client, mut events) = HorusClient::new(&config, connector, transport);
    let commands = client.commands();
    let client_task = tokio::spawn(client.run());

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.cancel();
            }
        });
    }

    println!("{HELP}");
    let mut view = View::default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => {
                    for line in view.apply(&event) {
                        println!("{}", stamp(&line));
                    }
                }
                None => break,
            },
            line = lines.next_line() => match line? {
                Some(line) => match input::parse(&line) {
                    Ok(Input::Client(command)) => {
                        if commands.send(command).is_err() {
                            break;
                        }
                    }
                    Ok(Input::Local(LocalCommand::Status)) => {
                        view.status_lines().iter().for_each(|l| println!("{l}"));
                    }
                    Ok(Input::Local(LocalCommand::Peers)) => {
                        view.peer_lines().iter().for_each(|l| println!("{l}"));
                    }
                    Ok(Input::Local(LocalCommand::Help)) => println!("{HELP}"),
                    Ok(Input::Local(LocalCommand::Quit)) => break,
                    Ok(Input::Empty) => {}
                    Err(e) => eprintln!("{e}"),
                },
                None => break,
            },
        }
    }

    let _ = commands.send(ClientCommand::Shutdown);
    let _ = client_task.await;
    Ok(())
}
