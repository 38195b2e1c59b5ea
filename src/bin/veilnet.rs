// This file is part of Veilnet and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;

use veilnet::config::{
    ParamsMap, PARAM_DCNET_TYPE, PARAM_LATENCY_PROBES, PARAM_N_CLIENTS, PARAM_N_TRUSTEES,
    PARAM_UPSTREAM_CELL_SIZE, PARAM_USE_UDP, PARAM_WINDOW_SIZE,
};
use veilnet::net::wire;
use veilnet::relay::RelayEvent;
use veilnet::session::spawn_local_session;
use veilnet::SessionParams;

#[derive(Parser)]
#[command(name = "veilnet", about = "DC-net anonymous communication engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a complete in-process session and stream decoded slots.
    Run(RunArgs),
    /// Print the session parameters derived from the given flags.
    Params(SessionArgs),
}

#[derive(Args, Clone)]
struct SessionArgs {
    #[arg(long, default_value_t = 2)]
    clients: u16,
    #[arg(long, default_value_t = 1)]
    trustees: u16,
    #[arg(long, default_value_t = 64)]
    cell_size: u32,
    /// DC-net variant: Simple or Verifiable.
    #[arg(long, default_value = "Simple")]
    variant: String,
    #[arg(long)]
    udp: bool,
    #[arg(long, default_value_t = 2)]
    window: u32,
    #[arg(long)]
    latency_probes: bool,
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    session: SessionArgs,
    /// Send this message anonymously from a client once the session is up.
    #[arg(long)]
    demo_message: Option<String>,
}

impl SessionArgs {
    fn to_params(&self) -> Result<SessionParams> {
        let mut map = ParamsMap::new();
        map.set_int(PARAM_N_CLIENTS, i64::from(self.clients))
            .set_int(PARAM_N_TRUSTEES, i64::from(self.trustees))
            .set_int(PARAM_UPSTREAM_CELL_SIZE, i64::from(self.cell_size))
            .set_str(PARAM_DCNET_TYPE, &self.variant)
            .set_bool(PARAM_USE_UDP, self.udp)
            .set_int(PARAM_WINDOW_SIZE, i64::from(self.window))
            .set_bool(PARAM_LATENCY_PROBES, self.latency_probes);
        SessionParams::from_map(&map).context("invalid session parameters")
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(args),
        Command::Params(args) => {
            println!("{:#?}", args.to_params()?);
            Ok(())
        }
    }
}

#[tokio::main]
async fn run(args: RunArgs) -> Result<()> {
    let params = args.session.to_params()?;
    info!(?params, "starting local session");
    let mut handles = spawn_local_session(&params).context("failed to spawn session")?;

    loop {
        match handles.events.recv().await {
            Some(RelayEvent::SessionReady) => break,
            Some(event) => info!(?event, "relay event"),
            None => anyhow::bail!("relay stopped during setup"),
        }
    }
    info!("session is READY");

    if let Some(message) = args.demo_message {
        handles.client_data_in[0]
            .send(wire::encode_slot(1, message.as_bytes()))
            .context("client data plane closed")?;
        info!("demo message queued on client 0");
    }

    loop {
        tokio::select! {
            slot = handles.relay_data_out.recv() => {
                match slot {
                    Some((connection_id, data)) => {
                        info!(connection_id, len = data.len(), data = %String::from_utf8_lossy(&data), "decoded anonymous slot");
                    }
                    None => break,
                }
            }
            event = handles.events.recv() => {
                match event {
                    Some(event) => info!(?event, "relay event"),
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                handles
                    .router
                    .send_to_relay(veilnet::Message::Shutdown)
                    .await
                    .ok();
                break;
            }
        }
    }
    for task in handles.tasks {
        let _ = task.await;
    }
    Ok(())
}
