use std::{path::PathBuf, time::Duration};

use anyhow::Context;
use clap::Parser;
use futures::{pin_mut, StreamExt};
use grbl_streamer::{
    cnc::{
        connection::{SerialTransport, DEFAULT_BAUD_RATE},
        events::MachineEvent,
        grbl::machine::MachineStatus,
        threading::{StreamingMode, ThreadingMode},
    },
    util::format_bytes::format_byte_string,
    MachineHandle, Settings,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Stream a G-code file to a Grbl board.", long_about = None)]
struct Args {
    /// Serial port the board is attached to.
    #[arg(short, long)]
    port: String,
    #[arg(short, long, default_value_t = DEFAULT_BAUD_RATE)]
    baud: u32,
    /// JSON file holding the persistent settings; created if missing.
    #[arg(short, long, default_value = "grbl_streamer.json")]
    settings: PathBuf,
    /// How many times to run the program.
    #[arg(short, long, default_value_t = 1)]
    loops: u32,
    #[arg(long, value_enum)]
    streaming: Option<StreamingMode>,
    #[arg(long, value_enum)]
    threading: Option<ThreadingMode>,
    /// Read and print the board's `$$` settings before streaming.
    #[arg(long)]
    read_config: bool,
    /// The program to stream.
    #[arg()]
    file: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    info!("starting with {:?}", args);

    let settings = Settings::open(args.settings.clone())
        .await
        .with_context(|| format!("could not open settings at {:?}", args.settings))?;
    let machine = MachineHandle::spawn(settings, SerialTransport::new(&args.port, args.baud));
    let events = machine.events(0);
    pin_mut!(events);

    machine.connect().await.context("could not connect")?;
    wait_for_idle(&machine).await?;
    if let Some(mode) = args.streaming {
        machine.set_streaming_mode(mode).await?;
    }
    if let Some(mode) = args.threading {
        machine.set_threading_mode(mode).await?;
    }
    if args.read_config {
        let config = machine.read_config().await.context("could not read the grbl settings")?;
        for line in config.to_commands() {
            println!("{}", line);
        }
    }
    machine
        .load_program(&args.file)
        .await
        .with_context(|| format!("could not load {:?}", args.file))?;
    machine.set_loop_count(args.loops).await?;
    machine.run_program().await.context("could not start the program")?;

    while let Some(event) = events.next().await {
        match event {
            MachineEvent::Sent(time, bytes) => println!("> {} {}", time, format_byte_string(bytes)),
            MachineEvent::Received(time, line) => println!("< {} {}", time, line),
            MachineEvent::Warning(time, text) => println!("! {} {}", time, text),
            MachineEvent::ProgramEnded {
                summary,
                restarting,
            } => {
                println!("~ {}", summary);
                if !restarting {
                    break;
                }
            }
            other => println!("~ {:?}", other),
        }
    }
    machine.disconnect(false).await?;
    Ok(())
}

// The board answers the connect-time reset with a banner and then reports Idle.
async fn wait_for_idle(machine: &MachineHandle) -> anyhow::Result<()> {
    for _ in 0..100 {
        match machine.snapshot().await?.status {
            MachineStatus::Idle => return Ok(()),
            MachineStatus::Disconnected => anyhow::bail!("the board closed the connection"),
            _ => tokio::time::sleep(Duration::from_millis(100)).await,
        }
    }
    anyhow::bail!("the board never became idle")
}
