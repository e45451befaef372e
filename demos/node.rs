use std::{path::PathBuf, sync::mpsc, time::Duration};

use chunkdht::{
    client::{read_hashfile, write_hashfile},
    rpc::Config,
    ChunkClient, DhtBuilder,
};

use clap::{Parser, Subcommand};
use tracing::{info, Level};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON config file: node_id, ip, port, nodes, file_dir
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log every message sent and received
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Join the network and keep serving until Ctrl+C
    Serve,
    /// Store a file, writing its chunk list to a hash file
    Store { file: PathBuf, hashfile: PathBuf },
    /// Retrieve the file described by a hash file
    Retrieve { hashfile: PathBuf, output: PathBuf },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose { Level::TRACE } else { Level::INFO })
        .with_thread_names(true)
        .init();

    let config = match &cli.config {
        Some(path) => Config::from_json_file(path)?,
        None => Config::default(),
    };

    let dht = DhtBuilder::from(config).build()?;

    info!(local = ?dht.local(), "Joining...");
    let closest = dht.join()?;
    info!(closest = closest.len(), "Joined");

    match cli.command {
        Command::Serve => {
            let (sender, receiver) = mpsc::channel();
            ctrlc::set_handler(move || {
                let _ = sender.send(());
            })?;

            info!("Serving, press Ctrl+C to stop.");

            while receiver.recv_timeout(Duration::from_secs(30)).is_err() {
                let info = dht.info()?;

                info!(
                    id = %info.id(),
                    local_addr = %info.local_addr(),
                    routing_table_size = info.routing_table_size(),
                    stored_chunks = info.stored_chunks(),
                    "Node status"
                );
            }

            let mut dht = dht;
            dht.shutdown();
        }
        Command::Store { file, hashfile } => {
            let client = ChunkClient::new(dht);

            let chunks = client.store_file(&file)?;
            write_hashfile(&hashfile, &chunks)?;

            println!("Stored {} chunks, hash file: {:?}", chunks.len(), hashfile);
        }
        Command::Retrieve { hashfile, output } => {
            let client = ChunkClient::new(dht);

            let chunks = read_hashfile(&hashfile)?;
            client.retrieve_to_file(&chunks, &output)?;

            println!("Retrieved {} chunks into {:?}", chunks.len(), output);
        }
    }

    Ok(())
}
