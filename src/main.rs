mod config;
mod crypto;
mod event;
mod schema;
mod server;
mod store;
mod validate;
mod verifier;
mod ws;

use std::net::SocketAddr;

use anyhow::{anyhow, bail};
use clap::{Parser, Subcommand};
use config::Settings;
use store::Store;

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "credr",
    author,
    version,
    about = "Relay for hierarchical delegated credentials"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Create or migrate the database at `STORE_PATH`.
    Init,
    /// Run one or more event files through the admission pipeline.
    Ingest {
        /// Paths to JSON event files to ingest.
        #[arg(required = true)]
        files: Vec<String>,
    },
    /// Launch HTTP and WebSocket services.
    Serve,
    /// Re-verify id and signature for a random sample of stored events.
    Verify {
        #[arg(long, default_value_t = 1000)]
        sample: usize,
    },
    /// Verify a credential grant chain by composite address.
    Chain {
        /// Grant address, `<kind>:<pubkey>:<d>`.
        address: String,
    },
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    let cfg = Settings::from_env(&cli.env)?;
    // Opening migrates, so `init` needs no extra work.
    let store = Store::open(&cfg.store_path, cfg.kinds)?;
    match cli.command {
        Commands::Init => {}
        Commands::Ingest { files } => {
            for f in files {
                let data = std::fs::read_to_string(&f)?;
                let ev: event::Event = serde_json::from_str(&data)?;
                validate::admit_event(&store, &ev, cfg.verify_sig, store::unix_now())
                    .map_err(|reject| anyhow!("{}: {}", f, reject))?;
            }
        }
        Commands::Serve => {
            let http_addr: SocketAddr = cfg.bind_http.parse()?;
            let ws_addr: SocketAddr = cfg.bind_ws.parse()?;
            let relay = ws::Relay::new(store.clone(), cfg.verify_sig, cfg.max_message_bytes);
            tokio::try_join!(
                server::serve_http(http_addr, store, std::future::pending()),
                ws::serve_ws(ws_addr, relay, std::future::pending())
            )?;
        }
        Commands::Verify { sample } => {
            store.verify_sample(sample)?;
        }
        Commands::Chain { address } => {
            let addr = event::Address::parse(&address)
                .filter(|a| a.kind == cfg.kinds.grant)
                .ok_or_else(|| anyhow!("not a grant address: {}", address))?;
            let grant = store
                .grant_event(&addr.pubkey, &addr.d)?
                .ok_or_else(|| anyhow!("no grant stored at {}", address))?;
            let status = verifier::verify(&store, &grant, store::unix_now())?;
            println!("{}", status);
            if !status.is_valid() {
                bail!("credential did not verify");
            }
        }
    }
    Ok(())
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    run(cli).await
}
