use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use junkscribe::{
    broadcast::JsonRpcClient,
    config::Config,
    server,
    session::Session,
    token::{self, Operation},
};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Inscribe files and tokens on chain and serve them back")]
struct Cli {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Manage the wallet file
    #[command(subcommand)]
    Wallet(WalletCmd),
    /// Serve decoded inscriptions at GET /tx/{txid}
    Server,
    #[command(flatten)]
    Inscribe(InscribeCmd),
}

#[derive(Subcommand)]
enum InscribeCmd {
    /// Inscribe a file, optionally several times
    Mint {
        address: String,
        file: PathBuf,
        count: Option<u32>,
    },
    /// Inscribe "{n}.junkmap" for every n from start to end inclusive
    MintJunkmap { address: String, start: u64, end: u64 },
    /// junk-20 token operations
    #[command(name = "junk-20", subcommand)]
    Junk20(TokenCmd),
}

#[derive(Subcommand)]
enum WalletCmd {
    /// Create a new wallet
    New,
    /// Refresh unspent outputs from the indexer
    Sync,
    /// Print address and balance
    Balance,
    /// Print address and private key
    Show,
    /// Send an amount, or everything when no amount is given
    Send { address: String, amount: Option<u64> },
    /// Split the balance into equal outputs
    Split { count: u64 },
    /// Merge all outputs into one
    Consolidate,
}

#[derive(Subcommand)]
enum TokenCmd {
    /// Deploy a token
    Deploy {
        address: String,
        tick: String,
        max: u64,
        lim: u64,
    },
    /// Mint tokens, optionally several times
    Mint {
        address: String,
        tick: String,
        amt: u64,
        repeat: Option<u32>,
    },
    /// Inscribe a transfer
    Transfer {
        address: String,
        tick: String,
        amt: u64,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.config;

    match cli.cmd {
        Cmd::Wallet(cmd) => wallet(&config, cmd),
        Cmd::Server => {
            let indexer = config.indexer();
            server::serve(&indexer, config.server_port).context("decoder server failed")
        }
        Cmd::Inscribe(cmd) => inscribe(&config, cmd),
    }
}

fn session<'a>(config: &Config, rpc: &'a JsonRpcClient) -> Session<'a, JsonRpcClient> {
    Session::new(rpc, config.wallet_file(), config.network()).with_fee_rate(config.fee_rate())
}

fn wallet(config: &Config, cmd: WalletCmd) -> Result<()> {
    let file = config.wallet_file();

    match cmd {
        WalletCmd::New => {
            let wallet = file.generate(config.network())?;
            println!("address {}", wallet.address);
        }
        WalletCmd::Sync => {
            let wallet = file
                .sync(&config.indexer(), config.network())
                .context("wallet sync failed")?;
            println!("balance {}", wallet.balance());
        }
        WalletCmd::Balance => {
            let wallet = file.load().context("cannot read wallet")?;
            println!("{} {}", wallet.address, wallet.balance());
        }
        WalletCmd::Show => {
            let wallet = file.load().context("cannot read wallet")?;
            println!("Address: {}", wallet.address);
            println!("Private Key: {}", wallet.privkey);
        }
        WalletCmd::Send { address, amount } => {
            let rpc = config.node_rpc()?;
            let session = session(config, &rpc);
            let txid = session.send(&session.address(&address)?, amount)?;
            println!("{}", txid);
        }
        WalletCmd::Split { count } => {
            let rpc = config.node_rpc()?;
            let txid = session(config, &rpc).split(count)?;
            println!("{}", txid);
        }
        WalletCmd::Consolidate => {
            let rpc = config.node_rpc()?;
            match session(config, &rpc).consolidate()? {
                Some(txid) => println!("{}", txid),
                None => println!("nothing to consolidate"),
            }
        }
    }

    Ok(())
}

fn inscribe(config: &Config, cmd: InscribeCmd) -> Result<()> {
    let rpc = config.node_rpc()?;
    let session = session(config, &rpc);

    if session
        .resume_pending()
        .context("rebroadcast of pending transactions failed")?
    {
        info!("pending transactions rebroadcast, run the command again for new work");
        return Ok(());
    }

    match cmd {
        InscribeCmd::Mint {
            address,
            file,
            count,
        } => {
            let destination = session.address(&address)?;
            for _ in 0..count.unwrap_or(1) {
                let txid = session
                    .inscribe_file(&destination, &file)
                    .with_context(|| format!("cannot mint {}", file.display()))?;
                println!("{}", txid);
            }
        }
        InscribeCmd::MintJunkmap {
            address,
            start,
            end,
        } => {
            let destination = session.address(&address)?;
            for n in start..=end {
                let name = format!("{}.junkmap", n);
                info!(%name, "minting");
                let txid = session.inscribe(&destination, "text/plain", name.as_bytes(), false)?;
                println!("{} {}", name, txid);
            }
        }
        InscribeCmd::Junk20(cmd) => {
            let (address, op, repeat) = match cmd {
                TokenCmd::Deploy {
                    address,
                    tick,
                    max,
                    lim,
                } => (address, Operation::Deploy { tick, max, lim }, 1),
                TokenCmd::Mint {
                    address,
                    tick,
                    amt,
                    repeat,
                } => (address, Operation::Mint { tick, amt }, repeat.unwrap_or(1)),
                TokenCmd::Transfer { address, tick, amt } => {
                    (address, Operation::Transfer { tick, amt }, 1)
                }
            };

            let destination = session.address(&address)?;
            let payload = op.to_payload()?;
            for n in 1..=repeat {
                info!(n, repeat, "inscribing token operation");
                let txid = session.inscribe(&destination, token::CONTENT_TYPE, &payload, true)?;
                println!("{}", txid);
            }
        }
    }

    Ok(())
}
