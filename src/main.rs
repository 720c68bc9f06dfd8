use std::path::PathBuf;

use clap::{Parser, Subcommand};

use decentralis::config::Config;
use decentralis::cryptography::CipherAlgorithm;
use decentralis::keystore::DEFAULT_ITERATIONS;

#[derive(Parser)]
#[command(name = "decentralis")]
#[command(about = "Peer-to-peer encrypted file vault", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the vault node (default)
    Run,
    /// Chunk a file and distribute it to the peer set
    Chunk {
        /// Path to the file to chunk
        path: String,
        /// Keep all chunks local instead of distributing
        #[arg(long)]
        no_distribute: bool,
    },
    /// Reconstruct a file by UUID or original name
    Reconstruct {
        /// File UUID or original name
        target: String,
        /// Output path (default: restored_<name>)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Show node statistics or one file's availability
    Status {
        /// File UUID to inspect
        file_uuid: Option<String>,
    },
    /// Create the passphrase retention record
    InitKey {
        /// Cipher for the verification blob: AES-256 or ChaCha20
        #[arg(long, default_value = "AES-256")]
        algorithm: String,
        /// PBKDF2 iteration count
        #[arg(long, default_value_t = DEFAULT_ITERATIONS)]
        iterations: u32,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let debug = cli.debug || std::env::var("DECENTRALIS_DEBUG").map(|v| v != "0").unwrap_or(false);
    env_logger::Builder::from_default_env()
        .filter_level(if debug {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };

    let result = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => decentralis::commands::run::run(config).await,
        Commands::Chunk { path, no_distribute } => {
            decentralis::commands::chunk::run(config, std::path::Path::new(&path), no_distribute).await
        }
        Commands::Reconstruct { target, output } => {
            decentralis::commands::reconstruct::run(config, &target, output).await
        }
        Commands::Status { file_uuid } => decentralis::commands::status::run(config, file_uuid).await,
        Commands::InitKey { algorithm, iterations } => {
            match algorithm.parse::<CipherAlgorithm>() {
                Ok(algorithm) => decentralis::commands::init_key::run(config, algorithm, iterations),
                Err(e) => Err(e),
            }
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(e.exit_code());
    }
}
