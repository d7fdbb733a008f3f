//! Serial Upload
//!
//! Pushes a project directory to a Raspberry Pi over a USB-gadget serial
//! link and starts it there.
//!
//! # Features
//!
//! - **Receiver**: Runs on the Pi, accepts config and archive over `/dev/ttyGS0`,
//!   verifies the SHA-256, extracts the project and launches it on request
//! - **Uploader**: Runs on the host, packs the project according to its
//!   `config.json`, retries failed transfers with exponential backoff
//! - **Pack**: Builds the archive locally without a link attached
//!
//! # Usage
//!
//! ```bash
//! # On the Pi
//! serial-upload receive
//!
//! # On the host
//! serial-upload send ./my-project -p /dev/ttyACM0
//!
//! # Inspect what would be sent
//! serial-upload pack ./my-project
//!
//! # List available serial ports (requires serial feature)
//! serial-upload ports list
//!
//! # Start a new project
//! serial-upload generate config -o my-project/config.json
//! ```

mod archive;
mod journal;
mod project;
mod protocol;
mod receiver;
mod serial;
mod settings;
mod storage;
mod uploader;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};

use project::ProjectConfig;
use settings::Settings;

#[cfg(feature = "serial")]
use journal::Journal;
#[cfg(feature = "serial")]
use receiver::Receiver;
#[cfg(feature = "serial")]
use serial::PortConfig;
#[cfg(feature = "serial")]
use std::fs;
#[cfg(feature = "serial")]
use uploader::{Upload, Uploader};

/// Serial Upload
///
/// Project upload over a USB-gadget serial link
#[derive(Parser)]
#[command(name = "serial-upload")]
#[command(author = "Prasanna Gautam")]
#[command(version = "0.1.0")]
#[command(about = "Upload and run a project on a Raspberry Pi over a USB serial gadget")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Tool settings file (TOML)
    #[arg(short, long, global = true)]
    settings: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve uploads on the Pi (requires --features serial)
    #[cfg(feature = "serial")]
    Receive {
        /// Serial port path (default: /dev/ttyGS0)
        #[arg(short, long)]
        port: Option<String>,

        /// Baud rate
        #[arg(short, long)]
        baud: Option<u32>,

        /// Directory holding the archive and upload.log (default: ~/app)
        #[arg(short, long)]
        app_dir: Option<String>,
    },

    /// Upload a project directory (requires --features serial)
    #[cfg(feature = "serial")]
    Send {
        /// Project directory containing config.json
        project_dir: PathBuf,

        /// Serial port path (overrides com_port from config.json)
        #[arg(short, long)]
        port: Option<String>,

        /// Baud rate
        #[arg(short, long)]
        baud: Option<u32>,

        /// Maximum number of attempts
        #[arg(short, long)]
        retries: Option<u32>,

        /// Do not start the project after a successful upload
        #[arg(long)]
        no_run: bool,

        /// Seconds to echo receiver output after RUN
        #[arg(long)]
        run_window: Option<u64>,
    },

    /// Build the upload archive without sending it
    Pack {
        /// Project directory containing config.json
        project_dir: PathBuf,

        /// Archive path (default: <PROJECT_DIR>/__upload__.tar.gz)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Serial port operations (requires --features serial)
    #[cfg(feature = "serial")]
    #[command(subcommand)]
    Ports(PortCommands),

    /// Generate project files
    #[command(subcommand)]
    Generate(GenerateCommands),
}

#[cfg(feature = "serial")]
#[derive(Subcommand)]
enum PortCommands {
    /// List available serial ports
    List,
}

#[derive(Subcommand)]
enum GenerateCommands {
    /// Generate a config.json template
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    let settings = Settings::load(cli.settings.as_deref())?;

    match cli.command {
        #[cfg(feature = "serial")]
        Commands::Receive {
            port,
            baud,
            app_dir,
        } => handle_receive(settings, port, baud, app_dir),
        #[cfg(feature = "serial")]
        Commands::Send {
            project_dir,
            port,
            baud,
            retries,
            no_run,
            run_window,
        } => handle_send(settings, &project_dir, port, baud, retries, no_run, run_window),
        Commands::Pack {
            project_dir,
            output,
        } => handle_pack(&project_dir, output),
        #[cfg(feature = "serial")]
        Commands::Ports(cmd) => handle_ports(cmd),
        Commands::Generate(cmd) => handle_generate(cmd),
    }
}

#[cfg(feature = "serial")]
fn handle_receive(
    mut settings: Settings,
    port: Option<String>,
    baud: Option<u32>,
    app_dir: Option<String>,
) -> Result<()> {
    if let Some(port) = port {
        settings.receiver.port = port;
    }
    if let Some(baud) = baud {
        settings.receiver.baud = baud;
    }
    if let Some(app_dir) = app_dir {
        settings.receiver.app_dir = app_dir;
    }
    let settings = settings.receiver;

    let app_dir = settings.app_dir();
    fs::create_dir_all(&app_dir)?;

    println!(
        "{} Opening {} at {} baud",
        "[*]".cyan().bold(),
        settings.port.white(),
        settings.baud
    );

    let port_config = PortConfig::new(&settings.port)
        .with_baud_rate(settings.baud)
        .with_timeout(settings.read_timeout());
    let link = serial::port::open(&port_config, false)?;

    println!(
        "{} Serving uploads into {} (log: {})",
        "[OK]".green().bold(),
        app_dir.display(),
        settings.log_path().display()
    );

    let journal = Journal::open(settings.log_path());
    let mut receiver = Receiver::new(link, settings, journal);
    receiver.serve()
}

#[cfg(feature = "serial")]
fn handle_send(
    mut settings: Settings,
    project_dir: &Path,
    port: Option<String>,
    baud: Option<u32>,
    retries: Option<u32>,
    no_run: bool,
    run_window: Option<u64>,
) -> Result<()> {
    if let Some(baud) = baud {
        settings.sender.baud = baud;
    }
    if let Some(retries) = retries {
        settings.sender.max_retries = retries;
    }
    if let Some(secs) = run_window {
        settings.sender.run_window_secs = secs;
    }
    let settings = settings.sender;

    let journal = Journal::open(&settings.log_file);
    let baud_rate = settings.baud;
    let timeout = settings.reply_timeout().min(std::time::Duration::from_millis(200));
    let mut uploader = Uploader::new(settings, journal).with_run(!no_run);

    let upload = Upload::prepare(project_dir, uploader.journal())?;

    if let Some(path) = uploader.journal().path() {
        println!("{} Logging to {}", "[*]".cyan().bold(), path.display());
    }

    let port_path = port.unwrap_or_else(|| upload.config.port_name().to_string());
    println!(
        "{} Sending {} ({} files, {}) to {} at {} baud",
        "[TX]".cyan().bold(),
        upload.project_dir.display(),
        upload.members,
        storage::format_size(upload.size),
        port_path.white(),
        baud_rate
    );

    let result = uploader.send_with_retries(&upload, |_| {
        let config = PortConfig::new(&port_path)
            .with_baud_rate(baud_rate)
            .with_timeout(timeout);
        serial::port::open(&config, true)
    });

    match result {
        Ok(()) => {
            println!("{} Upload complete", "[OK]".green().bold());
            Ok(())
        }
        Err(e) => {
            eprintln!("{} Upload to {} failed", "[ERROR]".red().bold(), port_path);
            Err(e)
        }
    }
}

fn handle_pack(project_dir: &Path, output: Option<PathBuf>) -> Result<()> {
    let config = ProjectConfig::load(project_dir)?;
    let out_path = output.unwrap_or_else(|| project_dir.join(protocol::ARCHIVE_NAME));

    println!(
        "{} Packing {}",
        "[*]".cyan().bold(),
        project_dir.display()
    );

    let members = archive::build(project_dir, &out_path, &config)?;
    let digest = archive::sha256_file(&out_path)?;
    let size = std::fs::metadata(&out_path)?.len();

    println!(
        "{} {} ({} files, {})",
        "[OK]".green().bold(),
        out_path.display(),
        members,
        storage::format_size(size)
    );
    println!("  sha256: {}", digest);

    Ok(())
}

#[cfg(feature = "serial")]
fn handle_ports(cmd: PortCommands) -> Result<()> {
    match cmd {
        PortCommands::List => serial::port::print_ports(),
    }
}

fn handle_generate(cmd: GenerateCommands) -> Result<()> {
    match cmd {
        GenerateCommands::Config { output } => {
            let config = serde_json::to_string_pretty(&ProjectConfig::template())?;

            if let Some(path) = output {
                std::fs::write(&path, format!("{}\n", config))?;
                println!(
                    "{} config.json written to {}",
                    "[OK]".green().bold(),
                    path.display()
                );
            } else {
                println!("{}", config);
            }
        }
    }

    Ok(())
}
