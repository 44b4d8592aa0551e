//! camfleet - command-line controller for a fleet of camera servers.
//!
//! One-shot subcommands over the client API: discover (or define) the
//! servers, then run a single fleet operation and report per-server
//! results.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use camfleet::addr::{parse_address_list, Network};
use camfleet::client::{FleetClient, FleetResult};
use camfleet::config::ClientConfig;
use camfleet::protocol::{AgcMode, AwbMode, ExposureMode, Fraction, MeteringMode, DEFAULT_PORT};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Control a fleet of camfleet camera servers")]
struct Cli {
    /// Network the servers live on, in CIDR notation. The mask must be
    /// correct for broadcast packets to work.
    #[arg(short, long, default_value = "192.168.0.0/16")]
    network: Network,

    /// UDP port the servers listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Local address to bind for responses
    #[arg(short, long, default_value = "0.0.0.0:5647")]
    bind: SocketAddr,

    /// Overall deadline for each fleet operation, in seconds
    #[arg(short, long, default_value_t = 5.0)]
    timeout: f64,

    /// Expected number of servers; discovery returns early once reached
    #[arg(short, long, default_value_t = 0)]
    count: usize,

    /// Skip discovery and use these servers (single address, inclusive
    /// A-B range, or comma-separated mixture)
    #[arg(short, long)]
    servers: Option<String>,

    /// Directory downloaded images are written to
    #[arg(short, long, default_value = "/tmp")]
    output: PathBuf,

    /// Warn when server clocks differ by more than this many seconds
    #[arg(long, default_value_t = 0.25)]
    time_delta: f64,

    /// TCP port for image transfers (0 picks a free port)
    #[arg(long, default_value_t = 0)]
    download_port: u16,

    /// Default number of images per capture
    #[arg(long, default_value_t = 1)]
    capture_count: u32,

    /// Default capture synchronisation delay in seconds (0 = immediate)
    #[arg(long, default_value_t = 0.0)]
    capture_delay: f64,

    /// Capture from the fast video port by default
    #[arg(long)]
    video_port: bool,

    #[command(subcommand)]
    command: Cmd,
}

fn parse_switch(s: &str) -> Result<bool, String> {
    match s {
        "0" => Ok(false),
        "1" => Ok(true),
        _ => Err(format!("expected 0 or 1, got {s:?}")),
    }
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Discover servers on the network and print their addresses
    Find,
    /// Show each server's configuration and image count
    Status,
    /// Set the capture resolution
    Resolution { width: u32, height: u32 },
    /// Set the framerate (integer or num/denom fraction, 1-90)
    Framerate { rate: Fraction },
    /// Set the white balance mode; red/blue gains apply to mode "off"
    Awb {
        mode: AwbMode,
        red: Option<f64>,
        blue: Option<f64>,
    },
    /// Set the exposure mode; the manual speed (ms) applies to mode "off"
    Exposure { mode: ExposureMode, speed: Option<f64> },
    /// Set the ISO level (0 = automatic)
    Iso { iso: u32 },
    /// Set the light metering mode
    Metering { mode: MeteringMode },
    /// Set brightness, contrast, saturation, and exposure compensation
    Levels {
        brightness: i32,
        contrast: i32,
        saturation: i32,
        ev: i32,
    },
    /// Flip the picture horizontally and/or vertically (0|1 each)
    Flip {
        #[arg(value_parser = parse_switch)]
        horizontal: bool,
        #[arg(value_parser = parse_switch)]
        vertical: bool,
    },
    /// Set the auto-gain-control mode
    Agc { mode: AgcMode },
    /// Enable or disable the denoise algorithm (0|1)
    Denoise {
        #[arg(value_parser = parse_switch)]
        enabled: bool,
    },
    /// Set the JPEG capture quality (1-100)
    Quality { quality: u8 },
    /// Blink every server's camera LED for identification
    Blink,
    /// Capture images on every server
    Capture {
        /// Number of consecutive images per server (default from
        /// --capture-count)
        #[arg(short, long)]
        count: Option<u32>,
        /// Capture from the fast video port instead of the still port
        #[arg(long)]
        video_port: bool,
        /// Synchronise captures to now + DELAY seconds (needs NTP-synced
        /// server clocks; default from --capture-delay)
        #[arg(short, long)]
        delay: Option<f64>,
    },
    /// List the images stored on each server
    List,
    /// Download all images into the output directory, then clear each
    /// fully retrieved server
    Download,
    /// Discard all images stored on the servers
    Clear,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    if cli.timeout <= 0.0 {
        bail!("timeout must be positive");
    }

    let config = ClientConfig {
        network: cli.network,
        port: cli.port,
        bind: cli.bind,
        timeout: Duration::from_secs_f64(cli.timeout),
        time_delta: cli.time_delta,
        download_port: cli.download_port,
        output: cli.output.clone(),
        capture_count: cli.capture_count,
        capture_delay: cli.capture_delay,
        video_port: cli.video_port,
    };
    config.validate()?;
    let mut client = FleetClient::new(config)?;

    // establish the peer set up front: explicit list or broadcast discovery
    match &cli.servers {
        Some(spec) => {
            for address in parse_address_list(spec)? {
                client.add(address)?;
            }
        }
        None => {
            client.find(cli.count)?;
            if client.servers().is_empty() {
                bail!("no servers found on {}", cli.network);
            }
        }
    }

    run(&mut client, cli.command)
}

fn run(client: &mut FleetClient, command: Cmd) -> Result<()> {
    match command {
        Cmd::Find => {
            for address in client.servers() {
                println!("{address}");
            }
            Ok(())
        }
        Cmd::Status => {
            let outcome = client.status(None)?;
            for (address, status) in &outcome.ok {
                println!("{address}:");
                println!("  resolution  {}x{}", status.width, status.height);
                println!("  framerate   {}", status.framerate);
                println!(
                    "  awb         {} (red {:.2}, blue {:.2})",
                    status.awb_mode, status.awb_red, status.awb_blue
                );
                println!(
                    "  exposure    {} ({:.3}ms, ev {})",
                    status.exposure_mode, status.exposure_speed, status.ev
                );
                if status.iso == 0 {
                    println!("  iso         auto");
                } else {
                    println!("  iso         {}", status.iso);
                }
                println!("  metering    {}", status.metering_mode);
                println!(
                    "  levels      brightness {} contrast {} saturation {}",
                    status.brightness, status.contrast, status.saturation
                );
                println!(
                    "  flip        horizontal {} vertical {}",
                    status.hflip as u8, status.vflip as u8
                );
                println!("  time        {:.6}", status.timestamp);
                println!("  images      {}", status.images);
            }
            finish(&outcome)
        }
        Cmd::Resolution { width, height } => finish(&client.resolution(width, height, None)?),
        Cmd::Framerate { rate } => finish(&client.framerate(rate, None)?),
        Cmd::Awb { mode, red, blue } => {
            let gains = match (red, blue) {
                (Some(red), Some(blue)) => Some((red, blue)),
                (None, None) => None,
                _ => bail!("red and blue gains must be given together"),
            };
            finish(&client.awb(mode, gains, None)?)
        }
        Cmd::Exposure { mode, speed } => finish(&client.exposure(mode, speed, None)?),
        Cmd::Iso { iso } => finish(&client.iso(iso, None)?),
        Cmd::Metering { mode } => finish(&client.metering(mode, None)?),
        Cmd::Levels { brightness, contrast, saturation, ev } => {
            finish(&client.levels(brightness, contrast, saturation, ev, None)?)
        }
        Cmd::Flip { horizontal, vertical } => finish(&client.flip(horizontal, vertical, None)?),
        Cmd::Agc { mode } => finish(&client.agc(mode, None)?),
        Cmd::Denoise { enabled } => finish(&client.denoise(enabled, None)?),
        Cmd::Quality { quality } => finish(&client.quality(quality, None)?),
        Cmd::Blink => finish(&client.blink(None)?),
        Cmd::Capture { count, video_port, delay } => {
            let config = client.config();
            let count = count.unwrap_or(config.capture_count);
            let video_port = video_port || config.video_port;
            let delay = delay.or((config.capture_delay > 0.0).then_some(config.capture_delay));
            finish(&client.capture(count, video_port, delay, None)?)
        }
        Cmd::List => {
            let outcome = client.list(None)?;
            for (address, images) in &outcome.ok {
                for image in images {
                    println!(
                        "{address}  image {:<3}  {:.6}  {} bytes",
                        image.index, image.timestamp, image.size
                    );
                }
                if images.is_empty() {
                    println!("{address}  (no images)");
                }
            }
            finish(&outcome)
        }
        Cmd::Download => {
            let bar = ProgressBar::new_spinner();
            bar.set_style(
                ProgressStyle::default_spinner()
                    .template("{spinner:.green} {pos} image(s) {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            bar.enable_steady_tick(Duration::from_millis(120));
            let outcome = client.download(None, Some(&bar))?;
            bar.finish_and_clear();
            for (address, paths) in &outcome.ok {
                for path in paths {
                    println!("{address}  {}", path.display());
                }
            }
            finish(&outcome)
        }
        Cmd::Clear => finish(&client.clear(None)?),
    }
}

/// Print per-server failures and fail the process if any server missed
/// out; successful peers have already taken effect.
fn finish<T>(outcome: &FleetResult<T>) -> Result<()> {
    for (address, reason) in &outcome.failed {
        eprintln!("{address}: {reason}");
    }
    if !outcome.fully_ok() {
        bail!("{} server(s) failed", outcome.failed.len());
    }
    Ok(())
}
