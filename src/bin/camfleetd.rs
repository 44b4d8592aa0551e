//! camfleetd - the camera server daemon, backed by the synthetic camera.
//! Hardware backends implement [`camfleet::camera::Camera`] and swap in
//! here.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use anyhow::Result;
use clap::Parser;

use camfleet::camera::SyntheticCamera;
use camfleet::config::ServerConfig;
use camfleet::protocol::DEFAULT_PORT;
use camfleet::server::CameraServer;

#[derive(Parser, Debug)]
#[command(author, version, about = "Camfleet camera server")]
struct Args {
    /// Address to listen on for commands
    #[arg(short, long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    bind: IpAddr,

    /// UDP port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Initial JPEG capture quality (1-100)
    #[arg(short, long, default_value_t = 85)]
    quality: u8,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = ServerConfig {
        bind: SocketAddr::new(args.bind, args.port),
        quality: args.quality,
    };
    let mut server = CameraServer::new(&config, Box::new(SyntheticCamera::new()))?;
    server.run()
}
