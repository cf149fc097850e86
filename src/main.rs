use anyhow::Context;
use env_logger::Builder;
use log::{LevelFilter, info};
use std::io::Write;
use std::path::Path;

use wave_mac_simulator::mac::MacConfig;
use wave_mac_simulator::simulation::{Network, load_scenario};

const USAGE: &str = "usage: wave-mac-simulator <scenario.json> [mac.toml]";

fn main() -> anyhow::Result<()> {
    // Logging setup; timestamps are simulated time, not wall clock.
    Builder::new()
        .filter_level(LevelFilter::Info)
        .filter(Some("wave_mac_simulator"), LevelFilter::Debug)
        .parse_default_env()
        .format(|buf, record| {
            writeln!(
                buf,
                "[{:>10} us {:<5} {}] {}",
                embassy_time::Instant::now().as_micros(),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let mut args = std::env::args().skip(1);
    let scenario_path = args.next().context(USAGE)?;
    let config = match args.next() {
        Some(path) => MacConfig::load(Path::new(&path)).map_err(anyhow::Error::msg)?,
        None => MacConfig::default(),
    };

    info!("Loading scenario {}", scenario_path);
    let scenario = load_scenario(&scenario_path)?;
    let mut network = Network::new(&scenario, &config).context("Invalid MAC configuration")?;
    let report = network.run();

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
