//! WiMAX cell simulation

use anyhow::{Context, Result};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use wimax_core::{MacAddress, SimTime};
use wimax_mac::{BaseStationMac, UplinkSchedulerType};
use wimax_sim::channel::Channel;
use wimax_sim::scenarios::{self, ScenarioReport};
use wimax_sim::{ScenarioConfig, SimulationPresets};

/// Hex of the leading map burst of a fresh cell's first frame.
fn first_map_burst(config: &ScenarioConfig) -> Option<String> {
    let mut bs = BaseStationMac::new(MacAddress::from_index(0), config.mac.clone());
    let mut channel = Channel::ideal();
    bs.start_frame(SimTime::ZERO, &config.phy, &mut channel);
    let (burst, _) = channel.take_bursts().into_iter().next()?;
    Some(hex::encode(&burst[..burst.len().min(64)]))
}

fn load_config(path: &str) -> Result<ScenarioConfig> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path))
}

fn print_report(report: &ScenarioReport) {
    let status = if report.provisioned {
        "provisioned".green()
    } else {
        "NOT provisioned".red()
    };
    println!(
        "{} {} ({} of {} stations registered after {:.0} ms)",
        ">>>".bright_green(),
        report.name.bold(),
        report.registered,
        report.stations,
        report.provisioning_ms,
    );
    println!("Cell: {}, {} frames", status, report.frames);
    println!(
        "{:>3} {:>4} {:>6} {:>5} {:>9} {:>9} {:>7} {:>6} {:>10}",
        "ss", "dir", "class", "sfid", "offered", "delivered", "refused", "queued", "kbps"
    );
    for flow in &report.flows {
        println!(
            "{:>3} {:>4} {:>6} {:>5} {:>9} {:>9} {:>7} {:>6} {:>10.1}",
            flow.station,
            format!("{:?}", flow.direction),
            format!("{:?}", flow.scheduling_type),
            flow.sfid.map_or("-".to_string(), |s| s.to_string()),
            flow.offered_bytes,
            flow.delivered_bytes,
            flow.rejected_packets,
            flow.queued_packets,
            flow.throughput_kbps,
        );
    }
    println!(
        "Delivered {:.1}% of offered bytes; downlink {} bursts ({} lost), uplink {} bursts ({} lost)",
        report.delivery_ratio() * 100.0,
        report.downlink.bursts_sent,
        report.downlink.bursts_dropped,
        report.uplink.bursts_sent,
        report.uplink.bursts_dropped,
    );
    println!("{}", "-".repeat(72));
}

async fn compare_uplink_schedulers(config: ScenarioConfig) -> Result<Vec<ScenarioReport>> {
    let schedulers = [
        UplinkSchedulerType::Simple,
        UplinkSchedulerType::Rtps,
        UplinkSchedulerType::Mbqos,
    ];
    let progress = ProgressBar::new(schedulers.len() as u64);
    progress.set_style(
        ProgressStyle::with_template("{spinner} [{bar:30}] {pos}/{len} {msg}")?.progress_chars("=> "),
    );

    let handles: Vec<_> = schedulers
        .into_iter()
        .map(|scheduler| {
            let mut config = config.clone();
            config.mac.ul_scheduler = scheduler;
            tokio::task::spawn_blocking(move || scenarios::uplink_scenario(&config))
        })
        .collect();

    let mut reports = Vec::with_capacity(handles.len());
    for handle in handles {
        let report = handle.await??;
        progress.set_message(report.name.clone());
        progress.inc(1);
        reports.push(report);
    }
    progress.finish_and_clear();
    Ok(reports)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args: Vec<String> = std::env::args().skip(1).collect();
    let json = args.iter().any(|arg| arg == "--json");
    let custom = match args.iter().position(|arg| arg == "--config") {
        Some(i) => {
            let path = args.get(i + 1).context("--config needs a path")?;
            Some(load_config(path)?)
        }
        None => None,
    };

    println!("{}", "WiMAX MAC Simulation".bright_blue().bold());
    println!("{}", "====================".bright_blue());
    println!();

    let mut reports = Vec::new();

    let test_cells = match custom {
        Some(config) => vec![("Configured cell", config)],
        None => vec![
            ("Small cell", SimulationPresets::small_cell()),
            ("Busy cell", SimulationPresets::busy_cell()),
            ("Cell edge", SimulationPresets::cell_edge()),
        ],
    };
    if let Some((_, config)) = test_cells.first() {
        if let Some(dump) = first_map_burst(config) {
            println!("First frame DL-MAP burst: {}..", dump.dimmed());
        }
    }
    for (name, config) in test_cells {
        println!(
            "{}",
            format!(
                "\n>>> {}: {} stations at {:?}",
                name, config.stations, config.modulation
            )
            .bright_green()
            .bold()
        );
        let report = tokio::task::spawn_blocking(move || scenarios::rtps_downlink_scenario(&config)).await??;
        print_report(&report);
        reports.push(report);
    }

    let lossy = SimulationPresets::lossy_cell();
    println!(
        "{}",
        format!(
            "\n>>> Lossy cell: {:.0}% burst loss",
            lossy.packet_loss * 100.0
        )
        .bright_red()
        .bold()
    );
    let report = tokio::task::spawn_blocking(move || scenarios::rtps_downlink_scenario(&lossy)).await??;
    print_report(&report);
    reports.push(report);

    println!("{}", "\n>>> Uplink scheduler comparison".bright_yellow().bold());
    for report in compare_uplink_schedulers(SimulationPresets::busy_cell()).await? {
        print_report(&report);
        reports.push(report);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    }

    println!("\n{}", "All simulations complete!".bright_green().bold());
    Ok(())
}
