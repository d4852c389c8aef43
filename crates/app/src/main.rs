use clap::Parser;
use std::path::PathBuf;

use td_output::file::FileSink;
use td_protocol::decoder::Decoder;

/// Fixed RX/TX sample rate of the interrogation cycle, in S/s.
const SAMPLE_RATE: u64 = 3_000_000;
/// Receive gather window per interrogation, in microseconds.
const INTERVAL_LEN_US: u64 = 580;

#[derive(Parser, Debug)]
#[command(name = "tolld")]
#[command(about = "915 MHz toll transponder interrogator daemon")]
struct Cli {
    /// USRP device ID to use
    #[arg(short = 'd', long, default_value = "")]
    device: String,

    /// Center frequency in Hz
    #[arg(short = 'c', long, default_value_t = 915_750_000)]
    center: u64,

    /// Transmit gain in dB
    #[arg(short = 'T', long, default_value_t = 75.0)]
    tx_gain: f64,

    /// Transmit port on the USRP
    #[arg(short = 't', long, default_value = "A:A")]
    tx_port: String,

    /// Transmit antenna on the specified TX port
    #[arg(short = 'A', long, default_value = "TX/RX")]
    tx_ant: String,

    /// Receive gain in dB
    #[arg(short = 'R', long, default_value_t = 75.0)]
    rx_gain: f64,

    /// Receive port on the USRP
    #[arg(short = 'r', long, default_value = "A:A")]
    rx_port: String,

    /// Receive antenna on the specified RX port
    #[arg(short = 'a', long, default_value = "RX2")]
    rx_ant: String,

    /// Length of the activation pulse, in microseconds
    #[arg(short = 'P', long, default_value_t = 20)]
    pulse_len: u64,

    /// Pulse interval, in milliseconds
    #[arg(short = 'p', long, default_value_t = 25)]
    pulse_spacing: u64,

    /// Maximum stale pass age, in seconds
    #[arg(short = 'm', long, default_value_t = 30)]
    max_age: u64,

    /// Use the GPS PPS source and synchronize local time
    #[arg(long)]
    gps_pps: bool,

    /// Output file receiving one JSON record per decoded pass
    output_file: PathBuf,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    eprintln!("tolld: the toll transponder interrogator daemon\n");

    if let Err(e) = run(&cli) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<(), String> {
    let spacing_us = cli.pulse_spacing * 1000;
    let max_age_us = cli.max_age * 1_000_000;

    log::info!("writing to output file [{}]", cli.output_file.display());
    log::info!(
        "activation pulse length: {} us, spacing: {} us",
        cli.pulse_len,
        spacing_us
    );
    log::info!("maximum pass age: {} us", max_age_us);
    log::info!("center frequency: {:.3} MHz", cli.center as f64 / 1e6);
    log::info!(
        "RX port: {} antenna: {} gain: {} dB",
        cli.rx_port,
        cli.rx_ant,
        cli.rx_gain
    );
    log::info!(
        "TX port: {} antenna: {} gain: {} dB",
        cli.tx_port,
        cli.tx_ant,
        cli.tx_gain
    );

    let sink = FileSink::open(&cli.output_file)?;
    let decoder = Decoder::new(cli.center, SAMPLE_RATE, INTERVAL_LEN_US, max_age_us, sink)?;

    trigger_loop(cli, decoder)
}

#[cfg(feature = "uhd")]
fn trigger_loop(cli: &Cli, mut decoder: Decoder<FileSink>) -> Result<(), String> {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use td_sdr::usrp::UsrpInterrogator;
    use td_sdr::{Interrogator, RadioConfig};

    let config = RadioConfig {
        device: cli.device.clone(),
        center_freq: cli.center,
        tx_port: cli.tx_port.clone(),
        rx_port: cli.rx_port.clone(),
        tx_ant: cli.tx_ant.clone(),
        rx_ant: cli.rx_ant.clone(),
        sample_rate: SAMPLE_RATE,
        tx_gain: cli.tx_gain,
        rx_gain: cli.rx_gain,
        interval_len_us: INTERVAL_LEN_US,
        activation_len_us: cli.pulse_len,
        use_gps_pps: cli.gps_pps,
    };
    let mut radio = UsrpInterrogator::open(&config)?;

    log::info!("letting the radio settle...");
    std::thread::sleep(std::time::Duration::from_millis(100));

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        eprintln!("\ninterrupted, stopping...");
        r.store(false, Ordering::SeqCst);
    })
    .map_err(|e| format!("failed to install signal handler: {}", e))?;

    log::info!("starting the trigger loop");

    let spacing_us = cli.pulse_spacing * 1000;
    let mut wallclock = 0;
    while running.load(Ordering::SeqCst) {
        wallclock = radio.arm_and_fire(decoder.input_buffer(), spacing_us)?;
        decoder.process_capture(wallclock)?;
    }

    log::info!("shutting down at wallclock {:.6}", wallclock as f64 / 1e6);
    Ok(())
}

#[cfg(not(feature = "uhd"))]
fn trigger_loop(_cli: &Cli, _decoder: Decoder<FileSink>) -> Result<(), String> {
    Err("this build has no radio backend; rebuild with --features uhd".to_string())
}
