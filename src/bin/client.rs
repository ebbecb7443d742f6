use std::path::PathBuf;

use clap::Parser;
use simplelog::LevelFilter;

use multipmt_bench::client::ControlClient;
use multipmt_bench::clock::SystemClock;
use multipmt_bench::config::ClientConfig;
use multipmt_bench::interpreter::{BringUpPlan, BusOpener, Interpreter};
use multipmt_bench::modbus::{ModbusRtu, RegisterTransport};
use multipmt_bench::run_control::MmapRunControl;

#[derive(Debug, Parser)]
#[command(name = "multipmt-client", about = "Embedded client of a multiPMT")]
struct Args {
    /// YAML configuration file, defaults are used when absent
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(long, default_value_t = LevelFilter::Info)]
    log_level: LevelFilter,
}

fn main() {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => match ClientConfig::read_config_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Could not load the configuration: {}", e);
                return;
            }
        },
        None => ClientConfig::default(),
    };
    if let Err(e) = multipmt_bench::init_logging(args.log_level, config.log_file.as_deref()) {
        eprintln!("Could not start logging: {}", e);
        return;
    }

    log::info!("Starting up the multiPMT client {}...", config.identity);
    let run_control = match MmapRunControl::open(&config.rc_device, config.rc_base, config.rc_span) {
        Ok(rc) => rc,
        Err(e) => {
            log::error!("Could not map the run control registers: {} Shutting down.", e);
            return;
        }
    };

    let baud_rate = config.hv_baud_rate;
    let timeout = config.hv_timeout();
    let opener: BusOpener = Box::new(move |port: &str| {
        let bus = ModbusRtu::open(port, baud_rate, timeout)?;
        Ok(Box::new(bus) as Box<dyn RegisterTransport>)
    });

    let clock = SystemClock::shared();
    let interpreter = Interpreter::new(opener, Box::new(run_control), BringUpPlan::from(&config), clock.clone());
    let context = zmq::Context::new();
    ControlClient::new(config, interpreter, clock).run(&context);
}
