use std::io::{BufRead, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use simplelog::LevelFilter;

use multipmt_bench::clock::SystemClock;
use multipmt_bench::config::ServerConfig;
use multipmt_bench::daq::AcquisitionKind;
use multipmt_bench::hv::ChannelConfig;
use multipmt_bench::instruments::InstrumentManager;
use multipmt_bench::protocol::ChannelSelection;
use multipmt_bench::server::{ControlServer, GainCurve, PolarizerScan, SpeRun, WheelScan};

#[derive(Debug, Parser)]
#[command(
    name = "multipmt-server",
    about = "Control interface for the multiPMTs",
    long_about = "Control interface for the multiPMTs. This build ships no filter wheel or polarizer drivers: \
                  wheels and polarizer only log a warning, and the optical scans (polarizer_acq, spe_acq, gain_acq, \
                  wheels_char) are refused."
)]
struct Args {
    /// YAML configuration file, defaults are used when absent
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(long, default_value_t = LevelFilter::Info)]
    log_level: LevelFilter,
}

/// One operator line
#[derive(Debug, Parser)]
#[command(name = "", no_binary_name = true)]
struct Line {
    #[command(subcommand)]
    command: Operator,
}

#[derive(Debug, Subcommand)]
#[command(rename_all = "snake_case")]
enum Operator {
    /// Wait for num_clients multiPMTs and shake hands with each of them
    Connect { num_clients: usize, batch: u32 },
    /// Power everything off, send the clients back to their handshake and exit
    Quit,
    /// Move the filter wheels, skipped when no wheels are attached
    Wheels { near_wheel_pos: u32, far_wheel_pos: u32 },
    /// Move the polarizer, skipped when no polarizer is attached
    Polarizer { pol_pos: f64 },
    /// Write a run control register on every client
    Write { address: u16, value: u32 },
    Read { address: u16 },
    SetInitConf {
        channels: ChannelSelection,
        #[arg(long)]
        port: Option<String>,
        #[arg(long, default_value_t = 800)]
        voltage_set: u16,
        #[arg(long, default_value_t = 100)]
        threshold_set: u16,
        #[arg(long, default_value_t = 2)]
        limit_trip_time: u16,
        #[arg(long, default_value_t = 100)]
        limit_voltage: u16,
        #[arg(long, default_value_t = 5)]
        limit_current: u16,
        #[arg(long, default_value_t = 50)]
        limit_temperature: u16,
        #[arg(long, default_value_t = 25)]
        rate_up: u16,
        #[arg(long, default_value_t = 25)]
        rate_down: u16,
    },
    SetVoltage {
        channels: ChannelSelection,
        voltage_set: u16,
        #[arg(long)]
        port: Option<String>,
    },
    On {
        channels: ChannelSelection,
        #[arg(long)]
        port: Option<String>,
    },
    Off {
        channels: ChannelSelection,
        #[arg(long)]
        port: Option<String>,
    },
    HvCalibration {
        channels: ChannelSelection,
        #[arg(long)]
        port: Option<String>,
    },
    Monitor {
        channels: ChannelSelection,
        #[arg(long)]
        port: Option<String>,
    },
    /// Acquire the charges from the channels that are on
    Acquire {
        suffix: String,
        flag: AcquisitionKind,
        run_id: String,
        #[arg(long, default_value_t = 20)]
        timer: u64,
    },
    /// One acquisition per polarizer angle, needs the wheels and the polarizer
    PolarizerAcq {
        start_angle: u32,
        step_angle: u32,
        period_angle: u32,
        near_w: u32,
        far_w: u32,
        voltage_ch: u16,
        timer_acq: u64,
        run_id: String,
    },
    Pedestal,
    /// Single photoelectron spectrum, needs the wheels and the polarizer
    SpeAcq {
        pol_angle: f64,
        near_w: u32,
        far_w: u32,
        voltage_ch: u16,
        timer_acq: u64,
        run_id: String,
    },
    /// One acquisition per voltage, needs the wheels and the polarizer
    GainAcq {
        pol_angle: f64,
        near_w: u32,
        far_w: u32,
        voltage_start: u16,
        voltage_end: u16,
        voltage_step: u16,
        timer_acq: u64,
        run_id: String,
    },
    /// One acquisition per wheel combination, needs the wheels and the polarizer
    WheelsChar {
        pol_angle: f64,
        near_start: u32,
        far_start: u32,
        voltage_channels: u16,
        timer_acq: u64,
        run_id: String,
    },
}

fn execute(server: &mut ControlServer, command: Operator, default_port: &str) {
    let port = |port: Option<String>| port.unwrap_or_else(|| default_port.to_string());
    match command {
        Operator::Connect { num_clients, batch } => {
            server.connect(num_clients, batch);
        }
        Operator::Quit => (),
        Operator::Wheels { near_wheel_pos, far_wheel_pos } => {
            server.init_wheels(near_wheel_pos, far_wheel_pos);
        }
        Operator::Polarizer { pol_pos } => {
            server.init_polarizer(pol_pos);
        }
        Operator::Write { address, value } => {
            server.rc_write(address, value);
        }
        Operator::Read { address } => {
            server.rc_read(address);
        }
        Operator::SetInitConf {
            channels,
            port: p,
            voltage_set,
            threshold_set,
            limit_trip_time,
            limit_voltage,
            limit_current,
            limit_temperature,
            rate_up,
            rate_down,
        } => {
            let config = ChannelConfig {
                voltage_set: Some(voltage_set),
                threshold_set: Some(threshold_set),
                limit_trip_time: Some(limit_trip_time),
                limit_voltage: Some(limit_voltage),
                limit_current: Some(limit_current),
                limit_temperature: Some(limit_temperature),
                rate_up: Some(rate_up),
                rate_down: Some(rate_down),
            };
            server.set_init_configuration(&port(p), channels, &config);
        }
        Operator::SetVoltage { channels, voltage_set, port: p } => {
            server.set_voltage(&port(p), channels, voltage_set);
        }
        Operator::On { channels, port: p } => {
            let done = server.power_on(&port(p), channels);
            log::info!("Power on {}", if done { "completed" } else { "failed on some channels" });
        }
        Operator::Off { channels, port: p } => {
            let done = server.power_off(&port(p), channels);
            log::info!("Power off {}", if done { "completed" } else { "failed on some channels" });
        }
        Operator::HvCalibration { channels, port: p } => {
            let done = server.hv_calibration(&port(p), channels);
            log::info!("HV calibration {}", if done { "completed" } else { "failed on some channels" });
        }
        Operator::Monitor { channels, port: p } => {
            for (client, states) in server.monitor(&port(p), channels) {
                for state in states {
                    log::info!(
                        "{} ch {}: {} V={:.3} I={:.3} T={:.3} Vset={} alarm={}",
                        client,
                        state.channel,
                        state.status,
                        state.voltage,
                        state.current,
                        state.temperature,
                        state.voltage_set,
                        state.alarm
                    );
                }
            }
        }
        Operator::Acquire { suffix, flag, run_id, timer } => {
            if let Err(e) = server.acquire(&suffix, flag, Some(&run_id), Some(timer)) {
                log::error!("Acquisition failed: {}", e);
            }
        }
        Operator::PolarizerAcq { start_angle, step_angle, period_angle, near_w, far_w, voltage_ch, timer_acq, run_id } => {
            let scan = PolarizerScan {
                start_angle,
                step: step_angle,
                amplitude: period_angle,
                near_wheel: near_w,
                far_wheel: far_w,
                voltage: voltage_ch,
                timer: timer_acq,
                run_id,
            };
            let runs = server.polarizer_scan(&scan);
            log::info!("Polarizer calibration done, {} acquisitions stored", runs.len());
        }
        Operator::Pedestal => {
            if let Err(e) = server.pedestal() {
                log::error!("Pedestal acquisition failed: {}", e);
            }
        }
        Operator::SpeAcq { pol_angle, near_w, far_w, voltage_ch, timer_acq, run_id } => {
            let spe = SpeRun {
                polarizer_angle: pol_angle,
                near_wheel: near_w,
                far_wheel: far_w,
                voltage: voltage_ch,
                timer: timer_acq,
                run_id,
            };
            let runs = server.spe(&spe);
            log::info!("SPE measurement done, {} acquisitions stored", runs.len());
        }
        Operator::GainAcq { pol_angle, near_w, far_w, voltage_start, voltage_end, voltage_step, timer_acq, run_id } => {
            let curve = GainCurve {
                polarizer_angle: pol_angle,
                near_wheel: near_w,
                far_wheel: far_w,
                voltage_start,
                voltage_end,
                voltage_step,
                timer: timer_acq,
                run_id,
            };
            let runs = server.gain_curve(&curve);
            log::info!("Gain measurement done, {} acquisitions stored", runs.len());
        }
        Operator::WheelsChar { pol_angle, near_start, far_start, voltage_channels, timer_acq, run_id } => {
            let scan = WheelScan {
                polarizer_angle: pol_angle,
                near_start,
                far_start,
                voltage: voltage_channels,
                timer: timer_acq,
                run_id,
            };
            let runs = server.wheel_characterisation(&scan);
            log::info!("Wheels characterisation done, {} acquisitions stored", runs.len());
        }
    }
}

fn main() {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => match ServerConfig::read_config_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Could not load the configuration: {}", e);
                return;
            }
        },
        None => ServerConfig::default(),
    };
    if let Err(e) = multipmt_bench::init_logging(args.log_level, config.log_file.as_deref()) {
        eprintln!("Could not start logging: {}", e);
        return;
    }

    log::info!("Starting up the multiPMT control server...");
    let context = zmq::Context::new();
    let default_port = config.hv_port.clone();
    let instruments = InstrumentManager::new();
    if !instruments.optics_attached() {
        log::warn!("No optical instruments attached, the optical scans are unavailable in this session");
    }
    let mut server = match ControlServer::bind(&context, instruments, SystemClock::shared(), config) {
        Ok(server) => server,
        Err(e) => {
            log::error!("An error was encountered starting the server: {} Shutting down.", e);
            return;
        }
    };

    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("MultiPMT> ");
        let _ = std::io::stdout().flush();
        let line = match lines.next() {
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                log::error!("Could not read the command line: {}", e);
                break;
            }
            None => break,
        };
        let words: Vec<&str> = line.split_whitespace().collect();
        if words.is_empty() {
            continue;
        }
        match Line::try_parse_from(words) {
            Ok(Line { command: Operator::Quit }) => break,
            Ok(Line { command }) => execute(&mut server, command, &default_port),
            Err(e) => {
                let _ = e.print();
            }
        }
    }

    log::info!("Quit command received. Shutting down...");
    if !server.shutdown() {
        log::warn!("Not every client acknowledged the exit");
    }
}
