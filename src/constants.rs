use std::time::Duration;

//Handshake tokens
pub const TOKEN_PING: &[u8] = b"Ping";
pub const TOKEN_ALIVE: &[u8] = b"Alive";
pub const TOKEN_CONNECTED: &[u8] = b"Connection successful";
pub const TOKEN_INIT: &[u8] = b"EV";
pub const TOKEN_READY: &[u8] = b"EV Success";

//Network defaults
pub const DEFAULT_CONTROL_PORT: u16 = 8001;
pub const DEFAULT_DAQ_PORT: u16 = 5555;
pub const DEFAULT_CLIENT_ID: &str = "Client";
pub const DEFAULT_HV_PORT: &str = "/dev/ttyPS1";
pub const MAX_RETRIES: u32 = 3;
pub const HANDSHAKE_POLL_TIMEOUT: Duration = Duration::from_millis(20_000);
pub const READY_TIMEOUT_FACTOR: u32 = 30; //HV ramp up is slow
pub const PING_INTERVAL: Duration = Duration::from_secs(6);
pub const DAQ_POLL_TIMEOUT: Duration = Duration::from_secs(5);

//HV channels
pub const MIN_CHANNEL: i64 = 1;
pub const MAX_CHANNEL: i64 = 20;
pub const ALL_CHANNELS: std::ops::RangeInclusive<u8> = 1..=7;
pub const PROBE_ATTEMPTS: u32 = 3;
pub const HV_BAUD_RATE: u32 = 115_200;
pub const HV_SERIAL_TIMEOUT: Duration = Duration::from_millis(500);

//HV timings
pub const SETTLE_DELAY: Duration = Duration::from_millis(200);
pub const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const CALIBRATION_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const CALIBRATION_LEVELING_DELAY: Duration = Duration::from_secs(2);
pub const CALIBRATION_SAMPLE_INTERVAL: Duration = Duration::from_millis(500);
pub const CALIBRATION_SAMPLES: usize = 10;
pub const CALIBRATION_RAMP_RATE: u16 = 25;
pub const CALIBRATION_IDLE_VOLTAGE: u16 = 10;
pub const CALIBRATION_TARGETS: [u16; 16] = [
    25, 50, 100, 200, 300, 400, 500, 600, 700, 800, 900, 1000, 1100, 1200, 1300, 1400,
];

//Fixed point encodings of the calibration registers
pub const CALIB_LINEAR_SCALE: f64 = 10_000.0;
pub const CALIB_DISCRIMINATOR_SCALE: f64 = 1.6890722;

//DMA event stream
pub const WORDS_PER_GROUP: usize = 8;
pub const PAYLOAD_BITS: usize = 96;
pub const INTEGRITY_CHANNELS: usize = 7;
pub const INTEGRITY_MIN_CHANNELS: usize = 4;
pub const INTEGRITY_ENERGY_THRESHOLD: f64 = 1000.0;
pub const CSV_HEADER: [&str; 8] = [
    "Channel",
    "Unix_time_16_bit",
    "Coarse_time",
    "TDC_time",
    "ToT_time",
    "TDC_trigger_end",
    "Energy",
    "CRC",
];

//Run control registers used by the procedures
pub const RC_BOOT_0: u16 = 0;
pub const RC_BOOT_1: u16 = 1;
pub const RC_PEDESTAL: u16 = 12;
pub const RC_LIGHT_MODE: u16 = 15;
pub const RC_LIGHT_WIDTH: u16 = 16;
pub const RC_LIGHT_PERIOD: u16 = 18;
pub const RC_DMA_ENABLE: u16 = 19;
pub const DMA_ENABLE_MASK: u32 = 127;
pub const MIN_ACQUISITION_SECONDS: u64 = 10;

//Client bring-up
pub const DEFAULT_SERVER_ADDRESS: &str = "172.16.24.107";
pub const COMMAND_POLL_TIMEOUT: Duration = Duration::from_millis(100);
pub const RC_WRITE_DELAY: Duration = Duration::from_millis(100);
pub const BRING_UP_RC_WRITES: [(u16, u32); 6] = [(1, 127), (0, 127), (10, 65), (19, 0), (15, 0), (16, 0)];
pub const DEFAULT_RC_DEVICE: &str = "/dev/uio0";
pub const DEFAULT_RC_SPAN: usize = 0x1000;
pub const HELPER_COMMAND: &str = "/root/evproducer.sh";
pub const HELPER_STOP_COMMAND: [&str; 2] = ["killall", "evproducer"];
pub const HELPER_GRACE_PERIOD: Duration = Duration::from_secs(2);

//Server procedures
pub const DEFAULT_STORAGE_ROOT: &str = "/swgo/multiPMT/calibration";
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60); //calibration sweeps take long
pub const STEP_DELAY: Duration = Duration::from_millis(100);
pub const HELPER_SETTLE_DELAY: Duration = Duration::from_secs(2);
pub const INTEGRITY_DURATION: Duration = Duration::from_secs(60);
pub const POST_INTEGRITY_DELAY: Duration = Duration::from_secs(2);
pub const FIFO_FLUSH_DURATION: Duration = Duration::from_secs(30);
pub const PRE_RUN_DELAY: Duration = Duration::from_secs(3);
pub const PEDESTAL_SECONDS: u64 = 120;
pub const PEDESTAL_VOLTAGE: u16 = 1200;
pub const LIGHT_SOURCE_ON: [(u16, u32); 3] = [(RC_LIGHT_MODE, 2), (RC_LIGHT_PERIOD, 7250), (RC_LIGHT_WIDTH, 400)];
pub const WHEEL_POSITIONS_END: u32 = 13;
