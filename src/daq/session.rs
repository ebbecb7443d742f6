use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::clock::SharedClock;
use crate::constants::*;
use crate::error::AcquisitionError;
use crate::transport::{DaqConnector, FrameSource};

use super::event::EventDecoder;
use super::storage::{file_name, run_folder, AcquisitionKind, EventWriter};

/// Parameters of one timed capture
#[derive(Debug, Clone, PartialEq)]
pub struct RunRequest {
    pub duration: Option<Duration>,
    pub suffix: String,
    pub kind: AcquisitionKind,
    pub run_id: Option<String>,
    pub batch: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub path: PathBuf,
    pub events: u64,
    pub dropped: u64,
    pub bytes: u64,
}

/// Per channel mean energy seen during a signal integrity check
#[derive(Debug, Clone, PartialEq)]
pub struct IntegrityReport {
    pub means: Vec<f64>,
}

impl IntegrityReport {
    pub fn passing_channels(&self) -> usize {
        self.means.iter().filter(|mean| **mean > INTEGRITY_ENERGY_THRESHOLD).count()
    }

    pub fn passed(&self) -> bool {
        self.passing_channels() >= INTEGRITY_MIN_CHANNELS
    }
}

/// # AcquisitionSession
/// Reads the DMA stream pushed by the acquisition helpers. Each operation opens its own data path
/// and releases it when it returns, on success or error.
pub struct AcquisitionSession<'a> {
    connector: &'a mut dyn DaqConnector,
    clock: SharedClock,
    poll_timeout: Duration,
    storage_root: PathBuf,
}

impl<'a> AcquisitionSession<'a> {
    pub fn new(connector: &'a mut dyn DaqConnector, clock: SharedClock, poll_timeout: Duration, storage_root: &Path) -> Self {
        Self { connector, clock, poll_timeout, storage_root: storage_root.to_path_buf() }
    }

    /// Receive messages until duration elapses (forever when None), handing every data frame to on_frame
    fn drain(
        &mut self,
        duration: Option<Duration>,
        mut on_frame: impl FnMut(&[u8]) -> Result<(), AcquisitionError>,
    ) -> Result<(), AcquisitionError> {
        let mut source: Box<dyn FrameSource> = self.connector.connect()?;
        let start = self.clock.now();
        loop {
            let elapsed = self.clock.elapsed_since(start);
            let timeout = match duration {
                Some(limit) if elapsed >= limit => break,
                Some(limit) => self.poll_timeout.min(limit - elapsed),
                None => self.poll_timeout,
            };
            match source.recv_frames(timeout) {
                Ok(Some(frames)) => {
                    for frame in frames {
                        on_frame(&frame)?;
                    }
                }
                Ok(None) => log::debug!("No message received in {:?}. Continuing...", timeout),
                Err(e) => {
                    log::error!("Failed to receive messages: {}", e);
                    return Err(AcquisitionError::from(e));
                }
            }
        }
        Ok(())
    }

    /// Collect energies of channels 0-6 for duration and check that enough of them carry signal
    pub fn signal_integrity(&mut self, duration: Duration) -> Result<IntegrityReport, AcquisitionError> {
        log::info!("Checking signal integrity for {:?}", duration);
        let mut sums = vec![(0.0f64, 0u64); INTEGRITY_CHANNELS];
        let mut decoder = EventDecoder::new();
        self.drain(Some(duration), |frame| {
            decoder.decode_part(frame, |record| {
                if let Some((sum, count)) = sums.get_mut(record.channel as usize) {
                    *sum += record.energy as f64;
                    *count += 1;
                }
                Ok::<(), AcquisitionError>(())
            })
        })?;

        let means = sums
            .iter()
            .map(|(sum, count)| if *count > 0 { sum / *count as f64 } else { 0.0 })
            .collect();
        let report = IntegrityReport { means };
        log::info!("Integrity check decoded {} events", decoder.decoded());
        if report.passed() {
            log::info!("Signal integrity check PASSED: {} channels have mean energy > {}", report.passing_channels(), INTEGRITY_ENERGY_THRESHOLD);
        } else {
            log::warn!("Signal integrity check FAILED: only {} channels have mean energy > {}", report.passing_channels(), INTEGRITY_ENERGY_THRESHOLD);
        }
        Ok(report)
    }

    /// Throw away whatever is buffered for duration, without decoding
    pub fn flush_fifo(&mut self, duration: Duration) -> Result<u64, AcquisitionError> {
        log::info!("Emptying the FIFO for {:?}", duration);
        let mut discarded = 0u64;
        self.drain(Some(duration), |frame| {
            discarded += frame.len() as u64;
            Ok(())
        })?;
        log::info!("Discarded {}", human_bytes::human_bytes(discarded as f64));
        Ok(discarded)
    }

    /// Decode the stream into a new CSV file until the duration elapses
    pub fn run(&mut self, request: &RunRequest) -> Result<RunSummary, AcquisitionError> {
        let now = chrono::Local::now().naive_local();
        let folder = run_folder(&self.storage_root, request.batch, &request.kind, request.run_id.as_deref(), now.date());
        let mut writer = EventWriter::create(&folder, &file_name(now, &request.suffix))?;
        let mut decoder = EventDecoder::new();

        log::info!("Starting the communication with the DMA");
        self.drain(request.duration, |frame| {
            decoder.decode_part(frame, |record| {
                writer.write(&record)?;
                writer.flush()?;
                Ok::<(), AcquisitionError>(())
            })
        })?;

        let path = writer.path().to_path_buf();
        let events = writer.rows();
        let bytes = writer.finish()?;
        log::info!(
            "Run finished: {} events ({} dropped), {} written to {}",
            events,
            decoder.dropped(),
            human_bytes::human_bytes(bytes as f64),
            path.display()
        );
        Ok(RunSummary { path, events, dropped: decoder.dropped(), bytes })
    }
}
