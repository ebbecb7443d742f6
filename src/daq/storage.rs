use std::convert::Infallible;
use std::fmt::Display;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime};

use crate::constants::CSV_HEADER;
use crate::error::StorageError;

use super::event::EventRecord;

/// The kind of measurement an acquisition belongs to, decides the folder it is stored in
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquisitionKind {
    Polarizer,
    Pedestal,
    Spe,
    Gain,
    WheelsChar,
    FiberChar,
    Other(String),
}

impl AcquisitionKind {
    pub fn folder(&self) -> &'static str {
        match self {
            Self::Polarizer => "polarizer_calibration",
            Self::Pedestal => "pedestal_characterisation",
            Self::Spe => "single_photoelectron",
            Self::Gain => "gain_curve",
            Self::WheelsChar => "wheels_characterisation",
            Self::FiberChar => "fiber_characterisation",
            Self::Other(_) => "unknown",
        }
    }
}

impl FromStr for AcquisitionKind {
    type Err = Infallible;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "polarizer" => Self::Polarizer,
            "pedestal" => Self::Pedestal,
            "spe" => Self::Spe,
            "gain" => Self::Gain,
            "wheels_char" => Self::WheelsChar,
            "fiber_char" => Self::FiberChar,
            other => Self::Other(other.to_string()),
        })
    }
}

impl Display for AcquisitionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let flag = match self {
            Self::Polarizer => "polarizer",
            Self::Pedestal => "pedestal",
            Self::Spe => "spe",
            Self::Gain => "gain",
            Self::WheelsChar => "wheels_char",
            Self::FiberChar => "fiber_char",
            Self::Other(other) => other,
        };
        write!(f, "{}", flag)
    }
}

/// Folder of a run: <root>/batch_<b>/<kind folder>/<YYYY_MM_DD>/(run_<id> | acq_<N>).
/// Without a run id the first acq_N that does not exist yet is taken.
pub fn run_folder(root: &Path, batch: u32, kind: &AcquisitionKind, run_id: Option<&str>, date: NaiveDate) -> PathBuf {
    let base = root
        .join(format!("batch_{}", batch))
        .join(kind.folder())
        .join(date.format("%Y_%m_%d").to_string());
    match run_id {
        Some(id) => base.join(format!("run_{}", id)),
        None => {
            let mut index = 1;
            loop {
                let candidate = base.join(format!("acq_{}", index));
                if !candidate.exists() {
                    return candidate;
                }
                index += 1;
            }
        }
    }
}

pub fn file_name(stamp: NaiveDateTime, suffix: &str) -> String {
    format!("daq_{}_{}.csv", stamp.format("%Y_%m_%d_%H_%M"), suffix)
}

/// Never overwrite: name.csv, name_1.csv, name_2.csv ...
pub fn unique_path(folder: &Path, name: &str) -> PathBuf {
    let candidate = folder.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let stem = Path::new(name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    let extension = Path::new(name)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let mut index = 1;
    loop {
        let candidate = folder.join(format!("{}_{}{}", stem, index, extension));
        if !candidate.exists() {
            return candidate;
        }
        index += 1;
    }
}

/// # EventWriter
/// CSV output of one run. The header is written on creation; rows are buffered until flush.
pub struct EventWriter {
    writer: csv::Writer<File>,
    path: PathBuf,
    rows: u64,
}

impl EventWriter {
    /// Create the run folder if needed and open a fresh file in it
    pub fn create(folder: &Path, name: &str) -> Result<Self, StorageError> {
        std::fs::create_dir_all(folder)?;
        let path = unique_path(folder, name);
        let file = File::create(&path)?;
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        writer.write_record(CSV_HEADER)?;
        log::info!("Writing events to {}", path.display());
        Ok(Self { writer, path, rows: 0 })
    }

    pub fn write(&mut self, record: &EventRecord) -> Result<(), StorageError> {
        self.writer.write_record(record.to_row())?;
        self.rows += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), StorageError> {
        self.writer.flush()?;
        Ok(())
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush and close, returning the size of the file
    pub fn finish(mut self) -> Result<u64, StorageError> {
        self.writer.flush()?;
        Ok(std::fs::metadata(&self.path)?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 7).unwrap()
    }

    #[test]
    fn folders_follow_the_naming_contract() {
        let root = tempfile::tempdir().unwrap();
        let kind: AcquisitionKind = "gain".parse().unwrap();
        let run = run_folder(root.path(), 2, &kind, Some("gain"), date());
        assert_eq!(run, root.path().join("batch_2/gain_curve/2025_03_07/run_gain"));

        let odd: AcquisitionKind = "laser".parse().unwrap();
        let first = run_folder(root.path(), 2, &odd, None, date());
        assert_eq!(first, root.path().join("batch_2/unknown/2025_03_07/acq_1"));
        std::fs::create_dir_all(&first).unwrap();
        let second = run_folder(root.path(), 2, &odd, None, date());
        assert_eq!(second, root.path().join("batch_2/unknown/2025_03_07/acq_2"));
    }

    #[test]
    fn existing_files_get_numeric_suffixes() {
        let root = tempfile::tempdir().unwrap();
        let stamp = date().and_hms_opt(14, 5, 0).unwrap();
        let name = file_name(stamp, "1200");
        assert_eq!(name, "daq_2025_03_07_14_05_1200.csv");

        let first = EventWriter::create(root.path(), &name).unwrap();
        assert_eq!(first.path(), root.path().join(&name));
        first.finish().unwrap();
        let second = EventWriter::create(root.path(), &name).unwrap();
        assert_eq!(second.path(), root.path().join("daq_2025_03_07_14_05_1200_1.csv"));
        second.finish().unwrap();
        assert_eq!(unique_path(root.path(), &name), root.path().join("daq_2025_03_07_14_05_1200_2.csv"));
    }

    #[test]
    fn header_then_rows() {
        let root = tempfile::tempdir().unwrap();
        let mut writer = EventWriter::create(&root.path().join("run"), "daq.csv").unwrap();
        writer.write(&EventRecord { channel: 5, energy: 1500, ..Default::default() }).unwrap();
        writer.flush().unwrap();
        assert_eq!(writer.rows(), 1);
        let path = writer.path().to_path_buf();
        let size = writer.finish().unwrap();

        let text = std::fs::read_to_string(path).unwrap();
        assert_eq!(
            text,
            "Channel,Unix_time_16_bit,Coarse_time,TDC_time,ToT_time,TDC_trigger_end,Energy,CRC\n5,0,0,0,0,0,1500,0\n"
        );
        assert_eq!(size, text.len() as u64);
    }
}
