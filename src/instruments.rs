use crate::error::InstrumentError;

/// # OpticalInstrument
/// A motorised optical element of the bench (filter wheel or polarizer stage). Drivers live outside
/// of this crate and are attached to the InstrumentManager at startup.
pub trait OpticalInstrument {
    fn port(&self) -> &str;
    /// Identification and current position, for the log
    fn info(&mut self) -> Result<String, InstrumentError>;
    /// Move to position and wait until the move is done. Not moving is fine if already there.
    fn go_to(&mut self, position: f64) -> Result<(), InstrumentError>;
    fn close(&mut self);
}

fn position(instrument: &mut dyn OpticalInstrument, name: &str, target: f64) -> Result<(), InstrumentError> {
    let info = instrument.info()?;
    log::info!("{} on {}: {}", name, instrument.port(), info);
    instrument.go_to(target)?;
    log::info!("{} moved to position {}", name, target);
    Ok(())
}

/// # InstrumentManager
/// Holds the near wheel, the far wheel and the polarizer. Moving an instrument that is not attached
/// is skipped with a warning; the optical procedures of the server refuse to start without all three.
#[derive(Default)]
pub struct InstrumentManager {
    near_wheel: Option<Box<dyn OpticalInstrument>>,
    far_wheel: Option<Box<dyn OpticalInstrument>>,
    polarizer: Option<Box<dyn OpticalInstrument>>,
}

impl InstrumentManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach_wheels(&mut self, near: Box<dyn OpticalInstrument>, far: Box<dyn OpticalInstrument>) {
        self.near_wheel = Some(near);
        self.far_wheel = Some(far);
    }

    pub fn attach_polarizer(&mut self, polarizer: Box<dyn OpticalInstrument>) {
        self.polarizer = Some(polarizer);
    }

    pub fn optics_attached(&self) -> bool {
        self.near_wheel.is_some() && self.far_wheel.is_some() && self.polarizer.is_some()
    }

    /// Move both wheels. On a failure both wheels are released.
    pub fn init_wheels(&mut self, near_position: u32, far_position: u32) -> bool {
        let (near, far) = match (self.near_wheel.as_mut(), self.far_wheel.as_mut()) {
            (Some(near), Some(far)) => (near, far),
            _ => {
                log::warn!("Filter wheels not attached, skipping positions {} / {}", near_position, far_position);
                return false;
            }
        };
        let result = position(near.as_mut(), "Near wheel", near_position as f64)
            .and_then(|_| position(far.as_mut(), "Far wheel", far_position as f64));
        match result {
            Ok(()) => true,
            Err(e) => {
                log::error!("Error during wheel initialization: {}", e);
                near.close();
                far.close();
                false
            }
        }
    }

    pub fn init_polarizer(&mut self, target: f64) -> bool {
        let polarizer = match self.polarizer.as_mut() {
            Some(polarizer) => polarizer,
            None => {
                log::warn!("Polarizer not attached, skipping position {}", target);
                return false;
            }
        };
        match position(polarizer.as_mut(), "Polarizer", target) {
            Ok(()) => true,
            Err(e) => {
                log::error!("Error during polarizer initialization: {}", e);
                polarizer.close();
                false
            }
        }
    }

    pub fn close_all(&mut self) {
        for instrument in [&mut self.near_wheel, &mut self.far_wheel, &mut self.polarizer].into_iter().flatten() {
            instrument.close();
        }
    }
}
