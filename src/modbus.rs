use std::io::{Read, Write};
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use crc::{Crc, CRC_16_MODBUS};
use serialport::SerialPort;

use super::error::HardwareError;

const READ_HOLDING_REGISTERS: u8 = 0x03;
const WRITE_SINGLE_COIL: u8 = 0x05;
const WRITE_SINGLE_REGISTER: u8 = 0x06;
const EXCEPTION_FLAG: u8 = 0x80;
const COIL_ON: u16 = 0xFF00;
const COIL_OFF: u16 = 0x0000;
const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// # RegisterTransport
/// Register level access to the devices on a serial bus. The HV boards and (optionally) the run control
/// are only ever touched through these primitives.
pub trait RegisterTransport {
    fn read_registers(&mut self, unit: u8, address: u16, count: u16) -> Result<Vec<u16>, HardwareError>;
    fn write_register(&mut self, unit: u8, address: u16, value: u16) -> Result<(), HardwareError>;
    fn write_coil(&mut self, unit: u8, address: u16, on: bool) -> Result<(), HardwareError>;

    fn read_register(&mut self, unit: u8, address: u16) -> Result<u16, HardwareError> {
        self.read_registers(unit, address, 1)?
            .first()
            .copied()
            .ok_or(HardwareError::BadResponse(unit))
    }
}

/// CRC-16/MODBUS, transmitted low byte first
pub fn crc16(data: &[u8]) -> u16 {
    MODBUS_CRC.checksum(data)
}

fn build_request(unit: u8, function: u8, first: u16, second: u16) -> Result<Vec<u8>, HardwareError> {
    let mut frame: Vec<u8> = Vec::with_capacity(8);
    frame.push(unit);
    frame.push(function);
    frame.write_u16::<BigEndian>(first)?;
    frame.write_u16::<BigEndian>(second)?;
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    Ok(frame)
}

fn check_crc(unit: u8, frame: &[u8]) -> Result<(), HardwareError> {
    if frame.len() < 3 {
        return Err(HardwareError::BadResponse(unit));
    }
    let (body, tail) = frame.split_at(frame.len() - 2);
    if crc16(body).to_le_bytes() != [tail[0], tail[1]] {
        return Err(HardwareError::BadCrc(unit));
    }
    Ok(())
}

/// # ModbusRtu
/// Modbus RTU master over a serial line (8N1). Generic over the port so the framing can be exercised
/// without hardware.
pub struct ModbusRtu<P> {
    port: P,
    name: String,
}

impl ModbusRtu<Box<dyn SerialPort>> {
    /// Open the serial device at path
    pub fn open(path: &str, baud_rate: u32, timeout: Duration) -> Result<Self, HardwareError> {
        let port = serialport::new(path, baud_rate).timeout(timeout).open()?;
        log::debug!("Opened serial port {} at {} baud", path, baud_rate);
        Ok(Self::with_port(port, path))
    }
}

impl<P: Read + Write> ModbusRtu<P> {
    pub fn with_port(port: P, name: &str) -> Self {
        Self { port, name: name.to_string() }
    }

    fn read_exact(&mut self, unit: u8, buffer: &mut [u8]) -> Result<(), HardwareError> {
        match self.port.read_exact(buffer) {
            Ok(()) => Ok(()),
            Err(e) => match e.kind() {
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::UnexpectedEof => {
                    log::debug!("Unit {} did not answer on {}", unit, self.name);
                    Err(HardwareError::NoResponse(unit))
                }
                _ => Err(HardwareError::IOError(e)),
            },
        }
    }

    /// Send one request and return the response bytes between the function code and the CRC
    fn transact(&mut self, unit: u8, function: u8, request: &[u8]) -> Result<Vec<u8>, HardwareError> {
        self.port.write_all(request)?;
        self.port.flush()?;

        let mut head = [0u8; 2];
        self.read_exact(unit, &mut head)?;
        if head[0] != unit {
            return Err(HardwareError::BadResponse(unit));
        }
        let mut frame = head.to_vec();

        if head[1] == function | EXCEPTION_FLAG {
            let mut rest = [0u8; 3];
            self.read_exact(unit, &mut rest)?;
            frame.extend_from_slice(&rest);
            check_crc(unit, &frame)?;
            return Err(HardwareError::Exception { unit, function, code: rest[0] });
        }
        if head[1] != function {
            return Err(HardwareError::BadResponse(unit));
        }

        let body_len = if function == READ_HOLDING_REGISTERS {
            let mut count = [0u8; 1];
            self.read_exact(unit, &mut count)?;
            frame.push(count[0]);
            count[0] as usize
        } else {
            4 //echo of address and value
        };
        let mut rest = vec![0u8; body_len + 2];
        self.read_exact(unit, &mut rest)?;
        frame.extend_from_slice(&rest);
        check_crc(unit, &frame)?;

        Ok(frame[2..frame.len() - 2].to_vec())
    }
}

impl<P: Read + Write> RegisterTransport for ModbusRtu<P> {
    fn read_registers(&mut self, unit: u8, address: u16, count: u16) -> Result<Vec<u16>, HardwareError> {
        let request = build_request(unit, READ_HOLDING_REGISTERS, address, count)?;
        let body = self.transact(unit, READ_HOLDING_REGISTERS, &request)?;
        let byte_count = body[0] as usize;
        if byte_count != 2 * count as usize || body.len() != byte_count + 1 {
            return Err(HardwareError::BadResponse(unit));
        }
        Ok(body[1..].chunks_exact(2).map(BigEndian::read_u16).collect())
    }

    fn write_register(&mut self, unit: u8, address: u16, value: u16) -> Result<(), HardwareError> {
        let request = build_request(unit, WRITE_SINGLE_REGISTER, address, value)?;
        self.transact(unit, WRITE_SINGLE_REGISTER, &request)?;
        Ok(())
    }

    fn write_coil(&mut self, unit: u8, address: u16, on: bool) -> Result<(), HardwareError> {
        let value = if on { COIL_ON } else { COIL_OFF };
        let request = build_request(unit, WRITE_SINGLE_COIL, address, value)?;
        self.transact(unit, WRITE_SINGLE_COIL, &request)?;
        Ok(())
    }
}
