//! Modbus RTU register transport over a serial port.
//!
//! Protocol: RS-485 multidrop bus, binary frames protected by CRC-16/MODBUS
//! (polynomial 0xA001 reflected, init 0xFFFF, transmitted low byte first).
//!
//! Only the three transactions the acquisition core needs are implemented:
//!
//! | Function | Request | Normal response |
//! |----------|---------|-----------------|
//! | 0x03 read holding register | `addr 03 reg_hi reg_lo 00 01 crc_lo crc_hi` | `addr 03 02 hi lo crc_lo crc_hi` |
//! | 0x04 read input register | `addr 04 reg_hi reg_lo 00 01 crc_lo crc_hi` | `addr 04 02 hi lo crc_lo crc_hi` |
//! | 0x06 write single register | `addr 06 reg_hi reg_lo val_hi val_lo crc_lo crc_hi` | echo of the request |
//!
//! An exception response is `addr (fn | 0x80) code crc_lo crc_hi`.

use crate::config::{LinkSettings, Parity};
use crate::transport::{FrameError, RegisterKind, RegisterTransport, TransportError};
use crc::{Crc, CRC_16_MODBUS};
use serialport::{ClearBuffer, DataBits, SerialPort, StopBits};
use std::io::{ErrorKind, Read, Write};
use tracing::{debug, instrument, trace};

const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Read holding registers.
pub const FN_READ_HOLDING: u8 = 0x03;
/// Read input registers.
pub const FN_READ_INPUT: u8 = 0x04;
/// Write single register.
pub const FN_WRITE_SINGLE: u8 = 0x06;

const EXCEPTION_FLAG: u8 = 0x80;
const EXCEPTION_FRAME_LEN: usize = 5;
const READ_RESPONSE_LEN: usize = 7;
const WRITE_RESPONSE_LEN: usize = 8;

/// CRC-16/MODBUS of `data`.
pub fn crc16(data: &[u8]) -> u16 {
    MODBUS_CRC.checksum(data)
}

fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

fn verify_crc(frame: &[u8]) -> Result<(), FrameError> {
    let (body, tail) = frame.split_at(frame.len() - 2);
    let expected = crc16(body);
    let actual = u16::from_le_bytes([tail[0], tail[1]]);
    if expected == actual {
        Ok(())
    } else {
        Err(FrameError::CrcMismatch { expected, actual })
    }
}

/// Function code used for reads from the given register bank.
pub fn read_function(kind: RegisterKind) -> u8 {
    match kind {
        RegisterKind::Holding => FN_READ_HOLDING,
        RegisterKind::Input => FN_READ_INPUT,
    }
}

/// Build a single-register read request.
pub fn encode_read_request(device: u8, function: u8, register: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8);
    frame.push(device);
    frame.push(function);
    frame.extend_from_slice(&register.to_be_bytes());
    frame.extend_from_slice(&1u16.to_be_bytes());
    append_crc(&mut frame);
    frame
}

/// Build a single-register write request.
pub fn encode_write_request(device: u8, register: u16, value: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8);
    frame.push(device);
    frame.push(FN_WRITE_SINGLE);
    frame.extend_from_slice(&register.to_be_bytes());
    frame.extend_from_slice(&value.to_be_bytes());
    append_crc(&mut frame);
    frame
}

/// Extract the register value from a complete read response.
pub fn decode_read_response(frame: &[u8]) -> Result<u16, FrameError> {
    if frame.len() != READ_RESPONSE_LEN {
        return Err(FrameError::UnexpectedResponse(format!(
            "read response has {} bytes, expected {READ_RESPONSE_LEN}",
            frame.len()
        )));
    }
    if frame[2] != 2 {
        return Err(FrameError::UnexpectedResponse(format!(
            "byte count {} for a single register",
            frame[2]
        )));
    }
    Ok(u16::from_be_bytes([frame[3], frame[4]]))
}

fn read_exact_frame<P: Read + ?Sized>(port: &mut P, buf: &mut [u8]) -> Result<(), FrameError> {
    port.read_exact(buf).map_err(|err| match err.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock => FrameError::Timeout,
        _ => FrameError::Io(err),
    })
}

/// Send `request` and read back a response of `expected_len` bytes.
///
/// The response is checked for CRC, device address and function code. An exception
/// response is detected after its fifth byte and returned as [`FrameError::Exception`].
pub fn transact<P: Read + Write + ?Sized>(
    port: &mut P,
    request: &[u8],
    expected_len: usize,
) -> Result<Vec<u8>, FrameError> {
    trace!(request = ?request, "Sending RTU frame");
    port.write_all(request)?;
    port.flush()?;

    let mut response = vec![0u8; expected_len.max(EXCEPTION_FRAME_LEN)];
    read_exact_frame(port, &mut response[..EXCEPTION_FRAME_LEN])?;

    let device = request[0];
    let function = request[1];
    if response[0] != device {
        return Err(FrameError::UnexpectedResponse(format!(
            "answer from device {} to a request for device {device}",
            response[0]
        )));
    }

    if response[1] == function | EXCEPTION_FLAG {
        verify_crc(&response[..EXCEPTION_FRAME_LEN])?;
        return Err(FrameError::Exception {
            function,
            code: response[2],
        });
    }
    if response[1] != function {
        return Err(FrameError::UnexpectedResponse(format!(
            "function {:#04x} in answer to {function:#04x}",
            response[1]
        )));
    }

    read_exact_frame(port, &mut response[EXCEPTION_FRAME_LEN..expected_len])?;
    response.truncate(expected_len);
    verify_crc(&response)?;
    trace!(response = ?response, "Received RTU frame");
    Ok(response)
}

/// Modbus RTU transport on a local serial port.
pub struct RtuTransport {
    link: LinkSettings,
    port: Option<Box<dyn SerialPort>>,
}

impl RtuTransport {
    /// Create a closed transport for the given link parameters.
    pub fn new(link: LinkSettings) -> Self {
        Self { link, port: None }
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn SerialPort>, TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::NotConnected)?;
        // Drop whatever a previous timed-out transaction left behind.
        if let Err(err) = port.clear(ClearBuffer::Input) {
            debug!(error = %err, "Failed to clear input buffer");
        }
        Ok(port)
    }
}

fn data_bits(bits: u8) -> DataBits {
    match bits {
        5 => DataBits::Five,
        6 => DataBits::Six,
        7 => DataBits::Seven,
        _ => DataBits::Eight,
    }
}

fn parity(parity: Parity) -> serialport::Parity {
    match parity {
        Parity::None => serialport::Parity::None,
        Parity::Odd => serialport::Parity::Odd,
        Parity::Even => serialport::Parity::Even,
    }
}

fn stop_bits(bits: u8) -> StopBits {
    if bits == 2 {
        StopBits::Two
    } else {
        StopBits::One
    }
}

impl RegisterTransport for RtuTransport {
    #[instrument(skip(self), fields(port = %self.link.port))]
    fn open(&mut self) -> Result<(), TransportError> {
        if self.port.is_some() {
            return Ok(());
        }
        let port = serialport::new(&self.link.port, self.link.baud_rate)
            .data_bits(data_bits(self.link.data_bits))
            .parity(parity(self.link.parity))
            .stop_bits(stop_bits(self.link.stop_bits))
            .timeout(self.link.timeout())
            .open()
            .map_err(|err| TransportError::Link {
                port: self.link.port.clone(),
                reason: err.to_string(),
            })?;
        debug!(baud = self.link.baud_rate, "Serial link opened");
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if self.port.take().is_some() {
            debug!(port = %self.link.port, "Serial link closed");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn read_register(&mut self, device: u8, register: u16) -> Result<u16, TransportError> {
        let request = encode_read_request(device, read_function(self.link.register_kind), register);
        let port = self.port_mut()?;
        transact(port.as_mut(), &request, READ_RESPONSE_LEN)
            .and_then(|frame| decode_read_response(&frame))
            .map_err(|source| TransportError::Read {
                device,
                register,
                source,
            })
    }

    fn write_register(
        &mut self,
        device: u8,
        register: u16,
        value: u16,
    ) -> Result<(), TransportError> {
        let request = encode_write_request(device, register, value);
        let port = self.port_mut()?;
        let echo = transact(port.as_mut(), &request, WRITE_RESPONSE_LEN).map_err(|source| {
            TransportError::Write {
                device,
                register,
                source,
            }
        })?;
        if echo != request {
            return Err(TransportError::Write {
                device,
                register,
                source: FrameError::UnexpectedResponse("write echo differs from request".into()),
            });
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("{}@{}", self.link.port, self.link.baud_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// In-memory stand-in for a serial port: records writes, replays a canned answer.
    struct LoopbackPort {
        written: Vec<u8>,
        answer: Cursor<Vec<u8>>,
        time_out_when_empty: bool,
    }

    impl LoopbackPort {
        fn answering(answer: Vec<u8>) -> Self {
            Self {
                written: Vec::new(),
                answer: Cursor::new(answer),
                time_out_when_empty: true,
            }
        }
    }

    impl Read for LoopbackPort {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = self.answer.read(buf)?;
            if n == 0 && self.time_out_when_empty {
                return Err(std::io::Error::new(ErrorKind::TimedOut, "timed out"));
            }
            Ok(n)
        }
    }

    impl Write for LoopbackPort {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn with_crc(mut body: Vec<u8>) -> Vec<u8> {
        append_crc(&mut body);
        body
    }

    #[test]
    fn crc_matches_reference_vector() {
        // 01 03 00 00 00 01 -> 84 0A on the wire
        let frame = encode_read_request(0x01, FN_READ_HOLDING, 0x0000);
        assert_eq!(frame, vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A]);
    }

    #[test]
    fn input_bank_uses_function_four() {
        assert_eq!(read_function(RegisterKind::Input), FN_READ_INPUT);
        let frame = encode_read_request(0x02, read_function(RegisterKind::Input), 0x1000);
        assert_eq!(&frame[..6], &[0x02, 0x04, 0x10, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn reads_register_value() {
        let mut port = LoopbackPort::answering(with_crc(vec![0x01, 0x03, 0x02, 0xFF, 0x38]));
        let request = encode_read_request(0x01, FN_READ_HOLDING, 0x1000);
        let frame = transact(&mut port, &request, READ_RESPONSE_LEN).unwrap();
        assert_eq!(decode_read_response(&frame).unwrap(), 0xFF38);
        assert_eq!(port.written, request);
    }

    #[test]
    fn detects_exception_response() {
        let mut port = LoopbackPort::answering(with_crc(vec![0x01, 0x83, 0x02]));
        let request = encode_read_request(0x01, FN_READ_HOLDING, 0x9999);
        let err = transact(&mut port, &request, READ_RESPONSE_LEN).unwrap_err();
        assert!(matches!(
            err,
            FrameError::Exception {
                function: 0x03,
                code: 0x02
            }
        ));
    }

    #[test]
    fn rejects_corrupted_frame() {
        let mut answer = with_crc(vec![0x01, 0x03, 0x02, 0x00, 0x64]);
        answer[4] ^= 0x01;
        let mut port = LoopbackPort::answering(answer);
        let request = encode_read_request(0x01, FN_READ_HOLDING, 0x1000);
        let err = transact(&mut port, &request, READ_RESPONSE_LEN).unwrap_err();
        assert!(matches!(err, FrameError::CrcMismatch { .. }));
    }

    #[test]
    fn short_answer_times_out() {
        let mut port = LoopbackPort::answering(vec![0x01, 0x03, 0x02]);
        let request = encode_read_request(0x01, FN_READ_HOLDING, 0x1000);
        let err = transact(&mut port, &request, READ_RESPONSE_LEN).unwrap_err();
        assert!(matches!(err, FrameError::Timeout));
    }

    #[test]
    fn answer_from_wrong_device_is_rejected() {
        let mut port = LoopbackPort::answering(with_crc(vec![0x07, 0x03, 0x02, 0x00, 0x01]));
        let request = encode_read_request(0x01, FN_READ_HOLDING, 0x1000);
        let err = transact(&mut port, &request, READ_RESPONSE_LEN).unwrap_err();
        assert!(matches!(err, FrameError::UnexpectedResponse(_)));
    }

    #[test]
    fn write_is_echoed() {
        let request = encode_write_request(0x03, 0x0500, 1200);
        let mut port = LoopbackPort::answering(request.clone());
        let echo = transact(&mut port, &request, WRITE_RESPONSE_LEN).unwrap();
        assert_eq!(echo, request);
    }

    #[test]
    fn closed_transport_reports_not_connected() {
        let link = LinkSettings {
            port: "/dev/null-port".into(),
            baud_rate: 9600,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: 1,
            register_kind: RegisterKind::Holding,
            timeout_ms: 100,
        };
        let mut transport = RtuTransport::new(link);
        assert!(!transport.is_open());
        assert!(matches!(
            transport.read_register(1, 0x1000),
            Err(TransportError::NotConnected)
        ));
        assert_eq!(transport.describe(), "/dev/null-port@9600");
    }
}
