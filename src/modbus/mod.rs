//!
//! Modbus/TCP slave serving the process image.
//!
//! The engine decodes one application data unit at a time, maps the request
//! onto the image address spaces (coils and discrete inputs onto the bit
//! tables, holding and input registers onto row 0 of the INT tables) and
//! frames the reply in-place. The TCP front-end lives in [`server`].
use crate::image::{Family, IoCell, ProcessImage, IMAGE_DIM};

/// The TCP front-end
pub mod server;

/// Maximum Modbus application data unit size
pub const ADU_SIZE: usize = 260;

/// Flattened single-bit address space served over the protocol
const BIT_SPACE: u32 = (IMAGE_DIM * IMAGE_DIM) as u32;
/// Flattened 16-bit register address space served over the protocol
const REGISTER_SPACE: u32 = IMAGE_DIM as u32;

/// The supported function codes
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum FunctionCode {
    /// FC 1, read output bits
    ReadCoils = 1,
    /// FC 2, read input bits
    ReadDiscreteInputs = 2,
    /// FC 3, read output registers
    ReadHoldingRegisters = 3,
    /// FC 4, read input registers
    ReadInputRegisters = 4,
    /// FC 5, write one output bit
    WriteCoil = 5,
    /// FC 6, write one output register
    WriteRegister = 6,
    /// FC 15, write a run of output bits
    WriteMultipleCoils = 15,
    /// FC 16, write a run of output registers
    WriteMultipleRegisters = 16,
    /// Anything else
    Error = 255,
}

impl FunctionCode {
    fn from_byte(fc: u8) -> Self {
        match fc {
            1 => FunctionCode::ReadCoils,
            2 => FunctionCode::ReadDiscreteInputs,
            3 => FunctionCode::ReadHoldingRegisters,
            4 => FunctionCode::ReadInputRegisters,
            5 => FunctionCode::WriteCoil,
            6 => FunctionCode::WriteRegister,
            15 => FunctionCode::WriteMultipleCoils,
            16 => FunctionCode::WriteMultipleRegisters,
            _ => FunctionCode::Error,
        }
    }
    /// True for the write function codes
    pub fn is_write(self) -> bool {
        matches!(
            self,
            FunctionCode::WriteCoil
                | FunctionCode::WriteRegister
                | FunctionCode::WriteMultipleCoils
                | FunctionCode::WriteMultipleRegisters
        )
    }
}

/// Modbus exception codes returned to the client
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum ExceptionCode {
    /// The function code is not supported
    IllegalFunction = 1,
    /// A requested address is outside the served space
    IllegalDataAddress = 2,
    /// A count/value field does not fit the ADU
    IllegalDataValue = 3,
    /// The slave failed while processing
    SlaveFailure = 4,
    /// The slave cannot accept the request now
    SlaveBusy = 6,
}

type HandlerResult = std::result::Result<(), ExceptionCode>;

/// One request/response exchange.
///
/// The ADU is processed in-place: handlers overwrite the buffer with the
/// reply, reusing the MBAP transaction and unit ids the client sent.
pub struct Transaction {
    adu: [u8; ADU_SIZE],
    fc: FunctionCode,
    exception: Option<ExceptionCode>,
    reply_len: usize,
}

impl Transaction {
    /// Copies the received ADU (truncated to [`ADU_SIZE`]) and tags the
    /// function code
    pub fn new(request: &[u8]) -> Self {
        let mut adu = [0u8; ADU_SIZE];
        let len = request.len().min(ADU_SIZE);
        adu[..len].copy_from_slice(&request[..len]);
        Self {
            fc: FunctionCode::from_byte(adu[7]),
            adu,
            exception: None,
            reply_len: 0,
        }
    }
    /// The function code of the request
    pub fn function_code(&self) -> FunctionCode {
        self.fc
    }
    /// The exception raised while processing, if any
    pub fn exception(&self) -> Option<ExceptionCode> {
        self.exception
    }
    /// Processes the request against the image. The image lock MUST be held
    /// by the caller for the whole call.
    pub fn run(&mut self, image: &ProcessImage) {
        let result = match self.fc {
            FunctionCode::ReadCoils => self.read_bits(image, Family::Output),
            FunctionCode::ReadDiscreteInputs => self.read_bits(image, Family::Input),
            FunctionCode::ReadHoldingRegisters => self.read_registers(image, Family::Output),
            FunctionCode::ReadInputRegisters => self.read_registers(image, Family::Input),
            FunctionCode::WriteCoil => self.write_coil(image),
            FunctionCode::WriteRegister => self.write_register(image),
            FunctionCode::WriteMultipleCoils => self.write_multiple_coils(image),
            FunctionCode::WriteMultipleRegisters => self.write_multiple_registers(image),
            FunctionCode::Error => Err(ExceptionCode::IllegalFunction),
        };
        if let Err(code) = result {
            self.exception = Some(code);
            self.exception_reply(code);
        }
    }
    /// The framed reply, valid after [`Transaction::run()`]
    pub fn reply(&self) -> &[u8] {
        &self.adu[..self.reply_len]
    }

    fn be_word(&self, at: usize) -> u16 {
        u16::from(self.adu[at]) << 8 | u16::from(self.adu[at + 1])
    }
    fn set_header_length(&mut self, len: u8) {
        self.adu[4] = 0;
        self.adu[5] = len;
    }

    fn read_bits(&mut self, image: &ProcessImage, family: Family) -> HandlerResult {
        let start = u32::from(self.be_word(8));
        let count = u32::from(self.be_word(10));
        let bytes = ((count + 7) / 8) as usize;
        if bytes + 9 > ADU_SIZE {
            return Err(ExceptionCode::IllegalDataValue);
        }
        self.set_header_length(bytes as u8 + 3);
        self.adu[8] = bytes as u8;
        for k in 0..bytes * 8 {
            let addr = start + k as u32;
            if addr >= BIT_SPACE {
                return Err(ExceptionCode::IllegalDataAddress);
            }
            let bit = image.bit_cell(family, addr).map_or(false, IoCell::get);
            let byte = &mut self.adu[9 + k / 8];
            if bit {
                *byte |= 1 << (k % 8);
            } else {
                *byte &= !(1 << (k % 8));
            }
        }
        self.reply_len = bytes + 9;
        Ok(())
    }

    fn read_registers(&mut self, image: &ProcessImage, family: Family) -> HandlerResult {
        let start = u32::from(self.be_word(8));
        let count = u32::from(self.be_word(10));
        let bytes = count as usize * 2;
        if bytes + 9 > ADU_SIZE {
            return Err(ExceptionCode::IllegalDataValue);
        }
        self.set_header_length(bytes as u8 + 3);
        self.adu[8] = bytes as u8;
        for i in 0..count as usize {
            let addr = start + i as u32;
            if addr >= REGISTER_SPACE {
                return Err(ExceptionCode::IllegalDataAddress);
            }
            let value = image
                .register_cell(family, addr)
                .map_or(0, IoCell::get) as u16;
            self.adu[9 + 2 * i] = (value >> 8) as u8;
            self.adu[10 + 2 * i] = (value & 0xff) as u8;
        }
        self.reply_len = bytes + 9;
        Ok(())
    }

    fn write_coil(&mut self, image: &ProcessImage) -> HandlerResult {
        let addr = u32::from(self.be_word(8));
        if addr >= BIT_SPACE {
            return Err(ExceptionCode::IllegalDataAddress);
        }
        let value = self.be_word(10) != 0;
        if let Some(cell) = image.bit_cell(Family::Output, addr) {
            cell.set(value);
        }
        self.set_header_length(6);
        self.reply_len = 12;
        Ok(())
    }

    fn write_register(&mut self, image: &ProcessImage) -> HandlerResult {
        let addr = u32::from(self.be_word(8));
        let value = self.be_word(10) as i16;
        if let Some(cell) = image.register_cell(Family::Output, addr) {
            cell.set(value);
        }
        self.set_header_length(6);
        self.reply_len = 12;
        Ok(())
    }

    fn write_multiple_coils(&mut self, image: &ProcessImage) -> HandlerResult {
        let start = u32::from(self.be_word(8));
        let count = u32::from(self.be_word(10));
        let bytes = ((count + 7) / 8) as usize;
        if 13 + bytes > ADU_SIZE {
            return Err(ExceptionCode::IllegalDataValue);
        }
        for k in 0..bytes * 8 {
            let addr = start + k as u32;
            if addr >= BIT_SPACE {
                continue;
            }
            let bit = self.adu[13 + k / 8] >> (k % 8) & 1 == 1;
            if let Some(cell) = image.bit_cell(Family::Output, addr) {
                cell.set(bit);
            }
        }
        self.set_header_length(6);
        self.reply_len = 12;
        Ok(())
    }

    fn write_multiple_registers(&mut self, image: &ProcessImage) -> HandlerResult {
        let start = u32::from(self.be_word(8));
        let count = u32::from(self.be_word(10));
        if 13 + count as usize * 2 > ADU_SIZE {
            return Err(ExceptionCode::IllegalDataValue);
        }
        for i in 0..count as usize {
            let addr = start + i as u32;
            if addr >= REGISTER_SPACE {
                return Err(ExceptionCode::IllegalDataAddress);
            }
            let value = self.be_word(13 + 2 * i) as i16;
            if let Some(cell) = image.register_cell(Family::Output, addr) {
                cell.set(value);
            }
        }
        self.set_header_length(6);
        self.reply_len = 12;
        Ok(())
    }

    fn exception_reply(&mut self, code: ExceptionCode) {
        self.adu[7] |= 0x80;
        self.adu[8] = code as u8;
        self.set_header_length(3);
        self.reply_len = 9;
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::{ExceptionCode, Transaction};
    use crate::image::{Family, IoCell, ProcessImage};

    fn adu(tid: u16, uid: u8, pdu: &[u8]) -> Vec<u8> {
        let mut request = Vec::with_capacity(7 + pdu.len());
        request.extend(tid.to_be_bytes());
        request.extend([0, 0]);
        request.extend((pdu.len() as u16 + 1).to_be_bytes());
        request.push(uid);
        request.extend(pdu);
        request
    }

    fn process(image: &ProcessImage, request: &[u8]) -> Transaction {
        let mut txn = Transaction::new(request);
        txn.run(image);
        txn
    }

    #[test]
    fn test_read_coils_all_unmapped() {
        let image = ProcessImage::new();
        let txn = process(&image, &adu(1, 1, &[1, 0x00, 0x00, 0x00, 0x08]));
        insta::assert_snapshot!(
            format!("{:02x?}", txn.reply()),
            @"[00, 01, 00, 00, 00, 04, 01, 01, 01, 00]"
        );
    }

    #[test]
    fn test_read_coils_with_set_bits() {
        let mut image = ProcessImage::new();
        for addr in [2usize, 5] {
            image
                .bind(Family::Output, 0, addr, Arc::new(IoCell::new(true)))
                .unwrap();
        }
        let txn = process(&image, &adu(1, 1, &[1, 0x00, 0x00, 0x00, 0x08]));
        assert_eq!(txn.reply().len(), 10);
        assert_eq!(txn.reply()[9], 0x24);
    }

    #[test]
    fn test_read_discrete_inputs_family() {
        let mut image = ProcessImage::new();
        image
            .bind(Family::Input, 0, 0, Arc::new(IoCell::new(true)))
            .unwrap();
        let txn = process(&image, &adu(9, 1, &[2, 0x00, 0x00, 0x00, 0x01]));
        assert_eq!(txn.reply()[9], 0x01);
        // the output family is not visible through FC 2
        let txn = process(&image, &adu(9, 1, &[1, 0x00, 0x00, 0x00, 0x01]));
        assert_eq!(txn.reply()[9], 0x00);
    }

    #[test]
    fn test_write_coil_on() {
        let mut image = ProcessImage::new();
        let cell = Arc::new(IoCell::new(false));
        image.bind(Family::Output, 0, 3, cell.clone()).unwrap();
        let request = adu(2, 1, &[5, 0x00, 0x03, 0xff, 0x00]);
        let txn = process(&image, &request);
        assert!(cell.get());
        assert_eq!(txn.reply(), &request[..]);
        assert_eq!(txn.reply().len(), 12);
    }

    #[test]
    fn test_write_coil_off_and_unmapped() {
        let mut image = ProcessImage::new();
        let cell = Arc::new(IoCell::new(true));
        image.bind(Family::Output, 0, 3, cell.clone()).unwrap();
        let txn = process(&image, &adu(2, 1, &[5, 0x00, 0x03, 0x00, 0x00]));
        assert!(!cell.get());
        assert!(txn.exception().is_none());
        // unmapped address: the write is discarded, the reply still echoes
        let txn = process(&image, &adu(3, 1, &[5, 0x00, 0x63, 0xff, 0x00]));
        assert!(txn.exception().is_none());
        assert_eq!(txn.reply().len(), 12);
    }

    #[test]
    fn test_unknown_function_code() {
        let image = ProcessImage::new();
        let txn = process(&image, &adu(1, 1, &[7, 0x00, 0x00, 0x00, 0x01]));
        assert_eq!(txn.exception(), Some(ExceptionCode::IllegalFunction));
        let reply = txn.reply();
        assert_eq!(reply.len(), 9);
        assert_eq!(reply[7], 0x87);
        assert_eq!(reply[8], 0x01);
        assert_eq!(u16::from_be_bytes([reply[4], reply[5]]), 3);
    }

    #[test]
    fn test_read_holding_registers() {
        let mut image = ProcessImage::new();
        let cell = Arc::new(IoCell::new(0x0102i16));
        image.bind(Family::Output, 0, 1, cell).unwrap();
        let txn = process(&image, &adu(5, 1, &[3, 0x00, 0x00, 0x00, 0x02]));
        let reply = txn.reply();
        assert_eq!(reply.len(), 13);
        assert_eq!(reply[8], 4);
        assert_eq!(&reply[9..13], &[0x00, 0x00, 0x01, 0x02]);
    }

    #[test]
    fn test_read_holding_registers_address_overflow() {
        let image = ProcessImage::new();
        let txn = process(&image, &adu(1, 1, &[3, 0x00, 0x63, 0x00, 0x02]));
        assert_eq!(txn.exception(), Some(ExceptionCode::IllegalDataAddress));
        let reply = txn.reply();
        assert_eq!(reply.len(), 9);
        assert_eq!(reply[7], 0x83);
        assert_eq!(reply[8], 0x02);
    }

    #[test]
    fn test_read_input_registers_unmapped_as_zero() {
        let image = ProcessImage::new();
        let txn = process(&image, &adu(1, 1, &[4, 0x00, 0x10, 0x00, 0x01]));
        assert_eq!(&txn.reply()[9..11], &[0x00, 0x00]);
    }

    #[test]
    fn test_write_register_roundtrip() {
        let mut image = ProcessImage::new();
        let cell = Arc::new(IoCell::new(0i16));
        image.bind(Family::Output, 0, 7, cell.clone()).unwrap();
        let txn = process(&image, &adu(4, 1, &[6, 0x00, 0x07, 0x12, 0x34]));
        assert_eq!(cell.get(), 0x1234);
        assert_eq!(txn.reply().len(), 12);
        // out-of-row addresses are unmapped, not errors
        let txn = process(&image, &adu(4, 1, &[6, 0x01, 0x00, 0x12, 0x34]));
        assert!(txn.exception().is_none());
    }

    #[test]
    fn test_write_multiple_coils_across_byte_boundary() {
        let mut image = ProcessImage::new();
        let cells: Vec<_> = (0..10)
            .map(|minor| {
                let cell = Arc::new(IoCell::new(false));
                image
                    .bind(Family::Output, minor / 8, minor % 8, cell.clone())
                    .unwrap();
                cell
            })
            .collect();
        // 10 coils from address 0: 0b0110010111, data bytes 0x97, 0x01
        let txn = process(
            &image,
            &adu(6, 1, &[15, 0x00, 0x00, 0x00, 0x0a, 0x02, 0x97, 0x01]),
        );
        assert!(txn.exception().is_none());
        assert_eq!(txn.reply().len(), 12);
        assert_eq!(u16::from_be_bytes([txn.reply()[4], txn.reply()[5]]), 6);
        let pattern: Vec<bool> = cells.iter().map(|c| c.get()).collect();
        assert_eq!(
            pattern,
            [true, true, true, false, true, false, false, true, true, false]
        );
    }

    #[test]
    fn test_write_multiple_registers() {
        let mut image = ProcessImage::new();
        let first = Arc::new(IoCell::new(0i16));
        let second = Arc::new(IoCell::new(0i16));
        image.bind(Family::Output, 0, 10, first.clone()).unwrap();
        image.bind(Family::Output, 0, 11, second.clone()).unwrap();
        let txn = process(
            &image,
            &adu(
                7,
                1,
                &[16, 0x00, 0x0a, 0x00, 0x02, 0x04, 0x00, 0x01, 0xff, 0xfe],
            ),
        );
        assert!(txn.exception().is_none());
        assert_eq!(txn.reply().len(), 12);
        assert_eq!(first.get(), 1);
        assert_eq!(second.get(), -2);
    }

    #[test]
    fn test_write_multiple_registers_address_overflow() {
        let image = ProcessImage::new();
        let txn = process(
            &image,
            &adu(
                7,
                1,
                &[16, 0x00, 0x63, 0x00, 0x02, 0x04, 0x00, 0x01, 0x00, 0x02],
            ),
        );
        assert_eq!(txn.exception(), Some(ExceptionCode::IllegalDataAddress));
    }

    #[test]
    fn test_oversized_count_rejected() {
        let image = ProcessImage::new();
        // 3000 coils would need 375 reply data bytes
        let txn = process(&image, &adu(1, 1, &[1, 0x00, 0x00, 0x0b, 0xb8]));
        assert_eq!(txn.exception(), Some(ExceptionCode::IllegalDataValue));
        let txn = process(&image, &adu(1, 1, &[3, 0x00, 0x00, 0x00, 0x80]));
        assert_eq!(txn.exception(), Some(ExceptionCode::IllegalDataValue));
    }

    #[test]
    fn test_reply_length_field_invariant() {
        let mut image = ProcessImage::new();
        image
            .bind(Family::Output, 0, 0, Arc::new(IoCell::new(true)))
            .unwrap();
        let requests: Vec<Vec<u8>> = vec![
            adu(1, 1, &[1, 0x00, 0x00, 0x00, 0x10]),
            adu(2, 1, &[3, 0x00, 0x00, 0x00, 0x05]),
            adu(3, 1, &[5, 0x00, 0x00, 0xff, 0x00]),
            adu(4, 1, &[6, 0x00, 0x00, 0x00, 0x01]),
            adu(5, 1, &[15, 0x00, 0x00, 0x00, 0x02, 0x01, 0x03]),
            adu(6, 1, &[16, 0x00, 0x00, 0x00, 0x01, 0x02, 0x00, 0x01]),
            adu(7, 1, &[8, 0x00, 0x00]),
        ];
        for request in requests {
            let txn = process(&image, &request);
            let reply = txn.reply();
            let length_field = u16::from_be_bytes([reply[4], reply[5]]) as usize;
            assert_eq!(length_field, reply.len() - 6, "fc {}", request[7]);
        }
    }

    #[test]
    fn test_unmapped_write_then_read_returns_zero() {
        let image = ProcessImage::new();
        let txn = process(&image, &adu(1, 1, &[6, 0x00, 0x20, 0xab, 0xcd]));
        assert!(txn.exception().is_none());
        let txn = process(&image, &adu(2, 1, &[3, 0x00, 0x20, 0x00, 0x01]));
        assert_eq!(&txn.reply()[9..11], &[0x00, 0x00]);
    }

    #[test]
    fn test_transaction_id_echoed() {
        let image = ProcessImage::new();
        let txn = process(&image, &adu(0xabcd, 3, &[1, 0x00, 0x00, 0x00, 0x01]));
        let reply = txn.reply();
        assert_eq!(&reply[..2], &[0xab, 0xcd]);
        assert_eq!(reply[6], 3);
    }
}
