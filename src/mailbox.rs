/*!
    implementation of the mailbox frame transport with a slave.

    The mailbox is a pair of sync-manager buffers in the slave's physical memory (channel 0
    written by the master, channel 1 read by it). Every asynchronous protocol (CoE, SoE)
    encapsulates its frames in the envelope defined here.

    ETG.1000.4 5.6
*/

use crate::{
    data::{self, PduData, PackingError, PackingResult},
    driver::{SlaveAddress, WireDriver},
    error::{EthercatError, EthercatResult},
    rawmaster::RawMaster,
    registers,
};
use bilge::prelude::*;
use core::time::Duration;

/// one sync-manager mailbox buffer in the slave's physical memory
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MailboxBuffer {
    pub offset: u16,
    pub size: u16,
}

/// implementation of communication with a slave's mailbox
pub struct Mailbox<'a, D: WireDriver> {
    raw: &'a mut RawMaster<D>,
    slave: u16,
    /// buffer written by the master (sync-manager channel 0)
    write: MailboxBuffer,
    /// buffer read by the master (sync-manager channel 1)
    read: MailboxBuffer,
    /// deadline for one frame in either direction
    timeout: Duration,
    /// frame counter, rolling 1 ..= 7
    count: u8,
}

impl<'a, D: WireDriver> Mailbox<'a, D> {
    pub fn new(raw: &'a mut RawMaster<D>, slave: u16, write: MailboxBuffer, read: MailboxBuffer, timeout: Duration) -> Self {
        Self { raw, slave, write, read, timeout, count: 0 }
    }

    /// fixed address of the slave this mailbox belongs to
    pub fn slave(&self) -> u16 {
        self.slave
    }

    /// write the given frame in the mailbox
    pub async fn write(&mut self, ty: MailboxType, data: &[u8]) -> EthercatResult<(), MailboxError> {
        let header_size = MailboxHeader::PACKED_SIZE;
        if data.len() + header_size > usize::from(self.write.size) {
            return Err(EthercatError::Master("frame too long for the slave's mailbox"));
        }
        self.count = self.count % 7 + 1;
        let header = MailboxHeader::new(
            data.len() as u16,
            0, // address of the master
            u6::new(0),
            u2::new(0),
            ty,
            u3::new(self.count),
        );

        // wait for the write buffer to be empty
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            let status = self
                .raw
                .read(SlaveAddress::Fixed(self.slave), registers::sync_manager::status(0))
                .await
                .map_err(EthercatError::upgrade)?;
            if !status.full() {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(EthercatError::Timeout("mailbox write"));
            }
        }

        // the whole buffer is written so the last byte triggers the sync manager
        let mut buffer = vec![0; usize::from(self.write.size)];
        header.pack(&mut buffer[..header_size])?;
        buffer[header_size..header_size + data.len()].copy_from_slice(data);
        self.raw
            .write_slice(SlaveAddress::Fixed(self.slave), self.write.offset, &mut buffer)
            .await
            .map_err(EthercatError::upgrade)?;
        Ok(())
    }

    /// read the frame currently in the mailbox, waiting for it if not already present.
    /// `data` is filled with the frame payload, the filled length is returned.
    pub async fn read(&mut self, ty: MailboxType, data: &mut [u8]) -> EthercatResult<usize, MailboxError> {
        // wait for a frame to be available
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            let status = self
                .raw
                .read(SlaveAddress::Fixed(self.slave), registers::sync_manager::status(1))
                .await
                .map_err(EthercatError::upgrade)?;
            if status.full() {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(EthercatError::Timeout("mailbox read"));
            }
        }

        // read the mailbox content
        let mut buffer = vec![0; usize::from(self.read.size)];
        self.raw
            .read_slice(SlaveAddress::Fixed(self.slave), self.read.offset, &mut buffer)
            .await
            .map_err(EthercatError::upgrade)?;

        let header = MailboxHeader::unpack(&buffer)?;
        let length = usize::from(header.length());
        let payload = buffer
            .get(MailboxHeader::PACKED_SIZE..MailboxHeader::PACKED_SIZE + length)
            .ok_or(EthercatError::Protocol("mailbox frame length exceeds the mailbox buffer"))?;

        if header.ty() == MailboxType::Exception {
            let frame = MailboxErrorFrame::unpack(payload)?;
            return Err(EthercatError::Slave(SlaveAddress::Fixed(self.slave), frame.error));
        }
        if header.ty() != ty {
            return Err(EthercatError::Protocol("unexpected mailbox protocol in the received frame"));
        }
        if length > data.len() {
            return Err(EthercatError::Master("buffer too short for the received frame"));
        }
        data[..length].copy_from_slice(payload);
        Ok(length)
    }
}

/// ETG.1000.4 table 29
#[bitsize(48)]
#[derive(FromBits, DebugBits, Copy, Clone)]
pub struct MailboxHeader {
    /// length of the mailbox service data following this header
    pub length: u16,
    /**
        - if a master is client: station address of the source
        - if a slave is client: station address of the destination
    */
    pub address: u16,
    /// reserved for future use
    pub channel: u6,
    /// 0 is lowest priority, 3 is highest
    pub priority: u2,
    pub ty: MailboxType,
    /// counter of the mailbox services (0 reserved, rolls from 1 to 7 and overflows to 1)
    pub count: u3,
    reserved: u1,
}

impl PduData for MailboxHeader {
    const ID: data::TypeId = data::TypeId::CUSTOM;
    const PACKED_SIZE: usize = 6;

    fn pack(&self, dst: &mut [u8]) -> PackingResult<()> {
        if dst.len() < Self::PACKED_SIZE {
            return Err(PackingError::BadSize(dst.len(), "destination too short for the value"));
        }
        let bits: u48 = (*self).into();
        dst[..Self::PACKED_SIZE].copy_from_slice(&bits.value().to_le_bytes()[..Self::PACKED_SIZE]);
        Ok(())
    }
    fn unpack(src: &[u8]) -> PackingResult<Self> {
        if src.len() < Self::PACKED_SIZE {
            return Err(PackingError::BadSize(src.len(), "source too short for the value"));
        }
        let mut bytes = [0u8; 8];
        bytes[..Self::PACKED_SIZE].copy_from_slice(&src[..Self::PACKED_SIZE]);
        Ok(Self::from(u48::new(u64::from_le_bytes(bytes))))
    }
}

/// ETG.1000.4 table 29
#[bitsize(4)]
#[derive(FromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub enum MailboxType {
    Exception = 0x0,
    Ads = 0x1,
    Ethernet = 0x2,
    Can = 0x3,
    File = 0x4,
    Servo = 0x5,
    #[fallback]
    Specific = 0xf,
}

/// error frame sent back by a slave rejecting a mailbox frame
/// ETG.1000.4 table 30
#[derive(Copy, Clone, Debug)]
pub struct MailboxErrorFrame {
    pub ty: u16,
    pub error: MailboxError,
}

impl PduData for MailboxErrorFrame {
    const ID: data::TypeId = data::TypeId::CUSTOM;
    const PACKED_SIZE: usize = 4;

    fn pack(&self, dst: &mut [u8]) -> PackingResult<()> {
        if dst.len() < Self::PACKED_SIZE {
            return Err(PackingError::BadSize(dst.len(), "destination too short for the value"));
        }
        self.ty.pack(&mut dst[0..2])?;
        (self.error as u16).pack(&mut dst[2..4])
    }
    fn unpack(src: &[u8]) -> PackingResult<Self> {
        if src.len() < Self::PACKED_SIZE {
            return Err(PackingError::BadSize(src.len(), "source too short for the value"));
        }
        Ok(Self {
            ty: u16::unpack(&src[0..2])?,
            error: MailboxError::from_code(u16::unpack(&src[2..4])?),
        })
    }
}

/// ETG.1000.4 table 30
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u16)]
pub enum MailboxError {
    Syntax = 0x1,
    UnsupportedProtocol = 0x2,
    InvalidChannel = 0x3,
    ServiceNotSupported = 0x4,
    InvalidHeader = 0x5,
    SizeTooShort = 0x6,
    NoMoreMemory = 0x7,
    InvalidSize = 0x8,
    ServiceInWork = 0x9,
    /// code outside the standard table
    Unknown = 0x0,
}

impl MailboxError {
    pub fn from_code(code: u16) -> Self {
        use MailboxError::*;
        match code {
            0x1 => Syntax,
            0x2 => UnsupportedProtocol,
            0x3 => InvalidChannel,
            0x4 => ServiceNotSupported,
            0x5 => InvalidHeader,
            0x6 => SizeTooShort,
            0x7 => NoMoreMemory,
            0x8 => InvalidSize,
            0x9 => ServiceInWork,
            _ => Unknown,
        }
    }
}

/// request header of the Servo profile over EtherCAT, used by `soeWrite` init commands
/// IEC 61800-7-3 as carried by ETG.1000.6 5.6.4
#[derive(Copy, Clone, Debug)]
pub struct SoeHeader {
    /// SoE service: 1 = read request, 2 = write request
    pub op_code: u8,
    /// addressed drive in the slave
    pub drive_no: u8,
    /// element flags, 0x40 selects the value element
    pub elements: u8,
    /// identity number of the addressed parameter
    pub idn: u16,
}

impl PduData for SoeHeader {
    const ID: data::TypeId = data::TypeId::CUSTOM;
    const PACKED_SIZE: usize = 4;

    fn pack(&self, dst: &mut [u8]) -> PackingResult<()> {
        if dst.len() < Self::PACKED_SIZE {
            return Err(PackingError::BadSize(dst.len(), "destination too short for the value"));
        }
        dst[0] = (self.op_code & 0x7) | (self.drive_no & 0x7) << 5;
        dst[1] = self.elements;
        self.idn.pack(&mut dst[2..4])
    }
    fn unpack(src: &[u8]) -> PackingResult<Self> {
        if src.len() < Self::PACKED_SIZE {
            return Err(PackingError::BadSize(src.len(), "source too short for the value"));
        }
        Ok(Self {
            op_code: src[0] & 0x7,
            drive_no: (src[0] >> 5) & 0x7,
            elements: src[1],
            idn: u16::unpack(&src[2..4])?,
        })
    }
}
