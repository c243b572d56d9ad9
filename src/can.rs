/*!
    implementation of CoE (CANopen over EtherCAT).

    It works exactly as on a CAN bus, except each of its frames is encapsulated in a
    mailbox frame. Only the transfers a Class B master needs are implemented: expedited
    and normal (single-frame) SDO upload/download, and the PDO-assignment walks used by
    discovery. Segmented transfers are not supported, the mailbox size bounds payloads.
*/

use crate::{
    data::{self, PduData},
    mailbox::{Mailbox, MailboxError, MailboxType},
    sdo::{self, PdoMappingEntry, Sdo, SdoList},
    driver::WireDriver,
    error::{EthercatError, EthercatResult},
};
use bilge::prelude::*;
use core::fmt;

/// maximum byte size of sdo data that can be expedited
const EXPEDITED_MAX_SIZE: usize = 4;

/// implementation of CoE communication with one slave
pub struct Can<'a, D: WireDriver> {
    mailbox: Mailbox<'a, D>,
}

impl<'a, D: WireDriver> Can<'a, D> {
    pub fn new(mailbox: Mailbox<'a, D>) -> Self {
        Self { mailbox }
    }

    /// read an SDO subitem, expecting the declared type
    pub async fn sdo_read<T: PduData>(&mut self, sdo: &Sdo<T>) -> EthercatResult<T, CanError> {
        let mut buffer = vec![0; T::PACKED_SIZE];
        let length = self.sdo_read_slice(sdo.index, sdo.sub, &mut buffer).await?;
        if length < T::PACKED_SIZE {
            return Err(EthercatError::Protocol("slave answered with a shorter value than the requested type"));
        }
        Ok(T::unpack(&buffer)?)
    }

    /// write an SDO subitem from its declared type
    pub async fn sdo_write<T: PduData>(&mut self, sdo: &Sdo<T>, value: T) -> EthercatResult<(), CanError> {
        let mut buffer = vec![0; T::PACKED_SIZE];
        value.pack(&mut buffer)?;
        self.sdo_write_slice(sdo.index, sdo.sub, &buffer).await
    }

    /// read an SDO subitem as raw bytes, returning the transferred length
    pub async fn sdo_read_slice(&mut self, index: u16, sub: u8, data: &mut [u8]) -> EthercatResult<usize, CanError> {
        let mut frame = vec![0; CoeHeader::PACKED_SIZE + SdoHeader::PACKED_SIZE + EXPEDITED_MAX_SIZE];
        CoeHeader::new(u9::new(0), CanService::SdoRequest).pack(&mut frame[..CoeHeader::PACKED_SIZE])?;
        SdoHeader::new(false, false, u2::new(0), false, SdoCommand::Upload, index, sub)
            .pack(&mut frame[CoeHeader::PACKED_SIZE..][..SdoHeader::PACKED_SIZE])?;
        self.mailbox.write(MailboxType::Can, &frame).await.map_err(coe_error)?;

        let (header, payload) = self.receive_response(index, sub, SdoCommand::Upload).await?;
        if header.expedited() {
            let length = EXPEDITED_MAX_SIZE - usize::from(u8::from(header.size()));
            let length = length.min(data.len());
            let content = payload
                .get(..length)
                .ok_or(EthercatError::Protocol("sdo response shorter than announced"))?;
            data[..length].copy_from_slice(content);
            Ok(length)
        } else {
            // normal transfer, total size first
            let total = u32::unpack(&payload)? as usize;
            let content = payload
                .get(u32::PACKED_SIZE..u32::PACKED_SIZE + total)
                .ok_or(EthercatError::Protocol("sdo normal transfer larger than its mailbox frame"))?;
            let length = total.min(data.len());
            data[..length].copy_from_slice(&content[..length]);
            Ok(length)
        }
    }

    /// write an SDO subitem from raw bytes
    pub async fn sdo_write_slice(&mut self, index: u16, sub: u8, data: &[u8]) -> EthercatResult<(), CanError> {
        let headers = CoeHeader::PACKED_SIZE + SdoHeader::PACKED_SIZE;
        let mut frame;
        if data.len() <= EXPEDITED_MAX_SIZE {
            // expedited transfer: the data replaces the size field
            frame = vec![0; headers + EXPEDITED_MAX_SIZE];
            CoeHeader::new(u9::new(0), CanService::SdoRequest).pack(&mut frame[..CoeHeader::PACKED_SIZE])?;
            SdoHeader::new(
                true,
                true,
                u2::new((EXPEDITED_MAX_SIZE - data.len()) as u8),
                false,
                SdoCommand::Download,
                index,
                sub,
            )
            .pack(&mut frame[CoeHeader::PACKED_SIZE..][..SdoHeader::PACKED_SIZE])?;
            frame[headers..headers + data.len()].copy_from_slice(data);
        } else {
            // normal transfer: size field then data, all in one frame
            frame = vec![0; headers + u32::PACKED_SIZE + data.len()];
            CoeHeader::new(u9::new(0), CanService::SdoRequest).pack(&mut frame[..CoeHeader::PACKED_SIZE])?;
            SdoHeader::new(true, false, u2::new(0), false, SdoCommand::Download, index, sub)
                .pack(&mut frame[CoeHeader::PACKED_SIZE..][..SdoHeader::PACKED_SIZE])?;
            (data.len() as u32).pack(&mut frame[headers..][..u32::PACKED_SIZE])?;
            frame[headers + u32::PACKED_SIZE..].copy_from_slice(data);
        }
        self.mailbox.write(MailboxType::Can, &frame).await.map_err(coe_error)?;

        self.receive_response(index, sub, SdoCommand::DownloadResponse).await?;
        Ok(())
    }

    /// read the list of PDOs assigned to a sync-manager channel
    pub async fn pdo_assignment(&mut self, channel: SdoList<u16>) -> EthercatResult<Vec<u16>, CanError> {
        let count = self.sdo_read(&channel.len()).await?;
        let mut pdos = Vec::with_capacity(usize::from(count));
        for position in 0..count {
            pdos.push(self.sdo_read(&channel.item(position)).await?);
        }
        Ok(pdos)
    }

    /// read the entries mapped by one PDO object
    pub async fn pdo_entries(&mut self, pdo_index: u16) -> EthercatResult<Vec<PdoMappingEntry>, CanError> {
        let pdo = sdo::pdo(pdo_index);
        let count = self.sdo_read(&pdo.len()).await?;
        let mut entries = Vec::with_capacity(usize::from(count));
        for position in 0..count {
            entries.push(self.sdo_read(&pdo.item(position)).await?);
        }
        Ok(entries)
    }

    /// wait for the SDO response matching the given address and extract its payload
    async fn receive_response(&mut self, index: u16, sub: u8, expected: SdoCommand) -> EthercatResult<(SdoHeader, Vec<u8>), CanError> {
        let mut buffer = vec![0; 256];
        let length = self.mailbox.read(MailboxType::Can, &mut buffer).await.map_err(coe_error)?;
        let frame = buffer
            .get(..length)
            .ok_or(EthercatError::Protocol("mailbox announced more data than received"))?;
        if length < CoeHeader::PACKED_SIZE + SdoHeader::PACKED_SIZE {
            return Err(EthercatError::Protocol("sdo response shorter than its headers"));
        }

        let coe = CoeHeader::unpack(frame)?;
        if coe.service() != CanService::SdoResponse {
            return Err(EthercatError::Protocol("unexpected CoE service in the received frame"));
        }
        let header = SdoHeader::unpack(&frame[CoeHeader::PACKED_SIZE..])?;
        let payload = frame[CoeHeader::PACKED_SIZE + SdoHeader::PACKED_SIZE..].to_vec();

        if header.command() == SdoCommand::Abort {
            let code = u32::unpack(&payload)?;
            log::debug!("sdo {:#x}:{} aborted with {:?}", index, sub, SdoAbortCode(code));
            return Err(EthercatError::Slave(
                crate::driver::SlaveAddress::Fixed(self.mailbox.slave()),
                CanError::Sdo(SdoAbortCode(code)),
            ));
        }
        if header.command() != expected {
            return Err(EthercatError::Protocol("unexpected SDO command in the received frame"));
        }
        if header.index() != index || header.sub() != sub {
            return Err(EthercatError::Protocol("slave answered for an other SDO than the requested one"));
        }
        Ok((header, payload))
    }
}

fn coe_error(src: EthercatError<MailboxError>) -> EthercatError<CanError> {
    src.map(CanError::Mailbox)
}

/// error reported by a slave during CoE communication
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CanError {
    /// the mailbox envelope was rejected
    Mailbox(MailboxError),
    /// the SDO transfer was aborted
    Sdo(SdoAbortCode),
}

/// SDO transfer abort code
/// ETG.1000.6 table 41
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct SdoAbortCode(pub u32);

impl SdoAbortCode {
    pub fn description(self) -> &'static str {
        match self.0 {
            0x0503_0000 => "toggle bit not changed",
            0x0504_0000 => "SDO protocol timeout",
            0x0504_0001 => "client/server command specifier not valid or unknown",
            0x0504_0005 => "out of memory",
            0x0601_0000 => "unsupported access to an object",
            0x0601_0001 => "attempt to read a write-only object",
            0x0601_0002 => "attempt to write a read-only object",
            0x0602_0000 => "the object does not exist in the object dictionary",
            0x0604_0041 => "the object cannot be mapped into the PDO",
            0x0604_0042 => "the number and length of the objects to be mapped would exceed the PDO length",
            0x0604_0043 => "general parameter incompatibility reason",
            0x0606_0000 => "access failed due to a hardware error",
            0x0607_0010 => "data type does not match, length of service parameter does not match",
            0x0607_0012 => "data type does not match, length of service parameter too high",
            0x0607_0013 => "data type does not match, length of service parameter too low",
            0x0609_0011 => "subindex does not exist",
            0x0609_0030 => "value range of parameter exceeded",
            0x0609_0031 => "value of parameter written too high",
            0x0609_0032 => "value of parameter written too low",
            0x0800_0000 => "general error",
            0x0800_0020 => "data cannot be transferred or stored to the application",
            0x0800_0021 => "data cannot be transferred or stored because of local control",
            0x0800_0022 => "data cannot be transferred or stored in the current device state",
            _ => "vendor specific or unknown abort",
        }
    }
}

impl fmt::Debug for SdoAbortCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SdoAbortCode({:#010x}: {})", self.0, self.description())
    }
}
impl fmt::Display for SdoAbortCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#010x} ({})", self.0, self.description())
    }
}

/// header common to all CoE frames
/// ETG.1000.6 table 31
#[bitsize(16)]
#[derive(FromBits, DebugBits, Copy, Clone)]
pub struct CoeHeader {
    /// PDO number for PDO services, 0 for SDO services
    pub number: u9,
    reserved: u3,
    pub service: CanService,
}
data::bilge_pdudata!(CoeHeader, u16);

/// type of CoE service carried by a frame
/// ETG.1000.6 table 31
#[bitsize(4)]
#[derive(FromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub enum CanService {
    Emergency = 1,
    SdoRequest = 2,
    SdoResponse = 3,
    TxPdo = 4,
    RxPdo = 5,
    TxPdoRemoteRequest = 6,
    RxPdoRemoteRequest = 7,
    SdoInfo = 8,
    #[fallback]
    Reserved = 0,
}

/// header of an SDO initiate frame, following the CoE header
/// ETG.1000.6 table 33
#[bitsize(32)]
#[derive(FromBits, DebugBits, Copy, Clone)]
pub struct SdoHeader {
    /// the size fields are valid
    pub sized: bool,
    /// the data is transferred inside the size field instead of after the header
    pub expedited: bool,
    /// number of unused bytes of an expedited transfer
    pub size: u2,
    /// complete-access transfer
    pub complete: bool,
    pub command: SdoCommand,
    /// index of the addressed dictionary object
    pub index: u16,
    /// subindex of the addressed dictionary object
    pub sub: u8,
}
data::bilge_pdudata!(SdoHeader, u32);

/// SDO command specifier. The same bits carry the client and the server vocabularies,
/// the variants here name the exchanges this master performs.
#[bitsize(3)]
#[derive(FromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub enum SdoCommand {
    /// server: upload segment response
    Segment = 0,
    /// client: download initiate request
    Download = 1,
    /// client: upload initiate request / server: upload initiate response
    Upload = 2,
    /// server: download initiate response
    DownloadResponse = 3,
    /// either side: abort transfer, an abort code follows the header
    Abort = 4,
    #[fallback]
    Reserved = 7,
}
