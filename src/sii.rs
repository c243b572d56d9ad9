/*!
    SII (Slave Information Interface) allows to retrieve declarative informations about a slave (like a manifest) such as product code, vendor, mailbox recommendations and process data descriptions.

    ETG.1000.4 6.4
*/

use crate::{
    data::{self, Field, PduData, PackingError, PackingResult},
    driver::{SlaveAddress, WireDriver},
    eeprom,
    error::{EthercatError, EthercatResult},
    rawmaster::RawMaster,
    registers,
};
use bilge::prelude::*;
use core::time::Duration;

/// implementation of the Slave Information Interface (SII) to read a slave's EEPROM memory
pub struct Sii<'a, D: WireDriver> {
    raw: &'a mut RawMaster<D>,
    slave: SlaveAddress,
    /// address unit (number of bytes) to use for communication
    unit: u16,
    /// deadline for each complete read transaction
    timeout: Duration,
}

impl<'a, D: WireDriver> Sii<'a, D> {
    pub async fn new(raw: &'a mut RawMaster<D>, slave: SlaveAddress, timeout: Duration) -> EthercatResult<Sii<'a, D>, SiiError> {
        let status = raw.read(slave, registers::sii::control).await.map_err(EthercatError::upgrade::<SiiError>)?;
        let unit = match status.address_unit() {
            registers::SiiUnit::Byte => 1,
            registers::SiiUnit::Word => 2,
        };
        if status.checksum_error() {
            return Err(EthercatError::Slave(slave, SiiError::Checksum));
        }
        Ok(Self { raw, slave, unit, timeout })
    }

    /// read data from the slave's EEPROM using the SII
    pub async fn read<T: PduData>(&mut self, field: Field<T>) -> EthercatResult<T, SiiError> {
        let mut buffer = vec![0; field.len];
        self.read_slice(field.byte as u16, &mut buffer).await?;
        Ok(T::unpack(&buffer)?)
    }

    /// read a contiguous EEPROM area. `address` is a byte address and must be word aligned.
    pub async fn read_slice(&mut self, address: u16, value: &mut [u8]) -> EthercatResult<(), SiiError> {
        assert!(address % 2 == 0, "SII reads must be word aligned");

        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut position = 0;
        while position < value.len() {
            // send request
            self.raw
                .write(self.slave, registers::sii::control_address, registers::SiiControlAddress {
                    control: registers::SiiControl::read_request(),
                    address: u32::from((address + position as u16) / self.unit),
                })
                .await
                .map_err(EthercatError::upgrade::<SiiError>)?;

            // wait for the interface to become available
            let status = loop {
                if tokio::time::Instant::now() >= deadline {
                    return Err(EthercatError::Timeout("SII read"));
                }
                let answer = self.raw.read(self.slave, registers::sii::control).await.map_err(EthercatError::upgrade::<SiiError>)?;
                if !answer.busy() && !answer.read_operation() {
                    break answer;
                }
            };
            // check for errors
            if status.command_error() {
                return Err(EthercatError::Slave(self.slave, SiiError::Command));
            }
            if status.device_info_error() {
                return Err(EthercatError::Slave(self.slave, SiiError::DeviceInfo));
            }
            // buffer the result
            let size = match status.read_size() {
                registers::SiiTransaction::Bytes4 => 4,
                registers::SiiTransaction::Bytes8 => 8,
            };
            let data = self.raw.read(self.slave, registers::sii::data).await.map_err(EthercatError::upgrade::<SiiError>)?;
            let chunk = size.min(value.len() - position);
            value[position..position + chunk].copy_from_slice(&data[..chunk]);
            position += chunk;
        }
        Ok(())
    }

    /// cursor pointing at the start of categories. See [CategoryHeader]
    pub fn categories(&mut self) -> SiiCursor<'_, 'a, D> {
        SiiCursor { position: eeprom::categories, sii: self }
    }
}

/// helper for walking the categories of the EEPROM through the SII
pub struct SiiCursor<'s, 'a, D: WireDriver> {
    sii: &'s mut Sii<'a, D>,
    position: u16,
}

impl<D: WireDriver> SiiCursor<'_, '_, D> {
    /// current byte position in the EEPROM
    pub fn position(&self) -> u16 {
        self.position
    }
    /// advance byte position of the given increment
    pub fn advance(&mut self, increment: u16) {
        self.position += increment;
    }
    /// read bytes filling the given slice and advance the position
    pub async fn read(&mut self, dst: &mut [u8]) -> EthercatResult<(), SiiError> {
        self.sii.read_slice(self.position, dst).await?;
        self.position += dst.len() as u16;
        Ok(())
    }
    /// read the given data and advance the position
    pub async fn unpack<T: PduData>(&mut self) -> EthercatResult<T, SiiError> {
        let mut buffer = vec![0; T::PACKED_SIZE];
        self.read(&mut buffer).await?;
        Ok(T::unpack(&buffer)?)
    }
    /// walk the categories until finding the requested one, and leave the cursor on its first data byte.
    /// returns the category size in bytes, or `None` when hitting the end marker first.
    pub async fn seek(&mut self, category: CategoryType) -> EthercatResult<Option<u16>, SiiError> {
        loop {
            let header: CategoryHeader = self.unpack().await?;
            match header.category() {
                value if value == category => return Ok(Some(header.size() * eeprom::WORD as u16)),
                CategoryType::End => return Ok(None),
                _ => self.advance(header.size() * eeprom::WORD as u16),
            }
        }
    }
}

/// error raised by the SII of a slave
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SiiError {
    /// bad SII command
    Command,
    /// EEPROM data has been corrupted
    Checksum,
    /// bad data in device info section
    DeviceInfo,
}

impl From<EthercatError<()>> for EthercatError<SiiError> {
    fn from(src: EthercatError<()>) -> Self {
        src.upgrade()
    }
}

/**
    header for a SII category

    ETG.1000.6 table 17
*/
#[bitsize(32)]
#[derive(FromBits, DebugBits, Copy, Clone)]
pub struct CategoryHeader {
    /// category type as defined in ETG.1000.6 Table 19
    pub category: CategoryType,
    /// size in words of the category
    pub size: u16,
}
data::bilge_pdudata!(CategoryHeader, u32);

/**
    type of category in the SII

    ETG.1000.6 table 19
*/
#[bitsize(16)]
#[derive(FromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub enum CategoryType {
    Nop = 0,
    /// String repository for other categories, structure of this category data see ETG.1000.6 Table 20
    Strings = 10,
    /// Data Types for future use
    DataTypes = 20,
    /// General information, structure of this category data see ETG.1000.6 Table 21
    General = 30,
    /// FMMUs to be used, structure of this category data see ETG.1000.6 Table 23
    Fmmu = 40,
    /// Sync Manager Configuration, structure of this category data see ETG.1000.6 Table 24
    SyncManager = 41,
    /// TxPDO description, structure of this category data see ETG.1000.6 Table 25
    TxPdo = 50,
    /// RxPDO description, structure of this category data see ETG.1000.6 Table 25
    RxPdo = 51,
    /// Distributed Clock
    Dc = 60,
    #[fallback]
    Specific = 0x0800,
    /// mark the end of SII categories
    End = 0xffff,
}

/// supported CoE features
#[bitsize(8)]
#[derive(FromBits, DebugBits, Copy, Clone, Default, Eq, PartialEq)]
pub struct CoeDetails {
    pub sdo: bool,
    pub sdo_info: bool,
    pub pdo_assign: bool,
    pub pdo_config: bool,
    pub startup_upload: bool,
    pub sdo_complete: bool,
    reserved: u2,
}
data::bilge_pdudata!(CoeDetails, u8);

#[bitsize(8)]
#[derive(FromBits, DebugBits, Copy, Clone, Default, Eq, PartialEq)]
pub struct FoeDetails {
    /// protocol supported
    pub enable: bool,
    reserved: u7,
}
data::bilge_pdudata!(FoeDetails, u8);

#[bitsize(8)]
#[derive(FromBits, DebugBits, Copy, Clone, Default, Eq, PartialEq)]
pub struct EoeDetails {
    /// protocol supported
    pub enable: bool,
    reserved: u7,
}
data::bilge_pdudata!(EoeDetails, u8);

/// the start of the General category (ETG.1000.6 table 21), as far as capability discovery is concerned
#[derive(Copy, Clone, Debug)]
pub struct CategoryGeneral {
    /// Group Information (Vendor specific) - Index to STRINGS
    pub group: u8,
    /// Image Name (Vendor specific) - Index to STRINGS
    pub img: u8,
    /// Device Order Number (Vendor specific) - Index to STRINGS
    pub order: u8,
    /// Device Name Information (Vendor specific) - Index to STRINGS
    pub name: u8,
    /// supported CoE features
    pub coe: CoeDetails,
    /// supported FoE features
    pub foe: FoeDetails,
    /// supported EoE features
    pub eoe: EoeDetails,
}

impl PduData for CategoryGeneral {
    const ID: data::TypeId = data::TypeId::CUSTOM;
    const PACKED_SIZE: usize = 8;

    fn pack(&self, dst: &mut [u8]) -> PackingResult<()> {
        if dst.len() < Self::PACKED_SIZE {
            return Err(PackingError::BadSize(dst.len(), "destination too short for the value"));
        }
        dst[0] = self.group;
        dst[1] = self.img;
        dst[2] = self.order;
        dst[3] = self.name;
        dst[4] = 0;
        self.coe.pack(&mut dst[5..6])?;
        self.foe.pack(&mut dst[6..7])?;
        self.eoe.pack(&mut dst[7..8])
    }
    fn unpack(src: &[u8]) -> PackingResult<Self> {
        if src.len() < Self::PACKED_SIZE {
            return Err(PackingError::BadSize(src.len(), "source too short for the value"));
        }
        Ok(Self {
            group: src[0],
            img: src[1],
            order: src[2],
            name: src[3],
            coe: CoeDetails::unpack(&src[5..6])?,
            foe: FoeDetails::unpack(&src[6..7])?,
            eoe: EoeDetails::unpack(&src[7..8])?,
        })
    }
}

/// one PDO record of the TxPdo/RxPdo categories
/// ETG.1000.6 table 25
#[derive(Copy, Clone, Debug)]
pub struct CategoryPdo {
    /// index of the PDO mapping object
    pub index: u16,
    /// number of entry records following this one
    pub entries: u8,
    /// sync-manager channel the PDO is assigned to
    pub sync_manager: u8,
    /// DC sync group
    pub dc_sync: u8,
    /// name of the PDO - index to STRINGS
    pub name: u8,
    pub flags: u16,
}

impl PduData for CategoryPdo {
    const ID: data::TypeId = data::TypeId::CUSTOM;
    const PACKED_SIZE: usize = 8;

    fn pack(&self, dst: &mut [u8]) -> PackingResult<()> {
        if dst.len() < Self::PACKED_SIZE {
            return Err(PackingError::BadSize(dst.len(), "destination too short for the value"));
        }
        self.index.pack(&mut dst[0..2])?;
        dst[2] = self.entries;
        dst[3] = self.sync_manager;
        dst[4] = self.dc_sync;
        dst[5] = self.name;
        self.flags.pack(&mut dst[6..8])
    }
    fn unpack(src: &[u8]) -> PackingResult<Self> {
        if src.len() < Self::PACKED_SIZE {
            return Err(PackingError::BadSize(src.len(), "source too short for the value"));
        }
        Ok(Self {
            index: u16::unpack(&src[0..2])?,
            entries: src[2],
            sync_manager: src[3],
            dc_sync: src[4],
            name: src[5],
            flags: u16::unpack(&src[6..8])?,
        })
    }
}

/// one PDO entry record following a [CategoryPdo]
/// ETG.1000.6 table 26
#[derive(Copy, Clone, Debug)]
pub struct CategoryPdoEntry {
    /// index of the mapped object in the dictionary
    pub index: u16,
    /// subindex of the mapped object
    pub sub: u8,
    /// name of the entry - index to STRINGS
    pub name: u8,
    /// CoE base data type index
    pub data_type: u8,
    /// size of the entry in bits
    pub bit_length: u8,
    pub flags: u16,
}

impl PduData for CategoryPdoEntry {
    const ID: data::TypeId = data::TypeId::CUSTOM;
    const PACKED_SIZE: usize = 8;

    fn pack(&self, dst: &mut [u8]) -> PackingResult<()> {
        if dst.len() < Self::PACKED_SIZE {
            return Err(PackingError::BadSize(dst.len(), "destination too short for the value"));
        }
        self.index.pack(&mut dst[0..2])?;
        dst[2] = self.sub;
        dst[3] = self.name;
        dst[4] = self.data_type;
        dst[5] = self.bit_length;
        self.flags.pack(&mut dst[6..8])
    }
    fn unpack(src: &[u8]) -> PackingResult<Self> {
        if src.len() < Self::PACKED_SIZE {
            return Err(PackingError::BadSize(src.len(), "source too short for the value"));
        }
        Ok(Self {
            index: u16::unpack(&src[0..2])?,
            sub: src[2],
            name: src[3],
            data_type: src[4],
            bit_length: src[5],
            flags: u16::unpack(&src[6..8])?,
        })
    }
}
