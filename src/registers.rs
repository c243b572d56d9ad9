//! structs and consts for the standard slave (ESC) registers this master touches. This should be used instead of any hardcoded register value

use crate::data::{self, Field};
use bilge::prelude::*;
use core::fmt;

/**
    application-layer state of a slave, as requested through [al::control] and reported through [al::status]

    The numeric values mirror the AL-control bit patterns (ETG.1000.6 table 9).
*/
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(u8)]
pub enum AlState {
    Init = 1,
    PreOperational = 2,
    SafeOperational = 4,
    Operational = 8,
}

impl AlState {
    /// parse the state nibble of the AL status register. `None` for the bootstrap state (not
    /// a master target) and for transitional garbage.
    pub fn from_al_bits(bits: u8) -> Option<Self> {
        match bits & 0x0f {
            1 => Some(Self::Init),
            2 => Some(Self::PreOperational),
            4 => Some(Self::SafeOperational),
            8 => Some(Self::Operational),
            _ => None,
        }
    }
}

impl fmt::Display for AlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => write!(f, "INIT"),
            Self::PreOperational => write!(f, "PRE_OP"),
            Self::SafeOperational => write!(f, "SAFE_OP"),
            Self::Operational => write!(f, "OP"),
        }
    }
}

/// AL control register content, written by the master to request a state
/// ETG.1000.6 table 9
#[bitsize(16)]
#[derive(FromBits, DebugBits, Copy, Clone)]
pub struct AlControl {
    /// requested state bits
    pub state: u4,
    /// acknowledge the error flag currently reported in [AlStatus]
    pub acknowledge: bool,
    /// request the device identification instead of a state change
    pub id_request: bool,
    reserved: u10,
}
data::bilge_pdudata!(AlControl, u16);

impl AlControl {
    /// request for switching to the given state, acknowledging any pending error
    pub fn request(state: AlState) -> Self {
        Self::new(u4::new(state as u8), true, false)
    }
}

/// AL status register content, reported by the slave
/// ETG.1000.6 table 10
#[bitsize(16)]
#[derive(FromBits, DebugBits, Copy, Clone)]
pub struct AlStatus {
    /// current state bits
    pub state: u4,
    /// the last requested transition failed, the cause is in [al::error]
    pub error: bool,
    /// device identification value is loaded
    pub id_loaded: bool,
    reserved: u10,
}
data::bilge_pdudata!(AlStatus, u16);

impl AlStatus {
    /// the reported state, if it is a settled one
    pub fn resolved(&self) -> Option<AlState> {
        AlState::from_al_bits(u8::from(self.state()))
    }
}

/// AL status codes reported through [al::error] when a transition fails
/// ETG.1000.6 table 11 (the codes a Class B master can meet)
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u16)]
pub enum AlError {
    NoError = 0x0000,
    Unspecified = 0x0001,
    NoMemory = 0x0002,
    InvalidDeviceSetup = 0x0003,
    InvalidStateRequest = 0x0011,
    UnknownStateRequest = 0x0012,
    BootstrapNotSupported = 0x0013,
    NoValidFirmware = 0x0014,
    InvalidMailboxConfig = 0x0015,
    InvalidSyncConfig = 0x0017,
    NoInputsAvailable = 0x0018,
    NoValidOutputs = 0x0019,
    Synchronization = 0x001a,
    SyncWatchdog = 0x001b,
    InvalidSyncTypes = 0x001c,
    InvalidOutputConfig = 0x001d,
    InvalidInputConfig = 0x001e,
    InvalidWatchdogConfig = 0x001f,
    NeedColdStart = 0x0020,
    NeedInit = 0x0021,
    NeedPreop = 0x0022,
    NeedSafeop = 0x0023,
    InvalidInputMapping = 0x0024,
    InvalidOutputMapping = 0x0025,
    InconsistentSettings = 0x0026,
    FreerunNotSupported = 0x0027,
    SyncModeNotSupported = 0x0028,
    FreerunNeedsBufferMode = 0x0029,
    BackgroundWatchdog = 0x002a,
    NoValidInputsOutputs = 0x002b,
    FatalSync = 0x002c,
    NoSync = 0x002d,
    MailboxEoe = 0x0042,
    MailboxCoe = 0x0043,
    MailboxFoe = 0x0044,
    MailboxSoe = 0x0045,
    MailboxVoe = 0x004f,
    EepromNoAccess = 0x0050,
    EepromError = 0x0051,
    SlaveRestarted = 0x0060,
}

impl AlError {
    /// decode a raw status code. `None` for reserved or vendor-specific codes.
    pub fn from_code(code: u16) -> Option<Self> {
        use AlError::*;
        Some(match code {
            0x0000 => NoError,
            0x0001 => Unspecified,
            0x0002 => NoMemory,
            0x0003 => InvalidDeviceSetup,
            0x0011 => InvalidStateRequest,
            0x0012 => UnknownStateRequest,
            0x0013 => BootstrapNotSupported,
            0x0014 => NoValidFirmware,
            0x0015 | 0x0016 => InvalidMailboxConfig,
            0x0017 => InvalidSyncConfig,
            0x0018 => NoInputsAvailable,
            0x0019 => NoValidOutputs,
            0x001a => Synchronization,
            0x001b => SyncWatchdog,
            0x001c => InvalidSyncTypes,
            0x001d => InvalidOutputConfig,
            0x001e => InvalidInputConfig,
            0x001f => InvalidWatchdogConfig,
            0x0020 => NeedColdStart,
            0x0021 => NeedInit,
            0x0022 => NeedPreop,
            0x0023 => NeedSafeop,
            0x0024 => InvalidInputMapping,
            0x0025 => InvalidOutputMapping,
            0x0026 => InconsistentSettings,
            0x0027 => FreerunNotSupported,
            0x0028 => SyncModeNotSupported,
            0x0029 => FreerunNeedsBufferMode,
            0x002a => BackgroundWatchdog,
            0x002b => NoValidInputsOutputs,
            0x002c => FatalSync,
            0x002d => NoSync,
            0x0042 => MailboxEoe,
            0x0043 => MailboxCoe,
            0x0044 => MailboxFoe,
            0x0045 => MailboxSoe,
            0x004f => MailboxVoe,
            0x0050 => EepromNoAccess,
            0x0051 => EepromError,
            0x0060 => SlaveRestarted,
            _ => return None,
        })
    }
}

/// used by the slave to inform the master which mailbox protocols can be used with it
/// ETG.1000.6 table 18
#[bitsize(16)]
#[derive(FromBits, DebugBits, Copy, Clone, Default)]
pub struct MailboxSupport {
    /// ADS over EtherCAT (routing and parallel services)
    pub aoe: bool,
    /// Ethernet over EtherCAT (tunnelling of Data Link services)
    pub eoe: bool,
    /// CAN application protocol over EtherCAT (access to SDO)
    pub coe: bool,
    /// File Access over EtherCAT
    pub foe: bool,
    /// Servo Drive Profile over EtherCAT
    pub soe: bool,
    /// Vendor specific protocol over EtherCAT
    pub voe: bool,
    reserved: u10,
}
data::bilge_pdudata!(MailboxSupport, u16);

/// status byte of a mailbox sync-manager channel, the register polled by the mailbox monitor.
///
/// Bit positions are the contract shared with the wire driver: bit 1 is the toggle
/// flipped by the slave on new mail, bit 3 reports the mailbox full.
#[bitsize(8)]
#[derive(FromBits, DebugBits, Copy, Clone, Default)]
pub struct MailboxStatus {
    /// write event pending on the channel
    pub write_event: bool,
    /// toggled by the slave whenever new mail is available
    pub toggle: bool,
    reserved: u1,
    /// a frame is waiting in the mailbox
    pub full: bool,
    /// buffer state of the channel
    pub buffer_state: u2,
    reserved: u2,
}
data::bilge_pdudata!(MailboxStatus, u8);

/// ETG.1000.4 table 48
#[bitsize(16)]
#[derive(FromBits, DebugBits, Copy, Clone, Default)]
pub struct SiiAccess {
    pub owner: SiiOwner,
    pub lock: bool,
    reserved: u6,
    pub pdi: bool,
    reserved: u7,
}
data::bilge_pdudata!(SiiAccess, u16);

#[bitsize(1)]
#[derive(FromBits, Debug, Copy, Clone, Default, Eq, PartialEq)]
pub enum SiiOwner {
    #[default]
    EthercatDl = 0,
    Pdi = 1,
}

/**
    register controlling the read operations of the Slave Information Interface (SII)

    ETG.1000.4 table 49
*/
#[bitsize(16)]
#[derive(FromBits, DebugBits, Copy, Clone, Default)]
pub struct SiiControl {
    /// true if the EEPROM is writable through the SII
    pub write_access: bool,
    reserved: u4,
    /**
        - false: normal operation (DL interfaces to SII)
        - true: DL-user emulates SII
    */
    pub eeprom_emulation: bool,
    /// number of bytes per read transaction
    pub read_size: SiiTransaction,
    /// unit of SII addresses
    pub address_unit: SiiUnit,

    /**
        read operation requested (parameter write) or read operation busy (parameter read)
        To start a new read operation there must be a positive edge on this parameter
    */
    pub read_operation: bool,
    /// write operation requested or busy, unused by this master
    pub write_operation: bool,
    /// reload operation requested or busy
    pub reload_operation: bool,

    /// checksum error while reading at startup
    pub checksum_error: bool,
    /// error on reading device information
    pub device_info_error: bool,
    /// error on last command
    pub command_error: bool,
    /// error on last write operation
    pub write_error: bool,

    /// operation is ongoing
    pub busy: bool,
}
data::bilge_pdudata!(SiiControl, u16);

impl SiiControl {
    /// request for reading the addressed words
    pub fn read_request() -> Self {
        let mut control = Self::default();
        control.set_read_operation(true);
        control
    }
}

#[bitsize(1)]
#[derive(FromBits, Debug, Copy, Clone, Default, Eq, PartialEq)]
pub enum SiiTransaction {
    #[default]
    Bytes4 = 0,
    Bytes8 = 1,
}
#[bitsize(1)]
#[derive(FromBits, Debug, Copy, Clone, Default, Eq, PartialEq)]
pub enum SiiUnit {
    #[default]
    Byte = 0,
    Word = 1,
}

/// content of one combined write to [sii::control_address]: the request and the word address it applies to
#[derive(Copy, Clone, Debug)]
pub struct SiiControlAddress {
    pub control: SiiControl,
    pub address: u32,
}

impl crate::data::PduData for SiiControlAddress {
    const ID: crate::data::TypeId = crate::data::TypeId::CUSTOM;
    const PACKED_SIZE: usize = 6;

    fn pack(&self, dst: &mut [u8]) -> crate::data::PackingResult<()> {
        if dst.len() < Self::PACKED_SIZE {
            return Err(crate::data::PackingError::BadSize(dst.len(), "destination too short for the value"));
        }
        self.control.pack(&mut dst[..2])?;
        self.address.pack(&mut dst[2..6])
    }
    fn unpack(src: &[u8]) -> crate::data::PackingResult<Self> {
        if src.len() < Self::PACKED_SIZE {
            return Err(crate::data::PackingError::BadSize(src.len(), "source too short for the value"));
        }
        Ok(Self {
            control: SiiControl::unpack(&src[..2])?,
            address: u32::unpack(&src[2..6])?,
        })
    }
}

/// station address registers
/// ETG.1000.4 table 32
pub mod address {
    use super::*;

    /// register of the station address, aka the fixed slave address
    pub const fixed: Field<u16> = Field::simple(0x0010);
    /// slave address alias
    pub const alias: Field<u16> = Field::simple(0x0012);
}

/// application-layer state machine registers
pub mod al {
    use super::*;

    /// AL control, written to request a state change
    pub const control: Field<AlControl> = Field::simple(0x0120);
    /// AL status, reporting the current state
    pub const status: Field<AlStatus> = Field::simple(0x0130);
    /// AL status code, reporting why the last transition failed
    pub const error: Field<u16> = Field::simple(0x0134);
}

/// watchdog registers
/// ETG.1000.4 tables 45-47
pub mod watchdog {
    use super::*;

    /// watchdog time base divider, default ≈ 2498 giving ≈ 100 µs per unit
    pub const divider: Field<u16> = Field::simple(0x0400);
    /// PDI watchdog timeout
    pub const pdi: Field<u16> = Field::simple(0x0410);
    /// sync-manager watchdog timeout, default ≈ 1000 giving ≈ 100 ms with the default divider
    pub const sync_manager: Field<u16> = Field::simple(0x0420);
    /// sync-manager watchdog status
    pub const status: Field<u16> = Field::simple(0x0440);
}

/// slave information interface registers
/// ETG.1000.4 tables 48-52
pub mod sii {
    use super::*;

    pub const access: Field<SiiAccess> = Field::simple(0x0500);
    pub const control: Field<SiiControl> = Field::simple(0x0502);
    /// the address in the SII accessed by the next read operation
    pub const address: Field<u32> = Field::simple(0x0504);
    /// combined control + address write, starting a read in one datagram
    pub const control_address: Field<SiiControlAddress> = Field::simple(0x0502);
    /// the data read by the last read operation, 4 or 8 bytes valid depending on [SiiControl::read_size]
    pub const data: Field<[u8; 8]> = Field::simple(0x0508);
}

/// sync-manager channel registers, as far as mailbox status polling is concerned
pub mod sync_manager {
    use super::*;

    /// status byte of the given sync-manager channel
    pub const fn status(channel: u16) -> Field<MailboxStatus> {
        Field::simple(0x0805 + 8 * channel as usize)
    }
    /// status byte of the mailbox-read channel (SM1), the usual mailbox status register
    pub const mailbox_read_status: Field<MailboxStatus> = Field::simple(0x080d);
}

/// distributed clock registers, only probed for capability by this Class B master
pub mod dc {
    use super::*;

    /// cyclic unit control + SYNC activation, readable only on DC-capable slaves
    pub const control: Field<u16> = Field::simple(0x0980);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::PduData;

    #[test]
    fn al_control_request_bits() {
        let mut raw = [0u8; 2];
        AlControl::request(AlState::SafeOperational).pack(&mut raw).unwrap();
        // state nibble 4, acknowledge bit 4
        assert_eq!(raw, [0x14, 0x00]);
    }

    #[test]
    fn al_status_resolution() {
        let status = AlStatus::unpack(&[0x12, 0x00]).unwrap();
        assert_eq!(status.resolved(), Some(AlState::PreOperational));
        assert!(status.error());
        assert!(AlStatus::unpack(&[0x03, 0x00]).unwrap().resolved().is_none());
    }

    #[test]
    fn mailbox_status_contract_bits() {
        let status = MailboxStatus::unpack(&[0x08]).unwrap();
        assert!(status.full());
        assert!(!status.toggle());
        let status = MailboxStatus::unpack(&[0x0a]).unwrap();
        assert!(status.full());
        assert!(status.toggle());
    }

    #[test]
    fn mailbox_read_status_is_the_default_register() {
        assert_eq!(sync_manager::status(1).byte, sync_manager::mailbox_read_status.byte);
        assert_eq!(sync_manager::mailbox_read_status.byte, 0x080d);
    }
}
