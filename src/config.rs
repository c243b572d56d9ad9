/*!
    value types describing one ethercat segment: the *network description*.

    The description is the JSON-equivalent schema consumed by the master: timings and
    policies for the master itself, one descriptor per slave in segment order (the position
    in [Network::slaves] is the slave index used everywhere), and optionally a process
    image of named variables. It is usually produced by an external ENI parser or by
    [discovery][crate::discovery], never mutated once handed to the master.

    Identity fields and object indexes accept both decimal and hexadecimal (`"0x…"`)
    textual forms when deserialized.
*/

use crate::data::TypeId;
use crate::registers::AlState;
use core::time::Duration;
use serde::{Deserialize, Deserializer, Serialize};

/// the authoritative configuration of one bus
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Network {
    pub master: MasterConfig,
    /// ordered sequence of slaves, the position is the stable slave index
    pub slaves: Vec<SlaveConfig>,
    /// named variables bound to the process data image
    #[serde(default)]
    pub process_image: Option<ProcessImageConfig>,
}

impl Network {
    /// check the description for the inconsistencies the master refuses to run with
    pub fn validate(&self) -> Result<(), &'static str> {
        for slave in &self.slaves {
            for command in &slave.init_commands {
                if command.action.data().len() > 4 {
                    // the init-command value field is 32 bit wide, nothing is silently truncated
                    return Err("init command data exceeds the 32-bit value field");
                }
                if command.transitions.is_empty() {
                    return Err("init command applies to no transition");
                }
            }
            if let Some(process) = &slave.process_data {
                for entry in &process.entries {
                    if entry.bit_length == 0 {
                        return Err("process data entry with a zero bit length");
                    }
                }
            }
        }
        Ok(())
    }

    /// true when any slave of the description announces CoE support
    pub fn any_coe(&self) -> bool {
        self.slaves.iter().any(|slave| slave.supports_coe())
    }
}

/// timings and policies of the master itself
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MasterConfig {
    /// period of the cyclic exchange, in µs
    pub cycle_period_us: u32,
    /// sync-manager watchdog timeout written to every slave before PreOp→SafeOp, in ms.
    /// `None` leaves the slaves' defaults untouched.
    pub watchdog_timeout_ms: Option<u32>,
    /// deadline for one PDU exchange, in ms
    pub pdu_timeout_ms: u64,
    /// deadline for one state transition, in ms
    pub state_transition_timeout_ms: u64,
    /// deadline for one mailbox frame in either direction, in ms
    pub mailbox_timeout_ms: u64,
    /// deadline for one EEPROM (SII) transaction, in ms
    pub eeprom_timeout_ms: u64,
    /// how many times a failed PDU is reissued before reporting
    pub pdu_retries: u32,
    /// true when distributed clocks hardware is present on the segment
    pub dc_support: bool,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            cycle_period_us: 10_000,
            watchdog_timeout_ms: None,
            pdu_timeout_ms: 100,
            state_transition_timeout_ms: 5_000,
            mailbox_timeout_ms: 1_000,
            eeprom_timeout_ms: 1_000,
            pdu_retries: 3,
            dc_support: false,
        }
    }
}

impl MasterConfig {
    pub fn cycle_period(&self) -> Duration {
        Duration::from_micros(u64::from(self.cycle_period_us))
    }
    pub fn pdu_timeout(&self) -> Duration {
        Duration::from_millis(self.pdu_timeout_ms)
    }
    pub fn state_transition_timeout(&self) -> Duration {
        Duration::from_millis(self.state_transition_timeout_ms)
    }
    pub fn mailbox_timeout(&self) -> Duration {
        Duration::from_millis(self.mailbox_timeout_ms)
    }
    pub fn eeprom_timeout(&self) -> Duration {
        Duration::from_millis(self.eeprom_timeout_ms)
    }
}

/// description of one slave of the segment
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlaveConfig {
    #[serde(default)]
    pub identity: Identity,
    /// station address set by the master, 0 to derive one from the slave index
    #[serde(default)]
    pub configured_address: u16,
    /// position-derived address on the wire
    #[serde(default)]
    pub auto_increment_address: i16,
    /// cyclic process data exposed by the slave. `None` excludes the slave from the cyclic frame.
    #[serde(default)]
    pub process_data: Option<ProcessData>,
    /// mailbox configuration. `None` for mailbox-less slaves.
    #[serde(default)]
    pub mailbox: Option<MailboxConfig>,
    /// ordered commands applied during state transitions
    #[serde(default)]
    pub init_commands: Vec<InitCommand>,
}

impl SlaveConfig {
    /// the station address of this slave, derived from its index when not configured
    pub fn station_address(&self, index: usize) -> u16 {
        if self.configured_address != 0 {
            self.configured_address
        } else {
            0x1000 + index as u16
        }
    }
    pub fn supports_coe(&self) -> bool {
        self.mailbox.as_ref().is_some_and(|mailbox| mailbox.coe)
    }
}

/// identity of one slave as stored in its SII
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    #[serde(deserialize_with = "hex_or_decimal", default)]
    pub vendor_id: u32,
    #[serde(deserialize_with = "hex_or_decimal", default)]
    pub product_code: u32,
    #[serde(deserialize_with = "hex_or_decimal", default)]
    pub revision_number: u32,
    /// 0 when the vendor left it unprogrammed, then never compared
    #[serde(deserialize_with = "hex_or_decimal", default)]
    pub serial_number: u32,
}

/// the cyclic process data of one slave, as byte ranges inside the two halves of the process data image
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessData {
    /// start of the slave's output section, relative to the outputs half
    #[serde(default)]
    pub output_byte_offset: usize,
    /// size of the slave's output section in bits
    #[serde(default)]
    pub output_bit_length: usize,
    /// start of the slave's input section, relative to the inputs half
    #[serde(default)]
    pub input_byte_offset: usize,
    /// size of the slave's input section in bits
    #[serde(default)]
    pub input_bit_length: usize,
    /// the mapped PDO entries, in mapping order
    #[serde(default)]
    pub entries: Vec<PdoEntryConfig>,
}

/// one PDO entry of a slave
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PdoEntryConfig {
    pub name: String,
    /// index of the mapped object in the slave's dictionary
    #[serde(deserialize_with = "hex_or_decimal", default)]
    pub index: u16,
    #[serde(default)]
    pub sub_index: u8,
    pub bit_length: u8,
    pub data_type: TypeId,
    /// legacy explicit offset inside the slave's PDO section. Must not be mixed with
    /// process-image variables addressing the same slave.
    #[serde(default)]
    pub pdo_byte_offset: Option<u32>,
    /// offset of the entry inside the process data image
    #[serde(default)]
    pub pdi_byte_offset: u32,
}

/// mailbox access parameters of one slave
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MailboxConfig {
    /// status register polled for new mail, usually the SM1 status byte
    #[serde(rename = "mailboxStatusRegisterAddress")]
    pub status_register_address: u16,
    /// period of the mailbox poll for this slave, in ms
    pub poll_period_ms: u32,
    /// CAN application protocol over EtherCAT
    #[serde(rename = "supportsCoE")]
    pub coe: bool,
    /// Ethernet over EtherCAT
    #[serde(rename = "supportsEoE")]
    pub eoe: bool,
    /// File access over EtherCAT
    #[serde(rename = "supportsFoE")]
    pub foe: bool,
    /// master→slave mailbox buffer in the slave's physical memory
    pub write_offset: u16,
    pub write_size: u16,
    /// slave→master mailbox buffer in the slave's physical memory
    pub read_offset: u16,
    pub read_size: u16,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        // the Class B recommendation for a CoE slave
        Self {
            status_register_address: 0x080d,
            poll_period_ms: 20,
            coe: true,
            eoe: false,
            foe: false,
            write_offset: 0x1000,
            write_size: 128,
            read_offset: 0x1080,
            read_size: 128,
        }
    }
}

impl MailboxConfig {
    /// master→slave buffer as used by the mailbox transport
    pub fn write_buffer(&self) -> crate::mailbox::MailboxBuffer {
        crate::mailbox::MailboxBuffer { offset: self.write_offset, size: self.write_size }
    }
    /// slave→master buffer as used by the mailbox transport
    pub fn read_buffer(&self) -> crate::mailbox::MailboxBuffer {
        crate::mailbox::MailboxBuffer { offset: self.read_offset, size: self.read_size }
    }
}

/// named variables bound to bit ranges of the process data image
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProcessImageConfig {
    /// variables of the inputs half (slaves → master)
    pub inputs: Vec<ProcessVariable>,
    /// variables of the outputs half (master → slaves)
    pub outputs: Vec<ProcessVariable>,
}

/// one named variable of the process image
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessVariable {
    pub name: String,
    pub data_type: TypeId,
    /// offset of the variable relative to its half of the image, in bits
    pub bit_offset: u64,
    /// size in bits, defaults to the natural size of the data type
    #[serde(default)]
    pub bit_size: Option<u32>,
}

impl ProcessVariable {
    /// the declared size, or the natural size of the type
    pub fn size(&self) -> u32 {
        self.bit_size.unwrap_or(self.data_type.bit_size() as u32)
    }
}

/// one command applied to a slave during state transitions
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitCommand {
    #[serde(flatten)]
    pub action: InitAction,
    /// the set of transitions this command applies to
    pub transitions: Vec<Transition>,
    /// how many times a failing command is retried before the transition fails
    #[serde(default)]
    pub retries: u32,
    /// working counter expected from a register write, when different from 1
    #[serde(default)]
    pub expected_wkc: Option<u16>,
    /// optional check of the value read back after the command
    #[serde(skip)]
    pub validate: Option<fn(&[u8]) -> bool>,
}

/// what an init command does
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum InitAction {
    /// write `data` to the register `ado` of the slave
    RegisterWrite {
        #[serde(deserialize_with = "hex_or_decimal", default)]
        ado: u16,
        data: Vec<u8>,
    },
    /// download `data` into the dictionary object `index:subIndex` through CoE
    #[serde(rename_all = "camelCase")]
    CoeSdoDownload {
        #[serde(deserialize_with = "hex_or_decimal", default)]
        index: u16,
        #[serde(default)]
        sub_index: u8,
        data: Vec<u8>,
    },
    /// write `data` to the drive parameter `idn` through SoE
    #[serde(rename_all = "camelCase")]
    SoeWrite {
        op_code: u8,
        drive_no: u8,
        #[serde(deserialize_with = "hex_or_decimal", default)]
        idn: u16,
        #[serde(default)]
        data: Vec<u8>,
    },
}

impl InitAction {
    /// the value bytes carried by the command
    pub fn data(&self) -> &[u8] {
        match self {
            Self::RegisterWrite { data, .. } => data,
            Self::CoeSdoDownload { data, .. } => data,
            Self::SoeWrite { data, .. } => data,
        }
    }
}

/// one step of the application-layer state machine, by its two-letter code
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Transition {
    IP,
    PS,
    SO,
    OS,
    SP,
    PI,
    SI,
    OI,
    OP,
    PO,
}

impl Transition {
    /// the state this transition leaves
    pub fn from(self) -> AlState {
        use AlState::*;
        match self {
            Self::IP => Init,
            Self::PS | Self::PI | Self::PO => PreOperational,
            Self::SO | Self::SP | Self::SI => SafeOperational,
            Self::OS | Self::OI | Self::OP => Operational,
        }
    }
    /// the state this transition enters
    pub fn to(self) -> AlState {
        use AlState::*;
        match self {
            Self::PI | Self::SI | Self::OI => Init,
            Self::IP | Self::SP | Self::OP => PreOperational,
            Self::PS | Self::OS => SafeOperational,
            Self::SO | Self::PO => Operational,
        }
    }
    /// the transition between two states, `None` when they are equal
    pub fn between(from: AlState, to: AlState) -> Option<Self> {
        use AlState::*;
        Some(match (from, to) {
            (Init, PreOperational) => Self::IP,
            (PreOperational, SafeOperational) => Self::PS,
            (SafeOperational, Operational) => Self::SO,
            (Operational, SafeOperational) => Self::OS,
            (SafeOperational, PreOperational) => Self::SP,
            (PreOperational, Init) => Self::PI,
            (SafeOperational, Init) => Self::SI,
            (Operational, Init) => Self::OI,
            (Operational, PreOperational) => Self::OP,
            (PreOperational, Operational) => Self::PO,
            (Init, SafeOperational) | (Init, Operational) => return None,
            (Init, Init) | (PreOperational, PreOperational) | (SafeOperational, SafeOperational) | (Operational, Operational) => return None,
        })
    }
}

/// deserialize an integer given either as a number or as decimal/hexadecimal text
fn hex_or_decimal<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<u64>,
{
    use serde::de::{Error, Visitor};
    struct HexOrDecimal<T>(core::marker::PhantomData<T>);

    impl<T: TryFrom<u64>> Visitor<'_> for HexOrDecimal<T> {
        type Value = T;

        fn expecting(&self, formatter: &mut core::fmt::Formatter) -> core::fmt::Result {
            formatter.write_str("an integer, or a decimal or 0x-prefixed string")
        }
        fn visit_u64<E: Error>(self, value: u64) -> Result<T, E> {
            T::try_from(value).map_err(|_| E::custom("integer out of range for the field"))
        }
        fn visit_i64<E: Error>(self, value: i64) -> Result<T, E> {
            let value = u64::try_from(value).map_err(|_| E::custom("negative integer for an unsigned field"))?;
            self.visit_u64(value)
        }
        fn visit_str<E: Error>(self, value: &str) -> Result<T, E> {
            let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
                Some(hex) => u64::from_str_radix(hex, 16),
                None => value.parse(),
            }
            .map_err(|_| E::custom("malformed integer text"))?;
            self.visit_u64(parsed)
        }
    }
    deserializer.deserialize_any(HexOrDecimal(core::marker::PhantomData))
}
