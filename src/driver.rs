/*!
    boundary with the wire driver owning the raw L2 socket.

    The master core never touches the network itself: every frame goes through an
    implementor of [WireDriver]. The trait speaks in structured results rather than the
    sentinel integers of the wire convention (working counter if non-negative, `-2` for a
    PDU timeout, `-4` for a working-counter mismatch, any other negative for a fatal driver
    failure); [CycleStatus::code] gives back the sentinel form where callers want it.
*/

use core::future::Future;

/// dynamically specifies a destination address on the ethercat segment
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SlaveAddress {
    /// every slave will receive and execute
    Broadcast,
    /// address determined by the topology (0-based position of the slave in the segment, the wire encoding decrement is the driver's concern)
    AutoIncremented(u16),
    /// address set by the master previously
    Fixed(u16),
    /// the logical memory is the destination, all configured slaves are concerned
    Logical,
}

/// the possible PDU commands
#[derive(Default, Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum PduCommand {
    /// no operation
    #[default]
    NOP = 0x0,

    /// auto-incremented read
    APRD = 0x01,
    /// auto-incremented write
    APWR = 0x02,

    /// fixed-address read
    FPRD = 0x04,
    /// fixed-address write
    FPWR = 0x05,

    /// broadcast read
    BRD = 0x07,
    /// broadcast write
    BWR = 0x08,

    /// logical memory read
    LRD = 0x0A,
    /// logical memory write
    LWR = 0x0B,
    /// logical memory read & write
    LRW = 0x0C,
}

impl PduCommand {
    /// the read command matching the given address kind
    pub fn read(slave: SlaveAddress) -> Self {
        match slave {
            SlaveAddress::Broadcast => PduCommand::BRD,
            SlaveAddress::AutoIncremented(_) => PduCommand::APRD,
            SlaveAddress::Fixed(_) => PduCommand::FPRD,
            SlaveAddress::Logical => PduCommand::LRD,
        }
    }
    /// the write command matching the given address kind
    pub fn write(slave: SlaveAddress) -> Self {
        match slave {
            SlaveAddress::Broadcast => PduCommand::BWR,
            SlaveAddress::AutoIncremented(_) => PduCommand::APWR,
            SlaveAddress::Fixed(_) => PduCommand::FPWR,
            SlaveAddress::Logical => PduCommand::LWR,
        }
    }
}

/// failure reported by the driver for a single datagram or for bringing the link up
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DriverError {
    /// no answer came back within the driver's own deadline
    Timeout,
    /// the medium is locked by another master stack, the operation can be retried later
    Busy,
    /// the process lacks the privilege to open the raw socket, retrying is pointless
    Permission,
    /// unrecoverable driver failure, the code is driver-specific
    Fault(i32),
}

/// outcome of one whole-image logical exchange
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CycleStatus {
    /// the frame came back, carrying this working counter
    Wkc(u16),
    /// the frame never came back in time
    PduTimeout,
    /// the frame came back but the working counter did not match the expectation
    WkcMismatch,
    /// unrecoverable driver failure
    Fault(i32),
}

impl CycleStatus {
    /// the signed sentinel form of the wire convention
    pub fn code(self) -> i32 {
        match self {
            CycleStatus::Wkc(wkc) => i32::from(wkc),
            CycleStatus::PduTimeout => -2,
            CycleStatus::WkcMismatch => -4,
            CycleStatus::Fault(code) => code,
        }
    }
}

/// outcome of one resilient mailbox status check
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MailboxPoll {
    /// the mailbox is full and the toggle bit moved: a new frame is waiting
    NewMail,
    /// the mailbox is empty, the toggle did not move
    Empty,
    /// the mailbox looked full but the toggle never moved within the driver's retry budget
    RetriesExhausted,
    /// transient driver-side error, the code is driver-specific
    Error(i32),
}

/// the `last_toggle` value passed to [WireDriver::check_mailbox] on the first poll of a slave,
/// before any toggle state is known. The driver must then accept whatever toggle it reads.
pub const TOGGLE_UNKNOWN: u8 = 2;

/// one CoE emergency as recorded by the driver
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct EmergencyFrame {
    /// 0-based position of the reporting slave in the segment
    pub slave: u16,
    /// CoE emergency error code
    pub error_code: u16,
    /// CANopen error register
    pub error_register: u8,
}

/**
    trait implemented by the wire driver the master is built over

    One implementor owns one raw socket engine and is the only thing in the process
    touching it. The master guarantees mutual exclusion: no two methods of this trait are
    ever in flight at the same time.

    All futures returned here are expected to resolve eventually on their own; the master
    additionally bounds each call by the timeout configured for the matching operation.
*/
pub trait WireDriver {
    /// bring the link up. Opening a link that is already up is a no-op.
    /// [DriverError::Busy] is retried with backoff by the caller,
    /// [DriverError::Permission] aborts immediately
    fn open(&mut self) -> impl Future<Output = Result<(), DriverError>>;

    /// execute a single datagram and return its working counter
    fn pdu(
        &mut self,
        command: PduCommand,
        slave: SlaveAddress,
        memory: u16,
        data: &mut [u8],
    ) -> impl Future<Output = Result<u16, DriverError>>;

    /// one logical read/write frame covering the whole process data image:
    /// transmit `outputs`, fill `inputs` from what came back
    fn exchange(&mut self, outputs: &[u8], inputs: &mut [u8]) -> impl Future<Output = CycleStatus>;

    /**
        resilient mailbox status check with toggle verification.

        `last_toggle` is the toggle bit (0 or 1) observed by the previous successful check
        of this slave, or [TOGGLE_UNKNOWN] on the first check. The driver re-reads the
        status register until the toggle differs from `last_toggle` or its internal retry
        budget runs out.
    */
    fn check_mailbox(
        &mut self,
        slave: u16,
        status_register: u16,
        last_toggle: u8,
    ) -> impl Future<Output = MailboxPoll>;

    /// the most recent CoE emergency recorded by the driver, if any
    fn last_emergency(&mut self) -> Option<EmergencyFrame>;

    /// release the link. Must tolerate being called on a link that is already down.
    fn close(&mut self);
}
