/*!
    Etherbus is a crate implementing an EtherCAT master runtime conforming to ETG.1500
    Class B, with an API as close as possible to the concepts of the ethercat protocol.

    The master sits above a wire driver owning the raw L2 socket: it discovers what is on
    the segment, walks every slave through the application-layer state machine, and
    exchanges process data cyclically with deterministic pacing left to the caller, while
    surfacing asynchronous mailbox and emergency events.

    ## It mainly features

    - [Master] for the whole lifecycle of one segment: initialization, state requests,
      cyclic exchange, SDO access, events
    - [discovery] for synthesizing a [Network](config::Network) description from whatever
      is wired
    - [RawMaster] and the structures based on it for lower level access to the slaves

    ## Complete feature list

    - [x] typed access to slave registers and SII
    - [x] discovery
        + [x] topology walk and station addressing
        + [x] identity and capabilities from the SII
        + [x] PDO enumeration through CoE, SII categories as fallback
    - [x] state machine orchestration
        + [x] ordered transition paths with per-step init commands
        + [x] sync-manager watchdog pre-arming
        + [x] topology verification
    - [x] cyclic process data exchange
        + [x] variable mapping with bit granularity
        + [x] ride-through of transient losses
    - [x] mailbox
        + [x] CoE SDO read/write (expedited and normal)
        + [x] resilient status polling with toggle tracking
        + [x] emergency channel with per-slave deduplication
    - [ ] distributed clocks (out of Class B scope)
    - [ ] EoE / FoE
*/

pub mod can;
pub mod config;
pub mod cyclic;
pub mod data;
pub mod discovery;
pub mod driver;
#[allow(non_upper_case_globals)]
pub mod eeprom;
pub mod error;
pub mod esm;
pub mod mailbox;
pub mod mapping;
pub mod master;
pub mod monitor;
pub mod rawmaster;
#[allow(non_upper_case_globals)]
pub mod registers;
#[allow(non_upper_case_globals)]
pub mod sdo;
pub mod sii;

pub use crate::config::Network;
pub use crate::cyclic::CycleError;
pub use crate::data::{BitField, Field, PduData, TypeId};
pub use crate::driver::{CycleStatus, EmergencyFrame, MailboxPoll, SlaveAddress, WireDriver};
pub use crate::error::{EthercatError, EthercatResult};
pub use crate::master::{Emergency, Event, Master};
pub use crate::rawmaster::RawMaster;
pub use crate::registers::AlState;
pub use crate::sdo::Sdo;
