/*!
    the cyclic exchange engine.

    One [Cyclic::run] call performs the full Tx/Rx of a single logical read/write frame
    covering the whole process data image. The call is single-shot: pacing and scheduling
    are the caller's responsibility.

    ## Ride-through

    Transient losses are absorbed rather than surfaced: a PDU timeout or a working-counter
    mismatch increments a `missed` counter and is returned to the caller as its sentinel
    code (`-2` / `-4`) without raising. A successful frame resets the counter. Once
    [RIDE_THROUGH_LIMIT] consecutive frames are missed, the next miss escalates to a fatal
    [CycleError::CommsLost] or [CycleError::PdoIntegrity]. Any other driver failure is
    fatal immediately.
*/

use crate::{
    data::PackingError,
    driver::{CycleStatus, WireDriver},
    mapping::{Mapping, ProcessImage},
};
use core::{fmt, time::Duration};

/// how many consecutive transient losses are absorbed before the next one escalates
pub const RIDE_THROUGH_LIMIT: u32 = 5;

/// fatal outcome of a cycle
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CycleError {
    /// the bus stopped answering: [RIDE_THROUGH_LIMIT] PDU timeouts were absorbed and another one followed
    CommsLost { missed: u32 },
    /// frames come back but the working counter keeps diverging: slaves are missing or faulty
    PdoIntegrity { missed: u32 },
    /// the driver reported an unrecoverable failure
    Driver(i32),
    /// a mapped value could not be serialized into the image
    Image(PackingError),
}

impl fmt::Display for CycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CommsLost { missed } => write!(f, "communication lost after {} missed cycles", missed),
            Self::PdoIntegrity { missed } => write!(f, "process data integrity lost after {} missed cycles", missed),
            Self::Driver(code) => write!(f, "fatal driver failure {}", code),
            Self::Image(error) => write!(f, "process image access failed: {:?}", error),
        }
    }
}
impl std::error::Error for CycleError {}

impl From<PackingError> for CycleError {
    fn from(src: PackingError) -> Self {
        Self::Image(src)
    }
}

/// state of the cyclic exchange engine
pub struct Cyclic {
    missed: u32,
}

impl Cyclic {
    pub fn new() -> Self {
        Self { missed: 0 }
    }

    /// current count of consecutive missed cycles, 0 after any successful cycle
    pub fn missed(&self) -> u32 {
        self.missed
    }

    /**
        run one cycle: serialize pending outputs, exchange one frame, refresh input snapshots.

        Returns the signed working counter convention: the frame's working counter when it
        came back, `-2`/`-4` for an absorbed transient loss.
    */
    pub async fn run<D: WireDriver>(
        &mut self,
        driver: &mut D,
        timeout: Duration,
        mapping: &mut Mapping,
        image: &mut ProcessImage,
    ) -> Result<i32, CycleError> {
        // output serialize happens-before transmit
        mapping.serialize_outputs(image.bytes_mut())?;

        let (outputs, inputs) = image.halves_mut();
        let status = match tokio::time::timeout(timeout, driver.exchange(outputs, inputs)).await {
            Ok(status) => status,
            Err(_) => CycleStatus::PduTimeout,
        };

        match status {
            CycleStatus::Wkc(wkc) => {
                self.missed = 0;
                // input deserialize happens only on success
                mapping.deserialize_inputs(image.bytes())?;
                Ok(i32::from(wkc))
            }
            CycleStatus::PduTimeout => {
                if self.missed >= RIDE_THROUGH_LIMIT {
                    log::error!("communication lost: {} consecutive PDU timeouts", self.missed + 1);
                    return Err(CycleError::CommsLost { missed: self.missed + 1 });
                }
                self.missed += 1;
                log::warn!("cycle missed (PDU timeout), {}/{} absorbed", self.missed, RIDE_THROUGH_LIMIT);
                Ok(status.code())
            }
            CycleStatus::WkcMismatch => {
                if self.missed >= RIDE_THROUGH_LIMIT {
                    log::error!("process data integrity lost: {} consecutive WKC mismatches", self.missed + 1);
                    return Err(CycleError::PdoIntegrity { missed: self.missed + 1 });
                }
                self.missed += 1;
                log::warn!("cycle missed (WKC mismatch), {}/{} absorbed", self.missed, RIDE_THROUGH_LIMIT);
                Ok(status.code())
            }
            CycleStatus::Fault(code) => {
                log::error!("fatal driver failure {} during the cycle", code);
                Err(CycleError::Driver(code))
            }
        }
    }
}

impl Default for Cyclic {
    fn default() -> Self {
        Self::new()
    }
}
