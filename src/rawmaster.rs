/*!
    low level access to the physical memory of the slaves, one datagram at a time.

    [RawMaster] has no notion of what a register means, it only executes typed reads and
    writes over the wire driver, bounding every datagram by the configured PDU timeout and
    retrying it up to the configured count before surfacing the last failure category.
*/

use crate::{
    data::{Field, PduData},
    driver::{DriverError, PduCommand, SlaveAddress, WireDriver},
    error::{EthercatError, EthercatResult},
};
use core::time::Duration;

/// low level ethercat access, with no compile-time checking of the communication state
pub struct RawMaster<D: WireDriver> {
    driver: D,
    /// deadline for one datagram exchange
    pdu_timeout: Duration,
    /// how many times a failed datagram is reissued before reporting
    retries: u32,
}

impl<D: WireDriver> RawMaster<D> {
    pub fn new(driver: D, pdu_timeout: Duration, retries: u32) -> Self {
        Self { driver, pdu_timeout, retries }
    }

    /// direct access to the wire driver, for the engines multiplexed over it
    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }
    /// release the wire driver
    pub fn into_driver(self) -> D {
        self.driver
    }

    /// read the value pointed by `field` in the physical memory of `slave`
    pub async fn read<T: PduData>(&mut self, slave: SlaveAddress, field: Field<T>) -> EthercatResult<T> {
        let mut buffer = vec![0; field.len];
        self.pdu(PduCommand::read(slave), slave, field.byte as u16, &mut buffer).await?;
        Ok(T::unpack(&buffer)?)
    }

    /// write the given value at the place pointed by `field` in the physical memory of `slave`
    pub async fn write<T: PduData>(&mut self, slave: SlaveAddress, field: Field<T>, value: T) -> EthercatResult<()> {
        let mut buffer = vec![0; field.len];
        value.pack(&mut buffer)?;
        self.pdu(PduCommand::write(slave), slave, field.byte as u16, &mut buffer).await?;
        Ok(())
    }

    /// read a raw byte area of the physical memory of `slave`
    pub async fn read_slice(&mut self, slave: SlaveAddress, address: u16, value: &mut [u8]) -> EthercatResult<()> {
        self.pdu(PduCommand::read(slave), slave, address, value).await?;
        Ok(())
    }

    /// write a raw byte area of the physical memory of `slave`
    pub async fn write_slice(&mut self, slave: SlaveAddress, address: u16, value: &mut [u8]) -> EthercatResult<()> {
        self.pdu(PduCommand::write(slave), slave, address, value).await?;
        Ok(())
    }

    /// count the slaves present on the segment: a broadcast read is incremented by every
    /// slave it passes through, so its working counter is the segment population
    pub async fn count_slaves(&mut self) -> EthercatResult<usize> {
        let mut token = [0u8; 1];
        let wkc = self.pdu(PduCommand::BRD, SlaveAddress::Broadcast, 0, &mut token).await?;
        Ok(usize::from(wkc))
    }

    /**
        execute one datagram, retried per the configured budget.

        Failure categories surfaced after exhaustion:
        - timeout: the datagram or its answer got lost repeatedly
        - no acknowledge: the datagram came back with a working counter of 0, the addressed slave did not process it
        - unreachable: the driver cannot reach the medium at all
    */
    pub async fn pdu(&mut self, command: PduCommand, slave: SlaveAddress, memory: u16, data: &mut [u8]) -> EthercatResult<u16> {
        let mut last = EthercatError::Timeout("PDU exchange timed out");
        for attempt in 0..=self.retries {
            if attempt != 0 {
                log::debug!("retrying {:?} on {:?} at {:#x}, attempt {}", command, slave, memory, attempt);
            }
            match tokio::time::timeout(self.pdu_timeout, self.driver.pdu(command, slave, memory, data)).await {
                Err(_) => last = EthercatError::Timeout("PDU exchange timed out"),
                Ok(Err(DriverError::Timeout)) => last = EthercatError::Timeout("PDU exchange timed out"),
                Ok(Err(DriverError::Busy)) => last = EthercatError::Master("medium is locked by another master"),
                Ok(Err(DriverError::Permission)) => {
                    return Err(EthercatError::Master("process lacks the privilege to use the medium"))
                }
                Ok(Err(DriverError::Fault(code))) => {
                    log::error!("driver fault {} on {:?} {:?}", code, command, slave);
                    return Err(EthercatError::Protocol("fatal driver failure"));
                }
                Ok(Ok(wkc)) => {
                    if wkc == 0 && !matches!(slave, SlaveAddress::Broadcast | SlaveAddress::Logical) {
                        last = EthercatError::Protocol("slave did not acknowledge the datagram");
                    } else {
                        return Ok(wkc);
                    }
                }
            }
        }
        Err(last)
    }
}
