/*!
    orchestration of the application-layer state machine (ESM) across the whole segment.

    The four master-reachable states are ordered Init ↔ PreOp ↔ SafeOp ↔ Op. A request for
    a non-adjacent state is executed as the ordered sequence of single steps the standard
    defines. Each step applies the init commands tagged for it, optionally pre-arms the
    sync-manager watchdogs, then writes AL control and polls AL status until every slave
    settled or the transition timeout elapsed.
*/

use crate::{
    can::Can,
    config::{InitAction, Network, Transition},
    data::PduData,
    driver::{SlaveAddress, WireDriver},
    mailbox::{Mailbox, MailboxType, SoeHeader},
    rawmaster::RawMaster,
    registers::{self, AlControl, AlError, AlState},
    sii::Sii,
};
use core::fmt;

/// the ordered ladder of master-reachable states
const LADDER: [AlState; 4] = [
    AlState::Init,
    AlState::PreOperational,
    AlState::SafeOperational,
    AlState::Operational,
];

fn rank(state: AlState) -> usize {
    LADDER.iter().position(|&step| step == state).unwrap()
}

/// the ordered sequence of single transitions leading from one state to another
pub fn path(from: AlState, to: AlState) -> Vec<Transition> {
    let (mut at, mut steps) = (rank(from), Vec::new());
    let destination = rank(to);
    while at < destination {
        steps.push(Transition::between(LADDER[at], LADDER[at + 1]).unwrap());
        at += 1;
    }
    while at > destination {
        steps.push(Transition::between(LADDER[at], LADDER[at - 1]).unwrap());
        at -= 1;
    }
    steps
}

/// fatal outcome of a state request
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TransitionError {
    /// an init command failed after its retry budget
    InitCommand { slave: usize, step: Transition },
    /// a slave refused the transition, the AL status code tells why
    AlStatus { slave: usize, code: u16 },
    /// a slave did not reach the requested state within the transition timeout
    Timeout { step: Transition },
    /// the wire failed underneath the transition
    Communication(&'static str),
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InitCommand { slave, step } => {
                write!(f, "init command failed on slave {} during {:?}", slave, step)
            }
            Self::AlStatus { slave, code } => match AlError::from_code(*code) {
                Some(error) => write!(f, "slave {} refused the transition: {:?} ({:#06x})", slave, error, code),
                None => write!(f, "slave {} refused the transition with status code {:#06x}", slave, code),
            },
            Self::Timeout { step } => write!(f, "transition {:?} timed out", step),
            Self::Communication(message) => write!(f, "transition failed on the wire: {}", message),
        }
    }
}
impl std::error::Error for TransitionError {}

/// first difference found between the description and the segment
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TopologyError {
    /// the segment population does not match the description
    CountMismatch { expected: usize, found: usize },
    /// the identity read from this slave differs from the expected one
    Identity { slave: usize },
}

impl fmt::Display for TopologyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CountMismatch { expected, found } => {
                write!(f, "expected {} slaves on the segment, found {}", expected, found)
            }
            Self::Identity { slave } => write!(f, "identity mismatch on slave {}", slave),
        }
    }
}
impl std::error::Error for TopologyError {}

/// state machine orchestrator: tracks the global state and drives transitions
pub struct Esm {
    current: AlState,
}

impl Esm {
    pub fn new() -> Self {
        Self { current: AlState::Init }
    }

    /// the current global state: the state every slave reached
    pub fn current(&self) -> AlState {
        self.current
    }

    /**
        drive every slave to `target` and return `(previous, current)` on settlement.

        Init commands tagged for a step run in descriptor order before its AL request; a
        failing command retries per its own budget before the whole request fails.
    */
    pub async fn request<D: WireDriver>(
        &mut self,
        raw: &mut RawMaster<D>,
        network: &Network,
        target: AlState,
    ) -> Result<(AlState, AlState), TransitionError> {
        let previous = self.current;
        for step in path(self.current, target) {
            self.apply_init_commands(raw, network, step).await?;
            if step == Transition::PS {
                self.arm_watchdogs(raw, network).await;
            }
            self.switch(raw, network, step).await?;
            self.current = step.to();
            log::info!("segment reached {}", self.current);
        }
        Ok((previous, self.current))
    }

    /// run the init commands of every slave tagged for the given step, in descriptor order
    async fn apply_init_commands<D: WireDriver>(
        &mut self,
        raw: &mut RawMaster<D>,
        network: &Network,
        step: Transition,
    ) -> Result<(), TransitionError> {
        for (index, slave) in network.slaves.iter().enumerate() {
            for command in &slave.init_commands {
                if !command.transitions.contains(&step) {
                    continue;
                }
                let mut done = false;
                for attempt in 0..=command.retries {
                    if attempt != 0 {
                        log::debug!("retrying init command on slave {}, attempt {}", index, attempt);
                    }
                    if self.execute_command(raw, network, index, command).await {
                        done = true;
                        break;
                    }
                }
                if !done {
                    return Err(TransitionError::InitCommand { slave: index, step });
                }
            }
        }
        Ok(())
    }

    /// one attempt of one init command, true on success
    async fn execute_command<D: WireDriver>(
        &mut self,
        raw: &mut RawMaster<D>,
        network: &Network,
        slave: usize,
        command: &crate::config::InitCommand,
    ) -> bool {
        let descriptor = &network.slaves[slave];
        let address = descriptor.station_address(slave);
        match &command.action {
            InitAction::RegisterWrite { ado, data } => {
                let mut buffer = data.clone();
                let wkc = match raw
                    .pdu(crate::driver::PduCommand::FPWR, SlaveAddress::Fixed(address), *ado, &mut buffer)
                    .await
                {
                    Ok(wkc) => wkc,
                    Err(error) => {
                        log::warn!("register write {:#06x} failed: {}", ado, error);
                        return false;
                    }
                };
                if let Some(expected) = command.expected_wkc {
                    if wkc != expected {
                        log::warn!("register write {:#06x} answered wkc {} instead of {}", ado, wkc, expected);
                        return false;
                    }
                }
                if let Some(validate) = command.validate {
                    let mut readback = vec![0; data.len()];
                    if raw
                        .read_slice(SlaveAddress::Fixed(address), *ado, &mut readback)
                        .await
                        .is_err()
                        || !validate(&readback)
                    {
                        return false;
                    }
                }
                true
            }
            InitAction::CoeSdoDownload { index, sub_index, data } => {
                let Some(mailbox) = descriptor.mailbox.clone() else {
                    log::warn!("sdo download init command on slave {} without mailbox", slave);
                    return false;
                };
                let transport = Mailbox::new(
                    raw,
                    address,
                    mailbox.write_buffer(),
                    mailbox.read_buffer(),
                    network.master.mailbox_timeout(),
                );
                let mut coe = Can::new(transport);
                match coe.sdo_write_slice(*index, *sub_index, data).await {
                    Ok(()) => true,
                    Err(error) => {
                        log::warn!("sdo download {:#06x}:{} failed: {}", index, sub_index, error);
                        false
                    }
                }
            }
            InitAction::SoeWrite { op_code, drive_no, idn, data } => {
                let Some(mailbox) = descriptor.mailbox.clone() else {
                    log::warn!("soe write init command on slave {} without mailbox", slave);
                    return false;
                };
                let mut transport = Mailbox::new(
                    raw,
                    address,
                    mailbox.write_buffer(),
                    mailbox.read_buffer(),
                    network.master.mailbox_timeout(),
                );
                let mut frame = vec![0; SoeHeader::PACKED_SIZE + data.len()];
                let header = SoeHeader {
                    op_code: *op_code,
                    drive_no: *drive_no,
                    // the value element
                    elements: 0x40,
                    idn: *idn,
                };
                if header.pack(&mut frame).is_err() {
                    return false;
                }
                frame[SoeHeader::PACKED_SIZE..].copy_from_slice(data);
                if let Err(error) = transport.write(MailboxType::Servo, &frame).await {
                    log::warn!("soe write idn {:#06x} failed: {}", idn, error);
                    return false;
                }
                let mut answer = vec![0; frame.len().max(SoeHeader::PACKED_SIZE)];
                match transport.read(MailboxType::Servo, &mut answer).await {
                    // bit 4 of the first byte is the error flag of the SoE response
                    Ok(length) => length >= SoeHeader::PACKED_SIZE && answer[0] & 0x10 == 0,
                    Err(error) => {
                        log::warn!("soe answer for idn {:#06x} failed: {}", idn, error);
                        false
                    }
                }
            }
        }
    }

    /// write the sync-manager watchdog of every slave, warning only on rejection
    async fn arm_watchdogs<D: WireDriver>(&mut self, raw: &mut RawMaster<D>, network: &Network) {
        let Some(timeout) = network.master.watchdog_timeout_ms else { return };
        // ms to register units with the default watchdog divider (100 µs per unit)
        let value = (timeout * 10).min(u32::from(u16::MAX)) as u16;
        for (index, slave) in network.slaves.iter().enumerate() {
            let address = slave.station_address(index);
            if let Err(error) = raw
                .write(SlaveAddress::Fixed(address), registers::watchdog::sync_manager, value)
                .await
            {
                log::warn!("slave {} rejected the watchdog value {}: {}", index, value, error);
            }
        }
    }

    /// issue the AL request for one step and poll every slave until it settles
    async fn switch<D: WireDriver>(
        &mut self,
        raw: &mut RawMaster<D>,
        network: &Network,
        step: Transition,
    ) -> Result<(), TransitionError> {
        let target = step.to();
        for (index, slave) in network.slaves.iter().enumerate() {
            let address = slave.station_address(index);
            raw.write(SlaveAddress::Fixed(address), registers::al::control, AlControl::request(target))
                .await
                .map_err(|_| TransitionError::Communication("AL control write failed"))?;
        }

        let deadline = tokio::time::Instant::now() + network.master.state_transition_timeout();
        let mut pending: Vec<usize> = (0..network.slaves.len()).collect();
        while !pending.is_empty() {
            let mut settled = Vec::new();
            for &index in &pending {
                let address = network.slaves[index].station_address(index);
                let status = raw
                    .read(SlaveAddress::Fixed(address), registers::al::status)
                    .await
                    .map_err(|_| TransitionError::Communication("AL status read failed"))?;
                if status.error() {
                    let code = raw
                        .read(SlaveAddress::Fixed(address), registers::al::error)
                        .await
                        .unwrap_or(0);
                    return Err(TransitionError::AlStatus { slave: index, code });
                }
                if status.resolved() == Some(target) {
                    settled.push(index);
                }
            }
            pending.retain(|index| !settled.contains(index));
            if !pending.is_empty() && tokio::time::Instant::now() >= deadline {
                return Err(TransitionError::Timeout { step });
            }
        }
        Ok(())
    }

    /// read the AL status code of one slave, for diagnostics
    pub async fn al_status_code<D: WireDriver>(
        &mut self,
        raw: &mut RawMaster<D>,
        network: &Network,
        slave: usize,
    ) -> Result<u16, TransitionError> {
        let address = network
            .slaves
            .get(slave)
            .ok_or(TransitionError::Communication("slave index out of range"))?
            .station_address(slave);
        raw.read(SlaveAddress::Fixed(address), registers::al::error)
            .await
            .map_err(|_| TransitionError::Communication("AL status code read failed"))
    }
}

impl Default for Esm {
    fn default() -> Self {
        Self::new()
    }
}

/**
    verify that the segment matches the description: the identity of every slave is read
    back in slave order and compared. The revision number is not compared, the serial
    number only when the expected value is non-zero.
*/
pub async fn verify_topology<D: WireDriver>(
    raw: &mut RawMaster<D>,
    network: &Network,
) -> Result<(), TopologyError> {
    let found = raw.count_slaves().await.map_err(|_| TopologyError::CountMismatch {
        expected: network.slaves.len(),
        found: 0,
    })?;
    if found != network.slaves.len() {
        return Err(TopologyError::CountMismatch { expected: network.slaves.len(), found });
    }

    for (index, slave) in network.slaves.iter().enumerate() {
        let address = SlaveAddress::Fixed(slave.station_address(index));
        let timeout = network.master.eeprom_timeout();
        let Ok(mut sii) = Sii::new(raw, address, timeout).await else {
            return Err(TopologyError::Identity { slave: index });
        };
        let (Ok(vendor), Ok(product), Ok(serial)) = (
            sii.read(crate::eeprom::device::vendor).await,
            sii.read(crate::eeprom::device::product).await,
            sii.read(crate::eeprom::device::serial_number).await,
        ) else {
            return Err(TopologyError::Identity { slave: index });
        };

        let expected = &slave.identity;
        if vendor != expected.vendor_id || product != expected.product_code {
            return Err(TopologyError::Identity { slave: index });
        }
        if expected.serial_number != 0 && serial != expected.serial_number {
            return Err(TopologyError::Identity { slave: index });
        }
    }
    Ok(())
}
