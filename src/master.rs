/*!
    the master facade: owns the network description, the process data image, the mapping
    tables, the state machine and the periodic monitors, and exposes the operations of the
    runtime.

    ## Note

    The master is single-owner: exactly one place in the program holds it, and everything
    touching the wire goes through `&mut self`, so no two wire operations can overlap. The
    mailbox and emergency monitors are cooperatively multiplexed with the cycle: whichever
    is due runs when the master holds the wire, the cycle always first. Memory operations
    (variable and byte access on the image, lookups, subscriptions) never suspend.
*/

use crate::{
    can::{Can, CanError},
    config::Network,
    cyclic::{Cyclic, CycleError},
    data::PduData,
    discovery,
    driver::WireDriver,
    error::{EthercatError, EthercatResult},
    esm::{self, Esm, TopologyError, TransitionError},
    mailbox::Mailbox,
    mapping::{Mapping, ProcessImage},
    monitor::{EmergencyMonitor, MailboxFailure, MailboxMonitor, MonitorEvent},
    rawmaster::RawMaster,
    registers::AlState,
    sii::Sii,
};
use tokio::sync::broadcast;

/// one deduplicated CoE emergency
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Emergency {
    pub slave: usize,
    pub error_code: u16,
    pub error_register: u8,
}

/// what the master publishes to its subscribers
#[derive(Clone, Debug)]
pub enum Event {
    /// the segment moved to another application-layer state
    StateChange { previous: AlState, current: AlState },
    /// a slave reported a CoE emergency
    Emergency(Emergency),
    /// the mailbox of a slave misbehaved, polling continues
    MailboxError { slave: usize, error: MailboxFailure },
}

/// the ethercat master runtime over one wire driver
pub struct Master<D: WireDriver> {
    raw: RawMaster<D>,
    network: Network,
    mapping: Mapping,
    image: ProcessImage,
    esm: Esm,
    cyclic: Cyclic,
    mailbox_monitor: MailboxMonitor,
    emergency_monitor: EmergencyMonitor,
    events: broadcast::Sender<Event>,
    last_emergency: Option<Emergency>,
    initialized: bool,
    closed: bool,
}

impl<D: WireDriver> Master<D> {
    /**
        build a master over a wire driver from a network description.

        The description is validated and the process data image is laid out here; nothing
        touches the wire before [Self::initialize].
    */
    pub fn new(driver: D, network: Network) -> EthercatResult<Self> {
        network.validate().map_err(EthercatError::Master)?;
        let mapping = Mapping::new(&network)?;
        let image = ProcessImage::new(mapping.output_size(), mapping.input_size());
        let raw = RawMaster::new(driver, network.master.pdu_timeout(), network.master.pdu_retries);
        let (events, _) = broadcast::channel(64);
        Ok(Self {
            mailbox_monitor: MailboxMonitor::new(&network),
            emergency_monitor: EmergencyMonitor::new(&network),
            raw,
            network,
            mapping,
            image,
            esm: Esm::new(),
            cyclic: Cyclic::new(),
            events,
            last_emergency: None,
            initialized: false,
            closed: false,
        })
    }

    /// the description this master runs
    pub fn network(&self) -> &Network {
        &self.network
    }
    /**
        return a reference to the low level master access.

        This method is marked unsafe since letting the user touch the wire may break the
        protocol sequences performed by the runtime. Accessing the low level is
        communication-unsafe.
    */
    pub unsafe fn raw_mut(&mut self) -> &mut RawMaster<D> {
        &mut self.raw
    }
    /// subscribe to the events published by the master
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }
    /// the current global application-layer state
    pub fn state(&self) -> AlState {
        self.esm.current()
    }
    /// count of consecutive missed cycles, 0 after any successful cycle
    pub fn missed_cycles(&self) -> u32 {
        self.cyclic.missed()
    }
    /// true between a successful [Self::initialize] and [Self::close]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// bring the link up (riding through a busy medium) and start the monitor timers
    pub async fn initialize(&mut self) -> EthercatResult<()> {
        self.guard()?;
        discovery::open_with_backoff(self.raw.driver_mut()).await?;
        self.initialized = true;
        log::info!(
            "master initialized: {} slaves, image {}+{} bytes",
            self.network.slaves.len(),
            self.image.output_size(),
            self.image.input_size(),
        );
        Ok(())
    }

    /// verify that the segment matches the description, slave by slave in order
    pub async fn verify_topology(&mut self) -> Result<(), TopologyError> {
        esm::verify_topology(&mut self.raw, &self.network).await
    }

    /// drive every slave to the target state and publish the state change
    pub async fn request_state(&mut self, target: AlState) -> Result<(), TransitionError> {
        if self.closed {
            return Err(TransitionError::Communication("master is closed"));
        }
        let (previous, current) = self.esm.request(&mut self.raw, &self.network, target).await?;
        if previous != current {
            self.publish(Event::StateChange { previous, current });
        }
        Ok(())
    }

    /// the AL status code of one slave, for diagnostics
    pub async fn al_status_code(&mut self, slave: usize) -> Result<u16, TransitionError> {
        self.esm.al_status_code(&mut self.raw, &self.network, slave).await
    }

    /**
        run one cycle of the process data exchange and return the signed working counter
        (`-2`/`-4` for an absorbed transient miss).

        Monitors that are due run right after the frame, on the same wire ownership.
    */
    pub async fn run_cycle(&mut self) -> Result<i32, CycleError> {
        if self.closed {
            return Err(CycleError::Driver(-1));
        }
        let timeout = self.network.master.pdu_timeout();
        let result = self
            .cyclic
            .run(self.raw.driver_mut(), timeout, &mut self.mapping, &mut self.image)
            .await;
        self.poll_monitors().await;
        result
    }

    /// run whichever periodic monitor is due. Called by [Self::run_cycle]; callers pacing
    /// their own loop may also invoke it while the bus is otherwise idle.
    pub async fn poll_monitors(&mut self) {
        if self.closed {
            return;
        }
        let now = tokio::time::Instant::now();
        if self.mailbox_monitor.due(now) {
            let events = self.mailbox_monitor.poll(self.raw.driver_mut(), now).await;
            for event in events {
                self.dispatch(event);
            }
        }
        let now = tokio::time::Instant::now();
        if self.emergency_monitor.due(now) {
            if let Some(event) = self.emergency_monitor.poll(self.raw.driver_mut(), now) {
                self.dispatch(event);
            }
        }
    }

    /// stage a value for an output variable, serialized by the next cycle
    pub fn write_variable<T: PduData>(&mut self, name: &str, value: T) -> EthercatResult<()> {
        self.mapping.set(name, value)
    }
    /// the value of a variable: the snapshot of the last successful cycle for an input,
    /// the pending value for an output
    pub fn read_variable<T: PduData>(&self, name: &str) -> EthercatResult<T> {
        self.mapping.get(name)
    }
    /// the mapping of one variable, if it survived matching
    pub fn variable(&self, name: &str) -> Option<&crate::mapping::VariableMapping> {
        self.mapping.lookup(name)
    }

    /// one byte of a slave's section of the image, bypassing the mapping table
    pub fn read_pdo_byte(&self, slave: usize, offset: usize, output: bool) -> EthercatResult<u8> {
        let position = self.pdo_byte_position(slave, offset, output)?;
        Ok(self.image.bytes()[position])
    }
    /// write one byte of a slave's output section, bypassing the mapping table
    pub fn write_pdo_byte(&mut self, slave: usize, offset: usize, value: u8) -> EthercatResult<()> {
        let position = self.pdo_byte_position(slave, offset, true)?;
        self.image.bytes_mut()[position] = value;
        Ok(())
    }
    fn pdo_byte_position(&self, slave: usize, offset: usize, output: bool) -> EthercatResult<usize> {
        let descriptor = self.network.slaves.get(slave).ok_or(EthercatError::Master("slave index out of range"))?;
        let process = descriptor
            .process_data
            .as_ref()
            .ok_or(EthercatError::Master("slave has no process data"))?;
        let (base, start, bits) = if output {
            (0, process.output_byte_offset, process.output_bit_length)
        } else {
            (self.image.output_size(), process.input_byte_offset, process.input_bit_length)
        };
        if offset >= (bits + 7) / 8 {
            return Err(EthercatError::Master("byte offset outside the slave's section"));
        }
        Ok(base + start + offset)
    }

    /// the whole process data image, `[outputs | inputs]`
    pub fn pdi(&self) -> &[u8] {
        self.image.bytes()
    }
    /// the whole process data image, writable. For bulk callers; offsets are not re-checked.
    pub fn pdi_mut(&mut self) -> &mut [u8] {
        self.image.bytes_mut()
    }

    /// read a dictionary object of one slave through CoE, returning the transferred length
    pub async fn sdo_read(&mut self, slave: usize, index: u16, sub: u8, data: &mut [u8]) -> EthercatResult<usize, CanError> {
        let mut coe = self.coe(slave)?;
        coe.sdo_read_slice(index, sub, data).await
    }
    /// write a dictionary object of one slave through CoE
    pub async fn sdo_write(&mut self, slave: usize, index: u16, sub: u8, data: &[u8]) -> EthercatResult<(), CanError> {
        let mut coe = self.coe(slave)?;
        coe.sdo_write_slice(index, sub, data).await
    }
    fn coe(&mut self, slave: usize) -> EthercatResult<Can<'_, D>, CanError> {
        if self.closed {
            return Err(EthercatError::Master("master is closed"));
        }
        let descriptor = self.network.slaves.get(slave).ok_or(EthercatError::Master("slave index out of range"))?;
        let mailbox = descriptor
            .mailbox
            .as_ref()
            .filter(|mailbox| mailbox.coe)
            .ok_or(EthercatError::Master("slave does not support CoE"))?;
        let station = descriptor.station_address(slave);
        Ok(Can::new(Mailbox::new(
            &mut self.raw,
            station,
            mailbox.write_buffer(),
            mailbox.read_buffer(),
            self.network.master.mailbox_timeout(),
        )))
    }

    /// read raw words from a slave's EEPROM through the SII
    pub async fn read_eeprom(&mut self, slave: usize, word_address: u16, data: &mut [u8]) -> EthercatResult<()> {
        self.guard()?;
        let descriptor = self.network.slaves.get(slave).ok_or(EthercatError::Master("slave index out of range"))?;
        let address = crate::driver::SlaveAddress::Fixed(descriptor.station_address(slave));
        let timeout = self.network.master.eeprom_timeout();
        let mut sii = Sii::new(&mut self.raw, address, timeout).await.map_err(|error| error.map(|_| ()))?;
        sii.read_slice(word_address * 2, data).await.map_err(|error| error.map(|_| ()))
    }

    /// re-arm the mailbox poll with a new period, 0 disables polling
    pub fn set_mailbox_poll_interval(&mut self, period_ms: u32) {
        self.mailbox_monitor.set_period(period_ms);
    }

    /// the last emergency dispatched to subscribers, if any
    pub fn last_emergency(&self) -> Option<Emergency> {
        self.last_emergency
    }

    /// stop the monitors and release the driver. Idempotent: a second call performs no I/O.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.initialized = false;
        self.raw.driver_mut().close();
        log::info!("master closed");
    }

    fn guard(&self) -> EthercatResult<()> {
        if self.closed {
            return Err(EthercatError::Master("master is closed"));
        }
        Ok(())
    }

    fn dispatch(&mut self, event: MonitorEvent) {
        match event {
            MonitorEvent::NewMail { slave } => {
                // the mailbox content itself is fetched by whoever asked for it
                log::debug!("slave {} signalled new mail", slave);
            }
            MonitorEvent::MailboxError { slave, error } => {
                self.publish(Event::MailboxError { slave, error });
            }
            MonitorEvent::Emergency { slave, error_code, error_register } => {
                let emergency = Emergency { slave, error_code, error_register };
                self.last_emergency = Some(emergency);
                self.publish(Event::Emergency(emergency));
            }
        }
    }

    fn publish(&self, event: Event) {
        // a send error only means nobody subscribed
        let _ = self.events.send(event);
    }
}

impl<D: WireDriver> Drop for Master<D> {
    fn drop(&mut self) {
        self.close();
    }
}
