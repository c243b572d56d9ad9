//! a scripted wire driver emulating a small segment: registers, the SII read protocol,
//! the AL state machine, a CoE mailbox, and the two monitor primitives.

use etherbus::driver::{CycleStatus, DriverError, EmergencyFrame, MailboxPoll, PduCommand, SlaveAddress, WireDriver};
use std::collections::{HashMap, VecDeque};

/// what the driver wrote where, in order
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct WriteRecord {
    pub station: u16,
    pub register: u16,
}

pub struct MockSlave {
    pub station: u16,
    pub eeprom: Vec<u8>,
    pub al_status: u16,
    pub watchdog: Option<u16>,
    /// reject sync-manager watchdog writes with a working counter of 0
    pub watchdog_nack: bool,
    pub dc_register: bool,
    /// CoE dictionary served by the mailbox emulation, keyed by (index, sub)
    pub dictionary: Option<HashMap<(u16, u8), Vec<u8>>>,
    sii_address: u32,
    pending_response: Option<Vec<u8>>,
}

impl MockSlave {
    pub fn new(eeprom: Vec<u8>) -> Self {
        Self {
            station: 0,
            eeprom,
            al_status: 0x0001,
            watchdog: None,
            watchdog_nack: false,
            dc_register: false,
            dictionary: None,
            sii_address: 0,
            pending_response: None,
        }
    }
}

pub struct MockDriver {
    pub slaves: Vec<MockSlave>,
    /// scripted outcomes for `exchange`, repeating the last one when exhausted
    pub cycles: VecDeque<CycleStatus>,
    pub mailbox_outcome: MailboxPoll,
    pub emergency: Option<EmergencyFrame>,
    /// every `check_mailbox` call as (slave, status register, last toggle)
    pub mailbox_checks: Vec<(u16, u16, u8)>,
    pub writes: Vec<WriteRecord>,
    pub close_count: u32,
    pub open_result: Result<(), DriverError>,
}

impl MockDriver {
    pub fn new(slaves: Vec<MockSlave>) -> Self {
        Self {
            slaves,
            cycles: VecDeque::new(),
            mailbox_outcome: MailboxPoll::Empty,
            emergency: None,
            mailbox_checks: Vec::new(),
            writes: Vec::new(),
            close_count: 0,
            open_result: Ok(()),
        }
    }

    /// pre-assign station addresses 0x1000 + index, as the master would
    pub fn with_stations(mut self) -> Self {
        for (index, slave) in self.slaves.iter_mut().enumerate() {
            slave.station = 0x1000 + index as u16;
        }
        self
    }

    fn resolve(&mut self, slave: SlaveAddress) -> Option<usize> {
        match slave {
            SlaveAddress::AutoIncremented(position) => {
                let position = usize::from(position);
                (position < self.slaves.len()).then_some(position)
            }
            SlaveAddress::Fixed(station) => self.slaves.iter().position(|slave| slave.station == station),
            SlaveAddress::Broadcast | SlaveAddress::Logical => None,
        }
    }

    fn write_register(&mut self, index: usize, register: u16, data: &[u8]) -> u16 {
        let station = self.slaves[index].station;
        self.writes.push(WriteRecord { station, register });
        match register {
            0x0010 => {
                self.slaves[index].station = u16::from_le_bytes([data[0], data[1]]);
                1
            }
            0x0120 => {
                // the requested state is immediately reached, no error
                let control = u16::from_le_bytes([data[0], data[1]]);
                self.slaves[index].al_status = control & 0x000f;
                1
            }
            0x0420 => {
                if self.slaves[index].watchdog_nack {
                    return 0;
                }
                self.slaves[index].watchdog = Some(u16::from_le_bytes([data[0], data[1]]));
                1
            }
            0x0502 => {
                // SII control + word address: the request completes instantly
                self.slaves[index].sii_address = u32::from_le_bytes([data[2], data[3], data[4], data[5]]);
                1
            }
            0x1000 if self.slaves[index].dictionary.is_some() => {
                self.mailbox_request(index, data);
                1
            }
            _ => 1,
        }
    }

    fn read_register(&mut self, index: usize, register: u16, data: &mut [u8]) -> u16 {
        let slave = &mut self.slaves[index];
        match register {
            0x0130 => {
                data[..2].copy_from_slice(&slave.al_status.to_le_bytes());
                1
            }
            0x0134 => {
                data[..2].copy_from_slice(&0u16.to_le_bytes());
                1
            }
            0x0420 => {
                data[..2].copy_from_slice(&slave.watchdog.unwrap_or(1000).to_le_bytes());
                1
            }
            0x0502 => {
                // not busy, word addressing, 4-byte reads
                data[..2].copy_from_slice(&0x0080u16.to_le_bytes());
                1
            }
            0x0508 => {
                let start = slave.sii_address as usize * 2;
                for (position, byte) in data.iter_mut().enumerate() {
                    *byte = slave.eeprom.get(start + position).copied().unwrap_or(0xff);
                }
                1
            }
            0x0980 => {
                if !slave.dc_register {
                    return 0;
                }
                data.fill(0);
                1
            }
            0x0805 => {
                // master→slave mailbox buffer, always ready
                if slave.dictionary.is_none() {
                    return 0;
                }
                data.fill(0);
                1
            }
            0x080d => {
                if slave.dictionary.is_none() {
                    return 0;
                }
                data[0] = if slave.pending_response.is_some() { 0x08 } else { 0x00 };
                1
            }
            register if slave.dictionary.is_some() && register == 0x1080 => {
                if let Some(response) = slave.pending_response.take() {
                    let n = response.len().min(data.len());
                    data[..n].copy_from_slice(&response[..n]);
                    1
                } else {
                    0
                }
            }
            _ => 0,
        }
    }

    /// parse one mailbox frame holding a CoE SDO request and stage the response
    fn mailbox_request(&mut self, index: usize, frame: &[u8]) {
        let slave = &mut self.slaves[index];
        let Some(dictionary) = slave.dictionary.as_mut() else { return };
        // mailbox header: length, address, flags, type|counter
        let ty = frame[5] & 0x0f;
        if ty != 0x3 {
            return;
        }
        let payload = &frame[6..];
        // CoE header then SDO header
        let command = (payload[2] >> 5) & 0x7;
        let index_field = u16::from_le_bytes([payload[3], payload[4]]);
        let sub = payload[5];

        let mut response = vec![0u8; 6 + 2 + 4 + 4];
        // CoE header: SDO response service
        response[6..8].copy_from_slice(&(3u16 << 12).to_le_bytes());
        let key = (index_field, sub);
        match command {
            // upload request
            2 => match dictionary.get(&key) {
                Some(value) if value.len() <= 4 => {
                    let free = 4 - value.len() as u8;
                    // sized + expedited + free size + upload response
                    response[8] = 0x03 | (free << 2) | (2 << 5);
                    response[9..11].copy_from_slice(&index_field.to_le_bytes());
                    response[11] = sub;
                    response[12..12 + value.len()].copy_from_slice(value);
                }
                _ => abort(&mut response, index_field, sub, 0x0602_0000),
            },
            // download request
            1 => {
                let expedited = payload[2] & 0x02 != 0;
                let value = if expedited {
                    let free = usize::from((payload[2] >> 2) & 0x3);
                    payload[6..10 - free].to_vec()
                } else {
                    let total = u32::from_le_bytes([payload[6], payload[7], payload[8], payload[9]]) as usize;
                    payload[10..10 + total].to_vec()
                };
                dictionary.insert(key, value);
                // download response
                response[8] = 3 << 5;
                response[9..11].copy_from_slice(&index_field.to_le_bytes());
                response[11] = sub;
            }
            _ => abort(&mut response, index_field, sub, 0x0504_0001),
        }
        // mailbox header of the response: CoE, 10 bytes of payload
        response[0..2].copy_from_slice(&10u16.to_le_bytes());
        response[5] = 0x3;
        slave.pending_response = Some(response);
    }
}

fn abort(response: &mut [u8], index: u16, sub: u8, code: u32) {
    response[8] = 4 << 5;
    response[9..11].copy_from_slice(&index.to_le_bytes());
    response[11] = sub;
    response[12..16].copy_from_slice(&code.to_le_bytes());
}

impl WireDriver for MockDriver {
    async fn open(&mut self) -> Result<(), DriverError> {
        self.open_result
    }

    async fn pdu(&mut self, command: PduCommand, slave: SlaveAddress, memory: u16, data: &mut [u8]) -> Result<u16, DriverError> {
        match slave {
            SlaveAddress::Broadcast => match command {
                PduCommand::BRD => Ok(self.slaves.len() as u16),
                _ => {
                    let count = self.slaves.len();
                    let owned = data.to_vec();
                    for index in 0..count {
                        self.write_register(index, memory, &owned);
                    }
                    Ok(count as u16)
                }
            },
            _ => {
                let Some(index) = self.resolve(slave) else { return Ok(0) };
                Ok(match command {
                    PduCommand::APRD | PduCommand::FPRD | PduCommand::BRD | PduCommand::LRD => {
                        self.read_register(index, memory, data)
                    }
                    _ => {
                        let owned = data.to_vec();
                        self.write_register(index, memory, &owned)
                    }
                })
            }
        }
    }

    async fn exchange(&mut self, _outputs: &[u8], _inputs: &mut [u8]) -> CycleStatus {
        match self.cycles.len() {
            0 => CycleStatus::Wkc(self.slaves.len() as u16),
            1 => *self.cycles.front().unwrap(),
            _ => self.cycles.pop_front().unwrap(),
        }
    }

    async fn check_mailbox(&mut self, slave: u16, status_register: u16, last_toggle: u8) -> MailboxPoll {
        self.mailbox_checks.push((slave, status_register, last_toggle));
        self.mailbox_outcome
    }

    fn last_emergency(&mut self) -> Option<EmergencyFrame> {
        self.emergency
    }

    fn close(&mut self) {
        self.close_count += 1;
    }
}

/// build an EEPROM image: identity words, mailbox protocol word, then categories
pub struct EepromBuilder {
    bytes: Vec<u8>,
    categories: Vec<(u16, Vec<u8>)>,
}

impl EepromBuilder {
    pub fn new(vendor: u32, product: u32, revision: u32, serial: u32) -> Self {
        let mut bytes = vec![0u8; 0x80];
        bytes[0x10..0x14].copy_from_slice(&vendor.to_le_bytes());
        bytes[0x14..0x18].copy_from_slice(&product.to_le_bytes());
        bytes[0x18..0x1c].copy_from_slice(&revision.to_le_bytes());
        bytes[0x1c..0x20].copy_from_slice(&serial.to_le_bytes());
        Self { bytes, categories: Vec::new() }
    }

    /// set the mailbox protocols word (bit 2 is CoE)
    pub fn protocols(mut self, word: u16) -> Self {
        self.bytes[0x38..0x3a].copy_from_slice(&word.to_le_bytes());
        self
    }

    /// general category: CoE/FoE/EoE capability bytes
    pub fn general(self, coe: bool, foe: bool, eoe: bool) -> Self {
        let mut body = vec![0u8; 8];
        body[5] = u8::from(coe);
        body[6] = u8::from(foe);
        body[7] = u8::from(eoe);
        self.category(30, body)
    }

    /// one PDO category (50 = TxPdo/inputs, 51 = RxPdo/outputs) with one PDO of the given entries
    pub fn pdo_category(self, category: u16, pdo_index: u16, entries: &[(u16, u8, u8)]) -> Self {
        let mut body = Vec::new();
        body.extend_from_slice(&pdo_index.to_le_bytes());
        body.push(entries.len() as u8);
        body.push(if category == 50 { 3 } else { 2 });
        body.extend_from_slice(&[0, 0, 0, 0]);
        for &(index, sub, bits) in entries {
            body.extend_from_slice(&index.to_le_bytes());
            body.push(sub);
            body.push(0);
            body.push(0);
            body.push(bits);
            body.extend_from_slice(&[0, 0]);
        }
        self.category(category, body)
    }

    /// an (empty) distributed-clock category
    pub fn dc(self) -> Self {
        self.category(60, vec![0u8; 4])
    }

    fn category(mut self, category: u16, mut body: Vec<u8>) -> Self {
        if body.len() % 2 != 0 {
            body.push(0);
        }
        self.categories.push((category, body));
        self
    }

    pub fn build(mut self) -> Vec<u8> {
        for (category, body) in &self.categories {
            self.bytes.extend_from_slice(&category.to_le_bytes());
            self.bytes.extend_from_slice(&((body.len() / 2) as u16).to_le_bytes());
            self.bytes.extend_from_slice(body);
        }
        self.bytes.extend_from_slice(&0xffffu16.to_le_bytes());
        self.bytes.extend_from_slice(&0u16.to_le_bytes());
        self.bytes
    }
}
