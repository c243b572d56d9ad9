/*!
    the discovery engine: walk the segment, read what every slave is and can do, and
    synthesize a [Network] description sufficient to run it.

    Discovery is mutually exclusive with the cyclic exchange: it owns the wire for its
    whole duration. A medium locked by another master stack is retried with exponential
    backoff before giving up.
*/

use crate::{
    can::Can,
    config::{
        MailboxConfig, MasterConfig, Network, PdoEntryConfig, ProcessData, SlaveConfig,
    },
    data::TypeId,
    driver::{DriverError, SlaveAddress, WireDriver},
    eeprom,
    error::{EthercatError, EthercatResult},
    mailbox::Mailbox,
    rawmaster::RawMaster,
    registers::{self, AlControl, AlState},
    sdo,
    sii::{CategoryGeneral, CategoryPdo, CategoryPdoEntry, CategoryType, Sii},
};
use core::time::Duration;

/// backoff against a busy medium: base delay, cap, attempts, with ±20 % jitter
const BACKOFF_BASE_MS: u64 = 50;
const BACKOFF_CAP_MS: u64 = 500;
const BACKOFF_ATTEMPTS: u32 = 5;

/// what discovery could not settle for one slave
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IssueKind {
    /// the SII never answered, the identity is unknown
    SiiUnreadable,
    /// neither CoE nor the SII categories describe the process data, the slave is excluded
    /// from the cyclic frame until configured by hand
    ManualConfigurationRequired,
}

/// one per-slave problem met during discovery
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SlaveIssue {
    pub slave: usize,
    pub kind: IssueKind,
}

/// the outcome of a discovery run: a usable description, plus what could not be settled
pub struct DiscoveryReport {
    pub network: Network,
    pub issues: Vec<SlaveIssue>,
}

/// bring the link up, riding through a busy medium with exponential backoff
pub async fn open_with_backoff<D: WireDriver>(driver: &mut D) -> EthercatResult<()> {
    for attempt in 0..BACKOFF_ATTEMPTS {
        match driver.open().await {
            Ok(()) => return Ok(()),
            Err(DriverError::Busy) => {
                let delay = backoff_delay(attempt);
                log::info!("medium busy, retrying in {:?} (attempt {})", delay, attempt + 1);
                tokio::time::sleep(delay).await;
            }
            Err(DriverError::Permission) => {
                return Err(EthercatError::Master("process lacks the privilege to use the medium"))
            }
            Err(DriverError::Timeout) => return Err(EthercatError::Timeout("link open timed out")),
            Err(DriverError::Fault(code)) => {
                log::error!("driver fault {} while opening the link", code);
                return Err(EthercatError::Protocol("fatal driver failure"));
            }
        }
    }
    Err(EthercatError::Master("medium still busy after backoff"))
}

/// exponential backoff with ±20 % jitter
fn backoff_delay(attempt: u32) -> Duration {
    let nominal = (BACKOFF_BASE_MS << attempt).min(BACKOFF_CAP_MS);
    let jitter = 0.8 + 0.4 * fastrand::f64();
    Duration::from_millis((nominal as f64 * jitter) as u64)
}

/**
    walk the segment and produce a network description.

    `options` provides the timings of the emitted description (and the timeouts discovery
    itself runs with); its `dc_support` is recomputed from what the slaves declare.
*/
pub async fn discover<D: WireDriver>(raw: &mut RawMaster<D>, options: &MasterConfig) -> EthercatResult<DiscoveryReport> {
    open_with_backoff(raw.driver_mut()).await?;
    let count = raw.count_slaves().await?;
    log::info!("{} slaves on the segment", count);

    let mut issues = Vec::new();
    let mut slaves = Vec::with_capacity(count);
    let mut any_dc = false;

    // station addressing, identity and capabilities
    for position in 0..count {
        let station = 0x1000 + position as u16;
        raw.write(SlaveAddress::AutoIncremented(position as u16), registers::address::fixed, station)
            .await?;

        let mut slave = SlaveConfig {
            configured_address: station,
            auto_increment_address: (0i16).wrapping_sub(position as i16),
            ..Default::default()
        };

        match read_slave_info(raw, station, options).await {
            Ok(info) => {
                slave.identity = info.identity;
                slave.mailbox = info.mailbox;
                any_dc |= info.dc;
            }
            Err(error) => {
                log::warn!("slave {} has an unreadable SII: {}", position, error);
                issues.push(SlaveIssue { slave: position, kind: IssueKind::SiiUnreadable });
            }
        }
        slaves.push(slave);
    }

    // the mailbox protocols need PreOp before PDO enumeration can go through CoE
    request_preop(raw, &slaves, options).await;

    // PDO enumeration and PDI slot allocation, two running bit cursors
    let mut output_cursor: u64 = 0;
    let mut input_cursor: u64 = 0;
    for position in 0..slaves.len() {
        if issues.iter().any(|issue| issue.slave == position) {
            continue;
        }
        match enumerate_pdos(raw, &slaves[position], options).await {
            Ok(pdos) => {
                slaves[position].process_data =
                    allocate_slots(&pdos, &mut output_cursor, &mut input_cursor);
            }
            Err(()) => {
                log::warn!("slave {} needs manual process data configuration", position);
                issues.push(SlaveIssue { slave: position, kind: IssueKind::ManualConfigurationRequired });
            }
        }
    }

    let mut master = options.clone();
    master.dc_support = any_dc;
    let network = Network { master, slaves, process_image: None };
    Ok(DiscoveryReport { network, issues })
}

/// identity and capabilities of one slave, read from its SII
struct SlaveInfo {
    identity: crate::config::Identity,
    mailbox: Option<MailboxConfig>,
    dc: bool,
}

async fn read_slave_info<D: WireDriver>(
    raw: &mut RawMaster<D>,
    station: u16,
    options: &MasterConfig,
) -> EthercatResult<SlaveInfo> {
    let address = SlaveAddress::Fixed(station);
    let mut sii = Sii::new(raw, address, options.eeprom_timeout())
        .await
        .map_err(|error| error.map(|_| ()))?;

    let identity = crate::config::Identity {
        vendor_id: sii.read(eeprom::device::vendor).await.map_err(|e| e.map(|_| ()))?,
        product_code: sii.read(eeprom::device::product).await.map_err(|e| e.map(|_| ()))?,
        revision_number: sii.read(eeprom::device::revision).await.map_err(|e| e.map(|_| ()))?,
        serial_number: sii.read(eeprom::device::serial_number).await.map_err(|e| e.map(|_| ()))?,
    };

    // mailbox protocol bits, from the General category when present, from the protocol
    // word otherwise
    let general: Option<CategoryGeneral> = {
        let mut cursor = sii.categories();
        match cursor.seek(CategoryType::General).await {
            Ok(Some(_)) => cursor.unpack().await.ok(),
            _ => None,
        }
    };
    let protocols = sii.read(eeprom::mailbox::protocols).await.ok();
    let coe = general.map(|general| general.coe.sdo()).unwrap_or(false)
        || protocols.map(|support| support.coe()).unwrap_or(false);
    let eoe = general.map(|general| general.eoe.enable()).unwrap_or(false)
        || protocols.map(|support| support.eoe()).unwrap_or(false);
    let foe = general.map(|general| general.foe.enable()).unwrap_or(false)
        || protocols.map(|support| support.foe()).unwrap_or(false);

    let mailbox = if coe || eoe || foe {
        // Class B recommendation: SM1 status byte, 20 ms poll
        let mut mailbox = MailboxConfig { coe, eoe, foe, ..Default::default() };
        // recommended buffers from the SII, keeping defaults when unprogrammed
        if let Ok(offset) = sii.read(eeprom::mailbox::write::offset).await {
            if offset != 0 {
                mailbox.write_offset = offset;
                mailbox.write_size = sii.read(eeprom::mailbox::write::size).await.unwrap_or(mailbox.write_size);
            }
        }
        if let Ok(offset) = sii.read(eeprom::mailbox::read::offset).await {
            if offset != 0 {
                mailbox.read_offset = offset;
                mailbox.read_size = sii.read(eeprom::mailbox::read::size).await.unwrap_or(mailbox.read_size);
            }
        }
        Some(mailbox)
    } else {
        None
    };

    // DC capability: the category when present, the register probe otherwise
    let dc = {
        let mut cursor = sii.categories();
        match cursor.seek(CategoryType::Dc).await {
            Ok(Some(_)) => true,
            _ => raw.read(address, registers::dc::control).await.is_ok(),
        }
    };

    Ok(SlaveInfo { identity, mailbox, dc })
}

/// ask every slave for PreOp and poll until settled or the transition timeout elapsed.
/// Failures are tolerated here: slaves left behind will fail CoE enumeration and fall
/// back to their SII categories.
async fn request_preop<D: WireDriver>(raw: &mut RawMaster<D>, slaves: &[SlaveConfig], options: &MasterConfig) {
    for (position, slave) in slaves.iter().enumerate() {
        let address = SlaveAddress::Fixed(slave.station_address(position));
        if let Err(error) = raw
            .write(address, registers::al::control, AlControl::request(AlState::PreOperational))
            .await
        {
            log::debug!("slave {} did not take the PreOp request: {}", position, error);
        }
    }
    let deadline = tokio::time::Instant::now() + options.state_transition_timeout();
    for (position, slave) in slaves.iter().enumerate() {
        let address = SlaveAddress::Fixed(slave.station_address(position));
        loop {
            match raw.read(address, registers::al::status).await {
                Ok(status) if status.resolved() == Some(AlState::PreOperational) => break,
                Ok(_) if tokio::time::Instant::now() < deadline => continue,
                _ => {
                    log::debug!("slave {} not in PreOp for discovery", position);
                    break;
                }
            }
        }
    }
}

/// one PDO entry found during enumeration, before slot allocation
struct FoundEntry {
    name: String,
    index: u16,
    sub: u8,
    bit_length: u8,
    /// true for inputs (TxPDO), false for outputs (RxPDO)
    input: bool,
}

/// enumerate the PDO entries of one slave: CoE first, SII categories as fallback.
/// `Err(())` means both sources were tried and failed.
async fn enumerate_pdos<D: WireDriver>(
    raw: &mut RawMaster<D>,
    slave: &SlaveConfig,
    options: &MasterConfig,
) -> Result<Vec<FoundEntry>, ()> {
    if slave.supports_coe() {
        match enumerate_coe(raw, slave, options).await {
            Ok(entries) => return Ok(entries),
            Err(error) => log::debug!(
                "CoE enumeration failed on {:#06x} ({}), falling back to the SII",
                slave.configured_address,
                error
            ),
        }
    }
    enumerate_sii(raw, slave, options).await.map_err(|_| ())
}

/// walk 0x1c12/0x1c13 then each assigned PDO object through CoE
async fn enumerate_coe<D: WireDriver>(
    raw: &mut RawMaster<D>,
    slave: &SlaveConfig,
    options: &MasterConfig,
) -> EthercatResult<Vec<FoundEntry>, crate::can::CanError> {
    let Some(mailbox) = slave.mailbox.clone() else {
        return Err(EthercatError::Master("CoE enumeration on a mailbox-less slave"));
    };
    let station = slave.configured_address;
    let mut coe = Can::new(Mailbox::new(
        raw,
        station,
        mailbox.write_buffer(),
        mailbox.read_buffer(),
        options.mailbox_timeout(),
    ));

    let mut found = Vec::new();
    for (assignment, input) in [(sdo::sync_manager::rx_pdos, false), (sdo::sync_manager::tx_pdos, true)] {
        for pdo in coe.pdo_assignment(assignment).await? {
            for entry in coe.pdo_entries(pdo).await? {
                // padding entries reserve space but map no object
                found.push(FoundEntry {
                    name: entry_name(entry.index(), entry.sub()),
                    index: entry.index(),
                    sub: entry.sub(),
                    bit_length: entry.bit_length(),
                    input,
                });
            }
        }
    }
    Ok(found)
}

/// parse the TxPdo/RxPdo categories of the SII
async fn enumerate_sii<D: WireDriver>(
    raw: &mut RawMaster<D>,
    slave: &SlaveConfig,
    options: &MasterConfig,
) -> EthercatResult<Vec<FoundEntry>, crate::sii::SiiError> {
    let address = SlaveAddress::Fixed(slave.configured_address);
    let mut sii = Sii::new(raw, address, options.eeprom_timeout()).await?;

    let mut found = Vec::new();
    for (category, input) in [(CategoryType::RxPdo, false), (CategoryType::TxPdo, true)] {
        let mut cursor = sii.categories();
        let Some(size) = cursor.seek(category).await? else { continue };
        let end = cursor.position() + size;
        while cursor.position() < end {
            let pdo: CategoryPdo = cursor.unpack().await?;
            for _ in 0..pdo.entries {
                let entry: CategoryPdoEntry = cursor.unpack().await?;
                found.push(FoundEntry {
                    name: entry_name(entry.index, entry.sub),
                    index: entry.index,
                    sub: entry.sub,
                    bit_length: entry.bit_length,
                    input,
                });
            }
        }
    }
    Ok(found)
}

fn entry_name(index: u16, sub: u8) -> String {
    format!("Entry_{:#06x}_{:02x}", index, sub)
}

/// the data type implied by an entry size
fn type_for_bits(bits: u8) -> TypeId {
    match bits {
        1 => TypeId::BOOL,
        8 => TypeId::U8,
        16 => TypeId::U16,
        32 => TypeId::U32,
        64 => TypeId::U64,
        _ => TypeId::CUSTOM,
    }
}

/**
    lay the found entries out in the process data image.

    Both halves keep a running bit cursor across slaves; every entry takes its slot in
    order, and each direction of each slave is byte-aligned once its entries are laid out.
*/
fn allocate_slots(entries: &[FoundEntry], output_cursor: &mut u64, input_cursor: &mut u64) -> Option<ProcessData> {
    if entries.is_empty() {
        return None;
    }
    let mut process = ProcessData {
        output_byte_offset: (*output_cursor / 8) as usize,
        input_byte_offset: (*input_cursor / 8) as usize,
        ..Default::default()
    };

    for entry in entries {
        let cursor = if entry.input { &mut *input_cursor } else { &mut *output_cursor };
        process.entries.push(PdoEntryConfig {
            name: entry.name.clone(),
            index: entry.index,
            sub_index: entry.sub,
            bit_length: entry.bit_length,
            data_type: type_for_bits(entry.bit_length),
            pdo_byte_offset: None,
            pdi_byte_offset: (*cursor / 8) as u32,
        });
        *cursor += u64::from(entry.bit_length);
    }

    process.output_bit_length = (*output_cursor - process.output_byte_offset as u64 * 8) as usize;
    process.input_bit_length = (*input_cursor - process.input_byte_offset as u64 * 8) as usize;

    // byte-align each half for the next slave
    *output_cursor = (*output_cursor + 7) / 8 * 8;
    *input_cursor = (*input_cursor + 7) / 8 * 8;

    if process.output_bit_length == 0 && process.input_bit_length == 0 {
        None
    } else {
        Some(process)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(bits: u8, input: bool) -> FoundEntry {
        FoundEntry { name: "e".into(), index: 0x6000, sub: 1, bit_length: bits, input }
    }

    #[test]
    fn slots_are_packed_then_byte_aligned_per_slave() {
        let (mut outputs, mut inputs) = (0, 0);

        // slave 0: two 1-bit outputs and one 16-bit input
        let first = allocate_slots(&[entry(1, false), entry(1, false), entry(16, true)], &mut outputs, &mut inputs).unwrap();
        assert_eq!((first.output_byte_offset, first.output_bit_length), (0, 2));
        assert_eq!((first.input_byte_offset, first.input_bit_length), (0, 16));
        assert_eq!(outputs, 8, "outputs half byte-aligned after the slave");

        // slave 1: one byte output, one byte input. Offsets must not decrease.
        let second = allocate_slots(&[entry(8, false), entry(8, true)], &mut outputs, &mut inputs).unwrap();
        assert_eq!((second.output_byte_offset, second.output_bit_length), (1, 8));
        assert_eq!((second.input_byte_offset, second.input_bit_length), (2, 8));
        assert!(second.output_byte_offset >= first.output_byte_offset);
        assert!(second.input_byte_offset >= first.input_byte_offset);
    }

    #[test]
    fn entry_slots_follow_the_cursor() {
        let (mut outputs, mut inputs) = (0, 0);
        let process = allocate_slots(
            &[entry(16, true), entry(16, true), entry(8, true)],
            &mut outputs,
            &mut inputs,
        )
        .unwrap();
        let offsets: Vec<u32> = process.entries.iter().map(|entry| entry.pdi_byte_offset).collect();
        assert_eq!(offsets, vec![0, 2, 4]);
        assert_eq!(process.input_bit_length, 40);
    }

    #[test]
    fn backoff_stays_bounded() {
        for attempt in 0..BACKOFF_ATTEMPTS {
            let delay = backoff_delay(attempt);
            assert!(delay >= Duration::from_millis(40));
            assert!(delay <= Duration::from_millis(600));
        }
    }
}
