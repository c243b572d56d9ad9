//! integration scenarios against the scripted driver: discovery, ride-through, monitors,
//! watchdog pre-gating, topology verification, SDO access and resource management.

mod common;

use common::{EepromBuilder, MockDriver, MockSlave, WriteRecord};
use etherbus::config::{
    MailboxConfig, MasterConfig, Network, ProcessData, ProcessImageConfig, ProcessVariable, SlaveConfig,
};
use etherbus::driver::{CycleStatus, EmergencyFrame, MailboxPoll};
use etherbus::esm::TopologyError;
use etherbus::rawmaster::RawMaster;
use etherbus::{AlState, CycleError, Event, Master, TypeId};
use std::collections::HashMap;
use std::time::Duration;

fn raw(driver: MockDriver) -> RawMaster<MockDriver> {
    RawMaster::new(driver, Duration::from_millis(50), 0)
}

fn fast_options() -> MasterConfig {
    MasterConfig {
        pdu_timeout_ms: 50,
        state_transition_timeout_ms: 200,
        mailbox_timeout_ms: 50,
        eeprom_timeout_ms: 200,
        pdu_retries: 0,
        ..Default::default()
    }
}

/// a digital output + analog input slave, CoE through the general category
fn coe_slave() -> MockSlave {
    let eeprom = EepromBuilder::new(0x0000_0002, 0x0444_2c52, 0x0012_0000, 77)
        .protocols(0x0004)
        .general(true, false, false)
        .pdo_category(51, 0x1600, &[(0x7000, 1, 8)])
        .pdo_category(50, 0x1a00, &[(0x6000, 1, 16)])
        .build();
    MockSlave::new(eeprom)
}

/// a plain input slave with DC hardware and no mailbox
fn dc_slave() -> MockSlave {
    let eeprom = EepromBuilder::new(0x0000_0002, 0x0bc0_3052, 0x0001_0000, 0)
        .pdo_category(50, 0x1a00, &[(0x6010, 1, 16), (0x6010, 2, 16)])
        .dc()
        .build();
    let mut slave = MockSlave::new(eeprom);
    slave.dc_register = true;
    slave
}

// S1 — discovery smoke

#[tokio::test]
async fn discovery_builds_a_usable_description() {
    let mut raw = raw(MockDriver::new(vec![coe_slave(), dc_slave()]));
    let report = etherbus::discovery::discover(&mut raw, &fast_options()).await.unwrap();

    assert!(report.issues.is_empty());
    let network = &report.network;
    assert_eq!(network.slaves.len(), 2);
    assert!(network.master.dc_support);

    let first = &network.slaves[0];
    assert_eq!(first.identity.vendor_id, 2);
    assert_eq!(first.identity.product_code, 0x0444_2c52);
    assert_eq!(first.identity.serial_number, 77);
    let mailbox = first.mailbox.as_ref().expect("CoE slave gets a mailbox");
    assert_eq!(mailbox.status_register_address, 0x080d);
    assert_eq!(mailbox.poll_period_ms, 20);
    assert!(mailbox.coe);

    let second = &network.slaves[1];
    assert!(second.mailbox.is_none());
    assert_eq!(second.identity.product_code, 0x0bc0_3052);

    // PDI byte offsets are monotonically non-decreasing in slave order
    let first_data = first.process_data.as_ref().unwrap();
    let second_data = second.process_data.as_ref().unwrap();
    assert_eq!((first_data.output_byte_offset, first_data.output_bit_length), (0, 8));
    assert_eq!((first_data.input_byte_offset, first_data.input_bit_length), (0, 16));
    assert!(second_data.input_byte_offset >= first_data.input_byte_offset);
    assert_eq!(second_data.input_bit_length, 32);
    assert_eq!(second_data.output_bit_length, 0);
    for window in first_data.entries.windows(2) {
        assert!(window[0].pdi_byte_offset <= window[1].pdi_byte_offset);
    }
}

// S3 — ride-through

fn bare_network() -> Network {
    Network { master: fast_options(), slaves: Vec::new(), process_image: None }
}

#[tokio::test]
async fn ride_through_policy_over_the_facade() {
    let mut driver = MockDriver::new(Vec::new());
    driver.cycles.extend(
        std::iter::repeat(CycleStatus::PduTimeout)
            .take(4)
            .chain([CycleStatus::Wkc(1)])
            .chain(std::iter::repeat(CycleStatus::PduTimeout).take(6)),
    );
    let mut master = Master::new(driver, bare_network()).unwrap();
    master.initialize().await.unwrap();

    for _ in 0..4 {
        assert_eq!(master.run_cycle().await.unwrap(), -2);
    }
    assert_eq!(master.run_cycle().await.unwrap(), 1);
    assert_eq!(master.missed_cycles(), 0);

    for _ in 0..5 {
        assert_eq!(master.run_cycle().await.unwrap(), -2);
    }
    assert!(matches!(master.run_cycle().await, Err(CycleError::CommsLost { .. })));
}

// S4 — mailbox toggle protocol

fn one_coe_network() -> Network {
    let mut network = bare_network();
    network.slaves.push(SlaveConfig {
        mailbox: Some(MailboxConfig::default()),
        ..Default::default()
    });
    network
}

#[tokio::test]
async fn mailbox_polls_run_the_toggle_protocol() {
    let mut driver = MockDriver::new(vec![coe_slave()]).with_stations();
    driver.mailbox_outcome = MailboxPoll::NewMail;
    let mut master = Master::new(driver, one_coe_network()).unwrap();
    master.initialize().await.unwrap();
    master.set_mailbox_poll_interval(1);

    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(2)).await;
        master.poll_monitors().await;
    }

    // first poll carries the unknown sentinel, then the toggle alternates
    // (the driver owns this protocol: 2 means "accept any toggle")
    let checks = unsafe { master.raw_mut() }.driver_mut().mailbox_checks.clone();
    let toggles: Vec<u8> = checks.iter().map(|&(_, _, toggle)| toggle).collect();
    assert_eq!(toggles, vec![2, 0, 1, 0, 1]);
    assert!(checks.iter().all(|&(slave, register, _)| slave == 0 && register == 0x080d));
}

// S5 — emergency dedup

#[tokio::test]
async fn emergencies_are_filtered_and_deduplicated() {
    let mut driver = MockDriver::new(vec![coe_slave()]).with_stations();
    driver.emergency = Some(EmergencyFrame { slave: 0, error_code: 0x1234, error_register: 0x56 });
    let mut master = Master::new(driver, one_coe_network()).unwrap();
    master.initialize().await.unwrap();
    let mut events = master.subscribe();

    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(12)).await;
        master.poll_monitors().await;
    }
    let emergency = master.last_emergency().expect("one emergency dispatched");
    assert_eq!((emergency.slave, emergency.error_code, emergency.error_register), (0, 0x1234, 0x56));

    let mut received = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, Event::Emergency(_)) {
            received += 1;
        }
    }
    assert_eq!(received, 1, "duplicates are dropped");
}

// S6 — watchdog pre-gate

#[tokio::test]
async fn watchdog_is_armed_before_the_safeop_request() {
    let mut network = bare_network();
    network.master.watchdog_timeout_ms = Some(200);
    network.slaves.push(SlaveConfig::default());
    network.slaves.push(SlaveConfig::default());

    let mut slaves = vec![coe_slave(), dc_slave()];
    slaves[1].watchdog_nack = true;
    let driver = MockDriver::new(slaves).with_stations();

    let mut master = Master::new(driver, network).unwrap();
    master.initialize().await.unwrap();
    master.request_state(AlState::SafeOperational).await.unwrap();
    assert_eq!(master.state(), AlState::SafeOperational);

    let driver = unsafe { master.raw_mut() }.driver_mut();
    // 200 ms × 10 register units per ms with the default divider
    assert_eq!(driver.slaves[0].watchdog, Some(2000));
    // the rejecting slave got a warning, not a transition failure
    assert_eq!(driver.slaves[1].watchdog, None);

    // the watchdog write lands before the AL request that enters SafeOp
    let writes = driver.writes.clone();
    for station in [0x1000u16, 0x1001] {
        let armed = writes.iter().position(|&record| record == WriteRecord { station, register: 0x0420 });
        let requested = writes.iter().rposition(|&record| record == WriteRecord { station, register: 0x0120 });
        assert!(armed.unwrap() < requested.unwrap());
    }
}

// round-trip of every supported scalar through an output mapping

#[tokio::test]
async fn scalar_round_trip_through_the_image() {
    let mut network = bare_network();
    network.slaves.push(SlaveConfig {
        process_data: Some(ProcessData {
            output_byte_offset: 0,
            output_bit_length: 8 * 40,
            input_byte_offset: 0,
            input_bit_length: 0,
            entries: Vec::new(),
        }),
        ..Default::default()
    });
    let variables = [
        ("u8", TypeId::U8, 0),
        ("i8", TypeId::I8, 8),
        ("u16", TypeId::U16, 16),
        ("i16", TypeId::I16, 32),
        ("u32", TypeId::U32, 48),
        ("i32", TypeId::I32, 80),
        ("f32", TypeId::F32, 112),
        ("u64", TypeId::U64, 144),
        ("i64", TypeId::I64, 208),
    ];
    network.process_image = Some(ProcessImageConfig {
        inputs: Vec::new(),
        outputs: variables
            .iter()
            .map(|&(name, data_type, bit_offset)| ProcessVariable {
                name: name.into(),
                data_type,
                bit_offset,
                bit_size: None,
            })
            .collect(),
    });

    let mut master = Master::new(MockDriver::new(Vec::new()), network).unwrap();
    master.initialize().await.unwrap();

    master.write_variable("u8", 0xa5u8).unwrap();
    master.write_variable("i8", -100i8).unwrap();
    master.write_variable("u16", 0xbeefu16).unwrap();
    master.write_variable("i16", i16::MIN).unwrap();
    master.write_variable("u32", 0xdead_beefu32).unwrap();
    master.write_variable("i32", -123_456i32).unwrap();
    master.write_variable("f32", -1.5f32).unwrap();
    master.write_variable("u64", u64::MAX).unwrap();
    master.write_variable("i64", i64::MIN + 1).unwrap();
    master.run_cycle().await.unwrap();

    assert_eq!(master.pdi()[0], 0xa5);
    assert_eq!(master.pdi()[2..4], 0xbeefu16.to_le_bytes());
    assert_eq!(master.pdi()[6..10], 0xdead_beefu32.to_le_bytes());
    assert_eq!(master.pdi()[14..18], (-1.5f32).to_le_bytes());
    assert_eq!(master.read_variable::<u8>("u8").unwrap(), 0xa5);
    assert_eq!(master.read_variable::<i16>("i16").unwrap(), i16::MIN);
    assert_eq!(master.read_variable::<f32>("f32").unwrap(), -1.5);
    assert_eq!(master.read_variable::<u64>("u64").unwrap(), u64::MAX);
    assert_eq!(master.read_variable::<i64>("i64").unwrap(), i64::MIN + 1);

    // a write of the declared type only
    assert!(master.write_variable("u8", 1u16).is_err());
}

// topology verification

#[tokio::test]
async fn topology_mismatch_names_the_first_offender() {
    let mut network = bare_network();
    network.slaves.push(SlaveConfig {
        identity: etherbus::config::Identity { vendor_id: 2, product_code: 0x0444_2c52, revision_number: 0, serial_number: 0 },
        ..Default::default()
    });
    network.slaves.push(SlaveConfig {
        identity: etherbus::config::Identity { vendor_id: 2, product_code: 0xffff_ffff, revision_number: 0, serial_number: 0 },
        ..Default::default()
    });

    let driver = MockDriver::new(vec![coe_slave(), dc_slave()]).with_stations();
    let mut master = Master::new(driver, network).unwrap();
    master.initialize().await.unwrap();
    assert_eq!(master.verify_topology().await, Err(TopologyError::Identity { slave: 1 }));
}

#[tokio::test]
async fn matching_topology_passes_with_zero_serial_wildcard() {
    let mut network = bare_network();
    // serial 0 in the description matches any programmed serial
    network.slaves.push(SlaveConfig {
        identity: etherbus::config::Identity { vendor_id: 2, product_code: 0x0444_2c52, revision_number: 0, serial_number: 0 },
        ..Default::default()
    });
    let driver = MockDriver::new(vec![coe_slave()]).with_stations();
    let mut master = Master::new(driver, network).unwrap();
    master.initialize().await.unwrap();
    assert_eq!(master.verify_topology().await, Ok(()));
}

// SDO access over the emulated mailbox

#[tokio::test]
async fn sdo_round_trip_through_the_mailbox() {
    let mut slave = coe_slave();
    let mut dictionary = HashMap::new();
    dictionary.insert((0x1018u16, 1u8), 2u32.to_le_bytes().to_vec());
    slave.dictionary = Some(dictionary);
    let driver = MockDriver::new(vec![slave]).with_stations();

    let mut master = Master::new(driver, one_coe_network()).unwrap();
    master.initialize().await.unwrap();

    let mut value = [0u8; 4];
    let length = master.sdo_read(0, 0x1018, 1, &mut value).await.unwrap();
    assert_eq!((length, u32::from_le_bytes(value)), (4, 2));

    master.sdo_write(0, 0x6060, 0, &[8]).await.unwrap();
    let mut mode = [0u8; 1];
    master.sdo_read(0, 0x6060, 0, &mut mode).await.unwrap();
    assert_eq!(mode[0], 8);

    // unknown objects surface the abort
    assert!(master.sdo_read(0, 0x9999, 0, &mut value).await.is_err());

    // out-of-range slave index fails without touching the wire
    assert!(master.sdo_read(9, 0x1018, 1, &mut value).await.is_err());
}

// resource management

#[tokio::test]
async fn close_is_idempotent_and_stops_io() {
    let driver = MockDriver::new(Vec::new());
    let mut master = Master::new(driver, bare_network()).unwrap();
    master.initialize().await.unwrap();

    master.close();
    master.close();
    assert!(master.run_cycle().await.is_err());
    assert!(!master.is_initialized());
    assert_eq!(unsafe { master.raw_mut() }.driver_mut().close_count, 1);
}
