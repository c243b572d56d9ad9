/*!
    the periodic monitors multiplexed with the cyclic exchange: mailbox resilience polling
    and the CoE emergency channel.

    Both run on their own logical timers but share the bus thread with the cycle: the
    master runs whichever monitor is due whenever it holds the wire, so a monitor never
    overlaps a cycle in real time. Their failures are soft, published as events, and never
    abort polling.
*/

use crate::{
    config::Network,
    driver::{MailboxPoll, WireDriver, TOGGLE_UNKNOWN},
};
use core::{fmt, time::Duration};
use tokio::time::Instant;

/// lower bound of the mailbox poll period mandated for Class B
const MAILBOX_PERIOD_CAP_MS: u32 = 20;
/// default period of the emergency poll
const EMERGENCY_PERIOD_MS: u64 = 10;

/// soft failure reported by the mailbox monitor
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MailboxFailure {
    /// the driver exhausted its retries without seeing the toggle move
    ResilientReadFailed,
    /// transient driver error, the code is driver-specific
    Code(i32),
}

impl fmt::Display for MailboxFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResilientReadFailed => write!(f, "resilient-read-failed"),
            Self::Code(code) => write!(f, "driver error {}", code),
        }
    }
}

/// what a monitor pass observed
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MonitorEvent {
    /// a new mailbox frame is waiting on this slave
    NewMail { slave: usize },
    /// the mailbox of this slave misbehaved
    MailboxError { slave: usize, error: MailboxFailure },
    /// a deduplicated CoE emergency
    Emergency { slave: usize, error_code: u16, error_register: u8 },
}

/// per-slave state of the mailbox monitor
struct MailboxSlave {
    /// slave index in the description
    index: usize,
    status_register: u16,
    /// last observed toggle bit, [TOGGLE_UNKNOWN] before the first successful check
    toggle: u8,
}

/// the mailbox resilience poller (one toggle tracker per CoE slave)
pub struct MailboxMonitor {
    slaves: Vec<MailboxSlave>,
    period: Duration,
    next_due: Instant,
    enabled: bool,
}

impl MailboxMonitor {
    pub fn new(network: &Network) -> Self {
        let mut slaves = Vec::new();
        let mut period_ms = MAILBOX_PERIOD_CAP_MS;
        for (index, slave) in network.slaves.iter().enumerate() {
            let Some(mailbox) = &slave.mailbox else { continue };
            if !mailbox.coe {
                continue;
            }
            period_ms = period_ms.min(mailbox.poll_period_ms.max(1));
            slaves.push(MailboxSlave {
                index,
                status_register: mailbox.status_register_address,
                toggle: TOGGLE_UNKNOWN,
            });
        }
        let period = Duration::from_millis(u64::from(period_ms));
        Self {
            enabled: !slaves.is_empty(),
            slaves,
            period,
            next_due: Instant::now() + period,
        }
    }

    /// re-arm the poll with a new period, 0 disables polling
    pub fn set_period(&mut self, period_ms: u32) {
        if period_ms == 0 {
            self.enabled = false;
            return;
        }
        self.period = Duration::from_millis(u64::from(period_ms));
        self.next_due = Instant::now() + self.period;
        self.enabled = !self.slaves.is_empty();
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// true when a poll pass is due
    pub fn due(&self, now: Instant) -> bool {
        self.enabled && now >= self.next_due
    }

    /// check every tracked slave once and report what happened
    pub async fn poll<D: WireDriver>(&mut self, driver: &mut D, now: Instant) -> Vec<MonitorEvent> {
        self.next_due = now + self.period;
        let mut events = Vec::new();
        for slave in &mut self.slaves {
            match driver.check_mailbox(slave.index as u16, slave.status_register, slave.toggle).await {
                MailboxPoll::NewMail => {
                    slave.toggle = match slave.toggle {
                        TOGGLE_UNKNOWN => 0,
                        toggle => toggle ^ 1,
                    };
                    log::debug!("new mail on slave {}", slave.index);
                    events.push(MonitorEvent::NewMail { slave: slave.index });
                }
                MailboxPoll::Empty => {}
                MailboxPoll::RetriesExhausted => {
                    events.push(MonitorEvent::MailboxError {
                        slave: slave.index,
                        error: MailboxFailure::ResilientReadFailed,
                    });
                }
                MailboxPoll::Error(code) => {
                    events.push(MonitorEvent::MailboxError {
                        slave: slave.index,
                        error: MailboxFailure::Code(code),
                    });
                }
            }
        }
        events
    }
}

/// the CoE emergency channel: polls the driver's last-emergency slot, filters and deduplicates
pub struct EmergencyMonitor {
    /// CoE capability per slave index
    coe: Vec<bool>,
    /// last emitted (code, register) per slave index
    last: Vec<Option<(u16, u8)>>,
    period: Duration,
    next_due: Instant,
}

impl EmergencyMonitor {
    pub fn new(network: &Network) -> Self {
        Self::with_period(network, Duration::from_millis(EMERGENCY_PERIOD_MS))
    }

    pub fn with_period(network: &Network, period: Duration) -> Self {
        Self {
            coe: network.slaves.iter().map(|slave| slave.supports_coe()).collect(),
            last: vec![None; network.slaves.len()],
            period,
            next_due: Instant::now() + period,
        }
    }

    /// true when a poll pass is due
    pub fn due(&self, now: Instant) -> bool {
        now >= self.next_due
    }

    /// read the last-emergency slot once. Non-CoE slaves and repeats of the last emitted
    /// event for a slave are silently dropped.
    pub fn poll<D: WireDriver>(&mut self, driver: &mut D, now: Instant) -> Option<MonitorEvent> {
        self.next_due = now + self.period;
        let frame = driver.last_emergency()?;
        let slave = usize::from(frame.slave);
        if !self.coe.get(slave).copied().unwrap_or(false) {
            log::trace!("emergency from non-CoE slave {} dropped", slave);
            return None;
        }
        let key = (frame.error_code, frame.error_register);
        if self.last[slave] == Some(key) {
            return None;
        }
        self.last[slave] = Some(key);
        log::warn!(
            "emergency on slave {}: code {:#06x}, register {:#04x}",
            slave,
            frame.error_code,
            frame.error_register
        );
        Some(MonitorEvent::Emergency {
            slave,
            error_code: frame.error_code,
            error_register: frame.error_register,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MailboxConfig, SlaveConfig};
    use crate::driver::{CycleStatus, DriverError, EmergencyFrame, PduCommand, SlaveAddress};

    /// driver stub recording mailbox checks and replaying an emergency slot
    struct Stub {
        mailbox_outcome: MailboxPoll,
        checks: Vec<(u16, u16, u8)>,
        emergency: Option<EmergencyFrame>,
    }
    impl Stub {
        fn new(mailbox_outcome: MailboxPoll) -> Self {
            Self { mailbox_outcome, checks: Vec::new(), emergency: None }
        }
    }
    impl WireDriver for Stub {
        async fn open(&mut self) -> Result<(), DriverError> {
            Ok(())
        }
        async fn pdu(&mut self, _: PduCommand, _: SlaveAddress, _: u16, _: &mut [u8]) -> Result<u16, DriverError> {
            Ok(1)
        }
        async fn exchange(&mut self, _: &[u8], _: &mut [u8]) -> CycleStatus {
            CycleStatus::Wkc(0)
        }
        async fn check_mailbox(&mut self, slave: u16, status_register: u16, last_toggle: u8) -> MailboxPoll {
            self.checks.push((slave, status_register, last_toggle));
            self.mailbox_outcome
        }
        fn last_emergency(&mut self) -> Option<EmergencyFrame> {
            self.emergency
        }
        fn close(&mut self) {}
    }

    fn coe_network(slaves: usize) -> Network {
        let mut network = Network::default();
        for _ in 0..slaves {
            network.slaves.push(SlaveConfig {
                mailbox: Some(MailboxConfig::default()),
                ..Default::default()
            });
        }
        network
    }

    #[tokio::test]
    async fn toggle_runs_the_sentinel_then_alternates() {
        let network = coe_network(1);
        let mut driver = Stub::new(MailboxPoll::NewMail);
        let mut monitor = MailboxMonitor::new(&network);

        for _ in 0..5 {
            monitor.poll(&mut driver, Instant::now()).await;
        }
        let toggles: Vec<u8> = driver.checks.iter().map(|&(_, _, toggle)| toggle).collect();
        assert_eq!(toggles, vec![2, 0, 1, 0, 1]);
        assert!(driver.checks.iter().all(|&(_, register, _)| register == 0x080d));
    }

    #[tokio::test]
    async fn exhausted_retries_become_a_soft_event() {
        let network = coe_network(1);
        let mut driver = Stub::new(MailboxPoll::RetriesExhausted);
        let mut monitor = MailboxMonitor::new(&network);

        let events = monitor.poll(&mut driver, Instant::now()).await;
        assert_eq!(
            events,
            vec![MonitorEvent::MailboxError { slave: 0, error: MailboxFailure::ResilientReadFailed }]
        );
        // polling continues
        assert!(!monitor.poll(&mut driver, Instant::now()).await.is_empty());
    }

    #[tokio::test]
    async fn emergencies_are_deduplicated_per_slave() {
        let network = coe_network(1);
        let mut driver = Stub::new(MailboxPoll::Empty);
        driver.emergency = Some(EmergencyFrame { slave: 0, error_code: 0x1234, error_register: 0x56 });
        let mut monitor = EmergencyMonitor::new(&network);

        assert_eq!(
            monitor.poll(&mut driver, Instant::now()),
            Some(MonitorEvent::Emergency { slave: 0, error_code: 0x1234, error_register: 0x56 })
        );
        for _ in 0..3 {
            assert_eq!(monitor.poll(&mut driver, Instant::now()), None);
        }

        driver.emergency = Some(EmergencyFrame { slave: 0, error_code: 0x5678, error_register: 0x56 });
        assert_eq!(
            monitor.poll(&mut driver, Instant::now()),
            Some(MonitorEvent::Emergency { slave: 0, error_code: 0x5678, error_register: 0x56 })
        );
        assert_eq!(monitor.poll(&mut driver, Instant::now()), None);
    }

    #[tokio::test]
    async fn non_coe_slaves_never_emit() {
        let mut network = coe_network(1);
        network.slaves.push(SlaveConfig::default());
        let mut driver = Stub::new(MailboxPoll::Empty);
        driver.emergency = Some(EmergencyFrame { slave: 1, error_code: 0x1234, error_register: 0x56 });
        let mut monitor = EmergencyMonitor::new(&network);

        assert_eq!(monitor.poll(&mut driver, Instant::now()), None);
    }
}
