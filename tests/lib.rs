#[cfg(test)]
mod tests {
    use etherbus::can::{CanError, SdoAbortCode};
    use etherbus::driver::SlaveAddress;
    use etherbus::{EthercatError, EthercatResult};
    use std::sync::Arc;

    #[test]
    fn display_ethercat_error() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "raw socket refused");
        let err_io: EthercatError = EthercatError::Io(Arc::new(io));
        let err_master: EthercatError = EthercatError::Master("master is closed");
        let err_proto: EthercatError = EthercatError::Protocol("slave did not acknowledge the datagram");
        let err_timer: EthercatError = EthercatError::Timeout("SII read");

        assert!(err_io.to_string().contains("raw socket refused"));
        assert!(err_master.to_string().contains("master is closed"));
        assert!(err_proto.to_string().contains("acknowledge"));
        assert!(err_timer.to_string().contains("SII"));
    }

    #[test]
    fn slave_errors_upgrade_and_map() {
        let plain: EthercatError = EthercatError::Timeout("mailbox read");
        let upgraded: EthercatError<CanError> = plain.upgrade();
        assert!(matches!(upgraded, EthercatError::Timeout(_)));

        let abort: EthercatResult<(), CanError> = Err(EthercatError::Slave(
            SlaveAddress::Fixed(0x1000),
            CanError::Sdo(SdoAbortCode(0x0602_0000)),
        ));
        let message = abort.unwrap_err().to_string();
        assert!(message.contains("0x06020000"));
    }

    #[test]
    fn abort_codes_carry_a_description() {
        assert!(SdoAbortCode(0x0601_0002).description().contains("read-only"));
        assert!(SdoAbortCode(0xdead_beef).description().contains("vendor"));
    }
}
