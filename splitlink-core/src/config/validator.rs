use crate::config::*;
use crate::error::{Error, Result};

const MIN_MTU_V4: u16 = 576;
const MIN_MTU_V6: u16 = 1280;

pub struct ConfigValidator;
impl ConfigValidator {
    pub fn validate(config: &EngineConfig) -> Result<()> {
        Self::validate_interface(&config.interface)?;
        Self::validate_flows(&config.flows)?;
        Self::validate_forwarder(&config.forwarder)?;
        Ok(())
    }

    fn validate_interface(interface: &InterfaceConfig) -> Result<()> {
        if interface.session_name.trim().is_empty() {
            return Err(Error::config("session_name cannot be empty"));
        }

        let max_prefix = if interface.address.is_ipv4() { 32 } else { 128 };
        if interface.prefix_len > max_prefix {
            return Err(Error::config(format!(
                "Invalid prefix_len {}: must be at most {} for {}",
                interface.prefix_len, max_prefix, interface.address
            )));
        }

        let min_mtu = if interface.address.is_ipv4() { MIN_MTU_V4 } else { MIN_MTU_V6 };
        if interface.mtu < min_mtu {
            return Err(Error::config(format!(
                "Invalid mtu {}: must be at least {}",
                interface.mtu, min_mtu
            )));
        }

        let route = interface.route_prefix()?;
        if route.addr.is_ipv4() != interface.address.is_ipv4() {
            return Err(Error::config(format!(
                "Route {} and interface address {} must be the same address family",
                route, interface.address
            )));
        }

        if interface.dns.is_unspecified() {
            return Err(Error::config("dns cannot be the unspecified address"));
        }

        for app in &interface.always_excluded {
            if app.trim().is_empty() {
                return Err(Error::config("always_excluded cannot contain empty entries"));
            }
        }

        Ok(())
    }

    fn validate_flows(flows: &FlowConfig) -> Result<()> {
        if flows.idle_timeout_secs > 0 && flows.cleanup_interval_secs == 0 {
            return Err(Error::config(
                "cleanup_interval_secs must be positive when idle eviction is enabled",
            ));
        }
        Ok(())
    }

    fn validate_forwarder(forwarder: &ForwarderConfig) -> Result<()> {
        if forwarder.connect_timeout_secs == 0 {
            return Err(Error::config("connect_timeout_secs must be positive"));
        }
        if forwarder.tcp_window == 0 {
            return Err(Error::config("tcp_window must be positive"));
        }
        if forwarder.relay_buffer_size < 1500 {
            return Err(Error::config("relay_buffer_size must be at least 1500 bytes"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_config() {
        assert!(ConfigValidator::validate(&EngineConfig::default()).is_ok());
    }

    #[test]
    fn test_invalid_mtu() {
        let mut config = EngineConfig::default();
        config.interface.mtu = 200;
        assert!(ConfigValidator::validate(&config).is_err());

        config.interface.mtu = 1000;
        config.interface.address = "fd00::2".parse().unwrap();
        config.interface.prefix_len = 128;
        config.interface.route = "::/0".to_string();
        assert!(ConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_route_family_mismatch() {
        let mut config = EngineConfig::default();
        config.interface.route = "::/0".to_string();
        let err = ConfigValidator::validate(&config).unwrap_err();
        assert_eq!(err.code(), "CONFIG");

        config.interface.route = "not-a-route".to_string();
        assert!(ConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_invalid_prefix_len() {
        let mut config = EngineConfig::default();
        config.interface.prefix_len = 40;
        assert!(ConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_flow_and_forwarder_limits() {
        let mut config = EngineConfig::default();
        config.flows.cleanup_interval_secs = 0;
        assert!(ConfigValidator::validate(&config).is_err());

        config.flows.idle_timeout_secs = 0;
        assert!(ConfigValidator::validate(&config).is_ok());

        config.forwarder.connect_timeout_secs = 0;
        assert!(ConfigValidator::validate(&config).is_err());
    }
}
