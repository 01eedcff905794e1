//! Configuration validation. Every builder calls these before issuing any
//! I/O; a failure returns a [`ValidationError`] and no channel is
//! constructed.

use crate::error::ValidationError;
use std::net::Ipv6Addr;
use std::str::FromStr;

const MAX_HOSTNAME_LENGTH: usize = 253;
const MAX_DEVICE_PATH_LENGTH: usize = 256;

pub fn validate_host(host: &str) -> Result<(), ValidationError> {
    if host.is_empty() {
        return Err(ValidationError::new("host", "must not be empty"));
    }
    if host.len() > MAX_HOSTNAME_LENGTH {
        return Err(ValidationError::new("host", format!("exceeds {MAX_HOSTNAME_LENGTH} bytes")));
    }
    if is_valid_ipv4(host) || is_valid_ipv6(host) || is_valid_hostname(host) {
        return Ok(());
    }
    Err(ValidationError::new("host", "not a valid IPv4 address, IPv6 address, or hostname"))
}

pub fn validate_port(port: u32) -> Result<(), ValidationError> {
    if port == 0 || port > 65535 {
        return Err(ValidationError::new("port", "must be in 1..=65535"));
    }
    Ok(())
}

/// Validates a device path: Unix paths must start with `/dev/` and use
/// `[A-Za-z0-9_/\-]`; Windows paths are `COM<1..255>` or a reserved device
/// name.
pub fn validate_device_path(device: &str) -> Result<(), ValidationError> {
    if device.is_empty() {
        return Err(ValidationError::new("device", "must not be empty"));
    }
    if device.len() > MAX_DEVICE_PATH_LENGTH {
        return Err(ValidationError::new("device", format!("exceeds {MAX_DEVICE_PATH_LENGTH} bytes")));
    }
    if is_valid_device_path(device) {
        return Ok(());
    }
    Err(ValidationError::new("device", "not a valid /dev/* path, COM<n> port, or reserved device name"))
}

pub fn validate_baud_rate(baud: u32) -> Result<(), ValidationError> {
    if !(50..=4_000_000).contains(&baud) {
        return Err(ValidationError::new("baud_rate", "must be in 50..=4_000_000"));
    }
    Ok(())
}

pub fn validate_data_bits(bits: u8) -> Result<(), ValidationError> {
    if !(5..=8).contains(&bits) {
        return Err(ValidationError::new("data_bits", "must be in 5..=8"));
    }
    Ok(())
}

pub fn validate_stop_bits(bits: u8) -> Result<(), ValidationError> {
    if bits != 1 && bits != 2 {
        return Err(ValidationError::new("stop_bits", "must be 1 or 2"));
    }
    Ok(())
}

pub fn validate_parity(parity: &str) -> Result<(), ValidationError> {
    let lower = parity.to_ascii_lowercase();
    if lower == "none" || lower == "odd" || lower == "even" {
        return Ok(());
    }
    Err(ValidationError::new("parity", "must be one of none, odd, even (case-insensitive)"))
}

pub fn validate_flow_control(flow_control: &str) -> Result<(), ValidationError> {
    let lower = flow_control.to_ascii_lowercase();
    if lower == "none" || lower == "sw" || lower == "hw" {
        return Ok(());
    }
    Err(ValidationError::new("flow_control", "must be one of none, sw, hw (case-insensitive)"))
}

pub fn validate_retry_interval_ms(ms: u64) -> Result<(), ValidationError> {
    if !(100..=300_000).contains(&ms) {
        return Err(ValidationError::new("retry_interval_ms", "must be in 100..=300000"));
    }
    Ok(())
}

pub fn validate_connection_timeout_ms(ms: u64) -> Result<(), ValidationError> {
    if !(100..=300_000).contains(&ms) {
        return Err(ValidationError::new("connection_timeout_ms", "must be in 100..=300000"));
    }
    Ok(())
}

/// `-1` means unlimited; otherwise `0..=1000`.
pub fn validate_max_retries(max_retries: i32) -> Result<(), ValidationError> {
    if max_retries == -1 || (0..=1000).contains(&max_retries) {
        return Ok(());
    }
    Err(ValidationError::new("max_retries", "must be -1 (unlimited) or in 0..=1000"))
}

pub fn validate_backpressure_threshold(bytes: usize) -> Result<(), ValidationError> {
    const MIN: usize = 1024;
    const MAX: usize = 100 * 1024 * 1024;
    if !(MIN..=MAX).contains(&bytes) {
        return Err(ValidationError::new("backpressure_threshold", "must be in 1 KiB..=100 MiB"));
    }
    Ok(())
}

fn is_valid_ipv4(address: &str) -> bool {
    let octets: Vec<&str> = address.split('.').collect();
    if octets.len() != 4 {
        return false;
    }
    for octet in octets {
        if octet.is_empty() || octet.len() > 3 {
            return false;
        }
        if octet.len() > 1 && octet.starts_with('0') {
            return false;
        }
        match octet.parse::<u16>() {
            Ok(value) if value <= 255 && octet.chars().all(|c| c.is_ascii_digit()) => {}
            _ => return false,
        }
    }
    true
}

fn is_valid_ipv6(address: &str) -> bool {
    Ipv6Addr::from_str(address).is_ok()
}

fn is_valid_hostname(hostname: &str) -> bool {
    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LENGTH {
        return false;
    }
    if hostname.starts_with('-') || hostname.ends_with('-') {
        return false;
    }
    hostname.split('.').all(is_valid_label)
}

fn is_valid_label(label: &str) -> bool {
    if label.is_empty() || label.len() > 63 {
        return false;
    }
    if label.starts_with('-') || label.ends_with('-') {
        return false;
    }
    label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

fn is_valid_device_path(device: &str) -> bool {
    if let Some(rest) = device.strip_prefix("/dev/") {
        let _ = rest;
        return device.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '-'));
    }
    if let Some(port_num) = device.strip_prefix("COM") {
        if port_num.is_empty() || !port_num.chars().all(|c| c.is_ascii_digit()) {
            return false;
        }
        return port_num.parse::<u16>().map(|p| (1..=255).contains(&p)).unwrap_or(false);
    }
    matches!(device, "NUL" | "CON" | "PRN" | "AUX" | "LPT1" | "LPT2" | "LPT3")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_rejects_leading_zeros_except_bare_zero() {
        assert!(validate_host("127.0.0.1").is_ok());
        assert!(validate_host("0.0.0.0").is_ok());
        assert!(validate_host("010.0.0.1").is_err());
        assert!(validate_host("256.0.0.1").is_err());
        assert!(validate_host("1.2.3").is_err());
        assert!(validate_host("1.2.3.4.5").is_err());
    }

    #[test]
    fn ipv6_literals() {
        assert!(validate_host("::1").is_ok());
        assert!(validate_host("::").is_ok());
        assert!(validate_host("2001:db8::1").is_ok());
        assert!(validate_host("2001:0db8:0000:0000:0000:0000:0000:0001").is_ok());
        assert!(validate_host("gggg::1").is_err());
    }

    #[test]
    fn hostnames() {
        assert!(validate_host("example.com").is_ok());
        assert!(validate_host("a.b.c").is_ok());
        assert!(validate_host("-bad.example.com").is_err());
        assert!(validate_host("bad-.example.com").is_err());
        assert!(validate_host("toolong".repeat(60).as_str()).is_err());
    }

    #[test]
    fn ports() {
        assert!(validate_port(1).is_ok());
        assert!(validate_port(65535).is_ok());
        assert!(validate_port(0).is_err());
        assert!(validate_port(65536).is_err());
    }

    #[test]
    fn device_paths() {
        assert!(validate_device_path("/dev/ttyUSB0").is_ok());
        assert!(validate_device_path("/dev/tty;rm -rf").is_err());
        assert!(validate_device_path("COM1").is_ok());
        assert!(validate_device_path("COM255").is_ok());
        assert!(validate_device_path("COM256").is_err());
        assert!(validate_device_path("NUL").is_ok());
        assert!(validate_device_path("relative/path").is_err());
    }

    #[test]
    fn serial_numeric_ranges() {
        assert!(validate_baud_rate(115_200).is_ok());
        assert!(validate_baud_rate(49).is_err());
        assert!(validate_baud_rate(4_000_001).is_err());
        assert!(validate_data_bits(8).is_ok());
        assert!(validate_data_bits(4).is_err());
        assert!(validate_stop_bits(1).is_ok());
        assert!(validate_stop_bits(3).is_err());
        assert!(validate_parity("Even").is_ok());
        assert!(validate_parity("mark").is_err());
        assert!(validate_flow_control("HW").is_ok());
        assert!(validate_flow_control("sw").is_ok());
        assert!(validate_flow_control("xonxoff").is_err());
    }

    #[test]
    fn retry_and_backpressure_ranges() {
        assert!(validate_retry_interval_ms(100).is_ok());
        assert!(validate_retry_interval_ms(99).is_err());
        assert!(validate_retry_interval_ms(300_000).is_ok());
        assert!(validate_retry_interval_ms(300_001).is_err());
        assert!(validate_max_retries(-1).is_ok());
        assert!(validate_max_retries(1000).is_ok());
        assert!(validate_max_retries(1001).is_err());
        assert!(validate_max_retries(-2).is_err());
        assert!(validate_backpressure_threshold(1024).is_ok());
        assert!(validate_backpressure_threshold(100 * 1024 * 1024).is_ok());
        assert!(validate_backpressure_threshold(1023).is_err());
        assert!(validate_backpressure_threshold(100 * 1024 * 1024 + 1).is_err());
    }
}
