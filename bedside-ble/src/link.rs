//! GATT link: the raw transport to one peripheral
//!
//! A link connects, reads, writes and disconnects. It never retries and never
//! reconnects on its own, all of that lives in [`crate::session`].

use std::time::Duration;

use async_trait::async_trait;
use bedside_proto::Characteristic;

/// A 6-byte BLE MAC address, written `AA:BB:CC:DD:EE:FF`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress(pub [u8; 6]);

#[derive(Debug, thiserror::Error)]
#[error("invalid BLE address {0:?}, expected AA:BB:CC:DD:EE:FF")]
pub struct InvalidMacAddress(String);

impl std::str::FromStr for MacAddress {
    type Err = InvalidMacAddress;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidMacAddress(s.to_string());
        let mut bytes = [0u8; 6];
        let mut parts = s.trim().split(':');
        for byte in bytes.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 {
                return Err(invalid());
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self(bytes))
    }
}

impl std::fmt::Display for MacAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

/// Which bed to talk to, and through which local adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralIdentity {
    pub address: MacAddress,
    /// Adapter name as reported by the OS (e.g. `hci0`), `None` picks the first one
    pub adapter: Option<String>,
}

impl PeripheralIdentity {
    pub fn new(address: MacAddress) -> Self {
        Self {
            address,
            adapter: None,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ConnError {
    #[error("peripheral {0} not found")]
    NotFound(MacAddress),
    #[error("connection timed out after {0:?}")]
    Timeout(Duration),
    /// Another central (usually the phone app) holds the only connection slot
    #[error("peripheral is busy with another controller")]
    Busy,
    #[error("connection denied: {0}")]
    Denied(String),
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum IoError {
    #[error("{0} timed out after {1:?}")]
    Timeout(Characteristic, Duration),
    #[error("{0} is not readable")]
    NotReadable(Characteristic),
    /// The firmware has no such characteristic, reconnecting won't help
    #[error("{0} is not exposed by this firmware")]
    NotExposed(Characteristic),
    #[error("link lost: {0}")]
    Disconnected(String),
    #[error("{0}: {1}")]
    Gatt(Characteristic, String),
}

/// Raw BLE transport to a single peripheral
#[async_trait]
pub trait GattLink: Send + Sync {
    /// Connected peripheral with its discovered characteristics
    type Handle: Send + Sync;

    /// Connect and discover the bed service, bounded by `timeout`
    async fn connect(
        &self,
        identity: &PeripheralIdentity,
        timeout: Duration,
    ) -> Result<Self::Handle, ConnError>;

    /// A single write with response, no retry
    async fn write(
        &self,
        handle: &Self::Handle,
        target: Characteristic,
        payload: &[u8],
    ) -> Result<(), IoError>;

    async fn read(&self, handle: &Self::Handle, target: Characteristic) -> Result<Vec<u8>, IoError>;

    /// Safe to call on a handle that is already closed
    async fn disconnect(&self, handle: &Self::Handle);
}

#[cfg(test)]
mod tests {
    use super::MacAddress;

    #[test]
    fn mac_address_round_trips_through_text() {
        let addr: MacAddress = "f8:68:ce:13:c3:df".parse().unwrap();
        assert_eq!(addr.0, [0xf8, 0x68, 0xce, 0x13, 0xc3, 0xdf]);
        assert_eq!(addr.to_string(), "F8:68:CE:13:C3:DF");
    }

    #[test]
    fn mac_address_rejects_garbage() {
        for bad in ["", "F8:68:CE:13:C3", "F8:68:CE:13:C3:DF:00", "F8-68-CE-13-C3-DF", "G8:68:CE:13:C3:DF", "F:68:CE:13:C3:DF"] {
            assert!(bad.parse::<MacAddress>().is_err(), "{bad} parsed");
        }
    }
}
