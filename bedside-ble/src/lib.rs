//! Bedside BLE
//!
//! Talks to the bed over Bluetooth Low Energy. [`link`] is the raw GATT
//! transport, [`session`] owns the one connection and decides when to connect,
//! retry and let go.
//!
//! # Example
//!
//! ```ignore
//! use bedside_ble::{BtleplugLink, DeviceSession, PeripheralIdentity, SessionConfig};
//! use bedside_proto::{Codec, Intent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let link = BtleplugLink::new(std::time::Duration::from_secs(5)).await?;
//!     let identity = PeripheralIdentity::new("F8:68:CE:13:C3:DF".parse()?);
//!     let session = DeviceSession::new(link, identity, Codec::default(), SessionConfig::default());
//!
//!     session.execute(Intent::MoveUpper(40)).await?;
//!     Ok(())
//! }
//! ```

pub mod ble;
pub mod link;
pub mod session;
pub mod simulated;

pub use ble::{AdapterError, BtleplugLink, DiscoveredPeripheral, scan};
pub use link::{ConnError, GattLink, InvalidMacAddress, IoError, MacAddress, PeripheralIdentity};
pub use session::{
    ConnectionState, DeviceSession, Outcome, RetryPolicy, SessionConfig, SessionError,
    TransportFailure,
};
pub use simulated::SimulatedBed;
