//! Leviton Decora Wi-Fi integration
//!
//! Polls the myLeviton cloud for an account's switches and exposes each one
//! as a light or fan, plus configuration numbers and diagnostic sensors.
//!
//! ```ignore
//! let integration = Arc::new(DecoraWifi::new(hub.clone(), session_factory(None)));
//! integration.register(&entries, &flows)?;
//! entries.setup_all().await;
//! ```

pub mod classification;
pub mod config_flow;
pub mod constants;
pub mod coordinator;
pub mod entity;
pub mod fan;
pub mod light;
pub mod number;
pub mod sensor;
pub mod setup;

pub use classification::{DecoraDevice, DeviceType, DeviceTypeOverride};
pub use config_flow::{
    import_credentials, validate_credentials, CredentialsError, DecoraFlowFactory,
    DiscoveredDevice,
};
pub use constants::DOMAIN;
pub use coordinator::{CoordinatorData, DecoraCoordinator, UpdateFailed};
pub use entity::{CommandError, DecoraEntity, PlatformEntity};
pub use setup::{session_factory, ApiFactory, DecoraWifi};
