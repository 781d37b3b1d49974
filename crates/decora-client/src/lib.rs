//! myLeviton cloud client
//!
//! [`DecoraSession`] logs in with the account's e-mail and password and
//! reads or updates the account's Decora Wi-Fi switches. The integration
//! talks to it through the [`DecoraApi`] trait.

mod error;
mod models;
mod session;

pub use error::{DecoraError, DecoraResult};
pub use models::{IotSwitch, LoginResponse, Residence, ResidentialPermission};
pub use session::{DecoraApi, DecoraSession, DEFAULT_BASE_URL};
