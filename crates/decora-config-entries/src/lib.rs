//! Config entries for the Decora Wi-Fi bridge
//!
//! - [`ConfigEntry`]: one configured account of an integration
//! - [`ConfigEntries`]: persistence and the setup/unload lifecycle
//! - [`FlowManager`]: config and options flows that create and edit entries

mod entry;
mod flow;
mod manager;
mod state_machine;

pub use entry::{
    ConfigEntry, ConfigEntryDisabledBy, ConfigEntrySource, ConfigEntryState, ConfigEntryUpdate,
};
pub use flow::{
    input_str, FlowError, FlowFactory, FlowHandler, FlowManager, FlowResult, FlowResultType,
    FlowStep, FormField, SelectOption, STEP_INIT, STEP_USER,
};
pub use manager::{
    ConfigEntries, ConfigEntriesData, ConfigEntriesError, ConfigEntriesResult,
    IntegrationHandler, SetupError, UpdateListener, STORAGE_KEY,
};
pub use state_machine::{calculate_retry_delay, InvalidTransition};
