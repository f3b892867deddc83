//! Shared building blocks for the Portico gateway.
//!
//! This crate holds everything the other Portico crates agree on: the
//! configuration records stored in the coordination store, the error
//! taxonomy, the JSON code envelope used for error and combination
//! responses, and the store client itself.

pub mod error;
pub mod hash;
pub mod model;
pub mod store;

pub use error::{GatewayError, Result};
pub use model::{
    ApiCombination, ApiRule, BreakerSetting, CodeInfo, NocacheRule, PermitUrlRule, RoutingRule,
    ServerInstance, UserModel, CODE_OK, CODE_SYSTEM_ERR,
};
pub use store::{
    ConfigStore, EtcdStore, KvEntry, MemoryStore, APIS_KEY, CLUSTERS_KEY, CLUSTER_OPTIONS_KEY,
    ROUTINGS_KEY,
};
