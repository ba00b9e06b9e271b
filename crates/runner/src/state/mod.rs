//! State Module - Ist-Zustand eines Hosts
//!
//! Der Soll-Zustand ist das validierte [`podfleet_config::HostProfile`].

mod actual;

pub use actual::{
    owned_by, ActualContainer, ActualNetwork, ActualState, ContainerStatus, DirectoryStat,
    HealthStatus, QueryError, ResourceKind,
};
