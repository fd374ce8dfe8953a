//! Cluster router: a process whose sole module forwards RPC frames between
//! node transports, discovering peers through the coordination service.

pub mod router;

pub use router::ClusterRouterModule;
