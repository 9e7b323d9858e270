//! Flare RPC Discovery Library
//!
//! Service registration and discovery for gRPC services: a pluggable registry port
//! (Consul or in-process), a long-poll resolver, round-robin load balancing, cached
//! discovery-aware clients and a server lifecycle manager that keeps its
//! registrations alive.

pub mod balancer;
pub mod client;
pub mod config;
pub mod error;
pub mod health;
pub mod logging;
pub mod registry;
pub mod resolver;
pub mod retry;
pub mod routing;
pub mod server;
pub mod utils;

// Re-exports
pub use config::{ClientConfig, Config, LogConfig, RegistryConfig, ServerConfig};
pub use error::{ErrorCode, FlareError, Result};

pub use balancer::{PickInfo, Picker, PickerBuilder, ROUND_ROBIN, RoundRobinBuilder, RoundRobinPicker};
pub use client::{
    BytesCodec, Client, ClientFactory, ClientManager, ClientOptions, GrpcClient, GrpcClientFactory,
};
pub use health::{HealthService, HealthStatus};
pub use registry::{
    CheckSpec, ConsulRegistry, Endpoint, GetOptions, MemoryRegistry, Node, QueryMeta,
    QueryOptions, RegisterOptions, Registry, RegistryType, Service, Value, create_registry,
};
pub use resolver::{
    Address, AddressSink, Resolver, ResolverBuilder, ResolverOptions, ResolverState, Target,
};
pub use retry::{ExponentialBackoffPolicy, RetryPolicy, StepBackoffPolicy};
pub use routing::{RouteEntry, RouteTable, SharedRouteTable};
pub use server::{GrpcServer, RpcHandler, ServerOptions, ServerState, ServiceInfo};
