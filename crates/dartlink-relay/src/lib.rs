pub mod client;
pub mod error;
pub mod registry;
pub mod server;
pub mod supervisor;
pub mod vm;

pub use client::{
    ClientConfig, ClientEvent, ConnectionState, Endpoint, FnHandler, MethodHandler, RpcClient,
};
pub use error::{Error, Result};
pub use registry::{
    CollisionPolicy, ProcedureKind, RegisterDynamicsMethod, RegisteredProcedure, RegistrationReceipt,
    RegistryConfig, ToolRegistry,
};
pub use server::{ClientType, RelayServer, ServerEvent, ServerMethod};
