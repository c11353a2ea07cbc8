//! # compass-network
//!
//! Deployment-network bootstrap for a Compass deployment host.
//!
//! Reads the network descriptor the installer points at through the `NETWORK`
//! environment variable and converges the host's Open vSwitch ports and IPv4
//! addressing to it for the management roles.
//!
//! ## Architecture
//!
//! ```text
//!   $NETWORK ──► DescriptorLoader ──► NetworkDescriptor
//!                                            │
//!                                            ▼
//!                              HostNetworkActuator<R>
//!                       (ensure-port, flush, link-up, vlan, address)
//!                                            │
//!                                            ▼
//!                                   CommandRunner trait
//!                                            │
//!                         ┌──────────────────┴──────────────────┐
//!                         ▼                                     ▼
//!                 ┌───────────────┐                     ┌───────────────┐
//!                 │  ShellRunner  │                     │  MockRunner   │
//!                 │ (sudo -n, ip, │                     │  (in-memory   │
//!                 │   ovs-vsctl)  │                     │   MockHost)   │
//!                 └───────────────┘                     └───────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use compass_network::{ActuatorOptions, DescriptorLoader, HostNetworkActuator, MockHost, MockRunner};
//!
//! #[tokio::main]
//! async fn main() {
//!     let descriptor = DescriptorLoader::default().load().unwrap();
//!     let runner = MockRunner::new(MockHost::new().with_bridge("br-external"));
//!
//!     let actuator = HostNetworkActuator::new(runner, ActuatorOptions::default());
//!     let report = actuator.apply(&descriptor).await.unwrap();
//!     println!("{} role(s) converged", report.roles.len());
//! }
//! ```

pub mod actuator;
pub mod commands;
pub mod descriptor;
pub mod error;
pub mod interrupt;
pub mod lock;
pub mod mock;
pub mod runner;
pub mod types;

pub use actuator::{
    ActuationReport,
    ActuatorOptions,
    HostAddressPolicy,
    HostNetworkActuator,
    PlannedStep,
    RolePlan,
    RoleReport,
    RoleTarget,
    StepRecord,
    DEFAULT_BRIDGE,
    DEFAULT_ROLE,
};
pub use descriptor::{
    load_from_path,
    DescriptorLoader,
    InterfaceMapping,
    IpRange,
    IpSetting,
    NetworkDescriptor,
    DEFAULT_DESCRIPTOR_ENV,
};
pub use error::{FailureDetail, NetSetupError, Result};
pub use interrupt::InterruptFlag;
pub use lock::{AdvisoryLock, DEFAULT_LOCK_FILE};
pub use mock::{MockHost, MockInterface, MockRunner};
pub use runner::{CommandRunner, ElevationConfig, ElevationMode, ShellRunner, DEFAULT_COMMAND_TIMEOUT};
pub use types::{CommandOutcome, Invocation, Step};
