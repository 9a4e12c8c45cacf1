//! rignet - echo-confirmed lifecycle messaging between experiment rigs
//!
//! A coordinator drives distributed experiment rigs through their lifecycle
//! (init, start, stop, cleanup) by sending small JSON messages. Every message is
//! confirmed by the receiver echoing the exact bytes back.
//!
//! # Core Concepts
//!
//! - **Echo Confirmation**: A send succeeds only when the identical bytes return
//! - **Fatal Failures**: A timeout or mismatched echo closes the communicator
//! - **Fixed Vocabulary**: Only the lifecycle events in [`LifecycleEvent`] travel
//! - **Fan-out**: [`Services`] signals many rigs and names any that stay silent
//!
//! # Modules
//!
//! - [`net`] - Endpoints, events, the communicator contract and the echo communicator
//! - [`services`] - Multi-rig orchestration
//! - [`config`] - Configuration types and loading
//! - [`error`] - Error types
//! - [`cli`] - Command-line interface

pub mod cli;
pub mod config;
pub mod error;
pub mod net;
pub mod services;

pub use config::{Config, NetworkConfig, RigConfig, ServicesConfig};
pub use error::{CommError, CommResult};
pub use net::communicator::{Callback, Communicator, EventWait, Frame, Role, Subscriber};
pub use net::echo::{EchoCommunicator, LinkState};
pub use net::event::{EVENT_TABLE_VERSION, EventKey, LifecycleEvent};
pub use net::uri::{Endpoint, LISTEN_PORT, Scheme, UriInput, UriOptions, check_uri, hostname2ip, is_valid_ip, validate_uri};
pub use services::{Responses, Services};
