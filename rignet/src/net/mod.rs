//! Network layer: endpoints, lifecycle events and communicators

pub mod communicator;
pub mod echo;
pub mod event;
pub mod uri;

pub use communicator::{Callback, Communicator, EventWait, Frame, Role, Subscriber};
pub use echo::EchoCommunicator;
pub use event::{EventKey, LifecycleEvent};
pub use uri::{Endpoint, Scheme, UriOptions, validate_uri};
