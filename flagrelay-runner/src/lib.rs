//! Turns an event into a subprocess invocation and relays its output back as
//! exactly one outcome.

pub mod args;
pub mod executor;
pub mod process;
pub mod relay;

pub use args::build_arguments;
pub use executor::RequestHandler;
pub use relay::{Callbacks, Completion, Notification, Relay, Transition};
