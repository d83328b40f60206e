#![forbid(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::todo)]
#![warn(clippy::panic)]
#![warn(clippy::dbg_macro)]
#![warn(clippy::print_stdout)]
#![warn(clippy::print_stderr)]
#![warn(clippy::clone_on_ref_ptr)]
#![warn(unreachable_pub)]
#![warn(missing_debug_implementations)]
#![warn(unused_qualifications)]
#![deny(unused_must_use)]

pub mod adapters;
pub mod config;
pub mod connection;
pub mod credential;
pub mod error;
pub mod goaway;
pub mod notification;
pub mod provider;
pub mod request;
pub mod response;
pub mod telemetry;
pub mod transport;

pub use connection::{Connection, PendingResponse};
pub use credential::Credential;
pub use error::{SendError, ValidationError};
pub use notification::{Notification, Priority};
pub use provider::{Provider, ProviderOptions, Server};
pub use response::Response;
