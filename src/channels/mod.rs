//! Typed channels built on the channel protocol.

pub mod askpass;
pub mod launch;

pub use askpass::{ASKPASS_CHANNEL, AskpassChannel, AskpassChannelClient, AskpassService, Credentials};
pub use launch::{LAUNCH_CHANNEL, LaunchChannel, LaunchChannelClient, LaunchService, StartArguments};
