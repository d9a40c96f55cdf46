// MIT License - Copyright (c) 2021 TJForc
// Telnet sessions to the device

pub mod command;
pub mod line;
pub mod session;
pub mod telnet;

pub use command::CommandEngine;
pub use line::LineTransport;
pub use session::{SessionHandle, SubscribeOutcome, SubscribeReport};
