// MIT License - Copyright (c) 2021 TJForc
// Minimal Telnet option handling

use crate::constants::telnet::{DO, DONT, IAC, SB, SE, WILL, WONT};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum State {
    #[default]
    Data,
    Iac,
    Negotiation(u8),
    Subnegotiation,
    SubnegotiationIac,
}

/// Strips Telnet commands from an inbound byte stream and refuses every option.
///
/// The server asks for terminal options before sending its banner; answering
/// `DO x` with `WONT x` and `WILL x` with `DONT x` lets it continue in plain NVT mode.
/// State is kept across calls, so a sequence may be split over several reads.
#[derive(Debug, Default)]
pub struct TelnetFilter {
    state: State,
}

impl TelnetFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes. Payload bytes are appended to `data`, negotiation replies to `replies`.
    pub fn feed(&mut self, input: &[u8], data: &mut Vec<u8>, replies: &mut Vec<u8>) {
        for &byte in input {
            self.state = match self.state {
                State::Data if byte == IAC => State::Iac,
                State::Data => {
                    data.push(byte);
                    State::Data
                }
                State::Iac => match byte {
                    IAC => {
                        data.push(IAC);
                        State::Data
                    }
                    DO | DONT | WILL | WONT => State::Negotiation(byte),
                    SB => State::Subnegotiation,
                    // NOP, GA and friends carry no payload
                    _ => State::Data,
                },
                State::Negotiation(verb) => {
                    match verb {
                        DO => replies.extend_from_slice(&[IAC, WONT, byte]),
                        WILL => replies.extend_from_slice(&[IAC, DONT, byte]),
                        _ => {}
                    }
                    State::Data
                }
                State::Subnegotiation if byte == IAC => State::SubnegotiationIac,
                State::Subnegotiation => State::Subnegotiation,
                State::SubnegotiationIac if byte == SE => State::Data,
                State::SubnegotiationIac => State::Subnegotiation,
            };
        }
    }
}
