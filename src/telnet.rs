//! Telnet option negotiation, stripped from the inbound stream and answered
//! in-line. We refuse every option: the probe only wants the banner.

pub const IAC: u8 = 255;
pub const DONT: u8 = 254;
pub const DO: u8 = 253;
pub const WONT: u8 = 252;
pub const WILL: u8 = 251;
pub const SB: u8 = 250;
pub const SE: u8 = 240;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Data,
    Iac,
    Option(u8),
    Sub,
    SubIac,
}

/// Output of one [`TelnetNegotiator::feed`] call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TelnetOutput {
    /// Banner bytes with all negotiation removed.
    pub data: Vec<u8>,
    /// Replies that must be written back to the peer.
    pub replies: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct TelnetNegotiator {
    state: State,
    negotiations: usize,
}

impl Default for TelnetNegotiator {
    fn default() -> Self {
        Self::new()
    }
}

impl TelnetNegotiator {
    pub fn new() -> Self {
        Self {
            state: State::Data,
            negotiations: 0,
        }
    }

    /// Number of option requests answered so far.
    pub fn negotiations(&self) -> usize {
        self.negotiations
    }

    /// Process one inbound fragment. A command split across fragments is
    /// carried over and completed by the next call.
    pub fn feed(&mut self, input: &[u8]) -> TelnetOutput {
        let mut out = TelnetOutput::default();
        for &b in input {
            self.state = match self.state {
                State::Data if b == IAC => State::Iac,
                State::Data => {
                    out.data.push(b);
                    State::Data
                }
                State::Iac => match b {
                    IAC => {
                        out.data.push(IAC);
                        State::Data
                    }
                    WILL | WONT | DO | DONT => State::Option(b),
                    SB => State::Sub,
                    // NOP, GA, AYT and friends carry no option byte.
                    _ => State::Data,
                },
                State::Option(cmd) => {
                    let answer = match cmd {
                        WILL | WONT => DONT,
                        _ => WONT,
                    };
                    out.replies.extend_from_slice(&[IAC, answer, b]);
                    self.negotiations += 1;
                    State::Data
                }
                State::Sub if b == IAC => State::SubIac,
                State::Sub => State::Sub,
                State::SubIac if b == SE => State::Data,
                State::SubIac => State::Sub,
            };
        }
        out
    }
}
