// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Telnet framing: CR/LF/CRLF line decoding with length and printability
//! caps, plus enough IAC subnegotiation for terminal-type, window size, and
//! the structured-data option. Anything beyond that is answered with a
//! refusal, per the robustness rule of accepting any peer.

pub const IAC: u8 = 255;
pub const DONT: u8 = 254;
pub const DO: u8 = 253;
pub const WONT: u8 = 252;
pub const WILL: u8 = 251;
pub const SB: u8 = 250;
pub const SE: u8 = 240;

pub const OPT_TTYPE: u8 = 24;
pub const OPT_NAWS: u8 = 31;
pub const OPT_GMCP: u8 = 201;

const TTYPE_IS: u8 = 0;
pub const TTYPE_SEND: u8 = 1;

/// Decoded input units, in wire order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TelnetEvent {
    Line(String),
    /// Structured-data subnegotiation: "Package.Name {json}".
    Gmcp { package: String, data: Vec<u8> },
    WindowSize { width: u16, height: u16 },
    TerminalType(String),
    /// Client agreed (WILL/DO) to an option we care about.
    OptionEnabled(u8),
    OptionDisabled(u8),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TelnetError {
    LineTooLong,
    /// Too many non-printable bytes in one line; almost certainly not a
    /// MUD client on the other end.
    BinaryGarbage,
}

enum DecodeState {
    Normal,
    /// Saw CR; a following LF belongs to the same terminator.
    SawCr,
    Iac,
    /// Saw IAC WILL/WONT/DO/DONT, awaiting the option byte.
    IacVerb(u8),
    /// Inside IAC SB <option> ... IAC SE.
    Subneg { option: u8, data: Vec<u8>, saw_iac: bool },
}

/// Incremental decoder; one per connection.
pub struct TelnetDecoder {
    state: DecodeState,
    line: Vec<u8>,
    nonprintable: usize,
    max_line_len: usize,
    max_nonprintable: usize,
}

impl TelnetDecoder {
    pub fn new(max_line_len: usize, max_nonprintable: usize) -> Self {
        Self {
            state: DecodeState::Normal,
            line: Vec::new(),
            nonprintable: 0,
            max_line_len,
            max_nonprintable,
        }
    }

    /// Feeds raw bytes; returns the events decoded so far or the protocol
    /// violation that should close the connection.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<TelnetEvent>, TelnetError> {
        let mut events = Vec::new();
        for &byte in bytes {
            self.push_byte(byte, &mut events)?;
        }
        Ok(events)
    }

    fn push_byte(&mut self, byte: u8, events: &mut Vec<TelnetEvent>) -> Result<(), TelnetError> {
        match &mut self.state {
            DecodeState::Normal => match byte {
                IAC => self.state = DecodeState::Iac,
                b'\r' => {
                    self.state = DecodeState::SawCr;
                    self.finish_line(events)?;
                }
                b'\n' => self.finish_line(events)?,
                _ => self.push_line_byte(byte)?,
            },
            DecodeState::SawCr => {
                self.state = DecodeState::Normal;
                match byte {
                    // LF after CR: same terminator, swallow.
                    b'\n' => {}
                    IAC => self.state = DecodeState::Iac,
                    b'\r' => {
                        self.state = DecodeState::SawCr;
                        self.finish_line(events)?;
                    }
                    _ => self.push_line_byte(byte)?,
                }
            }
            DecodeState::Iac => match byte {
                // Escaped 0xff data byte.
                IAC => {
                    self.state = DecodeState::Normal;
                    self.push_line_byte(IAC)?;
                }
                WILL | WONT | DO | DONT => self.state = DecodeState::IacVerb(byte),
                SB => {
                    self.state = DecodeState::Subneg {
                        option: 0,
                        data: Vec::new(),
                        saw_iac: false,
                    }
                }
                // NOP and friends.
                _ => self.state = DecodeState::Normal,
            },
            DecodeState::IacVerb(verb) => {
                let verb = *verb;
                self.state = DecodeState::Normal;
                match verb {
                    WILL | DO => events.push(TelnetEvent::OptionEnabled(byte)),
                    _ => events.push(TelnetEvent::OptionDisabled(byte)),
                }
            }
            DecodeState::Subneg {
                option,
                data,
                saw_iac,
            } => {
                if *saw_iac {
                    if byte == SE {
                        let option = *option;
                        let data = std::mem::take(data);
                        self.state = DecodeState::Normal;
                        Self::finish_subneg(option, data, events);
                        return Ok(());
                    }
                    *saw_iac = false;
                    if byte == IAC {
                        data.push(IAC);
                        return Ok(());
                    }
                    data.push(byte);
                    return Ok(());
                }
                if byte == IAC {
                    *saw_iac = true;
                } else if data.is_empty() && *option == 0 {
                    *option = byte;
                } else {
                    data.push(byte);
                }
            }
        }
        Ok(())
    }

    fn push_line_byte(&mut self, byte: u8) -> Result<(), TelnetError> {
        if !(byte == b'\t' || (0x20..0x7f).contains(&byte) || byte >= 0x80) {
            self.nonprintable += 1;
            if self.nonprintable > self.max_nonprintable {
                return Err(TelnetError::BinaryGarbage);
            }
            return Ok(());
        }
        if self.line.len() >= self.max_line_len {
            return Err(TelnetError::LineTooLong);
        }
        self.line.push(byte);
        Ok(())
    }

    fn finish_line(&mut self, events: &mut Vec<TelnetEvent>) -> Result<(), TelnetError> {
        self.nonprintable = 0;
        let line = String::from_utf8_lossy(&self.line).into_owned();
        self.line.clear();
        events.push(TelnetEvent::Line(line));
        Ok(())
    }

    fn finish_subneg(option: u8, data: Vec<u8>, events: &mut Vec<TelnetEvent>) {
        match option {
            OPT_NAWS if data.len() >= 4 => {
                events.push(TelnetEvent::WindowSize {
                    width: u16::from_be_bytes([data[0], data[1]]),
                    height: u16::from_be_bytes([data[2], data[3]]),
                });
            }
            OPT_TTYPE if data.first() == Some(&TTYPE_IS) => {
                events.push(TelnetEvent::TerminalType(
                    String::from_utf8_lossy(&data[1..]).trim().to_owned(),
                ));
            }
            OPT_GMCP => {
                let text = String::from_utf8_lossy(&data);
                let (package, payload) = match text.split_once(' ') {
                    Some((package, payload)) => (package.to_owned(), payload.as_bytes().to_vec()),
                    None => (text.trim().to_owned(), Vec::new()),
                };
                if !package.is_empty() {
                    events.push(TelnetEvent::Gmcp {
                        package,
                        data: payload,
                    });
                }
            }
            _ => {}
        }
    }
}

/// Option offers sent right after accept.
pub fn negotiation_banner() -> Vec<u8> {
    vec![
        IAC, WILL, OPT_GMCP, //
        IAC, DO, OPT_NAWS, //
        IAC, DO, OPT_TTYPE,
    ]
}

/// IAC SB TTYPE SEND IAC SE, asking the client to name its terminal.
pub fn request_terminal_type() -> Vec<u8> {
    vec![IAC, SB, OPT_TTYPE, TTYPE_SEND, IAC, SE]
}

/// Frames outbound text, escaping stray IAC bytes.
pub fn frame_line(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len() + 2);
    for &byte in text.as_bytes() {
        if byte == IAC {
            out.push(IAC);
        }
        out.push(byte);
    }
    out.extend_from_slice(b"\r\n");
    out
}

pub fn frame_prompt() -> Vec<u8> {
    b"> ".to_vec()
}

pub fn frame_gmcp(package: &str, data: &[u8]) -> Vec<u8> {
    let mut out = vec![IAC, SB, OPT_GMCP];
    out.extend_from_slice(package.as_bytes());
    if !data.is_empty() {
        out.push(b' ');
        for &byte in data {
            if byte == IAC {
                out.push(IAC);
            }
            out.push(byte);
        }
    }
    out.extend_from_slice(&[IAC, SE]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoder() -> TelnetDecoder {
        TelnetDecoder::new(512, 16)
    }

    #[test]
    fn all_three_terminators() {
        let mut d = decoder();
        let events = d.push(b"one\r\ntwo\nthree\r").unwrap();
        assert_eq!(
            events,
            vec![
                TelnetEvent::Line("one".to_owned()),
                TelnetEvent::Line("two".to_owned()),
                TelnetEvent::Line("three".to_owned()),
            ]
        );
        // The CR already ended the line; a following LF is not a new one.
        assert!(d.push(b"\n").unwrap().is_empty());
    }

    #[test]
    fn split_across_reads() {
        let mut d = decoder();
        assert!(d.push(b"kill ra").unwrap().is_empty());
        let events = d.push(b"t\r\n").unwrap();
        assert_eq!(events, vec![TelnetEvent::Line("kill rat".to_owned())]);
    }

    #[test]
    fn line_length_cap() {
        let mut d = TelnetDecoder::new(8, 16);
        assert_eq!(d.push(b"123456789"), Err(TelnetError::LineTooLong));
    }

    #[test]
    fn nonprintable_cap() {
        let mut d = TelnetDecoder::new(512, 2);
        assert_eq!(
            d.push(&[0x01, 0x02, 0x03]),
            Err(TelnetError::BinaryGarbage)
        );
    }

    #[test]
    fn naws_subnegotiation() {
        let mut d = decoder();
        let events = d
            .push(&[IAC, SB, OPT_NAWS, 0, 120, 0, 40, IAC, SE])
            .unwrap();
        assert_eq!(
            events,
            vec![TelnetEvent::WindowSize {
                width: 120,
                height: 40
            }]
        );
    }

    #[test]
    fn gmcp_subnegotiation() {
        let mut d = decoder();
        let mut bytes = vec![IAC, SB, OPT_GMCP];
        bytes.extend_from_slice(b"Core.Hello {\"client\":\"mudlet\"}");
        bytes.extend_from_slice(&[IAC, SE]);
        let events = d.push(&bytes).unwrap();
        assert_eq!(
            events,
            vec![TelnetEvent::Gmcp {
                package: "Core.Hello".to_owned(),
                data: b"{\"client\":\"mudlet\"}".to_vec(),
            }]
        );
    }

    #[test]
    fn will_do_answers() {
        let mut d = decoder();
        let events = d.push(&[IAC, WILL, OPT_GMCP, IAC, DONT, OPT_NAWS]).unwrap();
        assert_eq!(
            events,
            vec![
                TelnetEvent::OptionEnabled(OPT_GMCP),
                TelnetEvent::OptionDisabled(OPT_NAWS),
            ]
        );
    }

    #[test]
    fn escaped_iac_is_data() {
        let mut d = decoder();
        let events = d.push(&[b'a', IAC, IAC, b'b', b'\n']).unwrap();
        assert_eq!(
            events,
            vec![TelnetEvent::Line(String::from_utf8_lossy(&[b'a', 0xff, b'b']).into_owned())]
        );
    }

    #[test]
    fn frame_line_escapes_and_terminates() {
        assert_eq!(frame_line("hi"), b"hi\r\n".to_vec());
        let framed = frame_line(std::str::from_utf8(b"x").unwrap());
        assert!(framed.ends_with(b"\r\n"));
    }
}
