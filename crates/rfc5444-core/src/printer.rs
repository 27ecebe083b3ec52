//! Debug packet printer.
//!
//! Re-parses every packet through a consumer-less parser and logs a hexdump
//! when DEBUG logging is enabled. Parsing is not free, so the severity gate
//! is checked before any work happens.

use std::fmt::Write;
use std::net::SocketAddr;

use crate::reader::{InputContext, PacketParser};

pub struct PacketPrinter {
    parser: PacketParser,
    buffer: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl Default for PacketPrinter {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketPrinter {
    pub fn new() -> Self {
        Self { parser: PacketParser::new(), buffer: String::new() }
    }

    pub fn print(
        &mut self,
        direction: Direction,
        remote: SocketAddr,
        interface: &str,
        data: &[u8],
    ) {
        if !tracing::enabled!(tracing::Level::DEBUG) {
            return;
        }

        let (label, preposition) = match direction {
            Direction::Incoming => ("incoming", "from"),
            Direction::Outgoing => ("outgoing", "to"),
        };

        let input = InputContext { address: remote, interface: interface.to_string() };
        if let Err(e) = self.parser.handle_packet(&input, data, &mut |_| {}) {
            tracing::warn!(
                "could not print {label} packet {preposition} {remote} on {interface}: {e}"
            );
            return;
        }

        self.buffer.clear();
        hexdump(&mut self.buffer, data);
        tracing::debug!(
            "{label} packet {preposition} {remote} through {interface}:\n{}",
            self.buffer
        );
    }
}

fn hexdump(out: &mut String, data: &[u8]) {
    for (line, chunk) in data.chunks(16).enumerate() {
        let _ = write!(out, "{:04x}: ", line * 16);
        for i in 0..16 {
            match chunk.get(i) {
                Some(b) => {
                    let _ = write!(out, "{b:02x} ");
                }
                None => out.push_str("   "),
            }
        }
        out.push(' ');
        for b in chunk {
            out.push(if b.is_ascii_graphic() { *b as char } else { '.' });
        }
        out.push('\n');
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hexdump_format() {
        let mut out = String::new();
        hexdump(&mut out, b"RFC 5444 packets here");
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("0000: 52 46 43 20"));
        assert!(lines[0].ends_with("RFC.5444.packets"));
        assert!(lines[1].starts_with("0010: 20 68 65 72 65"));
    }

    #[test]
    fn test_hexdump_empty() {
        let mut out = String::new();
        hexdump(&mut out, &[]);
        assert!(out.is_empty());
    }
}
