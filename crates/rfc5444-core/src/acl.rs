//! Source-address filtering for inbound RFC 5444 datagrams.
//!
//! An ACL is an ordered pair of accept/reject CIDR lists plus a default
//! verdict. Configuration entries use the textual form of the original
//! daemon: `+<cidr>` or bare `<cidr>` adds an accept entry, `-<cidr>` a
//! reject entry, and the keywords `default_accept`, `default_reject`,
//! `first_accept` and `first_reject` set the defaults and check order.

use anyhow::{anyhow, bail, Context, Result};
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CidrEntry {
    addr: IpAddr,
    prefix_len: u8,
}

impl CidrEntry {
    fn parse(text: &str) -> Result<Self> {
        let (addr_text, prefix_text) = match text.split_once('/') {
            Some((a, p)) => (a, Some(p)),
            None => (text, None),
        };
        let addr: IpAddr = addr_text
            .parse()
            .with_context(|| format!("invalid address in acl entry '{text}'"))?;
        let max_len = if addr.is_ipv4() { 32 } else { 128 };
        let prefix_len = match prefix_text {
            Some(p) => {
                let len: u8 = p
                    .parse()
                    .map_err(|_| anyhow!("invalid prefix length in acl entry '{text}'"))?;
                if len > max_len {
                    bail!("prefix length {len} too long in acl entry '{text}'");
                }
                len
            }
            None => max_len,
        };
        Ok(Self { addr, prefix_len })
    }

    fn contains(&self, addr: IpAddr) -> bool {
        fn prefix_match(a: &[u8], b: &[u8], len: u8) -> bool {
            let full = (len / 8) as usize;
            if a[..full] != b[..full] {
                return false;
            }
            let rem = len % 8;
            if rem == 0 {
                return true;
            }
            let mask = 0xffu8 << (8 - rem);
            (a[full] & mask) == (b[full] & mask)
        }

        match (self.addr, addr) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                prefix_match(&net.octets(), &ip.octets(), self.prefix_len)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                prefix_match(&net.octets(), &ip.octets(), self.prefix_len)
            }
            _ => false,
        }
    }
}

/// Combined IPv4/IPv6 access control list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acl {
    accept: Vec<CidrEntry>,
    reject: Vec<CidrEntry>,
    accept_first: bool,
    default_accept: bool,
}

impl Default for Acl {
    fn default() -> Self {
        Self {
            accept: Vec::new(),
            reject: Vec::new(),
            accept_first: true,
            default_accept: true,
        }
    }
}

impl Acl {
    /// Build an ACL from configuration entries. Order of CIDR entries is
    /// irrelevant; the `first_*` keywords decide which list is consulted
    /// first.
    pub fn from_entries<S: AsRef<str>>(entries: &[S]) -> Result<Self> {
        let mut acl = Acl { accept_first: true, default_accept: false, ..Default::default() };
        let mut default_seen = false;

        for entry in entries {
            match entry.as_ref().trim() {
                "" => continue,
                "default_accept" => {
                    acl.default_accept = true;
                    default_seen = true;
                }
                "default_reject" => {
                    acl.default_accept = false;
                    default_seen = true;
                }
                "first_accept" => acl.accept_first = true,
                "first_reject" => acl.accept_first = false,
                text => {
                    if let Some(rest) = text.strip_prefix('-') {
                        acl.reject.push(CidrEntry::parse(rest)?);
                    } else if let Some(rest) = text.strip_prefix('+') {
                        acl.accept.push(CidrEntry::parse(rest)?);
                    } else {
                        acl.accept.push(CidrEntry::parse(text)?);
                    }
                }
            }
        }

        // an acl with accept entries and no explicit default rejects
        // everything else, an empty acl accepts everything
        if !default_seen {
            acl.default_accept = acl.accept.is_empty();
        }
        Ok(acl)
    }

    pub fn accepts(&self, addr: IpAddr) -> bool {
        let in_accept = self.accept.iter().any(|e| e.contains(addr));
        let in_reject = self.reject.iter().any(|e| e.contains(addr));

        if self.accept_first {
            if in_accept {
                return true;
            }
            if in_reject {
                return false;
            }
        } else {
            if in_reject {
                return false;
            }
            if in_accept {
                return true;
            }
        }
        self.default_accept
    }
}
