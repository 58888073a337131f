//! Client authorization.
//!
//! Every client query is checked against an [`Authorizer`]. Authorized
//! clients are proxied to the upstream resolver; everyone else gets the
//! portal address. Decisions are made fresh on every query.

use rustc_hash::FxHashSet;
use std::fs;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Default location of the kernel neighbour table on Linux.
pub const DEFAULT_ARP_TABLE: &str = "/proc/net/arp";

/// Neighbour entry flag: hardware address is known.
const ATF_COM: u32 = 0x2;

/// Decides whether a client may resolve names through the real upstream.
pub trait Authorizer: Send + Sync {
    fn is_authorized(&self, client: SocketAddr) -> bool;
}

impl<F> Authorizer for F
where
    F: Fn(SocketAddr) -> bool + Send + Sync,
{
    fn is_authorized(&self, client: SocketAddr) -> bool {
        self(client)
    }
}

/// Nobody is authorized; every query is redirected to the portal.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

impl Authorizer for DenyAll {
    fn is_authorized(&self, _client: SocketAddr) -> bool {
        false
    }
}

/// Everybody is authorized; the proxy is a plain forwarder.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn is_authorized(&self, _client: SocketAddr) -> bool {
        true
    }
}

/// Authorizes clients whose hardware address is on an allowlist.
///
/// The client's IP is mapped to a MAC through the kernel neighbour table,
/// which is re-read on every check so that new leases and departures are
/// seen immediately.
///
/// The table is read synchronously from the engine's receive loop, so every
/// check blocks that loop for one small file read. `/proc/net/arp` is served
/// from kernel memory; pointing `arp_path` at slow storage stalls the proxy.
pub struct MacAllowlist {
    allowed: FxHashSet<String>,
    arp_path: PathBuf,
}

impl MacAllowlist {
    pub fn new<I, S>(macs: I, arp_path: impl Into<PathBuf>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            allowed: macs
                .into_iter()
                .filter_map(|m| {
                    let raw = m.as_ref();
                    let mac = normalize_mac(raw);
                    if mac.is_none() {
                        warn!(entry = raw, "ignoring invalid MAC address in allowlist");
                    }
                    mac
                })
                .collect(),
            arp_path: arp_path.into(),
        }
    }

    /// Load the allowlist from a file with one MAC per line. Blank lines and
    /// lines starting with `#` are skipped.
    pub fn load(allowlist: &Path, arp_path: impl Into<PathBuf>) -> io::Result<Self> {
        let content = fs::read_to_string(allowlist)?;
        let macs = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'));

        Ok(Self::new(macs, arp_path))
    }

    pub fn len(&self) -> usize {
        self.allowed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty()
    }

    fn lookup_mac(&self, ip: IpAddr) -> io::Result<Option<String>> {
        let content = fs::read_to_string(&self.arp_path)?;
        Ok(parse_arp_table(&content, ip))
    }
}

impl Authorizer for MacAllowlist {
    fn is_authorized(&self, client: SocketAddr) -> bool {
        match self.lookup_mac(client.ip()) {
            Ok(Some(mac)) => self.allowed.contains(&mac),
            Ok(None) => {
                debug!(client = %client.ip(), "no neighbour entry for client");
                false
            }
            Err(e) => {
                warn!(path = %self.arp_path.display(), error = %e, "failed to read ARP table");
                false
            }
        }
    }
}

/// Find the MAC for `ip` in `/proc/net/arp` formatted text.
///
/// ```text
/// IP address       HW type     Flags       HW address            Mask     Device
/// 192.168.1.1      0x1         0x2         aa:bb:cc:dd:ee:ff     *        eth0
/// ```
///
/// Only complete entries count: those with the ATF_COM bit (0x2) set, which
/// includes permanent entries (0x6).
fn parse_arp_table(content: &str, ip: IpAddr) -> Option<String> {
    content.lines().skip(1).find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 || fields[3] == "00:00:00:00:00:00" {
            return None;
        }
        let flags = u32::from_str_radix(fields[2].trim_start_matches("0x"), 16).ok()?;
        if flags & ATF_COM == 0 {
            return None;
        }
        let entry_ip: IpAddr = fields[0].parse().ok()?;
        if entry_ip != ip {
            return None;
        }
        normalize_mac(fields[3])
    })
}

fn normalize_mac(raw: &str) -> Option<String> {
    let mac = raw.trim().to_ascii_lowercase().replace('-', ":");
    let octets: Vec<&str> = mac.split(':').collect();
    let valid = octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));
    valid.then_some(mac)
}
