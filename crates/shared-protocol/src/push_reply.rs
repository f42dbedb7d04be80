//! Server-pushed options

use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Cipher, ProtocolError, ProtocolResult};

/// IPv4 route pushed by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub destination: Ipv4Addr,
    pub mask: Ipv4Addr,
    /// None means the VPN gateway
    pub gateway: Option<Ipv4Addr>,
}

/// Interface addressing mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Topology {
    #[default]
    Net30,
    P2p,
    Subnet,
}

/// Tunnel interface IPv4 settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ipv4Settings {
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Option<Ipv4Addr>,
}

/// Options negotiated with the server
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteOptions {
    pub keep_alive_interval: Option<Duration>,
    pub keep_alive_timeout: Option<Duration>,
    pub renegotiates_after: Option<Duration>,
    pub ipv4: Option<Ipv4Settings>,
    pub routes: Vec<Route>,
    pub route_gateway: Option<Ipv4Addr>,
    pub topology: Option<Topology>,
    pub redirect_gateway: bool,
    pub dns_servers: Vec<IpAddr>,
    pub search_domains: Vec<String>,
    pub peer_id: Option<u32>,
    pub cipher: Option<Cipher>,
    pub mtu: Option<u16>,
    /// Options this parser does not interpret
    pub other: Vec<String>,
}

impl RemoteOptions {
    fn merge(&mut self, next: RemoteOptions) {
        macro_rules! take_some {
            ($($field:ident),*) => {
                $(if next.$field.is_some() { self.$field = next.$field; })*
            };
        }
        take_some!(
            keep_alive_interval,
            keep_alive_timeout,
            renegotiates_after,
            ipv4,
            route_gateway,
            topology,
            peer_id,
            cipher,
            mtu
        );
        self.redirect_gateway |= next.redirect_gateway;
        self.routes.extend(next.routes);
        self.dns_servers.extend(next.dns_servers);
        self.search_domains.extend(next.search_domains);
        self.other.extend(next.other);
    }
}

/// Snapshot of a `PUSH_REPLY` message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushReply {
    pub options: RemoteOptions,
    pub original: String,
    continuation: Option<u8>,
}

impl PushReply {
    pub const PREFIX: &'static str = "PUSH_REPLY";

    /// Parse a control message; `Ok(None)` if it is not a push reply
    pub fn parse(message: &str) -> ProtocolResult<Option<Self>> {
        let message = message.trim_end_matches('\0').trim();
        let Some(rest) = message.strip_prefix(Self::PREFIX) else {
            return Ok(None);
        };

        let mut options = RemoteOptions::default();
        let mut continuation = None;
        let mut ifconfig: Option<(Ipv4Addr, Ipv4Addr)> = None;

        for entry in rest.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let tokens: Vec<&str> = entry.split_whitespace().collect();
            let args = &tokens[1..];
            match tokens[0] {
                "ping" => options.keep_alive_interval = Some(seconds(entry, args)?),
                "ping-restart" => options.keep_alive_timeout = Some(seconds(entry, args)?),
                "reneg-sec" => options.renegotiates_after = Some(seconds(entry, args)?),
                "peer-id" => options.peer_id = Some(number(entry, args)?),
                "tun-mtu" => options.mtu = Some(number(entry, args)?),
                "cipher" => options.cipher = Some(Cipher::from_str(arg(entry, args, 0)?)?),
                "topology" => {
                    options.topology = Some(match arg(entry, args, 0)? {
                        "subnet" => Topology::Subnet,
                        "p2p" => Topology::P2p,
                        _ => Topology::Net30,
                    })
                }
                "ifconfig" => {
                    ifconfig = Some((address(entry, args, 0)?, address(entry, args, 1)?));
                }
                "route-gateway" => options.route_gateway = Some(address(entry, args, 0)?),
                "route" => {
                    let destination = address(entry, args, 0)?;
                    let mask = match args.get(1) {
                        Some(_) => address(entry, args, 1)?,
                        None => Ipv4Addr::BROADCAST,
                    };
                    let gateway = args.get(2).and_then(|gw| gw.parse().ok());
                    options.routes.push(Route {
                        destination,
                        mask,
                        gateway,
                    });
                }
                "redirect-gateway" => options.redirect_gateway = true,
                "dhcp-option" => match arg(entry, args, 0)? {
                    "DNS" | "DNS6" => {
                        let server = arg(entry, args, 1)?;
                        let server = server.parse().map_err(|_| invalid(entry, "bad address"))?;
                        options.dns_servers.push(server);
                    }
                    "DOMAIN" | "DOMAIN-SEARCH" => {
                        options.search_domains.push(arg(entry, args, 1)?.to_string())
                    }
                    _ => options.other.push(entry.to_string()),
                },
                "push-continuation" => continuation = Some(number(entry, args)?),
                _ => options.other.push(entry.to_string()),
            }
        }

        if let Some((local, remote)) = ifconfig {
            options.ipv4 = Some(match options.topology {
                Some(Topology::Subnet) => Ipv4Settings {
                    address: local,
                    netmask: remote,
                    gateway: options.route_gateway,
                },
                _ => Ipv4Settings {
                    address: local,
                    netmask: Ipv4Addr::BROADCAST,
                    gateway: Some(remote),
                },
            });
        }

        Ok(Some(Self {
            options,
            original: message.to_string(),
            continuation,
        }))
    }

    /// False while the server announced more parts (`push-continuation 2`)
    pub fn is_complete(&self) -> bool {
        self.continuation != Some(2)
    }

    /// Fold a continuation part into this reply
    pub fn merge(&mut self, next: PushReply) {
        self.options.merge(next.options);
        self.original.push('\n');
        self.original.push_str(&next.original);
        self.continuation = next.continuation;
    }
}

fn invalid(entry: &str, reason: &str) -> ProtocolError {
    ProtocolError::InvalidOption {
        option: entry.to_string(),
        reason: reason.to_string(),
    }
}

fn arg<'a>(entry: &str, args: &[&'a str], index: usize) -> ProtocolResult<&'a str> {
    args.get(index)
        .copied()
        .ok_or_else(|| invalid(entry, "missing argument"))
}

fn number<T: FromStr>(entry: &str, args: &[&str]) -> ProtocolResult<T> {
    arg(entry, args, 0)?
        .parse()
        .map_err(|_| invalid(entry, "not a number"))
}

fn seconds(entry: &str, args: &[&str]) -> ProtocolResult<Duration> {
    number::<u64>(entry, args).map(Duration::from_secs)
}

fn address(entry: &str, args: &[&str], index: usize) -> ProtocolResult<Ipv4Addr> {
    arg(entry, args, index)?
        .parse()
        .map_err(|_| invalid(entry, "bad address"))
}
