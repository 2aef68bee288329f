use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::metadata::{EdgeMetadata, NodeMetadata};
use super::types::Node;

#[derive(Serialize, Deserialize, Debug, Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Grpc,
    Http,
    Tcp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Grpc => "grpc",
            Protocol::Http => "http",
            Protocol::Tcp => "tcp",
        }
    }

    pub fn info(self) -> &'static ProtocolInfo {
        match self {
            Protocol::Grpc => &GRPC,
            Protocol::Http => &HTTP,
            Protocol::Tcp => &TCP,
        }
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "grpc" => Ok(Protocol::Grpc),
            "http" => Ok(Protocol::Http),
            "tcp" => Ok(Protocol::Tcp),
            other => Err(format!("unhandled protocol [{}]", other)),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Debug, Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
#[serde(rename_all = "camelCase")]
pub enum RateKey {
    Grpc,
    GrpcErr,
    GrpcIn,
    GrpcInErr,
    GrpcOut,
    Http,
    Http3xx,
    Http4xx,
    Http5xx,
    HttpIn,
    HttpIn3xx,
    HttpIn4xx,
    HttpIn5xx,
    HttpOut,
    Tcp,
    TcpIn,
    TcpOut,
}

#[derive(Debug, Copy, Clone)]
pub struct Rate {
    pub key: RateKey,
    pub is_err: bool,
    pub is_in: bool,
    pub is_out: bool,
    pub is_total: bool,
    pub precision: u8,
}

const fn rate(key: RateKey) -> Rate {
    Rate {
        key,
        is_err: false,
        is_in: false,
        is_out: false,
        is_total: false,
        precision: 2,
    }
}

const fn err(key: RateKey) -> Rate {
    Rate {
        is_err: true,
        ..rate(key)
    }
}

const fn rate_in(key: RateKey) -> Rate {
    Rate {
        is_in: true,
        ..rate(key)
    }
}

const fn rate_out(key: RateKey) -> Rate {
    Rate {
        is_out: true,
        ..rate(key)
    }
}

const fn total(key: RateKey) -> Rate {
    Rate {
        is_total: true,
        ..rate(key)
    }
}

#[derive(Debug)]
pub struct ProtocolInfo {
    pub protocol: Protocol,
    pub edge_rates: &'static [Rate],
    pub node_rates: &'static [Rate],
    pub unit: &'static str,
    pub unit_short: &'static str,
}

pub static GRPC: ProtocolInfo = ProtocolInfo {
    protocol: Protocol::Grpc,
    edge_rates: &[total(RateKey::Grpc), err(RateKey::GrpcErr)],
    node_rates: &[
        rate_in(RateKey::GrpcIn),
        err(RateKey::GrpcInErr),
        rate_out(RateKey::GrpcOut),
    ],
    unit: "requests per second",
    unit_short: "rps",
};

pub static HTTP: ProtocolInfo = ProtocolInfo {
    protocol: Protocol::Http,
    edge_rates: &[
        total(RateKey::Http),
        rate(RateKey::Http3xx),
        err(RateKey::Http4xx),
        err(RateKey::Http5xx),
    ],
    node_rates: &[
        rate_in(RateKey::HttpIn),
        rate(RateKey::HttpIn3xx),
        err(RateKey::HttpIn4xx),
        err(RateKey::HttpIn5xx),
        rate_out(RateKey::HttpOut),
    ],
    unit: "requests per second",
    unit_short: "rps",
};

pub static TCP: ProtocolInfo = ProtocolInfo {
    protocol: Protocol::Tcp,
    edge_rates: &[total(RateKey::Tcp)],
    node_rates: &[rate_in(RateKey::TcpIn), rate_out(RateKey::TcpOut)],
    unit: "bytes per second",
    unit_short: "bps",
};

pub static PROTOCOLS: [&ProtocolInfo; 3] = [&GRPC, &HTTP, &TCP];

/// Telemetry may report HTTP codes for gRPC; a 3-char code is judged as HTTP.
pub fn is_grpc_error(code: &str) -> bool {
    if code.len() == 3 {
        code.starts_with('4') || code.starts_with('5')
    } else {
        code != "0"
    }
}

/// Adds one traffic value as source, dest and edge traffic. Either node side may be skipped.
#[allow(clippy::too_many_arguments)]
pub fn add_to_metadata(
    protocol: Protocol,
    value: f64,
    code: &str,
    flags: &str,
    host: &str,
    source: Option<&mut NodeMetadata>,
    dest: Option<&mut NodeMetadata>,
    edge: &mut EdgeMetadata,
) {
    if value <= 0.0 {
        return;
    }

    match protocol {
        Protocol::Grpc => {
            let is_err = is_grpc_error(code);
            if let Some(source) = source {
                source.rates.add(RateKey::GrpcOut, value);
            }
            if let Some(dest) = dest {
                dest.rates.add(RateKey::GrpcIn, value);
                if is_err {
                    dest.rates.add(RateKey::GrpcInErr, value);
                }
            }
            edge.rates.add(RateKey::Grpc, value);
            if is_err {
                edge.rates.add(RateKey::GrpcErr, value);
            }
            edge.add_response(code, flags, host, value);
        }
        Protocol::Http => {
            // 2xx is not tracked, it is the total less 3xx/4xx/5xx
            let class = match code.chars().next() {
                Some('3') => Some((RateKey::HttpIn3xx, RateKey::Http3xx)),
                Some('4') => Some((RateKey::HttpIn4xx, RateKey::Http4xx)),
                Some('5') => Some((RateKey::HttpIn5xx, RateKey::Http5xx)),
                _ => None,
            };
            if let Some(source) = source {
                source.rates.add(RateKey::HttpOut, value);
            }
            if let Some(dest) = dest {
                dest.rates.add(RateKey::HttpIn, value);
                if let Some((node_key, _)) = class {
                    dest.rates.add(node_key, value);
                }
            }
            edge.rates.add(RateKey::Http, value);
            if let Some((_, edge_key)) = class {
                edge.rates.add(edge_key, value);
            }
            edge.add_response(code, flags, host, value);
        }
        Protocol::Tcp => {
            if let Some(source) = source {
                source.rates.add(RateKey::TcpOut, value);
            }
            if let Some(dest) = dest {
                dest.rates.add(RateKey::TcpIn, value);
            }
            edge.rates.add(RateKey::Tcp, value);
            edge.add_response("-", flags, host, value);
        }
    }
}

/// Folds an outgoing edge's totals into the source node's outgoing rates.
pub fn add_outgoing_edge_to_metadata(source: &mut NodeMetadata, edge: &EdgeMetadata) {
    for (edge_key, node_key) in [
        (RateKey::Grpc, RateKey::GrpcOut),
        (RateKey::Http, RateKey::HttpOut),
        (RateKey::Tcp, RateKey::TcpOut),
    ] {
        if let Some(value) = edge.rates.get(edge_key) {
            source.rates.add(node_key, value);
        }
    }
}

/// Adds every node rate of `node` into `aggregate`.
pub fn aggregate_node_traffic(node: &Node, aggregate: &mut Node) {
    for info in PROTOCOLS {
        for rate in info.node_rates {
            if let Some(value) = node.metadata.rates.get(rate.key) {
                aggregate.metadata.rates.add(rate.key, value);
            }
        }
    }
}

/// Adds the traffic of `edge` into `aggregate`, used when several edges reduce to one.
pub fn aggregate_edge_traffic(edge: &EdgeMetadata, aggregate: &mut EdgeMetadata) {
    let protocol = match edge.protocol {
        Some(protocol) => protocol,
        None => return,
    };
    for rate in protocol.info().edge_rates {
        if let Some(value) = edge.rates.get(rate.key) {
            aggregate.rates.add(rate.key, value);
        }
    }
    aggregate.add_responses(&edge.responses);
}
