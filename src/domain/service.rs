//! Service intent
//!
//! Swarm services describe how they want to be exposed through labels such as
//! `envoy.endpoint.port=8080` or `envoy.route.domain=example.com`. This module
//! turns those labels into a typed [`ServiceIntent`] with a pure parse step and
//! a separate, total validation step.

use chrono::TimeDelta;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::net::IpAddr;
use thiserror::Error;

/// Request timeout applied when a service does not set `endpoint.timeout`
pub const DEFAULT_REQUEST_TIMEOUT: TimeDelta = TimeDelta::seconds(15);

/// Catch-all domain, only accepted as a primary domain without extras
pub const WILDCARD_DOMAIN: &str = "*";

static LABEL_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)envoy\.(\S+?)\.(\S+)$").expect("label key pattern is valid")
});

static DNS_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^[A-Za-z0-9_]([A-Za-z0-9_-]{0,61}[A-Za-z0-9_])?(\.[A-Za-z0-9_]([A-Za-z0-9_-]{0,61}[A-Za-z0-9_])?)*\.?$",
    )
    .expect("dns name pattern is valid")
});

/// Transport protocol of the upstream endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EndpointProtocol {
    #[default]
    Tcp,
    Udp,
}

/// How the proxy reaches the service tasks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointIntent {
    pub protocol: EndpointProtocol,
    /// Zero means the label was missing or unparsable
    pub port: u32,
    pub request_timeout: TimeDelta,
}

/// Which requests are routed to the service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteIntent {
    pub domain: String,
    pub extra_domains: Vec<String>,
    pub path_prefix: String,
}

/// Routing and endpoint intent of one service, derived from its labels
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceIntent {
    pub endpoint: EndpointIntent,
    pub route: RouteIntent,
}

impl Default for ServiceIntent {
    fn default() -> Self {
        Self {
            endpoint: EndpointIntent {
                protocol: EndpointProtocol::Tcp,
                port: 0,
                request_timeout: DEFAULT_REQUEST_TIMEOUT,
            },
            route: RouteIntent {
                domain: String::new(),
                extra_domains: Vec::new(),
                path_prefix: "/".to_string(),
            },
        }
    }
}

/// Reasons a service cannot be exposed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LabelError {
    #[error("there is no endpoint.port label specified")]
    MissingPort,

    #[error("there is no route.domain label specified")]
    MissingDomain,

    #[error("the endpoint.timeout can't be a negative number")]
    NegativeTimeout,

    #[error("the route.domain is not a valid DNS name")]
    InvalidDomain,

    #[error("the route.extra-domains contains an invalid DNS name")]
    InvalidExtraDomain,
}

impl From<LabelError> for crate::errors::Error {
    fn from(error: LabelError) -> Self {
        crate::errors::Error::validation_field(error.to_string(), "labels")
    }
}

impl ServiceIntent {
    /// Build an intent from service labels. Unknown keys are ignored and
    /// malformed values fall back to zero values, never to an error.
    pub fn parse(labels: &HashMap<String, String>) -> Self {
        let mut intent = Self::default();

        for (key, value) in labels {
            let Some(captures) = LABEL_KEY.captures(key) else {
                continue;
            };

            let property = captures[2].to_ascii_lowercase();
            match captures[1].to_ascii_lowercase().as_str() {
                "endpoint" => intent.set_endpoint_property(&property, value),
                "route" => intent.set_route_property(&property, value),
                _ => {}
            }
        }

        intent
    }

    fn set_endpoint_property(&mut self, property: &str, value: &str) {
        match property {
            "timeout" => {
                self.endpoint.request_timeout = parse_go_duration(value).unwrap_or(TimeDelta::zero());
            }
            "protocol" => {
                self.endpoint.protocol = if value.eq_ignore_ascii_case("udp") {
                    EndpointProtocol::Udp
                } else {
                    EndpointProtocol::Tcp
                };
            }
            "port" => self.endpoint.port = value.trim().parse().unwrap_or(0),
            _ => {}
        }
    }

    fn set_route_property(&mut self, property: &str, value: &str) {
        match property {
            "path" => self.route.path_prefix = format!("/{}", value.trim_start_matches('/')),
            "domain" => self.route.domain = value.to_string(),
            "extra-domains" => {
                self.route.extra_domains = value.split(',').map(|d| d.trim().to_string()).collect();
            }
            _ => {}
        }
    }

    /// Check the intent can be turned into proxy configuration
    pub fn validate(&self) -> Result<(), LabelError> {
        if self.endpoint.port == 0 {
            return Err(LabelError::MissingPort);
        }

        if self.route.domain.is_empty() {
            return Err(LabelError::MissingDomain);
        }

        if self.endpoint.request_timeout < TimeDelta::zero() {
            return Err(LabelError::NegativeTimeout);
        }

        if !is_dns_name(&self.route.domain) && !self.is_catch_all() {
            return Err(LabelError::InvalidDomain);
        }

        if self.route.extra_domains.iter().any(|d| !is_dns_name(d)) {
            return Err(LabelError::InvalidExtraDomain);
        }

        Ok(())
    }

    /// Whether the service takes every host no other service claims
    pub fn is_catch_all(&self) -> bool {
        self.route.domain == WILDCARD_DOMAIN && self.route.extra_domains.is_empty()
    }

    /// Primary domain followed by the extra domains, without duplicates
    pub fn domains(&self) -> Vec<String> {
        let mut domains = vec![self.route.domain.clone()];
        for extra in &self.route.extra_domains {
            if !domains.contains(extra) {
                domains.push(extra.clone());
            }
        }
        domains
    }
}

/// Syntactic DNS name check. IP literals are not names.
pub fn is_dns_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 253 {
        return false;
    }

    if name.parse::<IpAddr>().is_ok() {
        return false;
    }

    DNS_NAME.is_match(name)
}

/// Parse a duration in the `300ms`, `1.5h`, `2h45m` format
pub fn parse_go_duration(input: &str) -> Option<TimeDelta> {
    let (negative, mut rest) = match input.as_bytes().first() {
        Some(b'-') => (true, &input[1..]),
        Some(b'+') => (false, &input[1..]),
        _ => (false, input),
    };

    if rest == "0" {
        return Some(TimeDelta::zero());
    }
    if rest.is_empty() {
        return None;
    }

    let mut total: i128 = 0;
    while !rest.is_empty() {
        let int_len = rest.bytes().take_while(u8::is_ascii_digit).count();
        let (int_part, after_int) = rest.split_at(int_len);

        let (frac_part, after_number) = match after_int.strip_prefix('.') {
            Some(tail) => {
                let frac_len = tail.bytes().take_while(u8::is_ascii_digit).count();
                tail.split_at(frac_len)
            }
            None => ("", after_int),
        };

        if int_part.is_empty() && frac_part.is_empty() {
            return None;
        }

        let unit_len = after_number
            .char_indices()
            .find(|(_, c)| c.is_ascii_digit() || *c == '.')
            .map(|(i, _)| i)
            .unwrap_or(after_number.len());
        let (unit, tail) = after_number.split_at(unit_len);

        let unit_nanos: i128 = match unit {
            "ns" => 1,
            "us" | "µs" | "μs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60 * 1_000_000_000,
            "h" => 3_600 * 1_000_000_000,
            _ => return None,
        };

        let whole: i128 = if int_part.is_empty() { 0 } else { int_part.parse().ok()? };
        total = total.checked_add(whole.checked_mul(unit_nanos)?)?;

        if !frac_part.is_empty() {
            // keep nanosecond precision; longer fractions are truncated
            let digits = &frac_part[..frac_part.len().min(18)];
            let numerator: i128 = digits.parse().ok()?;
            let scale = 10_i128.pow(digits.len() as u32);
            total = total.checked_add(numerator * unit_nanos / scale)?;
        }

        rest = tail;
    }

    let nanos = i64::try_from(if negative { -total } else { total }).ok()?;
    Some(TimeDelta::nanoseconds(nanos))
}
