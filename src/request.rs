use std::net::IpAddr;
use std::time::Duration;

use ipnet::{IpNet, Ipv4Net, Ipv6Net};

use crate::error::MalformedRequest;

/// Message type tag of a ban request, the one producers have always used.
pub const KIND_BAN: i64 = 1;
pub const KIND_UNBAN: i64 = 2;

pub const REASON_MAX_LENGTH: usize = 128;

const MAX_DURATION: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanRequest {
    pub address: IpNet,
    /// `None` is a permanent ban
    pub duration: Option<Duration>,
    pub reason: Option<String>,
}

impl BanRequest {
    pub fn permanent(address: IpNet) -> Self {
        Self {
            address,
            duration: None,
            reason: None,
        }
    }

    pub fn timed(address: IpNet, duration: Duration) -> Self {
        Self {
            address,
            duration: Some(duration),
            reason: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Ban(BanRequest),
    Unban(IpNet),
}

impl Request {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ban(_) => "ban",
            Self::Unban(_) => "unban",
        }
    }

    pub fn address(&self) -> IpNet {
        match self {
            Self::Ban(ban) => ban.address,
            Self::Unban(address) => *address,
        }
    }
}

/// Turns a raw queue message into a typed request.
///
/// Ban payloads are `ADDRESS [DURATION [REASON...]]`, unban payloads are a
/// lone `ADDRESS`. `DURATION` is `-` for an explicit permanent ban, or a
/// positive integer with an optional `s`, `m`, `h` or `d` suffix.
pub fn decode(kind: i64, payload: &[u8]) -> Result<Request, MalformedRequest> {
    let end = payload
        .iter()
        .rposition(|b| *b != 0)
        .map_or(0, |last| last + 1);
    let text = std::str::from_utf8(&payload[..end])
        .map_err(|_| MalformedRequest::NotUtf8)?
        .trim();
    if text.is_empty() {
        return Err(MalformedRequest::Empty);
    }

    let (address, rest) = split_token(text);
    let address = parse_address(address)?;

    match kind {
        KIND_BAN => {
            let (duration, reason) = split_token(rest);
            let duration = if duration.is_empty() {
                None
            } else {
                parse_duration(duration)?
            };
            let reason = (!reason.is_empty()).then(|| truncate_reason(reason));
            Ok(Request::Ban(BanRequest {
                address,
                duration,
                reason,
            }))
        }
        KIND_UNBAN if rest.is_empty() => Ok(Request::Unban(address)),
        KIND_UNBAN => Err(MalformedRequest::TrailingData(rest.to_string())),
        other => Err(MalformedRequest::UnknownKind(other)),
    }
}

fn split_token(s: &str) -> (&str, &str) {
    match s.split_once(char::is_whitespace) {
        Some((token, rest)) => (token, rest.trim_start()),
        None => (s, ""),
    }
}

/// Accepts a bare address (host network) or CIDR notation; host bits past
/// the prefix are cleared.
pub fn parse_address(s: &str) -> Result<IpNet, MalformedRequest> {
    if s.contains('/') {
        s.parse::<IpNet>()
            .map(|net| net.trunc())
            .map_err(|_| MalformedRequest::InvalidAddress(s.to_string()))
    } else {
        let invalid = || MalformedRequest::InvalidAddress(s.to_string());
        Ok(match s.parse::<IpAddr>().map_err(|_| invalid())? {
            IpAddr::V4(v4) => IpNet::V4(Ipv4Net::new(v4, 32).map_err(|_| invalid())?),
            IpAddr::V6(v6) => IpNet::V6(Ipv6Net::new(v6, 128).map_err(|_| invalid())?),
        })
    }
}

fn parse_duration(s: &str) -> Result<Option<Duration>, MalformedRequest> {
    if s == "-" {
        return Ok(None);
    }
    let invalid = || MalformedRequest::InvalidDuration(s.to_string());

    let (digits, unit) = match s.char_indices().last() {
        Some((idx, c)) if c.is_ascii_alphabetic() => (&s[..idx], c),
        _ => (s, 's'),
    };
    let multiplier = match unit {
        's' => 1,
        'm' => 60,
        'h' => 60 * 60,
        'd' => 24 * 60 * 60,
        _ => return Err(invalid()),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let secs = digits
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .ok_or_else(invalid)?;
    let duration = Duration::from_secs(secs);
    if secs == 0 || duration > MAX_DURATION {
        return Err(invalid());
    }
    Ok(Some(duration))
}

fn truncate_reason(reason: &str) -> String {
    if reason.len() <= REASON_MAX_LENGTH {
        return reason.to_string();
    }
    let mut end = REASON_MAX_LENGTH;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{decode, BanRequest, Request, KIND_BAN, KIND_UNBAN, REASON_MAX_LENGTH};
    use crate::error::MalformedRequest;

    fn ban(payload: &str) -> Result<Request, MalformedRequest> {
        decode(KIND_BAN, payload.as_bytes())
    }

    #[test]
    fn bare_address_is_permanent_host_ban() {
        let request = ban("192.168.1.5").unwrap();
        assert_eq!(
            request,
            Request::Ban(BanRequest::permanent("192.168.1.5/32".parse().unwrap()))
        );

        let request = ban("fd00::1").unwrap();
        assert_eq!(request.address(), "fd00::1/128".parse().unwrap());
    }

    #[test]
    fn duration_and_reason() {
        let request = ban("10.0.0.1 60").unwrap();
        assert_eq!(
            request,
            Request::Ban(BanRequest::timed(
                "10.0.0.1/32".parse().unwrap(),
                Duration::from_secs(60)
            ))
        );

        let Request::Ban(request) = ban("10.0.0.1  2h  too many   login failures").unwrap() else {
            panic!("expected a ban");
        };
        assert_eq!(request.duration, Some(Duration::from_secs(7200)));
        assert_eq!(request.reason.as_deref(), Some("too many   login failures"));

        let Request::Ban(request) = ban("10.0.0.1 - spam").unwrap() else {
            panic!("expected a ban");
        };
        assert_eq!(request.duration, None);
        assert_eq!(request.reason.as_deref(), Some("spam"));
    }

    #[test]
    fn cidr_host_bits_are_cleared() {
        let request = ban("10.1.2.3/8").unwrap();
        assert_eq!(request.address(), "10.0.0.0/8".parse().unwrap());
    }

    #[test]
    fn nul_terminated_payload() {
        let request = decode(KIND_BAN, b"127.0.0.1\0\0").unwrap();
        assert_eq!(request.address(), "127.0.0.1/32".parse().unwrap());
    }

    #[test]
    fn rejects_malformed_payloads() {
        assert_eq!(ban(""), Err(MalformedRequest::Empty));
        assert_eq!(ban(" \0"), Err(MalformedRequest::Empty));
        assert_eq!(decode(KIND_BAN, &[0xff, 0xfe]), Err(MalformedRequest::NotUtf8));
        assert!(matches!(ban("junk"), Err(MalformedRequest::InvalidAddress(_))));
        assert!(matches!(ban("10.0.0.1/33"), Err(MalformedRequest::InvalidAddress(_))));
        assert!(matches!(ban("10.0.0.1 0"), Err(MalformedRequest::InvalidDuration(_))));
        assert!(matches!(ban("10.0.0.1 ten"), Err(MalformedRequest::InvalidDuration(_))));
        assert!(matches!(ban("10.0.0.1 5w"), Err(MalformedRequest::InvalidDuration(_))));
        assert!(matches!(
            ban("10.0.0.1 99999999999999999999"),
            Err(MalformedRequest::InvalidDuration(_))
        ));
        assert_eq!(
            decode(7, b"10.0.0.1"),
            Err(MalformedRequest::UnknownKind(7))
        );
    }

    #[test]
    fn unban_takes_a_single_address() {
        assert_eq!(
            decode(KIND_UNBAN, b"10.0.0.1"),
            Ok(Request::Unban("10.0.0.1/32".parse().unwrap()))
        );
        assert!(matches!(
            decode(KIND_UNBAN, b"10.0.0.1 60"),
            Err(MalformedRequest::TrailingData(_))
        ));
    }

    #[test]
    fn long_reason_is_truncated_on_char_boundary() {
        let reason = "é".repeat(REASON_MAX_LENGTH);
        let Request::Ban(request) = ban(&format!("10.0.0.1 1m {reason}")).unwrap() else {
            panic!("expected a ban");
        };
        let truncated = request.reason.unwrap();
        assert!(truncated.len() <= REASON_MAX_LENGTH);
        assert!(reason.starts_with(&truncated));
    }
}
