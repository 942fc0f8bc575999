//! DNS resolution through the stack itself
//!
//! Queries go to the configured resolvers over the stack's own UDP sockets
//! on port 53, so lookups traverse the tunnel like any other traffic. Only
//! A/AAAA over plain DNS is spoken; answers are taken from the first server
//! that responds.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use tracing::{debug, trace};

use super::{Family, NetStack};
use crate::error::NetworkError;

const QUERY_TIMEOUT: Duration = Duration::from_secs(2);
/// Overall budget across servers and record types.
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

const QTYPE_A: u16 = 1;
const QTYPE_AAAA: u16 = 28;
const QCLASS_IN: u16 = 1;

/// Resolve `host` honoring the family constraint. v4 answers come first.
pub async fn resolve(
    stack: &NetStack,
    host: &str,
    family: Family,
) -> Result<Vec<IpAddr>, NetworkError> {
    let qtypes: &[u16] = match family {
        Family::V4 => &[QTYPE_A],
        Family::V6 => &[QTYPE_AAAA],
        Family::Any => &[QTYPE_A, QTYPE_AAAA],
    };

    let work = async {
        for qtype in qtypes {
            for server in stack.dns_servers() {
                match query_one(stack, *server, host, *qtype).await {
                    Ok(ips) if !ips.is_empty() => return Ok(ips),
                    Ok(_) => trace!(%server, host, "empty answer"),
                    Err(e) => trace!(%server, host, error = %e, "dns query failed"),
                }
            }
        }
        Err(NetworkError::DnsResolutionFailed {
            host: host.to_string(),
        })
    };

    match tokio::time::timeout(RESOLVE_TIMEOUT, work).await {
        Ok(result) => result,
        Err(_) => Err(NetworkError::DnsResolutionFailed {
            host: host.to_string(),
        }),
    }
}

async fn query_one(
    stack: &NetStack,
    server: IpAddr,
    host: &str,
    qtype: u16,
) -> Result<Vec<IpAddr>, NetworkError> {
    let id: u16 = rand::thread_rng().gen();
    let query = encode_query(id, host, qtype)?;

    let conn = stack
        .dial_udp_addr(SocketAddr::new(server, 53))
        .await?;
    conn.send(Bytes::from(query)).await?;

    let response = tokio::time::timeout(QUERY_TIMEOUT, conn.recv())
        .await
        .map_err(|_| NetworkError::DnsResolutionFailed {
            host: host.to_string(),
        })?
        .ok_or(NetworkError::StackClosed)?;

    let ips = parse_response(&response, id).ok_or_else(|| NetworkError::DnsResolutionFailed {
        host: host.to_string(),
    })?;
    debug!(host, %server, count = ips.len(), "resolved");
    Ok(ips)
}

/// Standard query: header, one question, recursion desired.
fn encode_query(id: u16, host: &str, qtype: u16) -> Result<Vec<u8>, NetworkError> {
    if host.is_empty() || host.len() > 253 {
        return Err(NetworkError::DnsResolutionFailed {
            host: host.to_string(),
        });
    }
    let mut buf = Vec::with_capacity(17 + host.len());
    buf.extend_from_slice(&id.to_be_bytes());
    buf.extend_from_slice(&0x0100u16.to_be_bytes()); // RD
    buf.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    buf.extend_from_slice(&[0u8; 6]); // AN/NS/AR
    for label in host.trim_end_matches('.').split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(NetworkError::DnsResolutionFailed {
                host: host.to_string(),
            });
        }
        buf.push(label.len() as u8);
        buf.extend_from_slice(label.as_bytes());
    }
    buf.push(0);
    buf.extend_from_slice(&qtype.to_be_bytes());
    buf.extend_from_slice(&QCLASS_IN.to_be_bytes());
    Ok(buf)
}

/// Walk the answer section, following compression pointers in names.
fn parse_response(data: &[u8], expect_id: u16) -> Option<Vec<IpAddr>> {
    if data.len() < 12 {
        return None;
    }
    let id = u16::from_be_bytes([data[0], data[1]]);
    if id != expect_id {
        return None;
    }
    let flags = u16::from_be_bytes([data[2], data[3]]);
    if flags & 0x8000 == 0 {
        return None; // not a response
    }
    if flags & 0x000f != 0 {
        return Some(Vec::new()); // rcode != 0: authoritative "no"
    }
    let qdcount = u16::from_be_bytes([data[4], data[5]]) as usize;
    let ancount = u16::from_be_bytes([data[6], data[7]]) as usize;

    let mut pos = 12;
    for _ in 0..qdcount {
        pos = skip_name(data, pos)?;
        pos = pos.checked_add(4)?; // qtype + qclass
    }

    let mut ips = Vec::new();
    for _ in 0..ancount {
        pos = skip_name(data, pos)?;
        if pos + 10 > data.len() {
            return None;
        }
        let rtype = u16::from_be_bytes([data[pos], data[pos + 1]]);
        let rdlen = u16::from_be_bytes([data[pos + 8], data[pos + 9]]) as usize;
        pos += 10;
        if pos + rdlen > data.len() {
            return None;
        }
        match (rtype, rdlen) {
            (QTYPE_A, 4) => {
                let octets: [u8; 4] = data[pos..pos + 4].try_into().ok()?;
                ips.push(IpAddr::from(octets));
            }
            (QTYPE_AAAA, 16) => {
                let octets: [u8; 16] = data[pos..pos + 16].try_into().ok()?;
                ips.push(IpAddr::from(octets));
            }
            _ => {} // CNAME chains etc.: skip, the A records still appear
        }
        pos += rdlen;
    }
    Some(ips)
}

/// Advance past a (possibly compressed) domain name.
fn skip_name(data: &[u8], mut pos: usize) -> Option<usize> {
    loop {
        let len = *data.get(pos)? as usize;
        if len == 0 {
            return Some(pos + 1);
        }
        if len & 0xc0 == 0xc0 {
            return Some(pos + 2); // pointer: two bytes, then done
        }
        pos = pos.checked_add(len + 1)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_encoding_layout() {
        let q = encode_query(0x1234, "cloudflare.com", QTYPE_A).unwrap();
        assert_eq!(&q[0..2], &[0x12, 0x34]);
        assert_eq!(&q[2..4], &[0x01, 0x00]);
        // 10 "cloudflare" 3 "com" 0
        assert_eq!(q[12], 10);
        assert_eq!(&q[13..23], b"cloudflare");
        assert_eq!(q[23], 3);
        assert_eq!(q[q.len() - 4..], [0, 1, 0, 1]);
    }

    #[test]
    fn rejects_oversized_labels() {
        let long = "a".repeat(64);
        assert!(encode_query(1, &long, QTYPE_A).is_err());
        assert!(encode_query(1, "", QTYPE_A).is_err());
    }

    fn answer(id: u16, name_ptr: bool) -> Vec<u8> {
        let mut r = Vec::new();
        r.extend_from_slice(&id.to_be_bytes());
        r.extend_from_slice(&0x8180u16.to_be_bytes());
        r.extend_from_slice(&1u16.to_be_bytes()); // qd
        r.extend_from_slice(&1u16.to_be_bytes()); // an
        r.extend_from_slice(&[0u8; 4]);
        // question: example.com A IN
        r.push(7);
        r.extend_from_slice(b"example");
        r.push(3);
        r.extend_from_slice(b"com");
        r.push(0);
        r.extend_from_slice(&[0, 1, 0, 1]);
        // answer
        if name_ptr {
            r.extend_from_slice(&[0xc0, 0x0c]);
        } else {
            r.push(7);
            r.extend_from_slice(b"example");
            r.push(3);
            r.extend_from_slice(b"com");
            r.push(0);
        }
        r.extend_from_slice(&[0, 1, 0, 1]); // A IN
        r.extend_from_slice(&[0, 0, 0, 60]); // ttl
        r.extend_from_slice(&[0, 4]); // rdlen
        r.extend_from_slice(&[93, 184, 216, 34]);
        r
    }

    #[test]
    fn parses_compressed_and_plain_answers() {
        for ptr in [true, false] {
            let resp = answer(42, ptr);
            let ips = parse_response(&resp, 42).unwrap();
            assert_eq!(ips, vec!["93.184.216.34".parse::<IpAddr>().unwrap()]);
        }
    }

    #[test]
    fn rejects_mismatched_id_and_truncated_data() {
        let resp = answer(42, true);
        assert!(parse_response(&resp, 43).is_none());
        assert!(parse_response(&resp[..resp.len() - 2], 42).is_none());
        assert!(parse_response(&[0u8; 5], 0).is_none());
    }
}
