//! HTTP front end: CONNECT tunnels and plain proxied requests
//!
//! CONNECT turns into a raw splice after the 200. Plain requests have
//! their request line rewritten to origin-form, hop-by-hop proxy headers
//! stripped, and the rebuilt head is carried as the stream's initial data.

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tracing::trace;

use super::{ClientStream, Greeting, Network, ProxyRequest, StreamRequest};

const MAX_LINE: usize = 8192;
const MAX_HEADERS: usize = 100;

pub async fn serve_http(mut stream: TcpStream) -> std::io::Result<Option<ProxyRequest>> {
    let request_line = read_crlf_line(&mut stream).await?;
    let mut headers = Vec::new();
    loop {
        let line = read_crlf_line(&mut stream).await?;
        if line.is_empty() {
            break;
        }
        headers.push(line);
        if headers.len() > MAX_HEADERS {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "too many headers",
            ));
        }
    }

    let mut parts = request_line.splitn(3, ' ');
    let method = parts.next().unwrap_or("");
    let target = parts.next().unwrap_or("");
    let version = parts.next().unwrap_or("HTTP/1.1");

    if method.eq_ignore_ascii_case("CONNECT") {
        let Some(destination) = with_default_port(target, 443) else {
            trace!(target, "bad CONNECT target");
            return Ok(None);
        };
        return Ok(Some(ProxyRequest::Stream(StreamRequest {
            network: Network::Tcp,
            destination,
            conn: ClientStream {
                stream,
                greeting: Greeting::HttpConnect,
            },
            initial_data: Bytes::new(),
        })));
    }

    // plain HTTP: absolute-form from well-behaved proxies, origin-form
    // plus Host from the rest
    let (destination, path) = if let Some(rest) = target.strip_prefix("http://") {
        let (authority, path) = match rest.split_once('/') {
            Some((a, p)) => (a, format!("/{p}")),
            None => (rest, String::from("/")),
        };
        match with_default_port(authority, 80) {
            Some(dest) => (dest, path),
            None => return Ok(None),
        }
    } else {
        let Some(host) = header_value(&headers, "host") else {
            trace!("plain request without Host");
            return Ok(None);
        };
        match with_default_port(&host, 80) {
            Some(dest) => (dest, target.to_string()),
            None => return Ok(None),
        }
    };

    let mut head = format!("{method} {path} {version}\r\n");
    for header in &headers {
        let lower = header.to_ascii_lowercase();
        if lower.starts_with("proxy-connection:") || lower.starts_with("proxy-authorization:") {
            continue;
        }
        head.push_str(header);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");

    Ok(Some(ProxyRequest::Stream(StreamRequest {
        network: Network::Tcp,
        destination,
        conn: ClientStream {
            stream,
            greeting: Greeting::HttpPlain,
        },
        initial_data: Bytes::from(head.into_bytes()),
    })))
}

fn header_value(headers: &[String], name: &str) -> Option<String> {
    headers.iter().find_map(|h| {
        let (key, value) = h.split_once(':')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then(|| value.trim().to_string())
    })
}

/// `host[:port]` → `host:port`, keeping v6 brackets intact.
fn with_default_port(authority: &str, default_port: u16) -> Option<String> {
    if authority.is_empty() {
        return None;
    }
    if let Some(rest) = authority.strip_prefix('[') {
        // [v6]:port or [v6]
        return match rest.split_once(']') {
            Some((host, "")) => Some(format!("[{host}]:{default_port}")),
            Some((host, port)) => {
                let port: u16 = port.strip_prefix(':')?.parse().ok()?;
                Some(format!("[{host}]:{port}"))
            }
            None => None,
        };
    }
    match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port.parse().ok()?;
            Some(format!("{host}:{port}"))
        }
        None => Some(format!("{authority}:{default_port}")),
    }
}

async fn read_crlf_line(stream: &mut TcpStream) -> std::io::Result<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await?;
        if byte[0] == b'\n' {
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            return String::from_utf8(line)
                .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "not ascii"));
        }
        line.push(byte[0]);
        if line.len() > MAX_LINE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "line too long",
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn pipe() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr);
        let (server, client) = tokio::join!(listener.accept(), client);
        (server.unwrap().0, client.unwrap())
    }

    #[tokio::test]
    async fn connect_request_yields_tunnel() {
        let (server, mut client) = pipe().await;
        let serve = tokio::spawn(serve_http(server));

        client
            .write_all(b"CONNECT cloudflare.com:443 HTTP/1.1\r\nHost: cloudflare.com:443\r\n\r\n")
            .await
            .unwrap();

        match serve.await.unwrap().unwrap().unwrap() {
            ProxyRequest::Stream(s) => {
                assert_eq!(s.destination, "cloudflare.com:443");
                assert_eq!(s.conn.greeting, Greeting::HttpConnect);
                assert!(s.initial_data.is_empty());
            }
            _ => panic!("expected stream"),
        }
    }

    #[tokio::test]
    async fn absolute_form_is_rewritten_to_origin_form() {
        let (server, mut client) = pipe().await;
        let serve = tokio::spawn(serve_http(server));

        client
            .write_all(
                b"GET http://example.com/a/b?c=1 HTTP/1.1\r\n\
                  Host: example.com\r\n\
                  Proxy-Connection: keep-alive\r\n\
                  Accept: */*\r\n\r\n",
            )
            .await
            .unwrap();

        match serve.await.unwrap().unwrap().unwrap() {
            ProxyRequest::Stream(s) => {
                assert_eq!(s.destination, "example.com:80");
                let head = String::from_utf8(s.initial_data.to_vec()).unwrap();
                assert!(head.starts_with("GET /a/b?c=1 HTTP/1.1\r\n"));
                assert!(!head.to_ascii_lowercase().contains("proxy-connection"));
                assert!(head.contains("Accept: */*"));
            }
            _ => panic!("expected stream"),
        }
    }

    #[tokio::test]
    async fn origin_form_uses_host_header() {
        let (server, mut client) = pipe().await;
        let serve = tokio::spawn(serve_http(server));

        client
            .write_all(b"GET /index.html HTTP/1.1\r\nHost: example.net:8080\r\n\r\n")
            .await
            .unwrap();

        match serve.await.unwrap().unwrap().unwrap() {
            ProxyRequest::Stream(s) => {
                assert_eq!(s.destination, "example.net:8080");
                assert_eq!(s.conn.greeting, Greeting::HttpPlain);
            }
            _ => panic!("expected stream"),
        }
    }

    #[test]
    fn authority_parsing() {
        assert_eq!(
            with_default_port("example.com", 80).unwrap(),
            "example.com:80"
        );
        assert_eq!(
            with_default_port("example.com:8443", 80).unwrap(),
            "example.com:8443"
        );
        assert_eq!(
            with_default_port("[2606:4700::1]", 443).unwrap(),
            "[2606:4700::1]:443"
        );
        assert_eq!(
            with_default_port("[2606:4700::1]:80", 443).unwrap(),
            "[2606:4700::1]:80"
        );
        assert!(with_default_port("", 80).is_none());
        assert!(with_default_port("host:notaport", 80).is_none());
    }
}
