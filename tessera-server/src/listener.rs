//! Blocking accept loop: sniff each connection, promote TLS clients, greet

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::fd::AsFd;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tessera_tls::TlsSupport;

/// First byte of a TLS handshake record
const HANDSHAKE_RECORD: u8 = 0x16;

const SNIFF_BYTES: usize = 512;

fn is_tls_handshake(data: &[u8]) -> bool {
    data.first() == Some(&HANDSHAKE_RECORD)
}

/// Per-connection settings shared by all connection threads
#[derive(Debug, Clone)]
pub struct Service {
    pub greeting: Arc<str>,
    pub timeout: Duration,
}

/// Accept connections until the listener fails, one thread per connection.
pub fn serve(listener: TcpListener, tls: Arc<TlsSupport>, service: Service) -> io::Result<()> {
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to accept connection");
                continue;
            }
        };

        let tls = tls.clone();
        let service = service.clone();
        thread::spawn(move || {
            let peer = stream.peer_addr().ok();
            if let Err(e) = handle_connection(stream, &tls, &service) {
                tracing::debug!(peer = ?peer, error = %e, "Connection closed with error");
            }
        });
    }
    Ok(())
}

/// Serve one client: read its first request, answer with the greeting.
fn handle_connection(mut stream: TcpStream, tls: &TlsSupport, service: &Service) -> io::Result<()> {
    stream.set_read_timeout(Some(service.timeout))?;
    stream.set_write_timeout(Some(service.timeout))?;

    let mut sniffed = [0u8; SNIFF_BYTES];
    let n = match stream.read(&mut sniffed) {
        Ok(n) => n,
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => 0,
        Err(e) => return Err(e),
    };
    let sniffed = &sniffed[..n];

    if tls.is_enabled() && is_tls_handshake(sniffed) {
        let mut session = tls.promote(stream.as_fd(), sniffed)?;

        // the first read completes the handshake
        let mut request = [0u8; SNIFF_BYTES];
        if session.read(&mut request)? == 0 {
            return Ok(());
        }

        let reply = match session.servername() {
            Some(name) => format!("{} {}\n", service.greeting, name),
            None => format!("{}\n", service.greeting),
        };
        session.write_all(reply.as_bytes())?;
        if let Err(e) = session.shutdown() {
            tracing::debug!(error = %e, "TLS shutdown failed");
        }
        return Ok(());
    }

    stream.write_all(format!("{}\n", service.greeting).as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};
    use tessera_tls::provider::Disabled;

    fn service() -> Service {
        Service {
            greeting: Arc::from("hello"),
            timeout: Duration::from_secs(5),
        }
    }

    fn exchange(request: &[u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let tls = TlsSupport::with_provider(Arc::new(Disabled));

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            handle_connection(stream, &tls, &service())
        });

        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(request).unwrap();
        let mut line = String::new();
        BufReader::new(client).read_line(&mut line).unwrap();
        server.join().unwrap().unwrap();
        line
    }

    #[test]
    fn recognizes_handshake_records() {
        assert!(is_tls_handshake(&[0x16, 0x03, 0x01]));
        assert!(!is_tls_handshake(b"GET / HTTP/1.1\r\n"));
        assert!(!is_tls_handshake(b""));
    }

    #[test]
    fn greets_plaintext_clients() {
        assert_eq!(exchange(b"hi\n"), "hello\n");
    }

    #[test]
    fn handshake_bytes_are_served_plaintext_when_tls_is_off() {
        assert_eq!(exchange(&[0x16, 0x03, 0x01, 0x00]), "hello\n");
    }
}
