//! Byte sources and sinks: local files, standard streams, HTTP(S) and UDP.

use anyhow::{Context, Result, anyhow};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::path::Path;
use tracing::info;

const UDP_DATAGRAM_MAX: usize = 65_536;

/// Open an input: `-` for stdin, an `http(s)://` URL, `udp://[@]addr:port`,
/// or a file path.
pub fn open_input(input: &str) -> Result<Box<dyn Read>> {
    if input == "-" {
        return Ok(Box::new(BufReader::new(io::stdin())));
    }
    if input.starts_with("http://") || input.starts_with("https://") {
        return open_url(input);
    }
    if let Some(addr) = input.strip_prefix("udp://") {
        return Ok(Box::new(UdpReader::bind(addr)?));
    }
    let file = File::open(input).with_context(|| format!("failed to open input {input:?}"))?;
    Ok(Box::new(BufReader::new(file)))
}

/// Stream the body of a GET on `url`.
fn open_url(url: &str) -> Result<Box<dyn Read>> {
    // Live sources never finish, so no overall request timeout.
    let client = reqwest::blocking::Client::builder()
        .timeout(None)
        .build()
        .context("failed to build HTTP client")?;
    let response = client
        .get(url)
        .send()
        .with_context(|| format!("failed to fetch {url}"))?
        .error_for_status()
        .with_context(|| format!("bad HTTP status from {url}"))?;
    info!("reading {url} ({})", response.status());
    Ok(Box::new(BufReader::new(response)))
}

/// Open an output: `-` for stdout, otherwise a file that is created or truncated.
pub fn open_output(output: &Path) -> Result<Box<dyn Write>> {
    if output == Path::new("-") {
        return Ok(Box::new(BufWriter::new(io::stdout())));
    }
    let file =
        File::create(output).with_context(|| format!("failed to create output {output:?}"))?;
    Ok(Box::new(BufWriter::new(file)))
}

/// Reads a transport stream carried in UDP datagrams.
pub struct UdpReader {
    socket: UdpSocket,
    buf: Vec<u8>,
    pos: usize,
    len: usize,
}

impl UdpReader {
    /// Bind to `addr` (`host:port`, optional leading `@`); multicast groups
    /// are joined on the default interface.
    pub fn bind(addr: &str) -> Result<Self> {
        let addr: SocketAddr = addr
            .trim_start_matches('@')
            .parse()
            .with_context(|| format!("invalid UDP address {addr:?}"))?;
        let socket = match addr {
            SocketAddr::V4(v4) if v4.ip().is_multicast() => {
                let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, v4.port()))
                    .with_context(|| format!("failed to bind UDP port {}", v4.port()))?;
                socket
                    .join_multicast_v4(v4.ip(), &Ipv4Addr::UNSPECIFIED)
                    .with_context(|| format!("failed to join multicast group {}", v4.ip()))?;
                info!("joined multicast group {}", v4);
                socket
            }
            SocketAddr::V4(_) => {
                UdpSocket::bind(addr).with_context(|| format!("failed to bind UDP {addr}"))?
            }
            SocketAddr::V6(_) => return Err(anyhow!("IPv6 UDP input is not supported: {addr}")),
        };
        Ok(Self {
            socket,
            buf: vec![0; UDP_DATAGRAM_MAX],
            pos: 0,
            len: 0,
        })
    }
}

impl Read for UdpReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.len {
            self.len = self.socket.recv(&mut self.buf)?;
            self.pos = 0;
        }
        let n = out.len().min(self.len - self.pos);
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn udp_reader_serves_datagrams_as_stream() {
        let mut reader = UdpReader::bind("127.0.0.1:0").unwrap();
        let local = reader.socket.local_addr().unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(&[1, 2, 3, 4, 5], local).unwrap();
        sender.send_to(&[6, 7], local).unwrap();

        let mut out = [0u8; 7];
        reader.read_exact(&mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn udp_address_must_parse() {
        assert!(UdpReader::bind("@not-an-address").is_err());
    }

    fn serve_once(response: &'static [u8]) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = Vec::new();
            let mut byte = [0u8; 1];
            while !request.ends_with(b"\r\n\r\n") && stream.read(&mut byte).unwrap() == 1 {
                request.push(byte[0]);
            }
            stream.write_all(response).unwrap();
        });
        addr
    }

    #[test]
    fn http_input_streams_body() {
        let addr = serve_once(
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\n\x47abcd",
        );
        let mut body = Vec::new();
        open_input(&format!("http://{addr}/live.ts"))
            .unwrap()
            .read_to_end(&mut body)
            .unwrap();
        assert_eq!(body, b"\x47abcd");
    }

    #[test]
    fn http_error_status_is_an_error() {
        let addr = serve_once(
            b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        );
        let err = open_input(&format!("http://{addr}/missing.ts")).err().unwrap();
        assert!(format!("{err:#}").contains("bad HTTP status"));
    }

    #[test]
    fn missing_input_file_is_an_error() {
        let err = open_input("/nonexistent/input.ts").err().unwrap();
        assert!(format!("{err:#}").contains("failed to open input"));
    }
}
