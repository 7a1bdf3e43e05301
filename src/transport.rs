//! Request/response transport clients: TCP/UDP stream client and serial RTU client, sharing
//! the deadline-aware incremental read loop and exception short-circuit from the design.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use url::Url;

use crate::constants::{
    DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_READ_TIMEOUT_MS, DEFAULT_WRITE_TIMEOUT_MS, MAX_RTU_ADU_SIZE, MAX_TCP_ADU_SIZE,
    SERIAL_POST_WRITE_DELAY_MS, SHORT_POLL_QUANTUM_US,
};
use crate::error::{ModbusError, Result};
use crate::frame::{
    as_rtu_exception_frame, as_tcp_exception_frame, decode_rtu_response, decode_tcp_response, encode_rtu_request,
    encode_tcp_request, looks_like_rtu, looks_like_tcp, FrameLookahead,
};
use crate::pdu::{Request, Response};

/// Timeouts shared by every transport client variant.
#[derive(Debug, Clone, Copy)]
pub struct ClientConfig {
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
    pub read_timeout: Duration,
    /// Serial-only: quiescence delay after a write, before the first read (see design note on
    /// the 30 ms sleep).
    pub post_write_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            write_timeout: Duration::from_millis(DEFAULT_WRITE_TIMEOUT_MS),
            read_timeout: Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
            post_write_delay: Duration::from_millis(SERIAL_POST_WRITE_DELAY_MS),
        }
    }
}

/// Scheme parsed out of the server URL, deciding both connection kind and wire framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scheme {
    Tcp,
    Udp,
    Serial,
}

fn parse_scheme(server_url: &str) -> Result<(Scheme, String)> {
    let url = Url::parse(server_url).or_else(|_| Url::parse(&format!("tcp://{server_url}")))?;
    let scheme = match url.scheme() {
        "tcp" | "tcp4" | "tcp6" | "" => Scheme::Tcp,
        "udp" => Scheme::Udp,
        "file" => Scheme::Serial,
        other => return Err(ModbusError::UrlParse(format!("unknown scheme {other:?}"))),
    };
    let host_port = match scheme {
        Scheme::Serial => url.path().to_string(),
        _ => format!(
            "{}:{}",
            url.host_str().ok_or_else(|| ModbusError::UrlParse("missing host".into()))?,
            url.port().unwrap_or(502)
        ),
    };
    Ok((scheme, host_port))
}

/// Decide whether a just-extended buffer already holds a complete frame (or an exception
/// short-circuit), per the look-ahead contract in 4.B, for the TCP/MBAP wire format.
fn tcp_frame_decision(buffer: &[u8]) -> Result<Option<usize>> {
    if let Some(ex) = as_tcp_exception_frame(buffer) {
        return Err(ModbusError::Exception(ex));
    }
    match looks_like_tcp(buffer) {
        FrameLookahead::Complete(n) => Ok(Some(n)),
        FrameLookahead::TooShort => Ok(None),
        FrameLookahead::NotAFrame => Err(ModbusError::NotModbusFrame),
    }
}

/// Same decision for the RTU wire format, parameterised by the expected normal-response PDU
/// length (the exception case is always detected regardless of this value).
fn rtu_frame_decision(buffer: &[u8], expected_pdu_len: usize) -> Result<Option<usize>> {
    if let Some(ex) = as_rtu_exception_frame(buffer) {
        return Err(ModbusError::Exception(ex));
    }
    match looks_like_rtu(buffer, expected_pdu_len) {
        FrameLookahead::Complete(n) => Ok(Some(n)),
        FrameLookahead::TooShort => Ok(None),
        FrameLookahead::NotAFrame => Err(ModbusError::NotModbusFrame),
    }
}

/// Shared incremental-read loop body for any `AsyncRead` stream (TCP or serial): short-poll
/// with a 500us read deadline so cancellation stays responsive, accumulating into `buffer`
/// until a complete frame (or exception short-circuit) is recognised by `decide`.
async fn read_loop<R, F>(
    stream: &mut R,
    max_len: usize,
    total_deadline: Duration,
    cancel: &CancellationToken,
    mut decide: F,
) -> Result<Vec<u8>>
where
    R: tokio::io::AsyncRead + Unpin,
    F: FnMut(&[u8]) -> Result<Option<usize>>,
{
    let mut buffer = Vec::with_capacity(max_len);
    let mut scratch = [0u8; 512];
    let deadline = tokio::time::Instant::now() + total_deadline;

    loop {
        if cancel.is_cancelled() {
            return Err(ModbusError::Cancelled);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(ModbusError::TotalReadTimeoutExceeded);
        }

        let quantum = Duration::from_micros(SHORT_POLL_QUANTUM_US);
        let read_result = tokio::select! {
            _ = cancel.cancelled() => return Err(ModbusError::Cancelled),
            res = timeout(quantum, stream.read(&mut scratch)) => res,
        };

        match read_result {
            Ok(Ok(0)) => {
                if buffer.is_empty() {
                    return Err(ModbusError::NoBytesReceived);
                }
                return Err(ModbusError::ReceivedTooShort { got: buffer.len(), expected: max_len });
            },
            Ok(Ok(n)) => {
                buffer.extend_from_slice(&scratch[..n]);
                if buffer.len() > max_len {
                    return Err(ModbusError::PacketTooLong { got: buffer.len(), max: max_len });
                }
                trace!(bytes = n, total = buffer.len(), "read chunk");
                match decide(&buffer)? {
                    Some(total) if buffer.len() >= total => return Ok(buffer),
                    _ => continue,
                }
            },
            Ok(Err(e)) => return Err(ModbusError::from(e)),
            Err(_elapsed) => continue, // short-poll deadline: normal, keep looping
        }
    }
}

enum Connection {
    Tcp(TcpStream),
    Udp(UdpSocket),
    #[cfg(feature = "rtu")]
    Serial(tokio_serial::SerialStream),
}

/// A single request/response transport client. `do_request` serialises internally: at most
/// one outstanding request on the wire at a time.
pub struct Client {
    scheme: Scheme,
    host_port: String,
    config: ClientConfig,
    conn: Mutex<Option<Connection>>,
}

impl Client {
    pub fn new(server_url: &str, config: ClientConfig) -> Result<Self> {
        let (scheme, host_port) = parse_scheme(server_url)?;
        Ok(Self { scheme, host_port, config, conn: Mutex::new(None) })
    }

    pub fn is_rtu_framed(&self) -> bool {
        self.scheme == Scheme::Serial
    }

    pub async fn connect(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        let connection = match self.scheme {
            Scheme::Tcp => {
                let stream = timeout(self.config.connect_timeout, TcpStream::connect(&self.host_port))
                    .await
                    .map_err(|_| ModbusError::TotalReadTimeoutExceeded)??;
                stream.set_nodelay(true).ok();
                Connection::Tcp(stream)
            },
            Scheme::Udp => {
                let socket = UdpSocket::bind("0.0.0.0:0").await?;
                timeout(self.config.connect_timeout, socket.connect(&self.host_port))
                    .await
                    .map_err(|_| ModbusError::TotalReadTimeoutExceeded)??;
                Connection::Udp(socket)
            },
            #[cfg(feature = "rtu")]
            Scheme::Serial => {
                use tokio_serial::SerialPortBuilderExt;
                if self.host_port.is_empty() {
                    return Err(ModbusError::SerialPortNotSet);
                }
                let port = tokio_serial::new(&self.host_port, 9600)
                    .open_native_async()
                    .map_err(|e| ModbusError::Io(e.to_string()))?;
                Connection::Serial(port)
            },
            #[cfg(not(feature = "rtu"))]
            Scheme::Serial => return Err(ModbusError::SerialPortNotSet),
        };
        debug!(scheme = ?self.scheme, addr = %self.host_port, "connected");
        *guard = Some(connection);
        Ok(())
    }

    pub async fn close(&self) {
        let mut guard = self.conn.lock().await;
        *guard = None;
    }

    async fn is_connected(&self) -> bool {
        self.conn.lock().await.is_some()
    }

    /// Send `request` to `unit_id` and return its decoded response, using RTU framing for
    /// serial connections and MBAP/TCP framing otherwise.
    pub async fn do_request(&self, request: &Request, unit_id: u8, cancel: &CancellationToken) -> Result<Response> {
        if !self.is_connected().await {
            return Err(ModbusError::NotConnected);
        }
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(ModbusError::NotConnected)?;

        match conn {
            Connection::Tcp(stream) => self.do_tcp_request(stream, request, unit_id, cancel).await,
            Connection::Udp(socket) => self.do_udp_request(socket, request, unit_id, cancel).await,
            #[cfg(feature = "rtu")]
            Connection::Serial(port) => self.do_serial_request(port, request, unit_id, cancel).await,
        }
    }

    async fn do_tcp_request(
        &self,
        stream: &mut TcpStream,
        request: &Request,
        unit_id: u8,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        let (adu, transaction_id) = encode_tcp_request(request, unit_id)?;
        timeout(self.config.write_timeout, stream.write_all(&adu))
            .await
            .map_err(|_| ModbusError::TotalReadTimeoutExceeded)??;

        let bytes = read_loop(stream, MAX_TCP_ADU_SIZE, self.config.read_timeout, cancel, |buf| {
            tcp_frame_decision(buf)
        })
        .await?;
        decode_tcp_response(&bytes, request, transaction_id)
    }

    async fn do_udp_request(
        &self,
        socket: &UdpSocket,
        request: &Request,
        unit_id: u8,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        let (adu, transaction_id) = encode_tcp_request(request, unit_id)?;
        timeout(self.config.write_timeout, socket.send(&adu))
            .await
            .map_err(|_| ModbusError::TotalReadTimeoutExceeded)??;

        let mut scratch = [0u8; MAX_TCP_ADU_SIZE];
        let deadline = tokio::time::Instant::now() + self.config.read_timeout;
        loop {
            if cancel.is_cancelled() {
                return Err(ModbusError::Cancelled);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ModbusError::TotalReadTimeoutExceeded);
            }
            let quantum = Duration::from_micros(SHORT_POLL_QUANTUM_US);
            let read = tokio::select! {
                _ = cancel.cancelled() => return Err(ModbusError::Cancelled),
                res = timeout(quantum, socket.recv(&mut scratch)) => res,
            };
            match read {
                Ok(Ok(n)) => {
                    let buf = &scratch[..n];
                    if let Some(ex) = as_tcp_exception_frame(buf) {
                        return Err(ModbusError::Exception(ex));
                    }
                    return decode_tcp_response(buf, request, transaction_id);
                },
                Ok(Err(e)) => return Err(ModbusError::from(e)),
                Err(_elapsed) => continue,
            }
        }
    }

    #[cfg(feature = "rtu")]
    async fn do_serial_request(
        &self,
        port: &mut tokio_serial::SerialStream,
        request: &Request,
        unit_id: u8,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        let adu = encode_rtu_request(request, unit_id)?;
        timeout(self.config.write_timeout, port.write_all(&adu))
            .await
            .map_err(|_| ModbusError::TotalReadTimeoutExceeded)??;
        tokio::time::sleep(self.config.post_write_delay).await;

        let expected_pdu_len = request.expected_response_pdu_len();
        let result = read_loop(port, MAX_RTU_ADU_SIZE + 8, self.config.read_timeout, cancel, |buf| {
            rtu_frame_decision(buf, expected_pdu_len)
        })
        .await;

        if matches!(result, Err(ModbusError::Io(_)) | Err(ModbusError::ReceivedTooShort { .. })) {
            warn!("serial read failed, flushing port");
            let _ = port.flush().await;
        } else {
            let _ = port.flush().await;
        }

        let bytes = result?;
        decode_rtu_response(&bytes, request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_scheme_defaults_to_tcp() {
        let (scheme, addr) = parse_scheme("127.0.0.1:502").unwrap();
        assert_eq!(scheme, Scheme::Tcp);
        assert_eq!(addr, "127.0.0.1:502");
    }

    #[test]
    fn parse_scheme_recognises_udp_and_file() {
        assert_eq!(parse_scheme("udp://127.0.0.1:502").unwrap().0, Scheme::Udp);
        assert_eq!(parse_scheme("file:///dev/ttyUSB0").unwrap().0, Scheme::Serial);
    }

    #[test]
    fn tcp_frame_decision_detects_exception_before_full_length() {
        let buffer = [0x00, 0x01, 0x00, 0x00, 0x00, 0x03, 0x01, 0x83, 0x02];
        let err = tcp_frame_decision(&buffer).unwrap_err();
        assert!(matches!(err, ModbusError::Exception(_)));
    }

    #[tokio::test]
    async fn do_request_fails_when_not_connected() {
        let client = Client::new("127.0.0.1:15020", ClientConfig::default()).unwrap();
        let request = Request::ReadHoldingRegisters { start_address: 0, quantity: 1 };
        let cancel = CancellationToken::new();
        let err = client.do_request(&request, 1, &cancel).await.unwrap_err();
        assert!(matches!(err, ModbusError::NotConnected));
    }
}
