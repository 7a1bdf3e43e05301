//! Server-side collaborator surface: a handler trait and a minimal TCP loopback accept loop,
//! so integration tests and downstream binaries get a peer without depending on an external
//! Modbus simulator. No retry/poll/splitter logic applies here.

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::constants::{MAX_TCP_ADU_SIZE, MBAP_HEADER_LEN};
use crate::error::Result;
use crate::frame::{looks_like_tcp, FrameLookahead};

/// Dispatches a decoded request PDU (unit id + PDU bytes, function code included) to a
/// response PDU. Implementors own whatever register/coil storage they simulate.
#[async_trait]
pub trait FrameHandler: Send + Sync {
    async fn handle(&self, unit_id: u8, request_pdu: &[u8]) -> Vec<u8>;
}

async fn read_tcp_frame(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut buffer = Vec::with_capacity(MBAP_HEADER_LEN + 8);
    let mut scratch = [0u8; 512];
    loop {
        match looks_like_tcp(&buffer) {
            FrameLookahead::Complete(n) if buffer.len() >= n => return Ok(buffer),
            FrameLookahead::NotAFrame => return Err(crate::error::ModbusError::NotModbusFrame),
            _ => {},
        }
        let n = stream.read(&mut scratch).await?;
        if n == 0 {
            return Err(crate::error::ModbusError::NoBytesReceived);
        }
        buffer.extend_from_slice(&scratch[..n]);
        if buffer.len() > MAX_TCP_ADU_SIZE {
            return Err(crate::error::ModbusError::PacketTooLong { got: buffer.len(), max: MAX_TCP_ADU_SIZE });
        }
    }
}

async fn serve_connection(mut stream: TcpStream, handler: &(dyn FrameHandler)) {
    loop {
        let frame = match read_tcp_frame(&mut stream).await {
            Ok(f) => f,
            Err(e) => {
                debug!(error = %e, "connection closed");
                return;
            },
        };
        let transaction_id = [frame[0], frame[1]];
        let unit_id = frame[6];
        let request_pdu = &frame[MBAP_HEADER_LEN..];
        let response_pdu = handler.handle(unit_id, request_pdu).await;

        let mut response = Vec::with_capacity(MBAP_HEADER_LEN + response_pdu.len());
        response.extend_from_slice(&transaction_id);
        response.extend_from_slice(&[0, 0]); // protocol id
        response.extend_from_slice(&((response_pdu.len() + 1) as u16).to_be_bytes());
        response.push(unit_id);
        response.extend_from_slice(&response_pdu);

        if let Err(e) = stream.write_all(&response).await {
            warn!(error = %e, "failed to write response");
            return;
        }
    }
}

/// Accept TCP connections on `listener` and dispatch frames to `handler` until `cancel` fires.
/// Each connection is served on its own task; one misbehaving peer does not block others.
pub async fn serve_tcp(listener: TcpListener, handler: std::sync::Arc<dyn FrameHandler>, cancel: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return,
            res = listener.accept() => res,
        };
        let (stream, addr) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            },
        };
        debug!(%addr, "accepted connection");
        let handler = handler.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {},
                _ = serve_connection(stream, handler.as_ref()) => {},
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::Request;
    use std::sync::Arc;
    use tokio::net::TcpStream as ClientStream;

    struct EchoRegisters;

    #[async_trait]
    impl FrameHandler for EchoRegisters {
        async fn handle(&self, _unit_id: u8, request_pdu: &[u8]) -> Vec<u8> {
            // Function code 0x03: reply with `quantity` registers, each equal to its offset.
            let quantity = u16::from_be_bytes([request_pdu[3], request_pdu[4]]);
            let mut pdu = vec![0x03, (quantity * 2) as u8];
            for i in 0..quantity {
                pdu.extend_from_slice(&i.to_be_bytes());
            }
            pdu
        }
    }

    #[tokio::test]
    async fn loopback_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let server_cancel = cancel.clone();
        let server = tokio::spawn(serve_tcp(listener, Arc::new(EchoRegisters), server_cancel));

        let mut client = ClientStream::connect(addr).await.unwrap();
        let request = Request::ReadHoldingRegisters { start_address: 0, quantity: 3 };
        let (adu, tid) = crate::frame::encode_tcp_request(&request, 1).unwrap();
        client.write_all(&adu).await.unwrap();

        let mut response = vec![0u8; MBAP_HEADER_LEN + 8];
        client.read_exact(&mut response).await.unwrap();
        let resp = crate::frame::decode_tcp_response(&response, &request, tid).unwrap();
        match resp {
            crate::pdu::Response::HoldingRegisters { registers, .. } => assert_eq!(registers, vec![0, 1, 2]),
            other => panic!("unexpected response {other:?}"),
        }

        cancel.cancel();
        let _ = server.await;
    }
}
