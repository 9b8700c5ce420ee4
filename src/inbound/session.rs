//! Post-handshake session loop.
//!
//! The loop reads client frames and forwards DATA payloads upstream. The
//! first DATA frame names the destination; a concurrent task pulls
//! upstream buffers and writes them back to the client as morphed DATA
//! frames. Only one writer ever touches the AEAD send path: the forwarder
//! owns the client write half, and the session write lock serializes it.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::crypto::AeadKey;
use crate::dispatch::{Destination, Dispatcher};
use crate::error::{Error, Result};
use crate::morphing::TrafficProfile;
use crate::transport::{FrameType, PeekReader, Session};

/// Parse the destination prefix of a first DATA frame:
/// `addr_len:u8 || addr:utf8 || port:u16 BE`, followed by payload.
pub(crate) fn parse_destination(data: &[u8]) -> Result<(Destination, &[u8])> {
    if data.len() < 3 {
        return Err(Error::malformed("data frame too short"));
    }
    let addr_len = data[0] as usize;
    if data.len() < 1 + addr_len + 2 {
        return Err(Error::malformed("data frame missing destination"));
    }
    let addr = std::str::from_utf8(&data[1..1 + addr_len])
        .map_err(|_| Error::malformed("destination address is not utf-8"))?;
    let port = u16::from_be_bytes([data[1 + addr_len], data[1 + addr_len + 1]]);
    Ok((
        Destination {
            addr: addr.to_string(),
            port,
        },
        &data[1 + addr_len + 2..],
    ))
}

pub(crate) async fn run<R, W, D>(
    reader: &mut PeekReader<R>,
    writer: W,
    dispatcher: &D,
    session_key: &AeadKey,
    policy: &str,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
    D: Dispatcher,
{
    let mut session = Session::new(session_key);
    session.set_traffic_profile(TrafficProfile::from_policy(policy));
    let session = Arc::new(session);

    let mut forwarder: Option<JoinHandle<()>> = None;
    let result = drive(reader, writer, dispatcher, &session, &mut forwarder).await;
    if let Some(handle) = forwarder {
        handle.abort();
    }
    result
}

async fn drive<R, W, D>(
    reader: &mut PeekReader<R>,
    writer: W,
    dispatcher: &D,
    session: &Arc<Session>,
    forwarder: &mut Option<JoinHandle<()>>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
    D: Dispatcher,
{
    let (err_tx, mut err_rx) = mpsc::channel::<Error>(1);
    let mut writer = Some(writer);
    let mut upstream: Option<mpsc::Sender<Vec<u8>>> = None;

    loop {
        let Some(frame) = session.read_frame(reader).await? else {
            return Ok(());
        };

        match frame.frame_type {
            FrameType::Data => {
                if let Some(tx) = &upstream {
                    send_upstream(tx, &frame.payload).await?;
                } else {
                    let (dest, payload) = parse_destination(&frame.payload)?;
                    tracing::debug!(%dest, "dispatching upstream");
                    let link = dispatcher.dispatch(dest).await?;
                    *forwarder = Some(tokio::spawn(forward_upstream(
                        Arc::clone(session),
                        writer.take().expect("writer moves exactly once"),
                        link.reader,
                        err_tx.clone(),
                    )));
                    send_upstream(&link.writer, payload).await?;
                    upstream = Some(link.writer);
                }
            }
            FrameType::Padding | FrameType::Timing => {
                session.handle_control_frame(&frame)?;
                continue;
            }
            FrameType::Close => {
                // Dropping the sender closes the upstream write side.
                drop(upstream);
                return Ok(());
            }
        }

        if let Ok(upstream_err) = err_rx.try_recv() {
            return Err(upstream_err);
        }
    }
}

async fn send_upstream(tx: &mpsc::Sender<Vec<u8>>, payload: &[u8]) -> Result<()> {
    if payload.is_empty() {
        return Ok(());
    }
    tx.send(payload.to_vec()).await.map_err(|_| {
        Error::Transport(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "upstream link closed",
        ))
    })
}

/// Pull upstream buffers and write them to the client as morphed DATA
/// frames. Upstream EOF sends a CLOSE frame and ends the task; any other
/// failure is reported on the error channel.
async fn forward_upstream<W>(
    session: Arc<Session>,
    mut writer: W,
    mut upstream: mpsc::Receiver<io::Result<Vec<u8>>>,
    errors: mpsc::Sender<Error>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        match upstream.recv().await {
            Some(Ok(buffer)) => {
                if let Err(e) = session
                    .write_frame_with_morphing(&mut writer, FrameType::Data, &buffer)
                    .await
                {
                    let _ = errors.try_send(e);
                    return;
                }
            }
            Some(Err(e)) => {
                let _ = errors.try_send(e.into());
                return;
            }
            None => {
                let _ = session
                    .write_frame(&mut writer, FrameType::Close, &[])
                    .await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_destination() {
        let mut data = vec![11u8];
        data.extend_from_slice(b"example.com");
        data.extend_from_slice(&443u16.to_be_bytes());
        data.extend_from_slice(b"payload");

        let (dest, payload) = parse_destination(&data).unwrap();
        assert_eq!(dest.addr, "example.com");
        assert_eq!(dest.port, 443);
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn test_parse_destination_rejects_short_frames() {
        assert!(parse_destination(&[]).is_err());
        assert!(parse_destination(&[5, b'a']).is_err());

        // addr_len pointing past the buffer
        let data = vec![200u8, b'x', b'y', 0, 80];
        assert!(parse_destination(&data).is_err());
    }

    #[test]
    fn test_parse_destination_rejects_invalid_utf8() {
        let data = vec![2u8, 0xFF, 0xFE, 0x01, 0xBB];
        assert!(parse_destination(&data).is_err());
    }
}
