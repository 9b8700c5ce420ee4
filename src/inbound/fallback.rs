//! Transparent fallback relay.
//!
//! Connections that never become Reflex sessions are spliced to a local
//! service so a probing client talks to something real. Bytes already
//! buffered by protocol detection are delivered to the target first.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::config::FallbackConfig;
use crate::error::{Error, Result};
use crate::transport::PeekReader;

pub(crate) async fn run<R, W>(
    reader: &mut PeekReader<R>,
    mut writer: W,
    fallback: Option<&FallbackConfig>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let Some(fallback) = fallback.filter(|f| f.dest > 0) else {
        return Err(Error::Unconfigured);
    };

    let target = TcpStream::connect(("127.0.0.1", fallback.dest)).await?;
    tracing::debug!(dest = fallback.dest, "fallback relay engaged");
    let (mut target_read, mut target_write) = target.into_split();

    // The PeekReader replays detection bytes before new client data, so the
    // target observes the stream from its first byte. The first direction
    // to finish decides the outcome; a clean EOF is success.
    let result = tokio::select! {
        r = tokio::io::copy(reader, &mut target_write) => r,
        r = tokio::io::copy(&mut target_read, &mut writer) => r,
    };

    match result {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(()),
        Err(e) => Err(e.into()),
    }
}
