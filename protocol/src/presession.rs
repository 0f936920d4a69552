//! Length-prefixed JSON framing for the plaintext commands that precede a keyed
//! [`crate::session::Session`]: `identify`, `createaccount`, and `session`. Shares the
//! same 4-byte big-endian length prefix as [`crate::handshake`] and [`crate::session`]
//! so a connection's framing never has to switch conventions mid-stream.

use crate::errors::SessionError;
use crate::wire::{PreSessionCommand, PreSessionReply};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const PRESESSION_FRAME_CAP: usize = 1 << 16;

async fn write_frame<W: AsyncWriteExt + Unpin>(w: &mut W, data: &[u8]) -> Result<(), SessionError> {
    let len = u32::try_from(data.len()).map_err(|_| SessionError::MessageTooLarge)?;
    w.write_all(&len.to_be_bytes()).await?;
    w.write_all(data).await?;
    w.flush().await?;
    Ok(())
}

async fn read_frame<R: AsyncReadExt + Unpin>(r: &mut R) -> Result<Vec<u8>, SessionError> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > PRESESSION_FRAME_CAP {
        return Err(SessionError::MessageTooLarge);
    }
    let mut body = vec![0u8; len];
    r.read_exact(&mut body).await?;
    Ok(body)
}

pub async fn send_command<W: AsyncWriteExt + Unpin>(w: &mut W, command: &PreSessionCommand) -> Result<(), SessionError> {
    let bytes = serde_json::to_vec(command).map_err(|_| SessionError::InvalidKx)?;
    write_frame(w, &bytes).await
}

pub async fn recv_command<R: AsyncReadExt + Unpin>(r: &mut R) -> Result<PreSessionCommand, SessionError> {
    let bytes = read_frame(r).await?;
    serde_json::from_slice(&bytes).map_err(|_| SessionError::InvalidKx)
}

pub async fn send_reply<W: AsyncWriteExt + Unpin>(w: &mut W, reply: &PreSessionReply) -> Result<(), SessionError> {
    let bytes = serde_json::to_vec(reply).map_err(|_| SessionError::InvalidKx)?;
    write_frame(w, &bytes).await
}

pub async fn recv_reply<R: AsyncReadExt + Unpin>(r: &mut R) -> Result<PreSessionReply, SessionError> {
    let bytes = read_frame(r).await?;
    serde_json::from_slice(&bytes).map_err(|_| SessionError::InvalidKx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::FullIdentity;

    #[tokio::test]
    async fn command_and_reply_round_trip_over_a_duplex_pipe() {
        let (mut a, mut b) = tokio::io::duplex(4096).into_split();
        let identity = FullIdentity::generate("server", "srv");

        send_command(&mut a, &PreSessionCommand::Identify).await.unwrap();
        let got = recv_command(&mut b).await.unwrap();
        assert!(matches!(got, PreSessionCommand::Identify));

        send_reply(&mut b, &PreSessionReply::Identify { identity: identity.public().clone() }).await.unwrap();
        let reply = recv_reply(&mut a).await.unwrap();
        match reply {
            PreSessionReply::Identify { identity: got } => assert_eq!(got.fingerprint_hex(), identity.public().fingerprint_hex()),
            _ => panic!("wrong reply variant"),
        }
    }
}
