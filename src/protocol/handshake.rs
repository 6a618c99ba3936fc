//! RTMP simple handshake
//!
//! ```text
//! Client                                   Server
//!   |------- C0 (1 byte: version) --------->|
//!   |------- C1 (1536 bytes: time+random) ->|
//!   |<------ S0 (1 byte: version) ----------|
//!   |<------ S1 (1536 bytes: time+random) --|
//!   |<------ S2 (1536 bytes: echo C1) ------|
//!   |------- C2 (1536 bytes: echo S1) ----->|
//! ```
//!
//! The proxy terminates the handshake on both hops, so no digest is ever
//! computed; echoes are consumed without verification.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{HandshakeError, Result};
use crate::protocol::constants::{HANDSHAKE_SIZE, RTMP_VERSION};

/// Run the server side of the handshake
pub async fn server_handshake<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let version = stream.read_u8().await?;
    check_version(version)?;

    let mut c1 = [0u8; HANDSHAKE_SIZE];
    stream.read_exact(&mut c1).await?;

    let mut response = BytesMut::with_capacity(1 + HANDSHAKE_SIZE * 2);
    response.put_u8(RTMP_VERSION);
    response.put_slice(&generate_packet());
    response.put_slice(&generate_echo(&c1));
    stream.write_all(&response).await?;
    stream.flush().await?;

    let mut c2 = [0u8; HANDSHAKE_SIZE];
    stream.read_exact(&mut c2).await?;
    Ok(())
}

/// Run the client side of the handshake
pub async fn client_handshake<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut c0c1 = BytesMut::with_capacity(1 + HANDSHAKE_SIZE);
    c0c1.put_u8(RTMP_VERSION);
    c0c1.put_slice(&generate_packet());
    stream.write_all(&c0c1).await?;
    stream.flush().await?;

    let version = stream.read_u8().await?;
    check_version(version)?;

    let mut s1 = [0u8; HANDSHAKE_SIZE];
    stream.read_exact(&mut s1).await?;
    let mut s2 = [0u8; HANDSHAKE_SIZE];
    stream.read_exact(&mut s2).await?;

    stream.write_all(&generate_echo(&s1)).await?;
    stream.flush().await?;
    Ok(())
}

/// Versions below 3 are pre-release Flash; anything above is tolerated
/// because some encoders set high bits there.
fn check_version(version: u8) -> Result<()> {
    if version < RTMP_VERSION {
        return Err(HandshakeError::InvalidVersion(version).into());
    }
    Ok(())
}

fn now_millis() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u32)
        .unwrap_or(0)
}

/// C1/S1: timestamp, four zero bytes, pseudo-random filler
fn generate_packet() -> [u8; HANDSHAKE_SIZE] {
    let mut packet = [0u8; HANDSHAKE_SIZE];
    let timestamp = now_millis();
    packet[0..4].copy_from_slice(&timestamp.to_be_bytes());

    let mut seed = u64::from(timestamp) | 1;
    for chunk in packet[8..].chunks_mut(8) {
        seed = seed
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        let bytes = seed.to_le_bytes();
        chunk.copy_from_slice(&bytes[..chunk.len()]);
    }
    packet
}

/// C2/S2: the peer's packet with our read time in bytes 4..8
fn generate_echo(peer: &[u8; HANDSHAKE_SIZE]) -> [u8; HANDSHAKE_SIZE] {
    let mut echo = *peer;
    echo[4..8].copy_from_slice(&now_millis().to_be_bytes());
    echo
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[tokio::test]
    async fn test_client_and_server_complete() {
        let (mut client, mut server) = tokio::io::duplex(8192);

        let server_task = tokio::spawn(async move { server_handshake(&mut server).await });
        client_handshake(&mut client).await.unwrap();
        server_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_server_rejects_old_version() {
        let mut stream = tokio_test::io::Builder::new().read(&[2u8]).build();
        let err = server_handshake(&mut stream).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Handshake(HandshakeError::InvalidVersion(2))
        ));
    }

    #[tokio::test]
    async fn test_server_accepts_high_version() {
        let (mut client, mut server) = tokio::io::duplex(8192);

        let server_task = tokio::spawn(async move { server_handshake(&mut server).await });

        let mut c0c1 = vec![6u8];
        c0c1.extend_from_slice(&generate_packet());
        client.write_all(&c0c1).await.unwrap();

        let mut s0s1s2 = vec![0u8; 1 + HANDSHAKE_SIZE * 2];
        client.read_exact(&mut s0s1s2).await.unwrap();
        assert_eq!(s0s1s2[0], RTMP_VERSION);
        // S2 echoes C1 except for the read timestamp.
        assert_eq!(&s0s1s2[1 + HANDSHAKE_SIZE + 8..], &c0c1[1 + 8..]);

        client.write_all(&[0u8; HANDSHAKE_SIZE]).await.unwrap();
        server_task.await.unwrap().unwrap();
    }

    #[test]
    fn test_packets_differ_in_filler() {
        let packet = generate_packet();
        assert_eq!(&packet[4..8], &[0, 0, 0, 0]);
        assert!(packet[8..].iter().any(|b| *b != 0));
    }
}
