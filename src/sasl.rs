//! The SASL line-oriented authentication handshake (§4.F).

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, ErrorKind};

/// The total deadline for the whole handshake.
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// A SASL authentication mechanism.
#[derive(Debug, Clone, Copy)]
pub enum Mechanism {
    /// `EXTERNAL`, authenticating as the given numeric user id.
    External(u32),
    /// `ANONYMOUS`.
    Anonymous,
}

impl Mechanism {
    /// Construct the `EXTERNAL` mechanism using this process's real user
    /// id.
    #[cfg(all(unix, feature = "libc"))]
    pub fn external_current_user() -> Mechanism {
        // SAFETY: `getuid` has no preconditions and never fails.
        Mechanism::External(unsafe { libc::getuid() })
    }
}

/// Drive the SASL handshake to completion over `stream`, per §4.F and
/// §6. On success the stream is positioned exactly after the trailing
/// `BEGIN\r\n`, ready for binary D-Bus traffic.
pub async fn authenticate<S>(stream: &mut S, mechanism: Mechanism) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match tokio::time::timeout(AUTH_TIMEOUT, authenticate_inner(stream, mechanism)).await {
        Ok(result) => result,
        Err(_) => Err(ErrorKind::Timeout.into()),
    }
}

async fn authenticate_inner<S>(stream: &mut S, mechanism: Mechanism) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&[0]).await?;

    match mechanism {
        Mechanism::External(uid) => {
            stream.write_all(b"AUTH EXTERNAL\r\n").await?;

            let line = read_line(stream).await?;
            if !line.starts_with("DATA") {
                return Err(ErrorKind::InvalidAuthResponse(line).into());
            }

            let hex = encode_uid_hex(uid);
            stream
                .write_all(format!("DATA {hex}\r\n").as_bytes())
                .await?;

            let line = read_line(stream).await?;
            if !line.starts_with("OK ") {
                return Err(ErrorKind::AuthenticationFailed(line).into());
            }
        }
        Mechanism::Anonymous => {
            stream.write_all(b"AUTH ANONYMOUS\r\n").await?;

            let mut line = read_line(stream).await?;

            if line.starts_with("DATA") {
                stream.write_all(b"DATA\r\n").await?;
                line = read_line(stream).await?;
            }

            if !line.starts_with("OK ") {
                return Err(ErrorKind::AuthenticationFailed(line).into());
            }
        }
    }

    stream.write_all(b"BEGIN\r\n").await?;
    Ok(())
}

/// Read a single `\r\n`-terminated line, without the terminator.
async fn read_line<S>(stream: &mut S) -> Result<String, Error>
where
    S: AsyncRead + Unpin,
{
    let mut line = Vec::new();
    let mut byte = [0u8; 1];

    loop {
        let n = stream.read(&mut byte).await?;

        if n == 0 {
            return Err(ErrorKind::ConnectionClosed.into());
        }

        if byte[0] == b'\n' {
            if line.last() == Some(&b'\r') {
                line.pop();
            }

            break;
        }

        line.push(byte[0]);

        if line.len() > 16 * 1024 {
            return Err(ErrorKind::InvalidAuthResponse("line too long".into()).into());
        }
    }

    String::from_utf8(line).map_err(|_| ErrorKind::InvalidAuthResponse("non-UTF-8 line".into()).into())
}

/// Encode a numeric user id as the ASCII-decimal-then-hex form the
/// `EXTERNAL` mechanism expects, e.g. uid `1000` (ASCII `"1000"`) becomes
/// `"31303030"`.
fn encode_uid_hex(uid: u32) -> String {
    let decimal = uid.to_string();
    let mut hex = String::with_capacity(decimal.len() * 2);

    for byte in decimal.as_bytes() {
        hex.push_str(&format!("{byte:02x}"));
    }

    hex
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn encodes_uid_as_ascii_hex() {
        assert_eq!(encode_uid_hex(1000), "31303030");
        assert_eq!(encode_uid_hex(0), "30");
    }

    #[tokio::test]
    async fn external_handshake_sends_expected_bytes() {
        let (mut client, mut server) = duplex(4096);

        let handle = tokio::spawn(async move { authenticate(&mut client, Mechanism::External(1000)).await });

        let mut preamble = [0u8; 1];
        server.read_exact(&mut preamble).await.unwrap();
        assert_eq!(preamble, [0]);

        let mut buf = [0u8; 64];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"AUTH EXTERNAL\r\n");

        server.write_all(b"DATA\r\n").await.unwrap();

        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"DATA 31303030\r\n");

        server.write_all(b"OK abcdef0123456789\r\n").await.unwrap();

        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"BEGIN\r\n");

        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn anonymous_handshake_without_data_challenge() {
        let (mut client, mut server) = duplex(4096);

        let handle = tokio::spawn(async move { authenticate(&mut client, Mechanism::Anonymous).await });

        let mut preamble = [0u8; 1];
        server.read_exact(&mut preamble).await.unwrap();

        let mut buf = [0u8; 64];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"AUTH ANONYMOUS\r\n");

        server.write_all(b"OK abcdef0123456789\r\n").await.unwrap();

        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"BEGIN\r\n");

        handle.await.unwrap().unwrap();
    }
}
