use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Longest request line accepted from a client, newline excluded.
pub(crate) const MAX_LINE_BYTES: usize = 64 * 1024;

/// Read one newline-terminated line of at most `max` bytes.
///
/// Returns `Ok(None)` at end of stream. Longer lines and invalid UTF-8 fail
/// with [`io::ErrorKind::InvalidData`]; the connection should be closed then.
pub(crate) async fn read_line<R>(reader: &mut R, max: usize) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let read = (&mut *reader)
        .take(max as u64 + 1)
        .read_until(b'\n', &mut buf)
        .await?;
    if read == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
    } else if buf.len() > max {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("line exceeds {max} bytes"),
        ));
    }
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    String::from_utf8(buf)
        .map(Some)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn splits_lines_and_strips_crlf() {
        let mut reader = BufReader::new(&b"hello 1.0\r\nsub a\nlast"[..]);
        assert_eq!(read_line(&mut reader, 64).await.unwrap().as_deref(), Some("hello 1.0"));
        assert_eq!(read_line(&mut reader, 64).await.unwrap().as_deref(), Some("sub a"));
        assert_eq!(read_line(&mut reader, 64).await.unwrap().as_deref(), Some("last"));
        assert_eq!(read_line(&mut reader, 64).await.unwrap(), None);
    }

    #[tokio::test]
    async fn rejects_overlong_lines() {
        let mut reader = BufReader::new(&b"0123456789\n"[..]);
        let err = read_line(&mut reader, 4).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let mut exact = BufReader::new(&b"0123\n"[..]);
        assert_eq!(read_line(&mut exact, 4).await.unwrap().as_deref(), Some("0123"));
    }
}
