//! Canned responses written to the client when a session cannot proceed

use crate::Result;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// `502 Bad Gateway` with a plain-text body naming the request and the reason
pub fn bad_gateway(url: &str, reason: &str) -> Vec<u8> {
    let body = format!("Bad Gateway: {} - {}", url, reason);
    plain_text(502, "Bad Gateway", &body)
}

/// `400 Bad Request` for heads that could not be parsed
pub fn bad_request(reason: &str) -> Vec<u8> {
    plain_text(400, "Bad Request", reason)
}

fn plain_text(code: u16, status: &str, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n\
         {}",
        code,
        status,
        body.len(),
        body
    )
    .into_bytes()
}

/// Write a complete response within `deadline`
pub async fn write_response<W>(writer: &mut W, response: &[u8], deadline: Duration) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    tokio::time::timeout(deadline, async {
        writer.write_all(response).await?;
        writer.flush().await
    })
    .await??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_bad_gateway_format() {
        let response = String::from_utf8(bad_gateway(
            "http://example.com/",
            "No fallback configured",
        ))
        .unwrap();
        let (head, body) = response.split_once("\r\n\r\n").unwrap();
        assert!(head.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
        assert!(head.contains("Content-Type: text/plain"));
        assert_eq!(body, "Bad Gateway: http://example.com/ - No fallback configured");
        assert!(head.contains(&format!("Content-Length: {}", body.len())));
    }

    #[test]
    fn test_bad_request_format() {
        let response = String::from_utf8(bad_request("Malformed request")).unwrap();
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(response.ends_with("\r\n\r\nMalformed request"));
    }

    #[tokio::test]
    async fn test_write_response() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let response = bad_request("nope");
        write_response(&mut a, &response, Duration::from_secs(1))
            .await
            .unwrap();
        drop(a);

        let mut received = Vec::new();
        b.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, response);
    }

    #[tokio::test]
    async fn test_write_response_times_out() {
        // The peer never reads, so a response larger than the pipe stalls.
        let (mut a, _b) = tokio::io::duplex(16);
        let response = bad_gateway("http://example.com/", &"x".repeat(256));
        let result = write_response(&mut a, &response, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(crate::Error::Timeout(_))));
    }
}
