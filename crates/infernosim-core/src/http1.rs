//! Minimal HTTP/1.1 wire helpers.
//!
//! The stub proxy's wire contract is deliberately small: read a request head
//! from a raw TCP stream (origin-form, absolute-form, or `CONNECT`
//! authority-form targets), answer with a fixed-size response. The capture
//! proxies reuse the same reader and a body-carrying response writer. Bodies
//! are supported only with an explicit `Content-Length`; chunked transfer
//! coding is rejected.
//!
//! All reads are bounded: request lines and header lines are capped at
//! [`MAX_LINE_BYTES`], header counts at [`MAX_HEADER_COUNT`], bodies at
//! [`MAX_BODY_BYTES`].

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single request or header line.
pub const MAX_LINE_BYTES: usize = 8 * 1024;

/// Upper bound on the number of header lines per request.
pub const MAX_HEADER_COUNT: usize = 100;

/// Upper bound on a buffered request or response body.
pub const MAX_BODY_BYTES: u64 = 16 * 1024 * 1024;

/// Errors from reading or writing the minimal wire format.
#[derive(Debug, thiserror::Error)]
pub enum Http1Error {
    /// Underlying socket failure.
    #[error("socket i/o failure: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the connection mid-record.
    #[error("connection closed mid-request")]
    TruncatedRequest,

    /// The request line did not have three parts.
    #[error("malformed request line {0:?}")]
    BadRequestLine(String),

    /// A header line had no colon.
    #[error("malformed header line {0:?}")]
    BadHeader(String),

    /// A line exceeded [`MAX_LINE_BYTES`].
    #[error("request line or header exceeds {MAX_LINE_BYTES} bytes")]
    LineTooLong,

    /// More than [`MAX_HEADER_COUNT`] headers.
    #[error("request carries more than {MAX_HEADER_COUNT} headers")]
    TooManyHeaders,

    /// `Content-Length` was present but not a valid integer, or the declared
    /// body exceeds [`MAX_BODY_BYTES`].
    #[error("unacceptable content length {0:?}")]
    BadContentLength(String),

    /// `Transfer-Encoding` is not supported by this minimal reader.
    #[error("transfer-encoding {0:?} is not supported")]
    UnsupportedTransferEncoding(String),
}

/// A parsed request line plus headers. The body, if any, is left on the
/// stream for the caller to read or discard.
#[derive(Debug, Clone)]
pub struct RequestHead {
    /// Request method, as sent.
    pub method: String,
    /// Request target: origin-form (`/path?q=1`), absolute-form
    /// (`http://host/path`), or authority-form (`host:port` for `CONNECT`).
    pub target: String,
    /// Header name/value pairs in wire order.
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Returns the first value of `name`, case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Declared body length.
    ///
    /// Zero when no `Content-Length` is present. Errors on an unparseable
    /// length, an over-limit length, or any `Transfer-Encoding`.
    pub fn content_length(&self) -> Result<u64, Http1Error> {
        if let Some(te) = self.header("transfer-encoding") {
            return Err(Http1Error::UnsupportedTransferEncoding(te.to_string()));
        }
        match self.header("content-length") {
            None => Ok(0),
            Some(raw) => {
                let n: u64 = raw
                    .trim()
                    .parse()
                    .map_err(|_| Http1Error::BadContentLength(raw.to_string()))?;
                if n > MAX_BODY_BYTES {
                    return Err(Http1Error::BadContentLength(raw.to_string()));
                }
                Ok(n)
            }
        }
    }
}

/// Reads one request head from the stream.
///
/// Returns `Ok(None)` on a clean EOF before the first byte (the peer is done
/// with the connection), and an error on anything malformed after that.
pub async fn read_request_head<R>(reader: &mut R) -> Result<Option<RequestHead>, Http1Error>
where
    R: AsyncBufRead + Unpin,
{
    let Some(request_line) = read_line(reader).await? else {
        return Ok(None);
    };
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target), Some(_version)) =
        (parts.next(), parts.next(), parts.next())
    else {
        return Err(Http1Error::BadRequestLine(request_line));
    };
    let head_method = method.to_string();
    let head_target = target.to_string();

    let mut headers = Vec::new();
    loop {
        let line = read_line(reader)
            .await?
            .ok_or(Http1Error::TruncatedRequest)?;
        if line.is_empty() {
            break;
        }
        if headers.len() >= MAX_HEADER_COUNT {
            return Err(Http1Error::TooManyHeaders);
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(Http1Error::BadHeader(line));
        };
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(Some(RequestHead {
        method: head_method,
        target: head_target,
        headers,
    }))
}

/// Reads exactly `len` body bytes into memory.
pub async fn read_body<R>(reader: &mut R, len: u64) -> Result<Vec<u8>, Http1Error>
where
    R: AsyncBufRead + Unpin,
{
    let mut body = vec![0u8; usize::try_from(len).map_err(|_| {
        Http1Error::BadContentLength(len.to_string())
    })?];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|_| Http1Error::TruncatedRequest)?;
    Ok(body)
}

/// Writes the minimal response form: a status line and `Content-Length: 0`.
pub async fn write_empty_response<W>(writer: &mut W, status: u16) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let head = format!(
        "HTTP/1.1 {status} {}\r\nContent-Length: 0\r\n\r\n",
        reason_phrase(status)
    );
    writer.write_all(head.as_bytes()).await?;
    writer.flush().await
}

/// Writes a full response with headers and body.
///
/// `Content-Length` is derived from `body`; any length or transfer-coding
/// headers in `headers` are dropped so the frame stays self-consistent.
pub async fn write_response<W>(
    writer: &mut W,
    status: u16,
    headers: &[(String, String)],
    body: &[u8],
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut head = format!("HTTP/1.1 {status} {}\r\n", reason_phrase(status));
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("content-length")
            || name.eq_ignore_ascii_case("transfer-encoding")
        {
            continue;
        }
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
    writer.write_all(head.as_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await
}

/// Reason phrase for the status codes this engine emits or relays.
#[must_use]
pub const fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        411 => "Length Required",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Status",
    }
}

/// Reads one CRLF- or LF-terminated line, without the terminator. Returns
/// `None` on EOF at a line boundary.
async fn read_line<R>(reader: &mut R) -> Result<Option<String>, Http1Error>
where
    R: AsyncBufRead + Unpin,
{
    let mut line: Vec<u8> = Vec::new();
    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            if line.is_empty() {
                return Ok(None);
            }
            return Err(Http1Error::TruncatedRequest);
        }
        if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            line.extend_from_slice(&buf[..pos]);
            reader.consume(pos + 1);
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.len() > MAX_LINE_BYTES {
                return Err(Http1Error::LineTooLong);
            }
            return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
        }
        let taken = buf.len();
        line.extend_from_slice(buf);
        reader.consume(taken);
        if line.len() > MAX_LINE_BYTES {
            return Err(Http1Error::LineTooLong);
        }
    }
}
