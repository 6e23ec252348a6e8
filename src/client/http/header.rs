//! Line-oriented HTTP/1.x header handling and body piping.
//!
//! The parser works directly on a connection buffer: lines are located in
//! accumulated bytes, reading more as needed, and the consumed prefix is
//! dropped afterwards so the buffer starts at the body (or at the next
//! pipelined request). Obsolete line folding is not supported.

use std::collections::HashMap;

use crate::common::{Buffer, Error, Result};
use crate::net::{ReadTransport, WriteTransport};

/// Body runs until the peer closes the connection.
pub const CONTENT_EOF: i64 = -1;
/// Body uses chunked transfer encoding.
pub const CONTENT_CHUNKED: i64 = -2;

#[derive(Debug, Clone)]
pub struct HeaderField {
    /// Field name with original casing, for re-emission.
    pub field: String,
    pub content: String,
}

#[derive(Debug)]
pub struct HttpHeader {
    is_request: bool,
    pub start_line: String,
    headers: HashMap<String, HeaderField>,
    set_cookies: Vec<HeaderField>,
}

impl HttpHeader {
    /// Case-insensitive lookup; `name` must already be lowercase.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|f| f.content.as_str())
    }

    pub fn set(&mut self, name: &str, field: &str, content: &str) {
        self.headers.insert(
            name.to_string(),
            HeaderField {
                field: field.to_string(),
                content: content.to_string(),
            },
        );
    }

    pub fn remove(&mut self, name: &str) {
        self.headers.remove(name);
    }

    /// 1 for HTTP/1.1, 0 for HTTP/1.0, -1 otherwise.
    pub fn version(&self) -> i32 {
        let line = &self.start_line;
        let (v11, v10) = if self.is_request {
            (line.ends_with("HTTP/1.1"), line.ends_with("HTTP/1.0"))
        } else {
            (line.starts_with("HTTP/1.1"), line.starts_with("HTTP/1.0"))
        };
        if v11 {
            1
        } else if v10 {
            0
        } else {
            -1
        }
    }

    /// An explicit `Connection` token wins; otherwise HTTP/1.1 defaults to
    /// persistent and HTTP/1.0 to close.
    pub fn keep_alive(&self) -> bool {
        if let Some(tokens) = self.get("connection") {
            for token in tokens.split(',') {
                let token = token.trim_matches(' ').to_ascii_lowercase();
                if token == "close" {
                    return false;
                }
                if token == "keep-alive" {
                    return true;
                }
            }
        }
        self.version() == 1
    }

    pub fn method(&self) -> Result<&str> {
        debug_assert!(self.is_request, "method() on a response header");
        let end = self.start_line.find(' ').ok_or(Error::InvalidHttpHeader)?;
        Ok(&self.start_line[..end])
    }

    /// Body length: an exact byte count, [`CONTENT_EOF`] or
    /// [`CONTENT_CHUNKED`].
    pub fn content_length(&self) -> Result<i64> {
        if self.is_request {
            let method = self.method()?;
            if method == "GET" || method == "HEAD" {
                return Ok(0);
            }
        } else {
            let status = self.status()?;
            if status < 0 || status == 204 || status == 304 {
                return Ok(0);
            }
        }
        if let Some(encodings) = self.get("transfer-encoding") {
            let last = encodings.split(',').next_back().unwrap_or("");
            if last.trim_matches(' ').eq_ignore_ascii_case("chunked") {
                return Ok(CONTENT_CHUNKED);
            }
            return Ok(CONTENT_EOF);
        }
        if let Some(value) = self.get("content-length") {
            let n: i64 = value
                .trim()
                .parse()
                .map_err(|_| Error::InvalidHttpHeader)?;
            if n < 0 {
                return Err(Error::InvalidHttpHeader);
            }
            return Ok(n);
        }
        if self.is_request {
            Ok(0)
        } else {
            Ok(CONTENT_EOF)
        }
    }

    /// Request target, the second start-line token.
    pub fn url(&self) -> Result<&str> {
        debug_assert!(self.is_request, "url() on a response header");
        let start = self.start_line.find(' ').ok_or(Error::InvalidHttpHeader)? + 1;
        let rest = &self.start_line[start..];
        let end = rest.find(' ').ok_or(Error::InvalidHttpHeader)?;
        Ok(&rest[..end])
    }

    /// Authority of an absolute-form target: the part between `//` and the
    /// next `/`.
    pub fn url_host(&self) -> Result<&str> {
        let url = self.url()?;
        let start = url.find("//").ok_or(Error::InvalidHttpHeader)? + 2;
        let end = url[start..].find('/').ok_or(Error::InvalidHttpHeader)?;
        Ok(&url[start..start + end])
    }

    /// Path-and-query of an absolute-form target.
    pub fn url_rel(&self) -> Result<&str> {
        let url = self.url()?;
        let start = url.find("//").ok_or(Error::InvalidHttpHeader)? + 2;
        let end = url[start..].find('/').ok_or(Error::InvalidHttpHeader)?;
        Ok(&url[start + end..])
    }

    /// Numeric status of a response start line.
    pub fn status(&self) -> Result<i32> {
        let start = self.start_line.find(' ').ok_or(Error::InvalidHttpHeader)? + 1;
        let rest = &self.start_line[start..];
        let end = rest.find(' ').ok_or(Error::InvalidHttpHeader)?;
        rest[..end].parse().map_err(|_| Error::InvalidHttpHeader)
    }
}

fn unexpected_eof(context: &str) -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        context.to_string(),
    ))
}

/// Reads one CRLF-terminated line starting at `offset`, pulling more bytes
/// from the connection as needed. Returns the line (CRLF excluded) and the
/// offset just past the CRLF.
pub async fn read_line<R>(conn: &mut R, buf: &mut Buffer, offset: usize) -> Result<(String, usize)>
where
    R: ReadTransport + ?Sized,
{
    let mut i = offset;
    loop {
        while i + 1 >= buf.len() {
            if conn.read(buf).await? == 0 {
                return Err(unexpected_eof("connection closed inside HTTP line"));
            }
        }
        let bytes = buf.as_slice();
        if bytes[i] == 0x0d && bytes[i + 1] == 0x0a {
            let line = String::from_utf8_lossy(&bytes[offset..i]).into_owned();
            return Ok((line, i + 2));
        }
        i += 1;
    }
}

/// Parses a start line plus header fields up to the empty line, then drops
/// the consumed bytes from the buffer front. `Ok(None)` means the peer
/// closed cleanly between messages, i.e. the end of a pipelined session
/// rather than an error.
pub async fn parse_header<R>(
    conn: &mut R,
    buf: &mut Buffer,
    is_request: bool,
) -> Result<Option<HttpHeader>>
where
    R: ReadTransport + ?Sized,
{
    if buf.is_empty() && conn.read(buf).await? == 0 {
        return Ok(None);
    }

    let (start_line, mut offset) = read_line(conn, buf, 0).await?;
    let mut headers: HashMap<String, HeaderField> = HashMap::new();
    let mut set_cookies = Vec::new();

    loop {
        let (line, next) = read_line(conn, buf, offset).await?;
        offset = next;
        if line.is_empty() {
            break;
        }
        let colon = line.find(':').ok_or(Error::InvalidHttpHeader)?;
        let field = &line[..colon];
        let name = field.to_ascii_lowercase();
        let content = line[colon + 1..].trim_matches(' ').to_string();

        if let Some(existing) = headers.get_mut(&name) {
            if name == "content-length" {
                // a repeated content-length must agree with the first
                if existing.content != content {
                    return Err(Error::InvalidHttpHeader);
                }
            } else {
                existing.content.push_str(", ");
                existing.content.push_str(&content);
            }
        } else if name == "set-cookie" {
            set_cookies.push(HeaderField {
                field: field.to_string(),
                content,
            });
        } else {
            headers.insert(
                name,
                HeaderField {
                    field: field.to_string(),
                    content,
                },
            );
        }
    }

    buf.consume(offset);
    Ok(Some(HttpHeader {
        is_request,
        start_line,
        headers,
        set_cookies,
    }))
}

/// Emits the header: start line, `Host` first (some origins insist on it
/// early), the remaining fields in unspecified order, then `Set-Cookie`s
/// in their original order.
pub async fn write_header<W>(conn: &mut W, header: &HttpHeader) -> Result<()>
where
    W: WriteTransport + ?Sized,
{
    let mut text = String::with_capacity(256);
    text.push_str(&header.start_line);
    text.push_str("\r\n");
    if let Some(host) = header.headers.get("host") {
        text.push_str(&host.field);
        text.push_str(": ");
        text.push_str(&host.content);
        text.push_str("\r\n");
    }
    for (name, value) in &header.headers {
        if name == "host" {
            continue;
        }
        text.push_str(&value.field);
        text.push_str(": ");
        text.push_str(&value.content);
        text.push_str("\r\n");
    }
    for cookie in &header.set_cookies {
        text.push_str(&cookie.field);
        text.push_str(": ");
        text.push_str(&cookie.content);
        text.push_str("\r\n");
    }
    text.push_str("\r\n");

    let mut out = Buffer::from_slice(text.as_bytes());
    conn.write(&mut out).await
}

pub async fn write_400<W>(conn: &mut W) -> Result<()>
where
    W: WriteTransport + ?Sized,
{
    let mut out = Buffer::from_slice(b"HTTP/1.1 400 Bad Request\r\n\r\n");
    conn.write(&mut out).await
}

pub async fn write_502<W>(conn: &mut W) -> Result<()>
where
    W: WriteTransport + ?Sized,
{
    let mut out = Buffer::from_slice(b"HTTP/1.1 502 Bad Gateway\r\n\r\n");
    conn.write(&mut out).await
}

/// Forwards one message body from `input` to `output` according to the
/// header's length semantics. The buffer may already hold pre-read body
/// bytes; anything past the body (a pipelined next message) stays in it.
pub async fn pipe_body<R, W>(
    input: &mut R,
    buf: &mut Buffer,
    output: &mut W,
    header: &HttpHeader,
) -> Result<()>
where
    R: ReadTransport + ?Sized,
    W: WriteTransport + ?Sized,
{
    match header.content_length()? {
        CONTENT_EOF => loop {
            output.write(buf).await?;
            if input.read(buf).await? == 0 {
                return Ok(());
            }
        },
        CONTENT_CHUNKED => pipe_chunked_body(input, buf, output).await,
        length => pipe_known_length(input, buf, output, length as u64).await,
    }
}

async fn pipe_known_length<R, W>(
    input: &mut R,
    buf: &mut Buffer,
    output: &mut W,
    length: u64,
) -> Result<()>
where
    R: ReadTransport + ?Sized,
    W: WriteTransport + ?Sized,
{
    let mut remaining = length;
    loop {
        let take = remaining.min(buf.len() as u64) as usize;
        if take == buf.len() {
            output.write(buf).await?;
        } else if take > 0 {
            // the tail belongs to the next pipelined message
            let mut head = Buffer::from_slice(&buf.as_slice()[..take]);
            output.write(&mut head).await?;
            buf.consume(take);
        }
        remaining -= take as u64;
        if remaining == 0 {
            return Ok(());
        }
        if input.read(buf).await? == 0 {
            return Err(unexpected_eof("connection closed inside HTTP body"));
        }
    }
}

async fn pipe_chunked_body<R, W>(input: &mut R, buf: &mut Buffer, output: &mut W) -> Result<()>
where
    R: ReadTransport + ?Sized,
    W: WriteTransport + ?Sized,
{
    let mut offset = 0usize;
    loop {
        let (line, next) = read_line(input, buf, offset).await?;
        offset = next;
        let size_token = line.split(';').next().unwrap_or("").trim_matches(' ');
        let size =
            u64::from_str_radix(size_token, 16).map_err(|_| Error::InvalidHttpHeader)?;
        if size > 0 {
            // chunk data plus its trailing CRLF
            offset += size as usize + 2;
        }
        while offset >= buf.len() && offset > 0 {
            offset -= buf.len();
            output.write(buf).await?;
            if input.read(buf).await? == 0 {
                return Err(unexpected_eof("connection closed inside HTTP chunk"));
            }
        }
        if size == 0 {
            break;
        }
    }

    // Trailer section: forward everything up to and including the blank
    // line that ends it, and nothing past it. State counts progress
    // through CR LF CR LF; the chunk-size CRLF already consumed counts as
    // the first pair.
    let mut state = 2u8;
    loop {
        let bytes = buf.as_slice();
        let mut terminator = None;
        for i in offset..bytes.len() {
            state = match (state, bytes[i]) {
                (3, 0x0a) => 4,
                (2, 0x0d) => 3,
                (1, 0x0a) => 2,
                (_, 0x0d) => 1,
                _ => 0,
            };
            if state == 4 {
                terminator = Some(i + 1);
                break;
            }
        }
        match terminator {
            Some(end) => {
                let mut head = Buffer::from_slice(&buf.as_slice()[..end]);
                output.write(&mut head).await?;
                buf.consume(end);
                return Ok(());
            }
            None => {
                output.write(buf).await?;
                offset = 0;
                if input.read(buf).await? == 0 {
                    return Err(unexpected_eof("connection closed inside HTTP trailer"));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    /// Test reader delivering pre-baked segments one `read` at a time.
    struct Segments {
        chunks: VecDeque<Vec<u8>>,
    }

    impl Segments {
        fn new<const N: usize>(parts: [&[u8]; N]) -> Self {
            Self {
                chunks: parts.iter().map(|p| p.to_vec()).collect(),
            }
        }
    }

    #[async_trait]
    impl ReadTransport for Segments {
        async fn read(&mut self, buf: &mut Buffer) -> Result<usize> {
            match self.chunks.pop_front() {
                Some(chunk) => {
                    buf.append(&chunk)?;
                    Ok(chunk.len())
                }
                None => Ok(0),
            }
        }
    }

    struct Sink {
        data: Vec<u8>,
    }

    impl Sink {
        fn new() -> Self {
            Self { data: Vec::new() }
        }
    }

    #[async_trait]
    impl WriteTransport for Sink {
        async fn write(&mut self, buf: &mut Buffer) -> Result<()> {
            self.data.extend_from_slice(buf.as_slice());
            buf.clear();
            Ok(())
        }
    }

    async fn parse(raw: &[u8], is_request: bool) -> (HttpHeader, Buffer) {
        let mut source = Segments::new([raw]);
        let mut buf = Buffer::new();
        let header = parse_header(&mut source, &mut buf, is_request)
            .await
            .unwrap()
            .unwrap();
        (header, buf)
    }

    #[tokio::test]
    async fn parses_request_and_leaves_body() {
        let (header, buf) = parse(
            b"POST http://h.test/x HTTP/1.1\r\nHost: h.test\r\nContent-Length: 4\r\n\r\nbody",
            true,
        )
        .await;
        assert_eq!(header.start_line, "POST http://h.test/x HTTP/1.1");
        assert_eq!(header.get("host"), Some("h.test"));
        assert_eq!(header.content_length().unwrap(), 4);
        assert_eq!(buf.as_slice(), b"body");
    }

    #[tokio::test]
    async fn header_spread_over_many_reads() {
        let mut source = Segments::new([
            &b"GET http://h.test/ HT"[..],
            &b"TP/1.1\r\nHo"[..],
            &b"st: h.test\r\n\r"[..],
            &b"\n"[..],
        ]);
        let mut buf = Buffer::new();
        let header = parse_header(&mut source, &mut buf, true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(header.get("host"), Some("h.test"));
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn clean_eof_before_any_request() {
        let mut source = Segments::new([]);
        let mut buf = Buffer::new();
        assert!(parse_header(&mut source, &mut buf, true)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn truncated_header_is_an_error() {
        let mut source = Segments::new([&b"GET / HTTP/1.1\r\nHost: h"[..]]);
        let mut buf = Buffer::new();
        assert!(parse_header(&mut source, &mut buf, true).await.is_err());
    }

    #[tokio::test]
    async fn repeated_headers_join_with_comma() {
        let (header, _) = parse(
            b"GET / HTTP/1.1\r\nAccept: a\r\nAccept: b\r\n\r\n",
            true,
        )
        .await;
        assert_eq!(header.get("accept"), Some("a, b"));
    }

    #[tokio::test]
    async fn conflicting_content_length_rejected() {
        let mut source = Segments::new([
            &b"POST / HTTP/1.1\r\nContent-Length: 4\r\nContent-Length: 5\r\n\r\n"[..],
        ]);
        let mut buf = Buffer::new();
        assert!(matches!(
            parse_header(&mut source, &mut buf, true).await,
            Err(Error::InvalidHttpHeader)
        ));
    }

    #[tokio::test]
    async fn repeated_content_length_with_same_value_ok() {
        let (header, _) = parse(
            b"POST / HTTP/1.1\r\nContent-Length: 4\r\nContent-Length: 4\r\n\r\n",
            true,
        )
        .await;
        assert_eq!(header.content_length().unwrap(), 4);
    }

    #[tokio::test]
    async fn set_cookie_preserves_order_and_duplicates() {
        let (header, _) = parse(
            b"HTTP/1.1 200 OK\r\nSet-Cookie: a=1\r\nSet-Cookie: b=2\r\nSet-Cookie: a=3\r\n\r\n",
            false,
        )
        .await;
        assert!(header.get("set-cookie").is_none());
        let cookies: Vec<&str> = header.set_cookies.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(cookies, ["a=1", "b=2", "a=3"]);
    }

    #[tokio::test]
    async fn header_without_colon_rejected() {
        let mut source = Segments::new([&b"GET / HTTP/1.1\r\nBogusLine\r\n\r\n"[..]]);
        let mut buf = Buffer::new();
        assert!(matches!(
            parse_header(&mut source, &mut buf, true).await,
            Err(Error::InvalidHttpHeader)
        ));
    }

    #[tokio::test]
    async fn keep_alive_rules() {
        let (h, _) = parse(b"GET / HTTP/1.1\r\n\r\n", true).await;
        assert!(h.keep_alive());
        let (h, _) = parse(b"GET / HTTP/1.0\r\n\r\n", true).await;
        assert!(!h.keep_alive());
        let (h, _) = parse(b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n", true).await;
        assert!(h.keep_alive());
        let (h, _) = parse(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n", true).await;
        assert!(!h.keep_alive());
    }

    #[tokio::test]
    async fn content_length_rules() {
        let (h, _) = parse(b"GET / HTTP/1.1\r\nContent-Length: 9\r\n\r\n", true).await;
        assert_eq!(h.content_length().unwrap(), 0); // GET wins

        let (h, _) = parse(b"HTTP/1.1 204 No Content\r\n\r\n", false).await;
        assert_eq!(h.content_length().unwrap(), 0);

        let (h, _) = parse(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: gzip, chunked\r\n\r\n",
            false,
        )
        .await;
        assert_eq!(h.content_length().unwrap(), CONTENT_CHUNKED);

        let (h, _) = parse(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: gzip\r\n\r\n",
            false,
        )
        .await;
        assert_eq!(h.content_length().unwrap(), CONTENT_EOF);

        let (h, _) = parse(b"HTTP/1.1 200 OK\r\n\r\n", false).await;
        assert_eq!(h.content_length().unwrap(), CONTENT_EOF);

        let (h, _) = parse(b"POST / HTTP/1.1\r\n\r\n", true).await;
        assert_eq!(h.content_length().unwrap(), 0);
    }

    #[tokio::test]
    async fn url_helpers() {
        let (h, _) = parse(b"GET http://h.test:8080/a/b?q=1 HTTP/1.1\r\n\r\n", true).await;
        assert_eq!(h.url().unwrap(), "http://h.test:8080/a/b?q=1");
        assert_eq!(h.url_host().unwrap(), "h.test:8080");
        assert_eq!(h.url_rel().unwrap(), "/a/b?q=1");

        let (h, _) = parse(b"GET http://h.test HTTP/1.1\r\n\r\n", true).await;
        assert!(h.url_host().is_err());
    }

    #[tokio::test]
    async fn status_parses_middle_field() {
        let (h, _) = parse(b"HTTP/1.1 404 Not Found\r\n\r\n", false).await;
        assert_eq!(h.status().unwrap(), 404);
        assert_eq!(h.version(), 1);
    }

    #[tokio::test]
    async fn write_header_puts_host_first() {
        let (mut h, _) = parse(
            b"GET http://h.test/ HTTP/1.1\r\nAccept: x\r\nHost: h.test\r\n\r\n",
            true,
        )
        .await;
        h.set("connection", "Connection", "keep-alive");
        let mut sink = Sink::new();
        write_header(&mut sink, &h).await.unwrap();
        let text = String::from_utf8(sink.data).unwrap();
        let lines: Vec<&str> = text.split("\r\n").collect();
        assert_eq!(lines[0], "GET http://h.test/ HTTP/1.1");
        assert_eq!(lines[1], "Host: h.test");
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn pipe_body_known_length_respects_pipelined_tail() {
        let mut source = Segments::new([&b"rest"[..]]);
        let mut buf = Buffer::from_slice(b"bo");
        let mut sink = Sink::new();
        let (header, _) = parse(b"POST / HTTP/1.1\r\nContent-Length: 6\r\n\r\n", true).await;
        pipe_body(&mut source, &mut buf, &mut sink, &header)
            .await
            .unwrap();
        assert_eq!(sink.data, b"borest");
        assert!(buf.is_empty());

        // pre-read bytes beyond the body stay buffered
        let mut source = Segments::new([]);
        let mut buf = Buffer::from_slice(b"bodyGET /next HTTP/1.1\r\n");
        let mut sink = Sink::new();
        let (header, _) = parse(b"POST / HTTP/1.1\r\nContent-Length: 4\r\n\r\n", true).await;
        pipe_body(&mut source, &mut buf, &mut sink, &header)
            .await
            .unwrap();
        assert_eq!(sink.data, b"body");
        assert_eq!(buf.as_slice(), b"GET /next HTTP/1.1\r\n");
    }

    #[tokio::test]
    async fn pipe_body_eof_terminated() {
        let mut source = Segments::new([&b"abc"[..], &b"def"[..]]);
        let mut buf = Buffer::new();
        let mut sink = Sink::new();
        let (header, _) = parse(b"HTTP/1.0 200 OK\r\n\r\n", false).await;
        pipe_body(&mut source, &mut buf, &mut sink, &header)
            .await
            .unwrap();
        assert_eq!(sink.data, b"abcdef");
    }

    #[tokio::test]
    async fn pipe_body_chunked_with_trailer() {
        let wire =
            b"4\r\nWiki\r\n5\r\npedia\r\n0\r\nExpires: now\r\n\r\nGET /next HTTP/1.1\r\n";
        let mut source = Segments::new([&wire[..]]);
        let mut buf = Buffer::new();
        let mut sink = Sink::new();
        let (header, _) = parse(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n",
            false,
        )
        .await;
        pipe_body(&mut source, &mut buf, &mut sink, &header)
            .await
            .unwrap();
        // the full chunked framing and trailer pass through, nothing more
        assert_eq!(
            sink.data,
            b"4\r\nWiki\r\n5\r\npedia\r\n0\r\nExpires: now\r\n\r\n"
        );
        assert_eq!(buf.as_slice(), b"GET /next HTTP/1.1\r\n");
    }

    #[tokio::test]
    async fn pipe_body_chunked_empty_trailer() {
        let wire = b"3\r\nabc\r\n0\r\n\r\n";
        let mut source = Segments::new([&wire[..]]);
        let mut buf = Buffer::new();
        let mut sink = Sink::new();
        let (header, _) = parse(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n",
            false,
        )
        .await;
        pipe_body(&mut source, &mut buf, &mut sink, &header)
            .await
            .unwrap();
        assert_eq!(sink.data, b"3\r\nabc\r\n0\r\n\r\n");
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn pipe_body_chunked_split_reads() {
        let mut source = Segments::new([
            &b"4\r\nWi"[..],
            &b"ki\r\n0"[..],
            &b"\r\n\r"[..],
            &b"\n"[..],
        ]);
        let mut buf = Buffer::new();
        let mut sink = Sink::new();
        let (header, _) = parse(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n",
            false,
        )
        .await;
        pipe_body(&mut source, &mut buf, &mut sink, &header)
            .await
            .unwrap();
        assert_eq!(sink.data, b"4\r\nWiki\r\n0\r\n\r\n");
    }

    #[tokio::test]
    async fn pipe_body_chunked_bad_size_line() {
        let mut source = Segments::new([&b"zz\r\n\r\n"[..]]);
        let mut buf = Buffer::new();
        let mut sink = Sink::new();
        let (header, _) = parse(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n",
            false,
        )
        .await;
        assert!(matches!(
            pipe_body(&mut source, &mut buf, &mut sink, &header).await,
            Err(Error::InvalidHttpHeader)
        ));
    }
}
