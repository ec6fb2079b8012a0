//! HTTP/1.x 解码器
//!
//! 客户端请求头用 httparse 解析，输出 `[METHOD] [host+uri] [query/form]`。
//! 请求体按 Content-Length 或 chunked 跳过；表单体（urlencoded）并入参数。
//! 服务端应答丢弃。

use crate::contract::FlowContext;
use crate::error::DecodeError;
use domain::{Direction, EventKind};
use serde_json::json;
use tracing::debug;
use wiretap_reassembly::ByteSource;

/// 请求头最大字节数
const MAX_HEAD: usize = 64 * 1024;
const MAX_HEADERS: usize = 64;
/// 并入参数的表单体上限
const MAX_FORM_BODY: usize = 1024 * 1024;

/// 解析出的请求行与关心的头部。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub uri: String,
    pub version: u8,
    pub host: Option<String>,
    pub content_length: Option<usize>,
    pub chunked: bool,
    pub form_body: bool,
}

impl RequestHead {
    pub fn path(&self) -> &str {
        self.uri.split_once('?').map_or(self.uri.as_str(), |(path, _)| path)
    }

    pub fn query(&self) -> &str {
        self.uri.split_once('?').map_or("", |(_, query)| query)
    }

    /// 代理形式的绝对 URI 原样输出，否则拼上 Host。
    pub fn target(&self) -> String {
        if self.uri.starts_with("http://") || self.uri.starts_with("https://") {
            return self.uri.clone();
        }
        format!("{}{}", self.host.as_deref().unwrap_or_default(), self.uri)
    }
}

/// 一个完整的请求：头部与（可选的）表单体。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub head: RequestHead,
    pub form: Option<String>,
}

impl HttpRequest {
    /// 查询串与表单体合并，按键排序后以 `&` 连接。
    pub fn params(&self) -> String {
        let mut pairs: Vec<(&str, &str)> = self
            .head
            .query()
            .split('&')
            .chain(self.form.as_deref().unwrap_or_default().split('&'))
            .filter(|pair| !pair.is_empty())
            .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
            .collect();
        pairs.sort_by(|a, b| a.0.cmp(b.0));
        let pairs: Vec<String> = pairs.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        pairs.join("&")
    }

    pub fn render(&self) -> String {
        format!("[{}] [{}] [{}]", self.head.method, self.head.target(), self.params())
    }
}

/// 从缓冲区解析请求头；数据不足时返回 `None`。
pub fn parse_head(buf: &[u8]) -> Result<Option<(RequestHead, usize)>, DecodeError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);
    let len = match request.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(err) => return Err(DecodeError::Malformed(format!("http: {}", err))),
    };

    let mut head = RequestHead {
        method: request.method.unwrap_or_default().to_string(),
        uri: request.path.unwrap_or_default().to_string(),
        version: request.version.unwrap_or(1),
        host: None,
        content_length: None,
        chunked: false,
        form_body: false,
    };
    for header in request.headers.iter() {
        let value = String::from_utf8_lossy(header.value);
        let value = value.trim();
        if header.name.eq_ignore_ascii_case("host") {
            head.host = Some(value.to_string());
        } else if header.name.eq_ignore_ascii_case("content-length") {
            let length = value
                .parse::<usize>()
                .map_err(|_| DecodeError::Malformed(format!("content-length {:?}", value)))?;
            head.content_length = Some(length);
        } else if header.name.eq_ignore_ascii_case("transfer-encoding") {
            head.chunked = value.to_ascii_lowercase().contains("chunked");
        } else if header.name.eq_ignore_ascii_case("content-type") {
            head.form_body = value
                .to_ascii_lowercase()
                .starts_with("application/x-www-form-urlencoded");
        }
    }
    Ok(Some((head, len)))
}

/// 读取下一个请求（含跳过请求体）。
pub async fn read_request(source: &mut ByteSource) -> Result<HttpRequest, DecodeError> {
    let (head, len) = loop {
        if let Some(parsed) = parse_head(source.buffered())? {
            break parsed;
        }
        if source.buffered().len() > MAX_HEAD {
            return Err(DecodeError::Malformed(format!("http head exceeds {} bytes", MAX_HEAD)));
        }
        source.fill().await?;
    };
    source.consume(len);

    let mut form = None;
    if head.chunked {
        skip_chunked(source).await?;
    } else if let Some(length) = head.content_length {
        if head.form_body && length <= MAX_FORM_BODY {
            let body = source.read_exact(length).await?;
            form = Some(String::from_utf8_lossy(&body).into_owned());
        } else {
            source.skip(length).await?;
        }
    }
    Ok(HttpRequest { head, form })
}

async fn read_line(source: &mut ByteSource) -> Result<String, DecodeError> {
    let line = source.read_until(b'\n').await?;
    Ok(String::from_utf8_lossy(&line).trim_end().to_string())
}

async fn skip_chunked(source: &mut ByteSource) -> Result<(), DecodeError> {
    loop {
        let line = read_line(source).await?;
        let size = line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size, 16)
            .map_err(|_| DecodeError::Malformed(format!("chunk size {:?}", size)))?;
        if size == 0 {
            break;
        }
        let size = size
            .checked_add(2)
            .ok_or_else(|| DecodeError::Malformed(format!("chunk size {:x} out of range", size)))?;
        source.skip(size).await?;
    }
    // trailer 以空行结束
    while !read_line(source).await?.is_empty() {}
    Ok(())
}

/// 解析失败后丢弃到下一个换行，从下一行重新尝试。
fn resync(source: &mut ByteSource) {
    let buffered = source.buffered();
    let n = buffered
        .iter()
        .position(|b| *b == b'\n')
        .map_or(buffered.len(), |pos| pos + 1);
    source.consume(n);
}

#[derive(Debug, Clone)]
pub struct HttpDecoder {
    pub(crate) port: u16,
}

impl Default for HttpDecoder {
    fn default() -> Self {
        Self { port: 80 }
    }
}

impl HttpDecoder {
    pub const NAME: &'static str = "http";

    pub async fn handle_flow(&self, ctx: FlowContext, mut client: ByteSource, mut server: ByteSource) {
        let requests = async {
            const DIR: Direction = Direction::ClientToServer;
            loop {
                match read_request(&mut client).await {
                    Ok(request) => {
                        let head = &request.head;
                        let event = ctx.event(EventKind::Query, DIR, request.render()).with_detail(json!({
                            "method": head.method,
                            "host": head.host,
                            "path": head.path(),
                            "version": format!("HTTP/1.{}", head.version),
                            "params": request.params(),
                        }));
                        ctx.emit(event).await;
                    }
                    Err(err @ DecodeError::Stream(_)) => {
                        ctx.stream_ended(DIR, &err);
                        break;
                    }
                    Err(err) => {
                        ctx.decode_failed(DIR, "http request", &err);
                        resync(&mut client);
                    }
                }
            }
            client.discard_to_end().await;
        };
        let responses = async {
            let discarded = server.discard_to_end().await;
            debug!(target: "wiretap.decode", flow = %ctx.flow(), discarded, "http responses ignored");
        };
        tokio::join!(requests, responses);
    }
}
