//! 플랫폼 웹 사이트와의 HTTP 세션 클라이언트.
//!
//! 한 호스트에 대한 세션 하나를 나타냅니다. 연결은 첫 요청 시점에 만들어지고,
//! 전송 중 일시적 에러가 나면 버려진 뒤 다음 호출에서 다시 만들어집니다.
//!
//! # 헤더 병합 규칙
//!
//! 요청 헤더는 기본 헤더 위에 호출별 헤더를 덮어써서 만듭니다.
//! 같은 이름이 양쪽에 있으면 **호출별 헤더가 기본 헤더를 대체**합니다.
//! 쿠키는 그 다음에 저장소에서 붙습니다.

use super::cookie::CookieStore;
use crate::error::{FeedError, FeedResult};
use flate2::read::GzDecoder;
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT, ACCEPT_ENCODING, ACCEPT_LANGUAGE, CONNECTION,
    CONTENT_ENCODING, CONTENT_TYPE, LOCATION, ORIGIN, REFERER, USER_AGENT,
};
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::io::Read;
use td365_core::config::HttpConfig;
use td365_core::types::{Market, MarketGroup};
use tracing::{debug, info, warn};

const JSON_UTF8: &str = "application/json; charset=utf-8";

/// 세션 연결 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
}

/// 압축 해제까지 끝난 HTTP 응답.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// 본문을 UTF-8 문자열로 반환합니다 (잘못된 바이트는 대체 문자로).
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// 본문을 JSON으로 역직렬화합니다.
    pub fn json<T: DeserializeOwned>(&self) -> FeedResult<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// `UTSAPI.asmx` 응답 봉투.
#[derive(Debug, Deserialize)]
struct RpcEnvelope<T> {
    d: T,
}

/// 쿠키 기반 세션을 유지하는 HTTP 클라이언트.
pub struct SessionClient {
    config: HttpConfig,
    scheme: String,
    /// `host[:port]`
    authority: String,
    client: Option<reqwest::Client>,
    state: ConnectionState,
    default_headers: HeaderMap,
    cookies: CookieStore,
}

impl SessionClient {
    /// HTTPS로 주어진 호스트에 대한 세션을 만듭니다.
    pub fn new(host: impl Into<String>, config: HttpConfig) -> Self {
        Self::with_scheme("https", host.into(), config)
    }

    /// `http://127.0.0.1:8080` 같은 기준 URL로 세션을 만듭니다.
    pub fn with_base_url(base_url: &str, config: HttpConfig) -> FeedResult<Self> {
        let url = Url::parse(base_url)
            .map_err(|e| FeedError::Protocol(format!("Invalid base URL {}: {}", base_url, e)))?;
        let authority = authority_of(&url)
            .ok_or_else(|| FeedError::Protocol(format!("Base URL has no host: {}", base_url)))?;
        Ok(Self::with_scheme(url.scheme(), authority, config))
    }

    fn with_scheme(scheme: &str, authority: String, config: HttpConfig) -> Self {
        let default_headers = default_headers(&config.user_agent);
        Self {
            config,
            scheme: scheme.to_string(),
            authority,
            client: None,
            state: ConnectionState::Closed,
            default_headers,
            cookies: CookieStore::new(),
        }
    }

    /// 세션 호스트 (`host[:port]`).
    pub fn host(&self) -> &str {
        &self.authority
    }

    /// `scheme://host[:port]` 형태의 origin.
    pub fn origin(&self) -> String {
        format!("{}://{}", self.scheme, self.authority)
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn cookies(&self) -> &CookieStore {
        &self.cookies
    }

    pub fn default_headers(&self) -> &HeaderMap {
        &self.default_headers
    }

    /// 기본 헤더를 설정합니다. 이미 있는 이름은 교체됩니다.
    pub fn set_default_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.default_headers.insert(name, value);
    }

    /// 리다이렉트를 따라가 최종 경로의 `ots` 토큰을 반환합니다.
    ///
    /// 요청 수는 리다이렉트 수 + 1이며, `max_redirects`를 넘으면 `Protocol` 에러입니다.
    pub async fn connect(&mut self, path: &str) -> FeedResult<String> {
        let mut current = path.to_string();

        for hop in 0..=self.config.max_redirects {
            let response = self.get(&current).await?;

            match response.status {
                StatusCode::OK => {
                    info!(path = %current, hops = hop, "Session landing page reached");
                    return extract_ots(&current);
                }
                StatusCode::MOVED_PERMANENTLY
                | StatusCode::FOUND
                | StatusCode::SEE_OTHER
                | StatusCode::TEMPORARY_REDIRECT
                | StatusCode::PERMANENT_REDIRECT => {
                    let location = response
                        .headers
                        .get(LOCATION)
                        .and_then(|v| v.to_str().ok())
                        .ok_or_else(|| {
                            FeedError::Protocol(format!(
                                "{} without Location from {}",
                                response.status, current
                            ))
                        })?;
                    let next = self.resolve_location(&current, location)?;
                    debug!(from = %current, to = %next, status = %response.status, "Following redirect");
                    current = next;
                }
                other => {
                    return Err(FeedError::Protocol(format!(
                        "Unexpected status {} for {}",
                        other, current
                    )));
                }
            }
        }

        Err(FeedError::Protocol(format!(
            "Redirect limit ({}) exceeded",
            self.config.max_redirects
        )))
    }

    /// 세션을 열고 세션 토큰 쿠키 값을 반환합니다.
    ///
    /// 성공하면 이후 모든 요청에 `Origin`/`Referer` 기본 헤더가 붙습니다.
    pub async fn login(&mut self, path: &str) -> FeedResult<String> {
        let ots = self.connect(path).await?;

        let token = self
            .cookies
            .get_for_host(&self.authority, &ots)
            .map(|c| c.value.clone())
            .ok_or_else(|| FeedError::Auth(format!("No session cookie named {}", ots)))?;

        let origin = self.origin();
        let referer = format!("{}/Advanced.aspx?ots={}", origin, ots);
        self.set_default_header(ORIGIN, header_value(&origin)?);
        self.set_default_header(REFERER, header_value(&referer)?);

        info!(host = %self.authority, "Session login complete");
        Ok(token)
    }

    /// GET 요청.
    pub async fn get(&mut self, path: &str) -> FeedResult<HttpResponse> {
        self.send(Method::GET, path, HeaderMap::new(), Vec::new())
            .await
    }

    /// POST 요청.
    pub async fn post(
        &mut self,
        path: &str,
        content_type: &str,
        body: impl Into<Vec<u8>>,
    ) -> FeedResult<HttpResponse> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, header_value(content_type)?);
        self.send(Method::POST, path, headers, body.into()).await
    }

    /// 요청/응답 한 번을 수행합니다.
    ///
    /// 전송 중 일시적 에러가 나면 연결을 버리고 `Transient`를 반환합니다.
    pub async fn send(
        &mut self,
        method: Method,
        path: &str,
        headers: HeaderMap,
        body: Vec<u8>,
    ) -> FeedResult<HttpResponse> {
        let client = self.ensure_connected()?;
        let url = format!("{}://{}{}", self.scheme, self.authority, path);

        let mut request_headers = self.default_headers.clone();
        for (name, value) in headers.iter() {
            request_headers.insert(name.clone(), value.clone());
        }
        self.cookies.apply(&self.authority, &mut request_headers);

        debug!(%method, %url, "HTTP request");

        let result = async {
            let response = client
                .request(method.clone(), &url)
                .headers(request_headers)
                .body(body)
                .send()
                .await?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = response.bytes().await?;
            Ok::<_, FeedError>((status, headers, body))
        }
        .await;

        let (status, headers, raw) = match result {
            Ok(parts) => parts,
            Err(e) => {
                if e.is_retryable() {
                    warn!(%url, error = %e, "Connection dropped, will reconnect on next request");
                    self.disconnect();
                }
                return Err(e);
            }
        };

        self.cookies.update(&self.authority, &headers);

        let body = if is_gzip(&headers) {
            gunzip(&raw)?
        } else {
            raw.to_vec()
        };

        debug!(%method, %url, %status, bytes = body.len(), "HTTP response");
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }

    /// 현재 연결을 버립니다. 다음 요청에서 새로 연결합니다.
    pub fn disconnect(&mut self) {
        self.client = None;
        self.state = ConnectionState::Closed;
    }

    /// 서버 측 세션을 연장합니다.
    pub async fn update_session_token(&mut self) -> FeedResult<()> {
        let response = self
            .post("/UTSAPI.asmx/UpdateClientSessionID", JSON_UTF8, Vec::new())
            .await?;
        expect_ok(&response, "UpdateClientSessionID")?;
        debug!("Session token refreshed");
        Ok(())
    }

    /// 최상위 마켓 그룹 목록.
    pub async fn get_market_super_group(&mut self) -> FeedResult<Vec<MarketGroup>> {
        self.rpc("GetMarketSuperGroup", Vec::new()).await
    }

    /// 슈퍼 그룹 아래의 마켓 그룹 목록.
    pub async fn get_market_group(&mut self, super_group_id: u32) -> FeedResult<Vec<MarketGroup>> {
        let body = serde_json::json!({ "superGroupId": super_group_id });
        self.rpc("GetMarketGroup", serde_json::to_vec(&body)?).await
    }

    /// 그룹 안의 종목 목록.
    pub async fn get_market_quote(&mut self, group_id: u32) -> FeedResult<Vec<Market>> {
        let body = serde_json::json!({
            "groupID": group_id,
            "keyword": "",
            "popular": false,
            "portfolio": false,
            "search": false,
        });
        self.rpc("GetMarketQuote", serde_json::to_vec(&body)?).await
    }

    async fn rpc<T: DeserializeOwned>(&mut self, method: &str, body: Vec<u8>) -> FeedResult<T> {
        let path = format!("/UTSAPI.asmx/{}", method);
        let response = self.post(&path, JSON_UTF8, body).await?;
        expect_ok(&response, method)?;
        let envelope: RpcEnvelope<T> = response.json()?;
        Ok(envelope.d)
    }

    fn ensure_connected(&mut self) -> FeedResult<reqwest::Client> {
        if let Some(client) = &self.client {
            return Ok(client.clone());
        }

        self.state = ConnectionState::Connecting;
        let mut builder = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_gzip()
            .timeout(self.config.request_timeout());

        if let Some(proxy) = &self.config.proxy {
            let proxy = reqwest::Proxy::all(proxy.as_str())
                .map_err(|e| FeedError::Protocol(format!("Invalid proxy {}: {}", proxy, e)))?;
            builder = builder.proxy(proxy);
        }

        let client = match builder.build() {
            Ok(client) => client,
            Err(e) => {
                self.state = ConnectionState::Closed;
                return Err(FeedError::Protocol(format!("HTTP client build failed: {}", e)));
            }
        };

        debug!(host = %self.authority, "HTTP session opened");
        self.client = Some(client.clone());
        self.state = ConnectionState::Open;
        Ok(client)
    }

    /// `Location` 값을 현재 경로 기준으로 해석해 다음 요청 경로를 만듭니다.
    ///
    /// 다른 호스트로의 리다이렉트는 세션 쿠키가 따라갈 수 없으므로 거부합니다.
    fn resolve_location(&self, current: &str, location: &str) -> FeedResult<String> {
        let base = Url::parse(&format!("{}{}", self.origin(), current))
            .map_err(|e| FeedError::Protocol(format!("Bad request path {}: {}", current, e)))?;
        let target = base
            .join(location)
            .map_err(|e| FeedError::Protocol(format!("Bad Location {}: {}", location, e)))?;

        match authority_of(&target) {
            Some(authority) if authority.eq_ignore_ascii_case(&self.authority) => {}
            _ => {
                return Err(FeedError::Protocol(format!(
                    "Cross-host redirect to {} rejected",
                    target
                )))
            }
        }

        Ok(match target.query() {
            Some(query) => format!("{}?{}", target.path(), query),
            None => target.path().to_string(),
        })
    }
}

fn default_headers(user_agent: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(user_agent) {
        headers.insert(USER_AGENT, value);
    }
    headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.5"));
    headers.insert(
        HeaderName::from_static("x-requested-with"),
        HeaderValue::from_static("XMLHttpRequest"),
    );
    headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    headers
}

fn header_value(value: &str) -> FeedResult<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| FeedError::Protocol(format!("Invalid header value {:?}: {}", value, e)))
}

fn authority_of(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

fn expect_ok(response: &HttpResponse, what: &str) -> FeedResult<()> {
    if response.status == StatusCode::OK {
        Ok(())
    } else {
        Err(FeedError::Protocol(format!(
            "{} returned {}",
            what, response.status
        )))
    }
}

fn is_gzip(headers: &HeaderMap) -> bool {
    headers
        .get_all(CONTENT_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains("gzip"))
}

fn gunzip(data: &[u8]) -> FeedResult<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() * 4);
    GzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| FeedError::Protocol(format!("gzip body: {}", e)))?;
    Ok(out)
}

/// 경로의 쿼리에서 `ots` 값을 꺼냅니다.
fn extract_ots(path: &str) -> FeedResult<String> {
    let url = Url::parse("http://localhost")
        .and_then(|base| base.join(path))
        .map_err(|e| FeedError::Auth(format!("Unparseable landing path {}: {}", path, e)))?;

    url.query_pairs()
        .find(|(k, _)| k == "ots")
        .map(|(_, v)| v.into_owned())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| FeedError::Auth(format!("No ots token in {}", path)))
}
