//! 계정 인증 및 접속 대상 확인.
//!
//! 처리 기능:
//! - 원클릭 데모 계정 접속 정보
//! - OAuth 비밀번호 grant로 접근 토큰 발급 (파일 캐시 사용)
//! - 포털 API에서 계정 선택 후 플랫폼 진입 URL 조회

use crate::error::{FeedError, FeedResult};
use crate::http::SessionClient;
use chrono::Utc;
use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::{StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use td365_core::config::{AuthConfig, HttpConfig};
use tracing::{debug, info, warn};

const PROD_SITE_HOST: &str = "traders.td365.com";
const PROD_API_HOST: &str = "prod-api.finsa.com.au";
const PROD_SOCK_HOST: &str = "prod-api.finsa.com.au";

const DEMO_SITE_HOST: &str = "demo.tradedirect365.com.au";
const DEMO_API_HOST: &str = "demo-api.finsa.com.au";
const DEMO_SOCK_HOST: &str = "demo-api.finsa.com.au";

/// 계정 종류.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountType {
    Demo,
    Prod,
}

/// 호스트와 경로로 나눈 플랫폼 진입 URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformUrl {
    pub host: String,
    pub path: String,
}

impl PlatformUrl {
    /// `https://host/path...` 형태의 URL을 나눕니다.
    pub fn parse(url: &str) -> FeedResult<Self> {
        let rest = url
            .strip_prefix("https://")
            .ok_or_else(|| FeedError::Protocol(format!("Platform URL is not https: {}", url)))?;

        let (host, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };
        if host.is_empty() {
            return Err(FeedError::Protocol(format!("Platform URL has no host: {}", url)));
        }

        Ok(Self {
            host: host.to_string(),
            path: path.to_string(),
        })
    }
}

/// 세션과 스트림 연결에 필요한 계정 정보.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountDetail {
    /// 세션 로그인 페이지
    pub platform_url: PlatformUrl,
    /// 스트림 인증에 사용하는 로그인 ID
    pub login_id: String,
    pub account_type: AccountType,
    pub site_host: String,
    pub api_host: String,
    pub sock_host: String,
}

impl AccountDetail {
    fn for_type(account_type: AccountType, platform_url: PlatformUrl, login_id: String) -> Self {
        let (site, api, sock) = match account_type {
            AccountType::Demo => (DEMO_SITE_HOST, DEMO_API_HOST, DEMO_SOCK_HOST),
            AccountType::Prod => (PROD_SITE_HOST, PROD_API_HOST, PROD_SOCK_HOST),
        };
        Self {
            platform_url,
            login_id,
            account_type,
            site_host: site.to_string(),
            api_host: api.to_string(),
            sock_host: sock.to_string(),
        }
    }
}

/// 원클릭 데모 계정 접속 정보. 인증 과정이 필요 없습니다.
pub fn authenticate_demo() -> AccountDetail {
    AccountDetail::for_type(
        AccountType::Demo,
        PlatformUrl {
            host: "demo.tradedirect365.com".to_string(),
            // aid 파라미터가 없으면 로그인이 거부됨
            path: "/finlogin/OneClickDemo.aspx?aid=1026".to_string(),
        },
        String::new(),
    )
}

/// 파일에 캐시되는 OAuth 토큰.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthToken {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub id_token: String,
    /// 만료 시각 (유닉스 초)
    #[serde(default)]
    pub expiry_time: i64,
}

impl AuthToken {
    pub fn is_expired(&self) -> bool {
        self.access_token.is_empty() || Utc::now().timestamp() >= self.expiry_time
    }

    /// 캐시 파일을 읽습니다. 없거나 손상되었으면 `None`.
    pub fn load(path: &Path) -> Option<Self> {
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "No cached token");
                return None;
            }
        };
        match serde_json::from_str(&data) {
            Ok(token) => Some(token),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cached token unreadable, ignoring");
                None
            }
        }
    }

    /// 캐시 파일에 저장합니다.
    pub fn save(&self, path: &Path) -> FeedResult<()> {
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data)?;
        debug!(path = %path.display(), "Token cached");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    id_token: String,
    expires_in: i64,
}

#[derive(Debug, Deserialize)]
struct LaunchResponse {
    url: String,
}

/// OAuth + 포털 API를 거쳐 계정 접속 정보를 얻는 인증기.
pub struct Authenticator {
    config: AuthConfig,
    http: HttpConfig,
    oauth_base: String,
    portal_base: String,
}

impl Authenticator {
    pub fn new(config: AuthConfig, http: HttpConfig) -> Self {
        let oauth_base = format!("https://{}", config.oauth_host);
        let portal_base = format!("https://{}", config.portal_host);
        Self {
            config,
            http,
            oauth_base,
            portal_base,
        }
    }

    /// OAuth/포털 기준 URL을 직접 지정합니다.
    pub fn with_base_urls(
        config: AuthConfig,
        http: HttpConfig,
        oauth_base: impl Into<String>,
        portal_base: impl Into<String>,
    ) -> Self {
        Self {
            config,
            http,
            oauth_base: oauth_base.into(),
            portal_base: portal_base.into(),
        }
    }

    /// 사용자 계정으로 인증하고 지정한 계정의 접속 정보를 반환합니다.
    pub async fn authenticate(
        &self,
        username: &str,
        password: &SecretString,
        account_id: &str,
    ) -> FeedResult<AccountDetail> {
        let token = self.access_token(username, password).await?;

        let mut portal = SessionClient::with_base_url(&self.portal_base, self.http.clone())?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", token.access_token))
            .map_err(|e| FeedError::Auth(format!("Unusable access token: {}", e)))?;
        portal.set_default_header(AUTHORIZATION, bearer);

        let account = select_account(&mut portal, account_id).await?;

        let account_type = match account.get("accountType").and_then(Value::as_str) {
            Some("DEMO") => AccountType::Demo,
            _ => AccountType::Prod,
        };
        let launch = account
            .pointer("/button/linkTo")
            .and_then(Value::as_str)
            .ok_or_else(|| FeedError::Protocol("Account has no button.linkTo".to_string()))?;
        let login_id = account
            .get("ct_login_id")
            .and_then(value_to_string)
            .ok_or_else(|| FeedError::Protocol("Account has no ct_login_id".to_string()))?;

        let launch_path = relative_path(&portal, launch)?;
        let response = portal.get(&launch_path).await?;
        if response.status != StatusCode::OK {
            return Err(FeedError::Protocol(format!(
                "Launch URL returned {}",
                response.status
            )));
        }
        let launch: LaunchResponse = response.json()?;
        let platform_url = PlatformUrl::parse(&launch.url)?;

        info!(
            account = account_id,
            account_type = ?account_type,
            host = %platform_url.host,
            "Account resolved"
        );
        Ok(AccountDetail::for_type(account_type, platform_url, login_id))
    }

    /// 캐시된 토큰이 유효하면 재사용하고, 아니면 새로 발급받아 저장합니다.
    async fn access_token(&self, username: &str, password: &SecretString) -> FeedResult<AuthToken> {
        let cache = self.config.token_cache_path.as_path();
        if let Some(token) = AuthToken::load(cache) {
            if !token.is_expired() {
                debug!("Using cached access token");
                return Ok(token);
            }
            info!("Cached access token expired, requesting a new one");
        }

        let token = self.request_token(username, password).await?;
        if let Err(e) = token.save(cache) {
            warn!(error = %e, "Token cache not written");
        }
        Ok(token)
    }

    async fn request_token(&self, username: &str, password: &SecretString) -> FeedResult<AuthToken> {
        let mut client = SessionClient::with_base_url(&self.oauth_base, self.http.clone())?;
        let body = serde_json::json!({
            "realm": "Username-Password-Authentication",
            "client_id": self.config.client_id,
            "scope": "openid",
            "grant_type": "http://auth0.com/oauth/grant-type/password-realm",
            "username": username,
            "password": password.expose_secret(),
        });

        let response = client
            .post("/oauth/token", "application/json", serde_json::to_vec(&body)?)
            .await?;
        if response.status != StatusCode::OK {
            return Err(FeedError::Auth(format!(
                "Token request returned {}: {}",
                response.status,
                response.text()
            )));
        }

        let token: TokenResponse = response.json()?;
        info!(expires_in = token.expires_in, "Access token obtained");
        Ok(AuthToken {
            access_token: token.access_token,
            id_token: token.id_token,
            expiry_time: expiry_time(token.expires_in),
        })
    }
}

/// 사용자 계정으로 인증합니다. [`Authenticator::authenticate`]의 축약형입니다.
pub async fn authenticate(
    username: &str,
    password: &SecretString,
    account_id: &str,
    config: &AuthConfig,
    http: &HttpConfig,
) -> FeedResult<AccountDetail> {
    Authenticator::new(config.clone(), http.clone())
        .authenticate(username, password, account_id)
        .await
}

async fn select_account(portal: &mut SessionClient, account_id: &str) -> FeedResult<Value> {
    let response = portal.get("/TD365/user/accounts/").await?;
    if response.status != StatusCode::OK {
        return Err(FeedError::Auth(format!(
            "Account list returned {}",
            response.status
        )));
    }

    let body: Value = response.json()?;
    body.get("results")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .find(|account| {
            account
                .get("account")
                .and_then(value_to_string)
                .is_some_and(|id| id == account_id)
        })
        .cloned()
        .ok_or_else(|| FeedError::Auth(format!("Account {} not found", account_id)))
}

/// 포털 기준 경로로 바꿉니다. 절대 URL이면 같은 호스트여야 합니다.
fn relative_path(portal: &SessionClient, link: &str) -> FeedResult<String> {
    if link.starts_with('/') {
        return Ok(link.to_string());
    }

    let url = Url::parse(link)
        .map_err(|e| FeedError::Protocol(format!("Bad launch link {}: {}", link, e)))?;
    let authority = match url.port() {
        Some(port) => format!("{}:{}", url.host_str().unwrap_or_default(), port),
        None => url.host_str().unwrap_or_default().to_string(),
    };
    if !authority.eq_ignore_ascii_case(portal.host()) {
        return Err(FeedError::Protocol(format!(
            "Launch link points outside the portal: {}",
            link
        )));
    }

    Ok(match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    })
}

/// 발급 시점 기준 만료 시각 (유닉스 초). 범위를 넘으면 포화시킵니다.
fn expiry_time(expires_in: i64) -> i64 {
    Utc::now().timestamp().saturating_add(expires_in)
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
