//! 세션 쿠키 저장소.
//!
//! 응답의 `Set-Cookie` 헤더로만 갱신되며, 도메인별로 이름당 하나의 쿠키를 유지합니다.
//! 같은 도메인에 같은 이름이 다시 오면 마지막 값이 이깁니다.
//! 만료된 항목을 스스로 지우지는 않습니다.

use chrono::{DateTime, Duration, Utc};
use reqwest::header::{HeaderMap, HeaderValue, COOKIE, SET_COOKIE};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// 저장된 쿠키 하나.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    /// 선행 `.` 없이 소문자로 정규화된 도메인
    pub domain: String,
    pub path: String,
    pub expires: Option<DateTime<Utc>>,
}

impl Cookie {
    /// `Set-Cookie` 헤더 값 하나를 파싱합니다.
    ///
    /// `Domain` 속성이 없으면 응답을 보낸 호스트가 도메인이 됩니다.
    /// `Max-Age`가 있으면 `Expires`보다 우선합니다.
    pub fn parse(header: &str, request_host: &str) -> Option<Self> {
        let mut parts = header.split(';');
        let (name, value) = parts.next()?.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }

        let mut cookie = Cookie {
            name: name.to_string(),
            value: value.trim().trim_matches('"').to_string(),
            domain: normalize_domain(request_host),
            path: "/".to_string(),
            expires: None,
        };
        let mut max_age = None;

        for attr in parts {
            let (key, val) = match attr.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => (attr.trim(), ""),
            };

            match key.to_ascii_lowercase().as_str() {
                "domain" if !val.is_empty() => cookie.domain = normalize_domain(val),
                "path" if !val.is_empty() => cookie.path = val.to_string(),
                "expires" => cookie.expires = parse_expires(val),
                "max-age" => max_age = val.parse::<i64>().ok(),
                _ => {}
            }
        }

        if let Some(secs) = max_age {
            cookie.expires = expiry_after(secs);
        }

        Some(cookie)
    }

    /// 쿠키가 주어진 호스트로 보내져야 하는지 확인합니다.
    pub fn matches_host(&self, host: &str) -> bool {
        domain_matches(&normalize_domain(host), &self.domain)
    }
}

/// 지금부터 `secs`초 뒤의 시각. 표현할 수 없는 값이면 만료 없음(`None`).
fn expiry_after(secs: i64) -> Option<DateTime<Utc>> {
    Duration::try_seconds(secs).and_then(|delta| Utc::now().checked_add_signed(delta))
}

/// 도메인별 쿠키 저장소.
#[derive(Debug, Default, Clone)]
pub struct CookieStore {
    by_domain: BTreeMap<String, BTreeMap<String, Cookie>>,
}

impl CookieStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 대상 호스트와 도메인이 일치하는 모든 쿠키를 하나의 `Cookie` 헤더로 붙입니다.
    ///
    /// 일치하는 쿠키가 없으면 헤더를 건드리지 않습니다.
    pub fn apply(&self, host: &str, headers: &mut HeaderMap) {
        let host = normalize_domain(host);
        let pairs: Vec<String> = self
            .by_domain
            .iter()
            .filter(|(domain, _)| domain_matches(&host, domain))
            .flat_map(|(_, cookies)| cookies.values())
            .map(|c| format!("{}={}", c.name, c.value))
            .collect();

        if pairs.is_empty() {
            return;
        }

        match HeaderValue::from_str(&pairs.join("; ")) {
            Ok(value) => {
                headers.insert(COOKIE, value);
            }
            Err(e) => warn!(host = %host, error = %e, "Cookie header not representable"),
        }
    }

    /// 응답의 모든 `Set-Cookie` 헤더로 저장소를 갱신합니다.
    ///
    /// 응답 호스트와 무관한 도메인을 지정한 쿠키는 버립니다.
    pub fn update(&mut self, host: &str, headers: &HeaderMap) {
        for raw in headers.get_all(SET_COOKIE) {
            let Ok(raw) = raw.to_str() else {
                warn!(host, "Set-Cookie is not valid ASCII, skipped");
                continue;
            };
            let Some(cookie) = Cookie::parse(raw, host) else {
                warn!(host, header = raw, "Malformed Set-Cookie, skipped");
                continue;
            };
            if !cookie.matches_host(host) {
                warn!(
                    host,
                    domain = %cookie.domain,
                    name = %cookie.name,
                    "Set-Cookie for foreign domain rejected"
                );
                continue;
            }

            debug!(domain = %cookie.domain, name = %cookie.name, "Cookie stored");
            self.insert(cookie);
        }
    }

    /// 쿠키를 직접 저장합니다. 같은 도메인/이름의 기존 항목은 교체됩니다.
    pub fn insert(&mut self, cookie: Cookie) {
        self.by_domain
            .entry(cookie.domain.clone())
            .or_default()
            .insert(cookie.name.clone(), cookie);
    }

    /// 이름으로 쿠키를 찾습니다.
    pub fn get(&self, name: &str) -> Option<&Cookie> {
        self.by_domain.values().find_map(|cookies| cookies.get(name))
    }

    /// 특정 호스트에 적용되는 쿠키를 이름으로 찾습니다.
    pub fn get_for_host(&self, host: &str, name: &str) -> Option<&Cookie> {
        let host = normalize_domain(host);
        self.by_domain
            .iter()
            .filter(|(domain, _)| domain_matches(&host, domain))
            .find_map(|(_, cookies)| cookies.get(name))
    }

    pub fn len(&self) -> usize {
        self.by_domain.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn normalize_domain(domain: &str) -> String {
    let domain = domain.trim().trim_start_matches('.');
    // 포트 제거
    let domain = domain.split(':').next().unwrap_or(domain);
    domain.to_ascii_lowercase()
}

fn domain_matches(host: &str, domain: &str) -> bool {
    host == domain
        || (host.len() > domain.len()
            && host.ends_with(domain)
            && host.as_bytes()[host.len() - domain.len() - 1] == b'.')
}

fn parse_expires(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .or_else(|_| DateTime::parse_from_rfc2822(&value.replace('-', " ")))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn set_cookies(values: &[&str]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for v in values {
            headers.append(SET_COOKIE, HeaderValue::from_str(v).unwrap());
        }
        headers
    }

    fn cookie_header(store: &CookieStore, host: &str) -> Option<String> {
        let mut headers = HeaderMap::new();
        store.apply(host, &mut headers);
        headers
            .get(COOKIE)
            .map(|v| v.to_str().unwrap().to_string())
    }

    #[test]
    fn test_parse_attributes() {
        let cookie = Cookie::parse(
            "ASP.NET_SessionId=abc123; Domain=.td365.com; Path=/app; Expires=Wed, 21 Oct 2015 07:28:00 GMT; HttpOnly",
            "traders.td365.com",
        )
        .unwrap();

        assert_eq!(cookie.name, "ASP.NET_SessionId");
        assert_eq!(cookie.value, "abc123");
        assert_eq!(cookie.domain, "td365.com");
        assert_eq!(cookie.path, "/app");
        assert_eq!(
            cookie.expires,
            Some(Utc.with_ymd_and_hms(2015, 10, 21, 7, 28, 0).unwrap())
        );
    }

    #[test]
    fn test_parse_dashed_expires() {
        let cookie = Cookie::parse(
            "a=1; expires=Wed, 21-Oct-2015 07:28:00 GMT",
            "traders.td365.com",
        )
        .unwrap();
        assert_eq!(
            cookie.expires,
            Some(Utc.with_ymd_and_hms(2015, 10, 21, 7, 28, 0).unwrap())
        );
    }

    #[test]
    fn test_max_age_wins_over_expires() {
        let cookie = Cookie::parse(
            "a=1; Expires=Wed, 21 Oct 2015 07:28:00 GMT; Max-Age=3600",
            "traders.td365.com",
        )
        .unwrap();
        assert!(cookie.expires.unwrap() > Utc::now());
    }

    #[test]
    fn test_oversized_max_age_means_no_expiry() {
        let mut store = CookieStore::new();
        store.update(
            "127.0.0.1",
            &set_cookies(&["OTS=tok; Max-Age=9999999999999; path=/"]),
        );
        let cookie = store.get_for_host("127.0.0.1", "OTS").unwrap();
        assert_eq!(cookie.value, "tok");
        assert_eq!(cookie.expires, None);

        let cookie = Cookie::parse(&format!("a=b; Max-Age={}", i64::MAX), "h.com").unwrap();
        assert_eq!(cookie.expires, None);
        let cookie = Cookie::parse(&format!("a=b; Max-Age={}", i64::MIN), "h.com").unwrap();
        assert_eq!(cookie.expires, None);
    }

    #[test]
    fn test_parse_rejects_nameless() {
        assert!(Cookie::parse("=value", "a.com").is_none());
        assert!(Cookie::parse("novalue", "a.com").is_none());
    }

    #[test]
    fn test_last_write_wins() {
        let mut store = CookieStore::new();
        store.update("traders.td365.com", &set_cookies(&["ots=first"]));
        store.update("traders.td365.com", &set_cookies(&["ots=second"]));

        assert_eq!(store.len(), 1);
        assert_eq!(store.get("ots").unwrap().value, "second");
        assert_eq!(
            cookie_header(&store, "traders.td365.com").as_deref(),
            Some("ots=second")
        );
    }

    #[test]
    fn test_apply_joins_with_semicolon() {
        let mut store = CookieStore::new();
        store.update(
            "traders.td365.com",
            &set_cookies(&["a=1; Path=/", "b=2; HttpOnly"]),
        );

        assert_eq!(
            cookie_header(&store, "traders.td365.com").as_deref(),
            Some("a=1; b=2")
        );
    }

    #[test]
    fn test_no_cross_domain_leakage() {
        let mut store = CookieStore::new();
        store.update("traders.td365.com", &set_cookies(&["session=x"]));
        store.update("demo.tradedirect365.com", &set_cookies(&["session=y"]));

        assert_eq!(
            cookie_header(&store, "traders.td365.com").as_deref(),
            Some("session=x")
        );
        assert_eq!(
            cookie_header(&store, "demo.tradedirect365.com").as_deref(),
            Some("session=y")
        );
        assert_eq!(cookie_header(&store, "prod-api.finsa.com.au"), None);
        // 접미사만 같은 다른 도메인
        assert_eq!(cookie_header(&store, "eviltraders.td365.com"), None);
    }

    #[test]
    fn test_parent_domain_cookie_applies_to_subdomain() {
        let mut store = CookieStore::new();
        store.update(
            "traders.td365.com",
            &set_cookies(&["shared=1; Domain=.td365.com"]),
        );

        assert_eq!(
            cookie_header(&store, "portal.td365.com").as_deref(),
            Some("shared=1")
        );
        assert_eq!(cookie_header(&store, "nottd365.com"), None);
    }

    #[test]
    fn test_foreign_domain_rejected() {
        let mut store = CookieStore::new();
        store.update(
            "traders.td365.com",
            &set_cookies(&["evil=1; Domain=example.com"]),
        );
        assert!(store.is_empty());
    }

    #[test]
    fn test_get_for_host() {
        let mut store = CookieStore::new();
        store.update("a.example.com", &set_cookies(&["ots=a"]));
        store.update("b.example.com", &set_cookies(&["ots=b"]));

        assert_eq!(store.get_for_host("b.example.com", "ots").unwrap().value, "b");
        assert!(store.get_for_host("c.example.com", "ots").is_none());
        assert!(store.get("missing").is_none());
    }
}
