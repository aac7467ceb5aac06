//! tracing 기반 로깅 초기화.
//!
//! 시세 클라이언트는 `td365-io`(연결/인증), `td365-ticks`(콜백 전달), 호출자 스레드가
//! 동시에 로그를 남기므로 스레드 이름은 항상 출력합니다. 웹소켓/HTTP 하위 크레이트는
//! 프레임 단위로 로그를 쏟아내므로 따로 지정하지 않으면 `warn`으로 낮춥니다.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// 레벨 문자열에 언급되지 않았을 때 적용하는 대상별 기본 레벨.
const QUIET_TARGETS: &[(&str, &str)] = &[
    ("tokio_tungstenite", "warn"),
    ("tungstenite", "warn"),
    ("reqwest", "warn"),
    ("hyper", "warn"),
    ("hyper_util", "warn"),
];

/// 로그 출력 형식.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// 터미널용
    #[default]
    Pretty,
    /// 로그 수집기용 한 줄 JSON
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown log format: {}", s)),
        }
    }
}

/// 로깅 설정.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// 필터 지시어 (예: "info", "td365_feed=debug")
    pub level: String,
    pub format: LogFormat,
}

impl LogConfig {
    pub fn new(level: impl Into<String>, format: LogFormat) -> Self {
        Self {
            level: level.into(),
            format,
        }
    }

    /// `EnvFilter`에 넘길 지시어 문자열.
    ///
    /// `level`에 없는 시끄러운 대상마다 기본 레벨을 덧붙입니다.
    pub fn filter_directives(&self) -> String {
        let mut directives = self.level.trim().to_string();
        for (target, level) in QUIET_TARGETS {
            let mentioned = self
                .level
                .split(',')
                .any(|d| d.trim().split('=').next() == Some(*target));
            if !mentioned {
                if !directives.is_empty() {
                    directives.push(',');
                }
                directives.push_str(&format!("{}={}", target, level));
            }
        }
        directives
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::new("info", LogFormat::Pretty)
    }
}

/// 전역 subscriber를 설치합니다.
///
/// `RUST_LOG`가 있으면 설정의 레벨보다 우선합니다. 두 번째 호출은 에러입니다.
///
/// ```no_run
/// use td365_core::logging::{init_logging, LogConfig, LogFormat};
///
/// init_logging(LogConfig::new("td365_feed=debug", LogFormat::Json)).unwrap();
/// ```
pub fn init_logging(config: LogConfig) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.filter_directives()))?;

    let base = fmt::layer().with_thread_names(true).with_target(true);

    match config.format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(base)
            .try_init()?,
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(base.json())
            .try_init()?,
    }

    tracing::debug!(
        format = ?config.format,
        directives = %config.filter_directives(),
        "Logging initialized"
    );

    Ok(())
}
