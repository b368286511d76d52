//! HTTP Client 构建模块
//!
//! Input: 代理配置、超时、TLS 后端
//! Output: reqwest::Client
//! Pos: 历史日志查询与实时流共用的客户端构建

use reqwest::{Client, Proxy};
use std::time::Duration;

use crate::model::config::{Config, TlsBackend};

/// 实时流只限制建连时间，不限制总时长
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// 代理配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxyConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: None,
            password: None,
        }
    }

    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// 从配置中提取代理设置，未配置 proxyUrl 时返回 None
    pub fn from_config(config: &Config) -> Option<Self> {
        let url = config.proxy_url.as_deref().filter(|u| !u.trim().is_empty())?;
        let mut proxy = Self::new(url);
        if let (Some(user), Some(pass)) = (&config.proxy_username, &config.proxy_password) {
            proxy = proxy.with_auth(user, pass);
        }
        Some(proxy)
    }
}

/// 构建 HTTP Client
///
/// # Arguments
/// * `proxy` - 可选的代理配置，支持 http/https/socks5
/// * `timeout_secs` - 整体超时（秒），`None` 表示不限制（用于长连接流）
/// * `tls_backend` - TLS 实现
pub fn build_client(
    proxy: Option<&ProxyConfig>,
    timeout_secs: Option<u64>,
    tls_backend: TlsBackend,
) -> anyhow::Result<Client> {
    let mut builder = Client::builder().connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS));

    if let Some(secs) = timeout_secs {
        builder = builder.timeout(Duration::from_secs(secs));
    }

    builder = match tls_backend {
        TlsBackend::Rustls => builder.use_rustls_tls(),
        #[cfg(feature = "native-tls")]
        TlsBackend::NativeTls => builder.use_native_tls(),
        #[cfg(not(feature = "native-tls"))]
        TlsBackend::NativeTls => {
            tracing::warn!("未启用 native-tls 特性，回退到 rustls");
            builder.use_rustls_tls()
        }
    };

    if let Some(proxy) = proxy {
        let mut p = Proxy::all(&proxy.url)?;
        if let (Some(user), Some(pass)) = (&proxy.username, &proxy.password) {
            p = p.basic_auth(user, pass);
        }
        builder = builder.proxy(p);
        tracing::debug!("HTTP Client 使用代理: {}", proxy.url);
    }

    Ok(builder.build()?)
}
