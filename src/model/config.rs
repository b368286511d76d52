use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TlsBackend {
    #[default]
    Rustls,
    NativeTls,
}

/// 日志客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// 网关 API 地址（不含路径前缀）
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// API 路径前缀
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,

    /// 管理端 API Key，以 `Authorization: Bearer` 发送（可选）
    #[serde(default)]
    pub api_key: Option<String>,

    /// 每页历史日志条数
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// 历史日志查询超时（秒），实时流不受此限制
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// 查询起始时间（Unix 秒，可选）
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,

    /// 查询结束时间（Unix 秒，可选）
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,

    /// HTTP 代理地址（可选）
    /// 支持格式: http://host:port, https://host:port, socks5://host:port
    #[serde(default)]
    pub proxy_url: Option<String>,

    /// 代理认证用户名（可选）
    #[serde(default)]
    pub proxy_username: Option<String>,

    /// 代理认证密码（可选）
    #[serde(default)]
    pub proxy_password: Option<String>,

    #[serde(default)]
    pub tls_backend: TlsBackend,
}

fn default_base_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_api_prefix() -> String {
    "/api/v1".to_string()
}

fn default_page_size() -> u32 {
    20
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_prefix: default_api_prefix(),
            api_key: None,
            page_size: default_page_size(),
            timeout_secs: default_timeout_secs(),
            start_time: None,
            end_time: None,
            proxy_url: None,
            proxy_username: None,
            proxy_password: None,
            tls_backend: TlsBackend::default(),
        }
    }
}

impl Config {
    /// 获取默认配置文件路径
    pub fn default_config_path() -> &'static str {
        "config.json"
    }

    /// API 根地址：base_url + api_prefix，去掉多余的斜杠
    pub fn api_root(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        let prefix = self.api_prefix.trim_matches('/');
        if prefix.is_empty() {
            base.to_string()
        } else {
            format!("{}/{}", base, prefix)
        }
    }

    /// 有效的每页条数（至少为 1）
    pub fn effective_page_size(&self) -> u32 {
        self.page_size.max(1)
    }

    /// 从文件加载配置
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            // 配置文件不存在，返回默认配置
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("读取配置文件失败: {}", path.display()))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("解析配置文件失败: {}", path.display()))?;
        Ok(config)
    }
}
