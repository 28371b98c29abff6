use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::push::provider::fcm::DEFAULT_GCM_ENDPOINT;

/// 旧版沙盒网关（对应 HTTP/2 的 api.sandbox.push.apple.com）
pub const DEFAULT_APN_GATEWAY: &str = "gateway.sandbox.push.apple.com";

const REDACTED: &str = "******";

/// generate-config 写出的默认配置文件
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# unipush 配置文件
# 此文件由 unipush generate-config 生成

[server]
host = "127.0.0.1"
port = 8090
# 请求头 X-Service-Key 与之相同的调用方视为内部调用方
# service_key = "change-me"
# 把回环地址的对端也视为内部调用方（前面有同机反向代理时不要开启）
trust_loopback = false

[logging]
level = "info"
format = "compact"
# file = "./logs/unipush.log"

[push]
internal_only = false
gcm_api_server_key = ""
apn_gateway = "gateway.sandbox.push.apple.com"
# apn_topic = "com.example.app"
# default_title = "Notification"
# default_message = "Hi, something came up!"
# default_ttl = 3000
cert_pem_location = "config/cert.pem"
key_pem_location = "config/key.pem"
key_pem_passphrase = ""
send_timeout_secs = 30
gcm_retry_base_delay_ms = 1000
feedback_interval_secs = 300
batch_feedback = true
"#;

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 服务器监听地址
    pub host: String,
    /// 服务器监听端口
    pub port: u16,
    /// 日志级别
    pub log_level: String,
    /// 内部服务密钥
    ///
    /// 请求头 `X-Service-Key` 与之相同的调用方视为内部调用方。
    pub service_key: Option<String>,
    /// 回环地址的对端视为内部调用方，默认关闭
    pub trust_loopback: bool,
    /// 推送配置
    pub push: PushConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8090,
            log_level: "info".to_string(),
            service_key: None,
            trust_loopback: false,
            push: PushConfig::default(),
        }
    }
}

/// 推送配置（启动时读取一次，之后只读共享）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfig {
    /// 只允许内部调用方分发
    pub internal_only: bool,
    /// GCM/FCM 服务端 API Key，为空时不启用 Android 通道
    pub gcm_api_server_key: String,
    pub gcm_endpoint: String,
    /// iOS 网关地址，旧版主机名会映射到 HTTP/2 主机
    pub apn_gateway: String,
    /// apns-topic（通常为 App 的 bundle id）
    pub apn_topic: Option<String>,
    pub default_title: Option<String>,
    pub default_message: Option<String>,
    /// 默认 TTL（秒），未配置时使用 3000
    pub default_ttl: Option<u32>,
    pub cert_pem_location: String,
    pub key_pem_location: String,
    pub key_pem_passphrase: String,
    /// 单次发送超时（秒）
    pub send_timeout_secs: u64,
    /// Android 重试退避基数（毫秒），每次翻倍
    pub gcm_retry_base_delay_ms: u64,
    /// Feedback 轮询间隔（秒）
    pub feedback_interval_secs: u64,
    /// 同一轮 feedback 按 Token 合并
    pub batch_feedback: bool,
    /// iOS 连接 actor 的队列容量
    pub ios_queue_capacity: usize,
    /// iOS 连接 actor 同时在途的请求数
    pub ios_concurrency: usize,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            internal_only: false,
            gcm_api_server_key: String::new(),
            gcm_endpoint: DEFAULT_GCM_ENDPOINT.to_string(),
            apn_gateway: DEFAULT_APN_GATEWAY.to_string(),
            apn_topic: None,
            default_title: None,
            default_message: None,
            default_ttl: None,
            cert_pem_location: "config/cert.pem".to_string(),
            key_pem_location: "config/key.pem".to_string(),
            key_pem_passphrase: String::new(),
            send_timeout_secs: 30,
            gcm_retry_base_delay_ms: 1000,
            feedback_interval_secs: 300,
            batch_feedback: true,
            ios_queue_capacity: 1024,
            ios_concurrency: 64,
        }
    }
}

impl PushConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn feedback_interval(&self) -> Duration {
        Duration::from_secs(self.feedback_interval_secs)
    }

    pub fn android_enabled(&self) -> bool {
        !self.gcm_api_server_key.trim().is_empty()
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从 TOML 文件加载配置
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("无法读取配置文件: {:?}", path.as_ref()))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let toml_config: TomlConfig =
            toml::from_str(content).with_context(|| "配置文件格式错误")?;
        Ok(toml_config.into())
    }

    /// 从环境变量加载配置（UNIPUSH_ 前缀）
    pub fn merge_from_env(&mut self) -> Result<()> {
        self.merge_from_lookup(|key| env::var(key).ok())
    }

    fn merge_from_lookup<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        // 服务器配置
        if let Some(host) = lookup("UNIPUSH_HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("UNIPUSH_PORT") {
            self.port = port
                .parse()
                .with_context(|| format!("UNIPUSH_PORT 不是合法端口: {}", port))?;
        }
        if let Some(log_level) = lookup("UNIPUSH_LOG_LEVEL") {
            self.log_level = log_level;
        }
        if let Some(key) = lookup("UNIPUSH_SERVICE_KEY") {
            self.service_key = Some(key);
        }
        if let Some(flag) = lookup("UNIPUSH_TRUST_LOOPBACK") {
            self.trust_loopback = parse_bool(&flag)
                .with_context(|| format!("UNIPUSH_TRUST_LOOPBACK 不是布尔值: {}", flag))?;
        }

        // 推送配置
        let push = &mut self.push;
        if let Some(flag) = lookup("UNIPUSH_INTERNAL_ONLY") {
            push.internal_only = parse_bool(&flag)
                .with_context(|| format!("UNIPUSH_INTERNAL_ONLY 不是布尔值: {}", flag))?;
        }
        if let Some(key) = lookup("UNIPUSH_GCM_API_SERVER_KEY").or_else(|| lookup("GCM_API_SERVER_KEY")) {
            push.gcm_api_server_key = key;
        }
        if let Some(endpoint) = lookup("UNIPUSH_GCM_ENDPOINT") {
            push.gcm_endpoint = endpoint;
        }
        if let Some(gateway) = lookup("UNIPUSH_APN_GATEWAY") {
            push.apn_gateway = gateway;
        }
        if let Some(topic) = lookup("UNIPUSH_APN_TOPIC") {
            push.apn_topic = Some(topic);
        }
        if let Some(path) = lookup("UNIPUSH_CERT_PEM_LOCATION") {
            push.cert_pem_location = path;
        }
        if let Some(path) = lookup("UNIPUSH_KEY_PEM_LOCATION") {
            push.key_pem_location = path;
        }
        if let Some(passphrase) = lookup("UNIPUSH_KEY_PEM_PASSPHRASE") {
            push.key_pem_passphrase = passphrase;
        }
        if let Some(secs) = lookup("UNIPUSH_FEEDBACK_INTERVAL_SECS") {
            push.feedback_interval_secs = secs
                .parse()
                .with_context(|| format!("UNIPUSH_FEEDBACK_INTERVAL_SECS 不是整数: {}", secs))?;
        }
        if let Some(secs) = lookup("UNIPUSH_SEND_TIMEOUT_SECS") {
            push.send_timeout_secs = secs
                .parse()
                .with_context(|| format!("UNIPUSH_SEND_TIMEOUT_SECS 不是整数: {}", secs))?;
        }

        Ok(())
    }

    /// 从命令行参数合并配置
    pub fn merge_from_cli(&mut self, cli: &crate::cli::Cli) {
        if let Some(host) = &cli.host {
            self.host = host.clone();
        }
        if let Some(port) = cli.port {
            self.port = port;
        }
        if let Some(key) = &cli.service_key {
            self.service_key = Some(key.clone());
        }
        if let Some(key) = &cli.gcm_api_key {
            self.push.gcm_api_server_key = key.clone();
        }
        if let Some(gateway) = &cli.apn_gateway {
            self.push.apn_gateway = gateway.clone();
        }
        if cli.internal_only {
            self.push.internal_only = true;
        }
        if cli.trust_loopback {
            self.trust_loopback = true;
        }
        if let Some(log_level) = cli.get_log_level() {
            self.log_level = log_level;
        }
    }

    /// 加载配置（按优先级：命令行 > 环境变量 > 配置文件 > 默认值）
    pub fn load(cli: &crate::cli::Cli) -> Result<Self> {
        // 1. 从配置文件加载（如果指定），否则使用默认值
        let mut config = if let Some(config_file) = &cli.config_file {
            if Path::new(config_file).exists() {
                info!("📄 从配置文件加载: {}", config_file);
                Self::from_toml_file(config_file)?
            } else {
                warn!("⚠️ 配置文件不存在: {}", config_file);
                Self::new()
            }
        } else if Path::new("config.toml").exists() {
            info!("📄 从默认配置文件加载: config.toml");
            Self::from_toml_file("config.toml")?
        } else {
            Self::new()
        };

        // 2. 从环境变量合并（优先级高于配置文件）
        config.merge_from_env()?;

        // 3. 从命令行参数合并（最高优先级）
        config.merge_from_cli(cli);

        config.validate()?;
        Ok(config)
    }

    /// 检查取值范围
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            bail!("port 不能为 0");
        }
        let push = &self.push;
        if push.send_timeout_secs == 0 {
            bail!("push.send_timeout_secs 必须大于 0");
        }
        if push.feedback_interval_secs == 0 {
            bail!("push.feedback_interval_secs 必须大于 0");
        }
        if push.ios_queue_capacity == 0 || push.ios_concurrency == 0 {
            bail!("push.ios_queue_capacity 和 push.ios_concurrency 必须大于 0");
        }
        if push.apn_gateway.trim().is_empty() {
            bail!("push.apn_gateway 不能为空");
        }
        Ok(())
    }

    /// 隐去密钥后的副本，用于展示
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.service_key.is_some() {
            copy.service_key = Some(REDACTED.to_string());
        }
        if !copy.push.gcm_api_server_key.is_empty() {
            copy.push.gcm_api_server_key = REDACTED.to_string();
        }
        if !copy.push.key_pem_passphrase.is_empty() {
            copy.push.key_pem_passphrase = REDACTED.to_string();
        }
        copy
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// 启动早期只读取 [logging] 段，完整配置在日志初始化之后加载
#[derive(Debug, Default, Clone, Deserialize)]
pub struct EarlyLoggingConfig {
    pub level: Option<String>,
    pub format: Option<String>,
    pub file: Option<String>,
}

/// 快速读取 config.toml 的 [logging] 段，文件缺失或格式错误时返回空配置
pub fn load_early_logging_config(config_file: Option<&str>) -> EarlyLoggingConfig {
    #[derive(Deserialize)]
    struct LoggingOnly {
        logging: Option<EarlyLoggingConfig>,
    }

    let path = config_file.unwrap_or("config.toml");
    fs::read_to_string(path)
        .ok()
        .and_then(|content| toml::from_str::<LoggingOnly>(&content).ok())
        .and_then(|parsed| parsed.logging)
        .unwrap_or_default()
}

/// TOML 配置文件结构（用于反序列化）
#[derive(Debug, Deserialize)]
struct TomlConfig {
    server: Option<TomlServerConfig>,
    logging: Option<TomlLoggingConfig>,
    push: Option<TomlPushConfig>,
}

#[derive(Debug, Deserialize)]
struct TomlServerConfig {
    host: Option<String>,
    port: Option<u16>,
    #[serde(alias = "serviceKey")]
    service_key: Option<String>,
    #[serde(alias = "trustLoopback")]
    trust_loopback: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct TomlLoggingConfig {
    level: Option<String>,
}

/// [push] 段，同时接受 snake_case 和旧插件配置里的 camelCase 键名
#[derive(Debug, Deserialize)]
struct TomlPushConfig {
    #[serde(alias = "internalOnly")]
    internal_only: Option<bool>,
    #[serde(alias = "gcmApiServerKey")]
    gcm_api_server_key: Option<String>,
    #[serde(alias = "gcmEndpoint")]
    gcm_endpoint: Option<String>,
    #[serde(alias = "apnGateway")]
    apn_gateway: Option<String>,
    #[serde(alias = "apnTopic")]
    apn_topic: Option<String>,
    #[serde(alias = "defaultTitle")]
    default_title: Option<String>,
    #[serde(alias = "defaultMessage")]
    default_message: Option<String>,
    #[serde(alias = "defaultTTL", alias = "defaultTtl")]
    default_ttl: Option<u32>,
    #[serde(alias = "certPemLocation")]
    cert_pem_location: Option<String>,
    #[serde(alias = "keyPemLocation")]
    key_pem_location: Option<String>,
    #[serde(alias = "keyPemPassphrase")]
    key_pem_passphrase: Option<String>,
    send_timeout_secs: Option<u64>,
    gcm_retry_base_delay_ms: Option<u64>,
    feedback_interval_secs: Option<u64>,
    #[serde(alias = "batchFeedback")]
    batch_feedback: Option<bool>,
    ios_queue_capacity: Option<usize>,
    ios_concurrency: Option<usize>,
}

impl From<TomlConfig> for ServerConfig {
    fn from(toml: TomlConfig) -> Self {
        let mut config = Self::default();

        if let Some(server) = toml.server {
            if let Some(host) = server.host {
                config.host = host;
            }
            if let Some(port) = server.port {
                config.port = port;
            }
            config.service_key = server.service_key.filter(|k| !k.is_empty());
            if let Some(v) = server.trust_loopback {
                config.trust_loopback = v;
            }
        }

        if let Some(level) = toml.logging.and_then(|l| l.level) {
            config.log_level = level;
        }

        if let Some(push) = toml.push {
            let target = &mut config.push;
            if let Some(v) = push.internal_only {
                target.internal_only = v;
            }
            if let Some(v) = push.gcm_api_server_key {
                target.gcm_api_server_key = v;
            }
            if let Some(v) = push.gcm_endpoint {
                target.gcm_endpoint = v;
            }
            if let Some(v) = push.apn_gateway {
                target.apn_gateway = v;
            }
            target.apn_topic = push.apn_topic;
            target.default_title = push.default_title;
            target.default_message = push.default_message;
            target.default_ttl = push.default_ttl;
            if let Some(v) = push.cert_pem_location {
                target.cert_pem_location = v;
            }
            if let Some(v) = push.key_pem_location {
                target.key_pem_location = v;
            }
            if let Some(v) = push.key_pem_passphrase {
                target.key_pem_passphrase = v;
            }
            if let Some(v) = push.send_timeout_secs {
                target.send_timeout_secs = v;
            }
            if let Some(v) = push.gcm_retry_base_delay_ms {
                target.gcm_retry_base_delay_ms = v;
            }
            if let Some(v) = push.feedback_interval_secs {
                target.feedback_interval_secs = v;
            }
            if let Some(v) = push.batch_feedback {
                target.batch_feedback = v;
            }
            if let Some(v) = push.ios_queue_capacity {
                target.ios_queue_capacity = v;
            }
            if let Some(v) = push.ios_concurrency {
                target.ios_concurrency = v;
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8090);
        assert!(!config.push.internal_only);
        assert!(!config.trust_loopback);
        assert_eq!(config.push.apn_gateway, DEFAULT_APN_GATEWAY);
        assert_eq!(config.push.cert_pem_location, "config/cert.pem");
        assert_eq!(config.push.key_pem_location, "config/key.pem");
        assert_eq!(config.push.feedback_interval(), Duration::from_secs(300));
        assert!(config.push.batch_feedback);
        assert!(!config.push.android_enabled());
        config.validate().unwrap();
    }

    #[test]
    fn test_toml_camel_case_keys() {
        let config = ServerConfig::from_toml_str(
            r#"
            [server]
            port = 9000
            serviceKey = "s3cret"
            trustLoopback = true

            [push]
            internalOnly = true
            gcmApiServerKey = "AIza-test"
            apnGateway = "gateway.push.apple.com"
            defaultTitle = "Acme"
            defaultTTL = 600
            keyPemPassphrase = "hunter2"
            "#,
        )
        .unwrap();

        assert_eq!(config.port, 9000);
        assert_eq!(config.service_key.as_deref(), Some("s3cret"));
        assert!(config.trust_loopback);
        assert!(config.push.internal_only);
        assert_eq!(config.push.gcm_api_server_key, "AIza-test");
        assert_eq!(config.push.apn_gateway, "gateway.push.apple.com");
        assert_eq!(config.push.default_title.as_deref(), Some("Acme"));
        assert_eq!(config.push.default_ttl, Some(600));
        assert_eq!(config.push.key_pem_passphrase, "hunter2");
        // 未出现的键保持默认值
        assert_eq!(config.push.send_timeout_secs, 30);
    }

    #[test]
    fn test_toml_file_and_early_logging() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[logging]\nlevel = \"debug\"\nformat = \"json\"\n\n[push]\nfeedback_interval_secs = 60"
        )
        .unwrap();
        let path = file.path().to_str().unwrap();

        let config = ServerConfig::from_toml_file(path).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.push.feedback_interval_secs, 60);

        let early = load_early_logging_config(Some(path));
        assert_eq!(early.level.as_deref(), Some("debug"));
        assert_eq!(early.format.as_deref(), Some("json"));
        assert!(early.file.is_none());
    }

    #[test]
    fn test_generated_template_parses() {
        let config = ServerConfig::from_toml_str(DEFAULT_CONFIG_TEMPLATE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.port, 8090);
        assert_eq!(config.push.apn_gateway, DEFAULT_APN_GATEWAY);
        assert!(!config.push.android_enabled());
        assert!(!config.trust_loopback);
    }

    #[test]
    fn test_invalid_toml_is_error() {
        assert!(ServerConfig::from_toml_str("[push\ninternalOnly = ").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("UNIPUSH_PORT", "9100"),
            ("GCM_API_SERVER_KEY", "from-env"),
            ("UNIPUSH_INTERNAL_ONLY", "yes"),
            ("UNIPUSH_APN_TOPIC", "com.example.app"),
            ("UNIPUSH_TRUST_LOOPBACK", "on"),
        ]
        .into_iter()
        .collect();

        let mut config = ServerConfig::default();
        config
            .merge_from_lookup(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.port, 9100);
        assert_eq!(config.push.gcm_api_server_key, "from-env");
        assert!(config.push.internal_only);
        assert_eq!(config.push.apn_topic.as_deref(), Some("com.example.app"));
        assert!(config.trust_loopback);
    }

    #[test]
    fn test_env_bad_values_rejected() {
        let mut config = ServerConfig::default();
        let result = config.merge_from_lookup(|k| (k == "UNIPUSH_PORT").then(|| "abc".to_string()));
        assert!(result.is_err());

        let result =
            config.merge_from_lookup(|k| (k == "UNIPUSH_INTERNAL_ONLY").then(|| "maybe".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut config = ServerConfig::default();
        config.push.feedback_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_redacted_hides_secrets() {
        let mut config = ServerConfig::default();
        config.service_key = Some("s3cret".into());
        config.push.gcm_api_server_key = "AIza-test".into();
        config.push.key_pem_passphrase = "hunter2".into();

        let shown = serde_json::to_string(&config.redacted()).unwrap();
        assert!(!shown.contains("s3cret"));
        assert!(!shown.contains("AIza-test"));
        assert!(!shown.contains("hunter2"));
        assert_eq!(config.push.gcm_api_server_key, "AIza-test");
    }
}
