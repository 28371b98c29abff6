use std::collections::{BTreeMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{ErrorCode, Result, ServerError};

/// 单次请求最多允许的 GCM registration id 数量（网关限制）
pub const MAX_REGISTRATION_IDS: usize = 1000;

/// 入站推送请求（JSON 字段名与原有客户端保持一致）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRequest {
    pub gcm_registration_ids: Option<Vec<String>>,
    pub apn_tokens: Option<Vec<String>>,
    pub title: Option<String>,
    pub message: Option<String>,
    pub time_to_live: Option<i64>,
    pub msgcnt: Option<i64>,
    pub soundname: Option<String>,
    pub collapse_key: Option<String>,
    pub delay_while_idle: Option<bool>,
    pub payload: Option<Map<String, Value>>,
}

/// 调用方上下文
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallerContext {
    /// 是否为部署系统内部的调用
    pub internal: bool,
}

impl CallerContext {
    pub fn internal() -> Self {
        Self { internal: true }
    }

    pub fn external() -> Self {
        Self { internal: false }
    }
}

/// APNs 设备 Token
///
/// 按不透明字符串处理，只要求非空并且可以放进 URL 路径。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceToken(String);

impl DeviceToken {
    /// 解析设备 Token
    ///
    /// 允许 `<abcd ef01>` 这类 Xcode 日志里常见的写法，空白和尖括号会被去掉。
    pub fn parse(raw: &str) -> Result<Self> {
        let normalized: String = raw
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '<' && *c != '>')
            .collect();

        if normalized.is_empty() {
            return Err(ServerError::InvalidRequest("empty APNs token".to_string()));
        }
        if normalized
            .chars()
            .any(|c| !c.is_ascii_graphic() || matches!(c, '/' | '?' | '#' | '%'))
        {
            return Err(ServerError::InvalidRequest(format!(
                "APNs token contains characters not allowed in a URL path: {}",
                raw
            )));
        }

        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 校验后的推送目标
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchTargets {
    None,
    Android(Vec<String>),
    Ios(Vec<DeviceToken>),
    Both {
        android: Vec<String>,
        ios: Vec<DeviceToken>,
    },
}

impl DispatchTargets {
    /// `ios_requested` 为 true 时即使没有可用 Token 也保留 iOS 路径，用来回报被拒绝的 Token
    fn from_lists(android: Vec<String>, ios: Vec<DeviceToken>, ios_requested: bool) -> Self {
        match (android.is_empty(), ios.is_empty() && !ios_requested) {
            (true, true) => DispatchTargets::None,
            (false, true) => DispatchTargets::Android(android),
            (true, false) => DispatchTargets::Ios(ios),
            (false, false) => DispatchTargets::Both { android, ios },
        }
    }

    pub fn android(&self) -> Option<&[String]> {
        match self {
            DispatchTargets::Android(ids) | DispatchTargets::Both { android: ids, .. } => Some(ids.as_slice()),
            _ => None,
        }
    }

    pub fn ios(&self) -> Option<&[DeviceToken]> {
        match self {
            DispatchTargets::Ios(tokens) | DispatchTargets::Both { ios: tokens, .. } => Some(tokens.as_slice()),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, DispatchTargets::None)
    }
}

/// 请求里无法使用的 iOS Token，不影响同一请求的其他目标
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedToken {
    pub raw: String,
    pub error: ServerError,
}

/// 校验后的推送请求
///
/// 空字符串、0 和 `false` 都视为“未提供”，交给 planner 按默认值补齐。
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRequest {
    pub targets: DispatchTargets,
    pub rejected_tokens: Vec<RejectedToken>,
    pub title: Option<String>,
    pub message: Option<String>,
    pub time_to_live: Option<u32>,
    pub msgcnt: Option<u32>,
    pub sound: Option<String>,
    pub collapse_key: Option<String>,
    pub delay_while_idle: bool,
    pub payload: Map<String, Value>,
}

impl TryFrom<NotificationRequest> for DispatchRequest {
    type Error = ServerError;

    fn try_from(req: NotificationRequest) -> Result<Self> {
        let android = validate_registration_ids(req.gcm_registration_ids.unwrap_or_default())?;

        let raw_tokens = req.apn_tokens.unwrap_or_default();
        let ios_requested = !raw_tokens.is_empty();
        let mut ios = Vec::with_capacity(raw_tokens.len());
        let mut rejected_tokens = Vec::new();
        for raw in raw_tokens {
            match DeviceToken::parse(&raw) {
                Ok(token) => ios.push(token),
                Err(error) => rejected_tokens.push(RejectedToken { raw, error }),
            }
        }

        let payload = req.payload.unwrap_or_default();
        if payload.contains_key("aps") {
            return Err(ServerError::InvalidRequest(
                "payload must not contain the reserved key \"aps\"".to_string(),
            ));
        }

        Ok(Self {
            targets: DispatchTargets::from_lists(android, ios, ios_requested),
            rejected_tokens,
            title: non_empty(req.title),
            message: non_empty(req.message),
            time_to_live: positive("timeToLive", req.time_to_live)?,
            msgcnt: positive("msgcnt", req.msgcnt)?,
            sound: non_empty(req.soundname),
            collapse_key: non_empty(req.collapse_key),
            delay_while_idle: req.delay_while_idle.unwrap_or(false),
            payload,
        })
    }
}

fn validate_registration_ids(ids: Vec<String>) -> Result<Vec<String>> {
    if ids.len() > MAX_REGISTRATION_IDS {
        return Err(ServerError::InvalidRequest(format!(
            "too many gcmRegistrationIds: {} (max {})",
            ids.len(),
            MAX_REGISTRATION_IDS
        )));
    }

    // 报告按设备 id 索引，重复的 id 只发一次
    let mut seen = HashSet::with_capacity(ids.len());
    let mut unique = Vec::with_capacity(ids.len());
    for id in ids {
        let id = id.trim().to_string();
        if id.is_empty() {
            return Err(ServerError::InvalidRequest(
                "gcmRegistrationIds contains an empty id".to_string(),
            ));
        }
        if seen.insert(id.clone()) {
            unique.push(id);
        } else {
            debug!("[DISPATCH] Duplicate registration id dropped: {}", id);
        }
    }
    Ok(unique)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}

fn positive(field: &str, value: Option<i64>) -> Result<Option<u32>> {
    match value {
        None | Some(0) => Ok(None),
        Some(v) if v < 0 => Err(ServerError::InvalidRequest(format!(
            "{} must not be negative: {}",
            field, v
        ))),
        Some(v) => u32::try_from(v)
            .map(Some)
            .map_err(|_| ServerError::InvalidRequest(format!("{} is out of range: {}", field, v))),
    }
}

/// Android（GCM）消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AndroidMessage {
    pub title: String,
    pub message: String,
    /// 秒
    pub time_to_live: u32,
    pub msgcnt: Option<u32>,
    pub sound: Option<String>,
    pub collapse_key: Option<String>,
    pub delay_while_idle: Option<bool>,
}

/// iOS（APNs）通知，每个设备 Token 一份
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IosNotification {
    /// 有效期（秒）
    pub expiry: u32,
    pub badge: u32,
    pub sound: Option<String>,
    pub alert: String,
    pub payload: Map<String, Value>,
}

impl IosNotification {
    /// `apns-expiration` 头使用的 UNIX 时间戳
    pub fn expiration_at(&self, now: DateTime<Utc>) -> i64 {
        now.timestamp() + i64::from(self.expiry)
    }
}

/// 单个设备的 GCM 投递结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeviceResult {
    Delivered {
        message_id: String,
    },
    /// 投递成功，但网关要求以后改用新的 registration id
    CanonicalId {
        message_id: String,
        registration_id: String,
    },
    Failed {
        error: String,
    },
}

impl DeviceResult {
    /// 网关提示稍后重试的设备级错误
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DeviceResult::Failed { error } if error == "Unavailable" || error == "InternalServerError"
        )
    }
}

/// GCM 投递报告，按设备 id 索引
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReport {
    pub multicast_id: Option<i64>,
    pub success: u32,
    pub failure: u32,
    pub canonical_ids: u32,
    pub results: BTreeMap<String, DeviceResult>,
}

impl DeliveryReport {
    pub fn record(&mut self, device_id: &str, result: DeviceResult) {
        self.results.insert(device_id.to_string(), result);
    }

    /// 根据 results 重新计算计数
    pub fn recount(&mut self) {
        self.success = 0;
        self.failure = 0;
        self.canonical_ids = 0;
        for result in self.results.values() {
            match result {
                DeviceResult::Delivered { .. } => self.success += 1,
                DeviceResult::CanonicalId { .. } => {
                    self.success += 1;
                    self.canonical_ids += 1;
                }
                DeviceResult::Failed { .. } => self.failure += 1,
            }
        }
    }
}

/// 网关报告已失效的设备 Token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub token: String,
    pub invalidated_at: DateTime<Utc>,
}

/// 单个平台的处理结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PlatformResult<T> {
    Ok { result: T },
    Error { code: ErrorCode, message: String },
}

impl<T> From<Result<T>> for PlatformResult<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(result) => PlatformResult::Ok { result },
            Err(e) => PlatformResult::Error {
                code: ErrorCode::from(&e),
                message: e.to_string(),
            },
        }
    }
}

/// iOS 提交结果：只代表已交给连接，不代表已送达
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IosSubmission {
    pub submitted: Vec<String>,
    pub failed: Vec<IosSubmissionFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IosSubmissionFailure {
    pub token: String,
    pub code: ErrorCode,
    pub message: String,
}

/// 一次分发的汇总结果，两个平台的结果都可见
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DispatchOutcome {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub android: Option<PlatformResult<DeliveryReport>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ios: Option<IosSubmission>,
}

impl DispatchOutcome {
    pub fn is_noop(&self) -> bool {
        self.android.is_none() && self.ios.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(value: serde_json::Value) -> NotificationRequest {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_targets_variant() {
        let req = DispatchRequest::try_from(request(json!({}))).unwrap();
        assert!(req.targets.is_empty());

        let req = DispatchRequest::try_from(request(json!({
            "gcmRegistrationIds": [],
            "apnTokens": []
        })))
        .unwrap();
        assert_eq!(req.targets, DispatchTargets::None);

        let req = DispatchRequest::try_from(request(json!({
            "gcmRegistrationIds": ["dev1"]
        })))
        .unwrap();
        assert_eq!(req.targets, DispatchTargets::Android(vec!["dev1".to_string()]));
        assert!(req.targets.ios().is_none());

        let req = DispatchRequest::try_from(request(json!({
            "gcmRegistrationIds": ["dev1"],
            "apnTokens": ["ABCD"]
        })))
        .unwrap();
        assert_eq!(req.targets.android().map(|a| a.len()), Some(1));
        assert_eq!(req.targets.ios().unwrap()[0].as_str(), "ABCD");
    }

    #[test]
    fn test_device_token_parse() {
        let token = DeviceToken::parse("<AB01 cd23>").unwrap();
        assert_eq!(token.as_str(), "AB01cd23");
        assert_eq!(DeviceToken::parse("tok1").unwrap().as_str(), "tok1");
        assert_eq!(DeviceToken::parse("abc").unwrap().as_str(), "abc");

        assert!(DeviceToken::parse("").is_err());
        assert!(DeviceToken::parse("<>").is_err());
        assert!(DeviceToken::parse("ab/../cd").is_err());
        assert!(DeviceToken::parse("ab?x=1").is_err());
    }

    #[test]
    fn test_bad_token_does_not_fail_request() {
        let req = DispatchRequest::try_from(request(json!({
            "gcmRegistrationIds": ["dev1"],
            "apnTokens": ["aabb", "<>", "cc/dd"]
        })))
        .unwrap();

        assert_eq!(req.targets.android().map(|a| a.len()), Some(1));
        let tokens: Vec<&str> = req.targets.ios().unwrap().iter().map(|t| t.as_str()).collect();
        assert_eq!(tokens, vec!["aabb"]);
        let rejected: Vec<&str> = req.rejected_tokens.iter().map(|r| r.raw.as_str()).collect();
        assert_eq!(rejected, vec!["<>", "cc/dd"]);

        // 全部 Token 都不可用时仍保留 iOS 路径
        let req = DispatchRequest::try_from(request(json!({ "apnTokens": [""] }))).unwrap();
        assert_eq!(req.targets, DispatchTargets::Ios(Vec::new()));
        assert_eq!(req.rejected_tokens.len(), 1);
    }

    #[test]
    fn test_duplicate_registration_ids_collapse() {
        let req = DispatchRequest::try_from(request(json!({
            "gcmRegistrationIds": ["dev1", "dev2", " dev1 ", "dev2"]
        })))
        .unwrap();
        assert_eq!(
            req.targets,
            DispatchTargets::Android(vec!["dev1".to_string(), "dev2".to_string()])
        );
    }

    #[test]
    fn test_falsy_values_are_absent() {
        let req = DispatchRequest::try_from(request(json!({
            "title": "",
            "message": "",
            "timeToLive": 0,
            "msgcnt": 0,
            "soundname": "",
            "collapseKey": "",
            "delayWhileIdle": false
        })))
        .unwrap();

        assert_eq!(req.title, None);
        assert_eq!(req.message, None);
        assert_eq!(req.time_to_live, None);
        assert_eq!(req.msgcnt, None);
        assert_eq!(req.sound, None);
        assert_eq!(req.collapse_key, None);
        assert!(!req.delay_while_idle);
        assert!(req.payload.is_empty());
    }

    #[test]
    fn test_malformed_requests() {
        let negative_ttl = DispatchRequest::try_from(request(json!({ "timeToLive": -5 })));
        assert!(matches!(negative_ttl, Err(ServerError::InvalidRequest(_))));

        let negative_badge = DispatchRequest::try_from(request(json!({ "msgcnt": -1 })));
        assert!(matches!(negative_badge, Err(ServerError::InvalidRequest(_))));

        let blank_id = DispatchRequest::try_from(request(json!({
            "gcmRegistrationIds": ["dev1", "  "]
        })));
        assert!(matches!(blank_id, Err(ServerError::InvalidRequest(_))));

        let reserved = DispatchRequest::try_from(request(json!({
            "payload": { "aps": { "badge": 9 } }
        })));
        assert!(matches!(reserved, Err(ServerError::InvalidRequest(_))));

        let ids: Vec<String> = (0..=MAX_REGISTRATION_IDS).map(|i| format!("dev{}", i)).collect();
        let too_many = DispatchRequest::try_from(NotificationRequest {
            gcm_registration_ids: Some(ids),
            ..Default::default()
        });
        assert!(matches!(too_many, Err(ServerError::InvalidRequest(_))));
    }

    #[test]
    fn test_report_recount() {
        let mut report = DeliveryReport::default();
        report.record("a", DeviceResult::Delivered { message_id: "1".into() });
        report.record(
            "b",
            DeviceResult::CanonicalId {
                message_id: "2".into(),
                registration_id: "b2".into(),
            },
        );
        report.record("c", DeviceResult::Failed { error: "NotRegistered".into() });
        report.recount();

        assert_eq!(report.success, 2);
        assert_eq!(report.canonical_ids, 1);
        assert_eq!(report.failure, 1);
    }

    #[test]
    fn test_platform_result_serialization() {
        let ok: PlatformResult<IosSubmission> = Ok(IosSubmission::default()).into();
        let value = serde_json::to_value(&ok).unwrap();
        assert_eq!(value["status"], "ok");

        let err: PlatformResult<DeliveryReport> =
            Err(ServerError::Authentication("bad key".into())).into();
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["status"], "error");
        assert_eq!(value["code"], "Authentication");
    }
}
