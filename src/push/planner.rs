use crate::config::PushConfig;
use crate::push::types::{AndroidMessage, DispatchRequest, IosNotification};

/// 标题兜底值
pub const FALLBACK_TITLE: &str = "Notification";
/// 消息正文兜底值
pub const FALLBACK_MESSAGE: &str = "Hi, something came up!";
/// TTL 兜底值（秒）
pub const FALLBACK_TTL_SECS: u32 = 3000;
/// iOS badge 兜底值
pub const FALLBACK_BADGE: u32 = 1;

/// Push Planner（消息构建器）
///
/// 把校验后的请求展开成平台消息。每个字段独立按
/// “请求值 > 配置默认值 > 兜底值” 的顺序取值。
pub struct PushPlanner<'a> {
    config: &'a PushConfig,
}

impl<'a> PushPlanner<'a> {
    pub fn new(config: &'a PushConfig) -> Self {
        Self { config }
    }

    pub fn title(&self, request: &DispatchRequest) -> String {
        resolve_text(
            request.title.as_deref(),
            self.config.default_title.as_deref(),
            FALLBACK_TITLE,
        )
    }

    pub fn message(&self, request: &DispatchRequest) -> String {
        resolve_text(
            request.message.as_deref(),
            self.config.default_message.as_deref(),
            FALLBACK_MESSAGE,
        )
    }

    pub fn time_to_live(&self, request: &DispatchRequest) -> u32 {
        request
            .time_to_live
            .or(self.config.default_ttl.filter(|ttl| *ttl > 0))
            .unwrap_or(FALLBACK_TTL_SECS)
    }

    /// 构建 Android 消息
    pub fn android_message(&self, request: &DispatchRequest) -> AndroidMessage {
        AndroidMessage {
            title: self.title(request),
            message: self.message(request),
            time_to_live: self.time_to_live(request),
            msgcnt: request.msgcnt,
            sound: request.sound.clone(),
            collapse_key: request.collapse_key.clone(),
            delay_while_idle: request.delay_while_idle.then_some(true),
        }
    }

    /// 构建 iOS 通知（所有 Token 共用同一份内容）
    pub fn ios_notification(&self, request: &DispatchRequest) -> IosNotification {
        IosNotification {
            expiry: self.time_to_live(request),
            badge: request.msgcnt.unwrap_or(FALLBACK_BADGE),
            sound: request.sound.clone(),
            alert: self.message(request),
            payload: request.payload.clone(),
        }
    }
}

fn resolve_text(explicit: Option<&str>, configured: Option<&str>, fallback: &str) -> String {
    explicit
        .filter(|s| !s.is_empty())
        .or(configured.filter(|s| !s.is_empty()))
        .unwrap_or(fallback)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::push::types::NotificationRequest;
    use serde_json::json;

    fn validated(value: serde_json::Value) -> DispatchRequest {
        let raw: NotificationRequest = serde_json::from_value(value).unwrap();
        DispatchRequest::try_from(raw).unwrap()
    }

    fn configured() -> PushConfig {
        PushConfig {
            default_title: Some("Acme".to_string()),
            default_message: Some("Something new in Acme".to_string()),
            default_ttl: Some(600),
            ..PushConfig::default()
        }
    }

    #[test]
    fn test_hard_coded_fallbacks() {
        let config = PushConfig::default();
        let planner = PushPlanner::new(&config);
        let msg = planner.android_message(&validated(json!({ "gcmRegistrationIds": ["dev1"] })));

        assert_eq!(msg.title, "Notification");
        assert_eq!(msg.message, "Hi, something came up!");
        assert_eq!(msg.time_to_live, 3000);
        assert_eq!(msg.msgcnt, None);
        assert_eq!(msg.delay_while_idle, None);
    }

    #[test]
    fn test_configured_defaults() {
        let config = configured();
        let planner = PushPlanner::new(&config);
        let req = validated(json!({ "gcmRegistrationIds": ["dev1"], "title": "" }));
        let msg = planner.android_message(&req);

        assert_eq!(msg.title, "Acme");
        assert_eq!(msg.message, "Something new in Acme");
        assert_eq!(msg.time_to_live, 600);
    }

    #[test]
    fn test_explicit_values_win() {
        let config = configured();
        let planner = PushPlanner::new(&config);
        let req = validated(json!({
            "gcmRegistrationIds": ["dev1"],
            "title": "Order shipped",
            "message": "Your parcel is on its way",
            "timeToLive": 60,
            "msgcnt": 2,
            "soundname": "ping.caf",
            "collapseKey": "orders",
            "delayWhileIdle": true
        }));
        let msg = planner.android_message(&req);

        assert_eq!(msg.title, "Order shipped");
        assert_eq!(msg.message, "Your parcel is on its way");
        assert_eq!(msg.time_to_live, 60);
        assert_eq!(msg.msgcnt, Some(2));
        assert_eq!(msg.sound.as_deref(), Some("ping.caf"));
        assert_eq!(msg.collapse_key.as_deref(), Some("orders"));
        assert_eq!(msg.delay_while_idle, Some(true));
    }

    #[test]
    fn test_empty_configured_default_falls_through() {
        let config = PushConfig {
            default_title: Some(String::new()),
            default_ttl: Some(0),
            ..PushConfig::default()
        };
        let planner = PushPlanner::new(&config);
        let req = validated(json!({}));

        assert_eq!(planner.title(&req), FALLBACK_TITLE);
        assert_eq!(planner.time_to_live(&req), FALLBACK_TTL_SECS);
    }

    #[test]
    fn test_android_scenario_hello() {
        let config = PushConfig::default();
        let planner = PushPlanner::new(&config);
        let req = validated(json!({ "gcmRegistrationIds": ["dev1"], "message": "Hello" }));
        let msg = planner.android_message(&req);

        assert_eq!(msg.title, "Notification");
        assert_eq!(msg.message, "Hello");
        assert_eq!(msg.time_to_live, 3000);
        assert_eq!(req.targets.android(), Some(&["dev1".to_string()][..]));
    }

    #[test]
    fn test_ios_notification() {
        let config = configured();
        let planner = PushPlanner::new(&config);

        let note = planner.ios_notification(&validated(json!({ "apnTokens": ["ab"], "msgcnt": 3 })));
        assert_eq!(note.badge, 3);
        assert_eq!(note.alert, "Something new in Acme");
        assert_eq!(note.expiry, 600);
        assert!(note.payload.is_empty());

        let note = planner.ios_notification(&validated(json!({
            "apnTokens": ["ab"],
            "payload": { "orderId": 42 }
        })));
        assert_eq!(note.badge, FALLBACK_BADGE);
        assert_eq!(note.payload["orderId"], 42);
    }
}
