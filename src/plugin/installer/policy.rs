//! 插件来源信任策略
//!
//! 在任何网络请求之前检查来源地址：
//! - 只接受 http / https，以及开启 `allow_file_sources` 时的 file://
//! - deny 列表优先于 allow 列表
//! - allow 列表为空时接受所有未被拒绝的主机
//!
//! 主机模式支持的通配符：
//! - 精确匹配: `plugins.example.com`
//! - 子域匹配: `*.example.com`
//! - 前缀匹配: `cdn-*`
//! - 任意主机: `*`

use serde::{Deserialize, Serialize};
use url::Url;

/// 来源策略配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcePolicy {
    /// 允许的主机模式
    pub allow: Vec<String>,
    /// 拒绝的主机模式
    pub deny: Vec<String>,
    /// 是否允许 file:// 来源
    pub allow_file_sources: bool,
}

impl SourcePolicy {
    /// 检查来源，返回解析后的地址或拒绝原因
    pub fn check(&self, source: &str) -> Result<Url, String> {
        let url = Url::parse(source).map_err(|e| format!("无效的来源地址: {}", e))?;

        match url.scheme() {
            "http" | "https" => {}
            "file" => {
                if self.allow_file_sources {
                    return Ok(url);
                }
                return Err("不允许本地文件来源".to_string());
            }
            other => return Err(format!("不支持的协议: {}", other)),
        }

        let host = url
            .host_str()
            .map(|h| h.to_ascii_lowercase())
            .ok_or_else(|| "来源地址缺少主机名".to_string())?;

        if let Some(pattern) = self.deny.iter().find(|p| host_matches(p, &host)) {
            return Err(format!("主机 {} 命中拒绝规则 {}", host, pattern));
        }

        if !self.allow.is_empty() && !self.allow.iter().any(|p| host_matches(p, &host)) {
            return Err(format!("主机 {} 不在允许列表中", host));
        }

        Ok(url)
    }

    /// 检查模式格式，返回第一个无效模式
    pub fn invalid_pattern(&self) -> Option<&str> {
        self.allow
            .iter()
            .chain(self.deny.iter())
            .map(String::as_str)
            .find(|p| !is_valid_pattern(p))
    }
}

fn is_valid_pattern(pattern: &str) -> bool {
    !pattern.is_empty()
        && pattern.matches('*').count() <= 1
        && pattern
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '*' | '[' | ']' | ':'))
}

/// 检查主机模式是否匹配
fn host_matches(pattern: &str, host: &str) -> bool {
    let pattern = pattern.to_ascii_lowercase();

    if !pattern.contains('*') {
        return pattern == host;
    }

    let parts: Vec<&str> = pattern.split('*').collect();
    match parts.as_slice() {
        ["", ""] => true,
        // `*.example.com` 同时匹配 example.com 本身
        ["", suffix] => {
            host.ends_with(suffix) || suffix.strip_prefix('.').is_some_and(|bare| host == bare)
        }
        [prefix, ""] => host.starts_with(prefix),
        [prefix, suffix] => {
            host.len() >= prefix.len() + suffix.len()
                && host.starts_with(prefix)
                && host.ends_with(suffix)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(allow: &[&str], deny: &[&str]) -> SourcePolicy {
        SourcePolicy {
            allow: allow.iter().map(|s| s.to_string()).collect(),
            deny: deny.iter().map(|s| s.to_string()).collect(),
            allow_file_sources: false,
        }
    }

    #[test]
    fn test_empty_policy_accepts_http() {
        let policy = SourcePolicy::default();
        assert!(policy.check("https://plugins.example.com/demo.zip").is_ok());
        assert!(policy.check("http://127.0.0.1:8080/demo.zip").is_ok());
    }

    #[test]
    fn test_rejects_unsupported_schemes() {
        let policy = SourcePolicy::default();
        assert!(policy.check("ftp://example.com/demo.zip").is_err());
        assert!(policy.check("file:///tmp/demo.zip").is_err());
        assert!(policy.check("not a url").is_err());
    }

    #[test]
    fn test_file_sources_when_enabled() {
        let policy = SourcePolicy {
            allow_file_sources: true,
            ..Default::default()
        };
        assert!(policy.check("file:///tmp/demo.zip").is_ok());
    }

    #[test]
    fn test_allow_list() {
        let policy = policy(&["*.example.com"], &[]);
        assert!(policy.check("https://cdn.example.com/a.zip").is_ok());
        assert!(policy.check("https://example.com/a.zip").is_ok());
        assert!(policy.check("https://evil.com/a.zip").is_err());
        assert!(policy.check("https://badexample.com/a.zip").is_err());
    }

    #[test]
    fn test_deny_wins_over_allow() {
        let policy = policy(&["*"], &["evil.example.com"]);
        assert!(policy.check("https://good.example.com/a.zip").is_ok());
        let err = policy.check("https://EVIL.example.com/a.zip").unwrap_err();
        assert!(err.contains("拒绝"));
    }

    #[test]
    fn test_host_patterns() {
        assert!(host_matches("cdn-*", "cdn-eu"));
        assert!(!host_matches("cdn-*", "edge-cdn"));
        assert!(host_matches("a*z", "abcz"));
        assert!(!host_matches("ab*ba", "aba"));
        assert!(host_matches("127.0.0.1", "127.0.0.1"));
    }

    #[test]
    fn test_invalid_pattern() {
        assert_eq!(policy(&["ok.com"], &[]).invalid_pattern(), None);
        assert_eq!(policy(&["a*b*c"], &[]).invalid_pattern(), Some("a*b*c"));
        assert_eq!(policy(&[], &["http://x"]).invalid_pattern(), Some("http://x"));
        assert_eq!(policy(&[""], &[]).invalid_pattern(), Some(""));
    }
}
