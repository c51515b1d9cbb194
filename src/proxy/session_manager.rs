use rand::Rng;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// 会话管理器 - 基于请求内容生成稳定的会话指纹
///
/// 同一对话的每一轮都锚定第一条用户消息，因此得到相同的 session id，
/// 上游据此保持缓存亲和。
/// 输出格式：`-{positive i64}`
pub struct SessionManager;

/// 从 8 字节大端整数生成 session ID（清除符号位）
fn bytes_to_session_id(bytes: [u8; 8]) -> String {
    let n = (u64::from_be_bytes(bytes) & 0x7FFF_FFFF_FFFF_FFFF) as i64;
    format!("-{}", n)
}

impl SessionManager {
    /// 根据信封内 `request.contents` 生成稳定的会话指纹
    ///
    /// 取第一条带非空 `parts[0].text` 的 user 消息做 SHA-256；找不到时退化为随机 id。
    pub fn stable_session_id(envelope: &Value) -> String {
        let first_text = envelope
            .pointer("/request/contents")
            .and_then(|c| c.as_array())
            .into_iter()
            .flatten()
            .filter(|content| content.get("role").and_then(|r| r.as_str()) == Some("user"))
            .filter_map(|content| content.pointer("/parts/0/text").and_then(|t| t.as_str()))
            .find(|text| !text.is_empty());

        match first_text {
            Some(text) => {
                let digest = Sha256::digest(text.as_bytes());
                let mut head = [0u8; 8];
                head.copy_from_slice(&digest[..8]);
                bytes_to_session_id(head)
            }
            None => {
                tracing::debug!("[SessionManager] No user text found, using random session id");
                Self::random_session_id()
            }
        }
    }

    pub fn random_session_id() -> String {
        bytes_to_session_id(rand::thread_rng().gen())
    }
}
