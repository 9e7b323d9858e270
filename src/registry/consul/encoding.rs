//! Consul 标签编解码
//!
//! Consul 的服务定义只有扁平的标签列表，版本、元数据和方法描述都编码成
//! `<prefix>-<base64>` 形式的标签。

use crate::registry::Endpoint;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use std::collections::BTreeMap;
use std::time::Duration;

pub const VERSION_PREFIX: &str = "v";
pub const SERVICE_METADATA_PREFIX: &str = "sm";
pub const NODE_METADATA_PREFIX: &str = "nm";
pub const ENDPOINT_PREFIX: &str = "e";

const MIN_DEREGISTER_AFTER: Duration = Duration::from_secs(60);

fn tag(prefix: &str, payload: &[u8]) -> String {
    format!("{}-{}", prefix, URL_SAFE_NO_PAD.encode(payload))
}

fn payloads<'a>(prefix: &'a str, tags: &'a [String]) -> impl Iterator<Item = Vec<u8>> + 'a {
    tags.iter().filter_map(move |t| {
        let encoded = t.strip_prefix(prefix)?.strip_prefix('-')?;
        URL_SAFE_NO_PAD.decode(encoded).ok()
    })
}

pub fn encode_version(version: &str) -> Vec<String> {
    if version.is_empty() {
        return Vec::new();
    }
    vec![tag(VERSION_PREFIX, version.as_bytes())]
}

pub fn decode_version(tags: &[String]) -> Option<String> {
    payloads(VERSION_PREFIX, tags)
        .find_map(|bytes| String::from_utf8(bytes).ok())
}

/// 每个键值对一个标签
pub fn encode_metadata(prefix: &str, metadata: &BTreeMap<String, String>) -> Vec<String> {
    metadata
        .iter()
        .filter_map(|(k, v)| {
            let mut single = BTreeMap::new();
            single.insert(k, v);
            serde_json::to_vec(&single).ok().map(|json| tag(prefix, &json))
        })
        .collect()
}

pub fn decode_metadata(prefix: &str, tags: &[String]) -> BTreeMap<String, String> {
    let mut metadata = BTreeMap::new();
    for bytes in payloads(prefix, tags) {
        if let Ok(entry) = serde_json::from_slice::<BTreeMap<String, String>>(&bytes) {
            metadata.extend(entry);
        }
    }
    metadata
}

pub fn encode_endpoints(endpoints: &[Endpoint]) -> Vec<String> {
    endpoints
        .iter()
        .filter_map(|e| serde_json::to_vec(e).ok())
        .map(|json| tag(ENDPOINT_PREFIX, &json))
        .collect()
}

pub fn decode_endpoints(tags: &[String]) -> Vec<Endpoint> {
    payloads(ENDPOINT_PREFIX, tags)
        .filter_map(|bytes| serde_json::from_slice(&bytes).ok())
        .collect()
}

/// 渲染为 Go duration 字符串（`10s`、`500ms`）
pub fn go_duration(duration: Duration) -> String {
    if duration.subsec_nanos() == 0 {
        format!("{}s", duration.as_secs())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

/// 检查进入 critical 后多久被 Consul 自动摘除，至少一分钟
pub fn deregister_after(interval: Duration) -> Duration {
    interval.max(MIN_DEREGISTER_AFTER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_tags_decode_back() {
        let mut metadata = BTreeMap::new();
        metadata.insert("gray".to_string(), "true".to_string());
        metadata.insert("zone".to_string(), "sh-1".to_string());

        let mut tags = encode_metadata(NODE_METADATA_PREFIX, &metadata);
        tags.extend(encode_version("1.2.0"));
        tags.push("nm-%%%not-base64".to_string());
        tags.push("unrelated".to_string());

        assert_eq!(tags.iter().filter(|t| t.starts_with("nm-")).count(), 3);
        assert_eq!(decode_metadata(NODE_METADATA_PREFIX, &tags), metadata);
        assert!(decode_metadata(SERVICE_METADATA_PREFIX, &tags).is_empty());
        assert_eq!(decode_version(&tags).as_deref(), Some("1.2.0"));
    }

    #[test]
    fn version_prefix_does_not_swallow_other_tags() {
        let tags = vec!["vx-abc".to_string()];
        assert_eq!(decode_version(&tags), None);
    }

    #[test]
    fn go_duration_strings() {
        assert_eq!(go_duration(Duration::from_secs(10)), "10s");
        assert_eq!(go_duration(Duration::from_millis(500)), "500ms");
        assert_eq!(deregister_after(Duration::from_secs(10)), Duration::from_secs(60));
        assert_eq!(deregister_after(Duration::from_secs(90)), Duration::from_secs(90));
    }
}
