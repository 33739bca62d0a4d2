//! Candidate engine configs.
//!
//! A candidate is a full Xray JSON document. Only the handful of keys the
//! orchestrator inspects are typed; everything else rides along in `extra`
//! maps so that re-serializing a candidate loses nothing.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Transport fields that may carry the TLS host name, in lookup order.
const SNI_SOURCES: [(&str, &[&str]); 5] = [
    ("wsSettings", &["host"]),
    ("wsSettings", &["headers", "Host"]),
    ("httpupgradeSettings", &["host"]),
    ("xhttpSettings", &["host"]),
    ("grpcSettings", &["authority"]),
];

/// Top-level blocks that reference geo files and resolvers the bundled
/// engine does not ship with.
const STRIPPED_BLOCKS: [&str; 2] = ["routing", "dns"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remarks: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sni: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbounds: Option<Vec<Outbound>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Outbound {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<OutboundSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_settings: Option<StreamSettings>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vnext: Option<Vec<ServerEndpoint>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub servers: Option<Vec<ServerEndpoint>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerEndpoint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Kept untyped: share links in the wild carry the port as a string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_settings: Option<TlsSettings>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ServerEndpoint {
    fn port_number(&self) -> Option<u16> {
        match self.port.as_ref()? {
            Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl Outbound {
    fn endpoint(&self) -> Option<&ServerEndpoint> {
        let settings = self.settings.as_ref()?;
        settings
            .vnext
            .as_ref()
            .and_then(|v| v.first())
            .or_else(|| settings.servers.as_ref().and_then(|v| v.first()))
    }

    fn tls_enabled(&self) -> bool {
        self.stream_settings
            .as_ref()
            .and_then(|s| s.security.as_deref())
            .is_some_and(|s| s.eq_ignore_ascii_case("tls"))
    }
}

impl StreamSettings {
    fn transport_host(&self) -> Option<String> {
        SNI_SOURCES.iter().find_map(|(block, path)| {
            let mut value = self.extra.get(*block)?;
            for key in *path {
                value = value.get(key)?;
            }
            value
                .as_str()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        })
    }

    fn server_name(&self) -> Option<&str> {
        self.tls_settings
            .as_ref()
            .and_then(|t| t.server_name.as_deref())
            .filter(|s| !s.trim().is_empty())
    }
}

impl CandidateConfig {
    /// Parse a candidate; the document must be a JSON object.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(raw)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        if !value.is_object() {
            return Err(serde::de::Error::custom("expected a JSON object"));
        }
        serde_json::from_value(value)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    fn primary_outbound(&self) -> Option<&Outbound> {
        self.outbounds
            .as_deref()?
            .iter()
            .find(|o| o.endpoint().is_some())
    }

    #[must_use]
    pub fn host(&self) -> Option<&str> {
        self.primary_outbound()?
            .endpoint()?
            .address
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    #[must_use]
    pub fn port(&self) -> Option<u16> {
        self.primary_outbound()?.endpoint()?.port_number()
    }

    /// `(host, port)` when both are present and well-formed.
    #[must_use]
    pub fn endpoint(&self) -> Option<(String, u16)> {
        Some((self.host()?.to_string(), self.port()?))
    }

    #[must_use]
    pub fn label(&self) -> String {
        if let Some(remarks) = self.remarks.as_deref().filter(|s| !s.trim().is_empty()) {
            return remarks.to_string();
        }
        if let Some(tag) = self.primary_outbound().and_then(|o| o.tag.as_deref()) {
            return tag.to_string();
        }
        match self.endpoint() {
            Some((host, port)) => format!("{}:{}", host, port),
            None => "unnamed".to_string(),
        }
    }

    #[must_use]
    pub fn network(&self) -> Option<&str> {
        self.primary_outbound()?.stream_settings.as_ref()?.network.as_deref()
    }

    #[must_use]
    pub fn security(&self) -> Option<&str> {
        self.primary_outbound()?.stream_settings.as_ref()?.security.as_deref()
    }

    #[must_use]
    pub fn tls_enabled(&self) -> bool {
        self.primary_outbound().is_some_and(Outbound::tls_enabled)
    }

    #[must_use]
    pub fn server_name(&self) -> Option<&str> {
        self.primary_outbound()?.stream_settings.as_ref()?.server_name()
    }

    /// Build the launch-ready copy; `self` is left untouched.
    #[must_use]
    pub fn patched(&self) -> PatchedConfig {
        let mut doc = self.clone();
        for block in STRIPPED_BLOCKS {
            doc.extra.remove(block);
        }

        let top_level_sni = doc
            .sni
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        for outbound in doc.outbounds.iter_mut().flatten() {
            if !outbound.tls_enabled() {
                continue;
            }
            let Some(stream) = outbound.stream_settings.as_mut() else {
                continue;
            };
            if stream.server_name().is_some() {
                continue;
            }
            let Some(name) = stream.transport_host().or_else(|| top_level_sni.clone()) else {
                tracing::debug!(tag = ?outbound.tag, "sni_patch_no_source");
                continue;
            };
            tracing::debug!(server_name = %name, "sni_patch_applied");
            stream
                .tls_settings
                .get_or_insert_with(TlsSettings::default)
                .server_name = Some(name);
        }

        PatchedConfig { doc }
    }
}

/// A candidate with sandbox-hostile blocks removed and SNI filled in.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchedConfig {
    doc: CandidateConfig,
}

impl PatchedConfig {
    #[must_use]
    pub fn config(&self) -> &CandidateConfig {
        &self.doc
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.doc)
    }

    /// Overwrite `path` with this config, creating parent directories.
    pub async fn write_to(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = self.to_json_pretty().map_err(std::io::Error::other)?;
        tokio::fs::write(path, json).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn sample_doc(label: &str, host: &str, port: u16) -> Value {
        json!({
            "remarks": label,
            "log": { "loglevel": "warning" },
            "inbounds": [{
                "port": 10808,
                "listen": "127.0.0.1",
                "protocol": "socks",
                "settings": { "udp": true }
            }],
            "outbounds": [{
                "protocol": "vless",
                "tag": "proxy",
                "settings": {
                    "vnext": [{
                        "address": host,
                        "port": port,
                        "users": [{ "id": "b831381d-6324-4d53-ad4f-8cda48b30811", "encryption": "none" }]
                    }]
                },
                "streamSettings": {
                    "network": "ws",
                    "security": "tls",
                    "wsSettings": { "path": "/ray", "host": "example.com" }
                }
            }, {
                "protocol": "freedom",
                "tag": "direct"
            }],
            "routing": { "rules": [{ "type": "field", "outboundTag": "direct", "domain": ["geosite:private"] }] },
            "dns": { "servers": ["1.1.1.1"] }
        })
    }

    pub(crate) fn sample(label: &str, host: &str, port: u16) -> CandidateConfig {
        CandidateConfig::from_value(sample_doc(label, host, port)).expect("sample parses")
    }

    #[test]
    fn lookups_read_primary_outbound() {
        let cfg = sample("de-1", "203.0.113.7", 443);
        assert_eq!(cfg.label(), "de-1");
        assert_eq!(cfg.host(), Some("203.0.113.7"));
        assert_eq!(cfg.port(), Some(443));
        assert_eq!(cfg.network(), Some("ws"));
        assert_eq!(cfg.security(), Some("tls"));
        assert!(cfg.tls_enabled());
        assert_eq!(cfg.server_name(), None);
    }

    #[test]
    fn round_trip_is_lossless() {
        let doc = sample_doc("de-1", "203.0.113.7", 443);
        let cfg = CandidateConfig::from_value(doc.clone()).expect("parse");
        assert_eq!(cfg.to_value(), doc);
    }

    #[test]
    fn rejects_non_object_documents() {
        assert!(CandidateConfig::from_json("[1, 2, 3]").is_err());
        assert!(CandidateConfig::from_json("\"vless://\"").is_err());
        assert!(CandidateConfig::from_json("{broken").is_err());
    }

    #[test]
    fn port_as_string_and_servers_block() {
        let cfg = CandidateConfig::from_value(json!({
            "outbounds": [{
                "protocol": "trojan",
                "settings": { "servers": [{ "address": "trojan.example.net", "port": "8443" }] }
            }]
        }))
        .expect("parse");
        assert_eq!(
            cfg.endpoint(),
            Some(("trojan.example.net".to_string(), 8443))
        );
        assert_eq!(cfg.label(), "trojan.example.net:8443");
    }

    #[test]
    fn missing_endpoint_is_none() {
        let cfg = CandidateConfig::from_value(json!({
            "outbounds": [{ "protocol": "freedom", "settings": {} }]
        }))
        .expect("parse");
        assert_eq!(cfg.endpoint(), None);
        assert_eq!(cfg.label(), "unnamed");
    }

    #[test]
    fn patch_infers_sni_from_ws_host() {
        let original = sample("de-1", "203.0.113.7", 443);
        let patched = original.patched();
        assert_eq!(patched.config().server_name(), Some("example.com"));

        let written = patched.config().to_value();
        assert_eq!(
            written["outbounds"][0]["streamSettings"]["tlsSettings"]["serverName"],
            json!("example.com")
        );
        // original untouched
        assert_eq!(original.server_name(), None);
    }

    #[test]
    fn patch_strips_routing_and_dns() {
        let original = sample("de-1", "203.0.113.7", 443);
        let written = original.patched().config().to_value();
        assert!(written.get("routing").is_none());
        assert!(written.get("dns").is_none());
        assert!(written.get("inbounds").is_some());
        assert!(original.extra.contains_key("routing"));
    }

    #[test]
    fn patch_keeps_existing_server_name() {
        let mut doc = sample_doc("de-1", "203.0.113.7", 443);
        doc["outbounds"][0]["streamSettings"]["tlsSettings"] =
            json!({ "serverName": "cdn.example.org", "allowInsecure": false });
        let cfg = CandidateConfig::from_value(doc).expect("parse");

        let written = cfg.patched().config().to_value();
        let tls = &written["outbounds"][0]["streamSettings"]["tlsSettings"];
        assert_eq!(tls["serverName"], json!("cdn.example.org"));
        assert_eq!(tls["allowInsecure"], json!(false));
    }

    #[test]
    fn patch_falls_back_to_header_then_top_level_sni() {
        let mut doc = sample_doc("de-1", "203.0.113.7", 443);
        doc["outbounds"][0]["streamSettings"]["wsSettings"] =
            json!({ "path": "/ray", "headers": { "Host": "header.example.com" } });
        let cfg = CandidateConfig::from_value(doc.clone()).expect("parse");
        assert_eq!(
            cfg.patched().config().server_name(),
            Some("header.example.com")
        );

        doc["outbounds"][0]["streamSettings"]["wsSettings"] = json!({ "path": "/ray" });
        doc["sni"] = json!("top.example.com");
        let cfg = CandidateConfig::from_value(doc).expect("parse");
        assert_eq!(cfg.patched().config().server_name(), Some("top.example.com"));
    }

    #[test]
    fn patch_leaves_non_tls_outbounds_alone() {
        let mut doc = sample_doc("de-1", "203.0.113.7", 80);
        doc["outbounds"][0]["streamSettings"]["security"] = json!("none");
        let cfg = CandidateConfig::from_value(doc).expect("parse");

        let written = cfg.patched().config().to_value();
        assert!(written["outbounds"][0]["streamSettings"]
            .get("tlsSettings")
            .is_none());
    }

    #[tokio::test]
    async fn write_to_overwrites_previous_file() {
        let dir = std::env::temp_dir().join(format!(
            "vlessmux-candidate-test-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time")
                .as_nanos()
        ));
        let path = dir.join("nested").join("engine.json");

        sample("first", "198.51.100.1", 443)
            .patched()
            .write_to(&path)
            .await
            .expect("first write");
        sample("second", "198.51.100.2", 443)
            .patched()
            .write_to(&path)
            .await
            .expect("second write");

        let on_disk = CandidateConfig::from_json(
            &std::fs::read_to_string(&path).expect("read back"),
        )
        .expect("parse written");
        assert_eq!(on_disk.label(), "second");
        assert!(on_disk.extra.get("routing").is_none());

        let _ = std::fs::remove_dir_all(dir);
    }
}
