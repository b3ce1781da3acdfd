//! Pluggable decoders for local language-server RPC bodies

use serde_json::Value;

use super::metadata::{MetadataTree, str_at, value_at};
use super::{DecodeFault, DecodedRequest, Source};
use crate::reassembly::MessageHead;

/// Decoder for one family of RPC methods
pub trait RpcDecoder: Send + Sync {
    fn name(&self) -> &'static str;

    fn accepts(&self, method: &str) -> bool;

    /// Whether a JSON body has this decoder's shape whatever path carried it
    fn recognizes(&self, _body: &Value) -> bool {
        false
    }

    fn decode_request(&self, head: &MessageHead, body: &[u8]) -> Result<DecodedRequest, DecodeFault>;

    /// Assistant text carried by the RPC response, if the format has any
    fn decode_response(&self, _head: &MessageHead, _body: &[u8]) -> Option<String> {
        None
    }
}

/// JSON cascade envelope: `{cascadeId, items, cascadeConfig, metadata}`
pub struct CascadeJsonDecoder {
    methods: Vec<String>,
}

impl CascadeJsonDecoder {
    pub fn new(methods: Vec<String>) -> Self {
        Self { methods }
    }
}

impl RpcDecoder for CascadeJsonDecoder {
    fn name(&self) -> &'static str {
        "cascade-json"
    }

    fn accepts(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m == method)
    }

    fn recognizes(&self, body: &Value) -> bool {
        body.get("cascadeId").is_some_and(Value::is_string)
            && body.get("items").is_some_and(Value::is_array)
    }

    fn decode_request(&self, head: &MessageHead, body: &[u8]) -> Result<DecodedRequest, DecodeFault> {
        if let Some(content_type) = head.content_type() {
            if !content_type.contains("json") {
                return Err(DecodeFault::UnsupportedContentType(content_type));
            }
        }

        let data: Value = serde_json::from_slice(body)?;
        let cascade_id = data
            .get("cascadeId")
            .and_then(Value::as_str)
            .ok_or(DecodeFault::MissingField("cascadeId"))?
            .to_string();
        let items = data
            .get("items")
            .and_then(Value::as_array)
            .ok_or(DecodeFault::MissingField("items"))?;

        let prompt = items
            .iter()
            .filter_map(|item| match item {
                Value::String(text) => Some(text.as_str()),
                other => other.get("text").and_then(Value::as_str),
            })
            .collect::<Vec<_>>()
            .join("\n");

        let model = str_at(&data, &["cascadeConfig", "plannerConfig", "requestedModelUid"]);
        let planner_mode = str_at(
            &data,
            &["cascadeConfig", "plannerConfig", "conversational", "plannerMode"],
        );
        let brain_enabled = value_at(&data, &["cascadeConfig", "brainConfig", "enabled"])
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let ide_name = str_at(&data, &["metadata", "ideName"]).or_else(|| Some("windsurf".to_string()));
        let ide_version = str_at(&data, &["metadata", "ideVersion"]);
        let extension_version = str_at(&data, &["metadata", "extensionVersion"]);
        let api_key_present = value_at(&data, &["metadata", "apiKey"])
            .and_then(Value::as_str)
            .is_some_and(|k| !k.is_empty());

        let mut metadata = MetadataTree::new();
        metadata.insert("model", model.clone().unwrap_or_default());
        metadata.insert("cascade_id", cascade_id.clone());
        metadata.insert("planner_mode", planner_mode.clone().unwrap_or_default());
        metadata.insert("ide_name", ide_name.clone().unwrap_or_default());
        metadata.insert("ide_version", ide_version.clone().unwrap_or_default());
        metadata.insert("extension_version", extension_version.clone().unwrap_or_default());
        metadata.insert(
            "locale",
            str_at(&data, &["metadata", "locale"]).unwrap_or_default(),
        );
        metadata.insert("api_key_present", api_key_present);
        metadata.insert("brain_enabled", brain_enabled);
        metadata.insert("content_type", head.header("content-type").unwrap_or_default());
        metadata.insert("request_size", body.len());

        Ok(DecodedRequest {
            prompt,
            model,
            cascade_id: Some(cascade_id),
            planner_mode,
            brain_enabled,
            ide_name,
            ide_version,
            extension_version,
            source: Source::Windsurf,
            metadata,
        })
    }
}

/// Ordered set of RPC decoders; the first one that accepts a method wins
#[derive(Default)]
pub struct DecoderRegistry {
    decoders: Vec<Box<dyn RpcDecoder>>,
}

impl DecoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the cascade decoder for the given methods
    pub fn with_defaults(methods: &[String]) -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(CascadeJsonDecoder::new(methods.to_vec())));
        registry
    }

    pub fn register(&mut self, decoder: Box<dyn RpcDecoder>) {
        tracing::debug!(decoder = decoder.name(), "Registered RPC decoder");
        self.decoders.push(decoder);
    }

    pub fn find(&self, method: &str) -> Option<&dyn RpcDecoder> {
        self.decoders
            .iter()
            .find(|d| d.accepts(method))
            .map(|d| d.as_ref())
    }

    /// First decoder that recognizes the body's shape
    pub fn recognize(&self, body: &Value) -> Option<&dyn RpcDecoder> {
        self.decoders
            .iter()
            .find(|d| d.recognizes(body))
            .map(|d| d.as_ref())
    }

    pub fn named(&self, name: &str) -> Option<&dyn RpcDecoder> {
        self.decoders
            .iter()
            .find(|d| d.name() == name)
            .map(|d| d.as_ref())
    }

    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reassembly::http::parse_head;
    use serde_json::json;

    fn head(content_type: &str) -> MessageHead {
        parse_head(
            format!("POST /svc/SendUserCascadeMessage HTTP/1.1\r\nContent-Type: {content_type}\r\n\r\n")
                .as_bytes(),
        )
        .unwrap()
    }

    fn decoder() -> CascadeJsonDecoder {
        CascadeJsonDecoder::new(vec!["SendUserCascadeMessage".into()])
    }

    #[test]
    fn test_decode_cascade_envelope() {
        let body = json!({
            "cascadeId": "abc-123",
            "items": [{"text": "first line"}, "second line", {"image": "ignored"}],
            "metadata": {"apiKey": "secret", "ideName": "windsurf", "ideVersion": "1.9.0", "extensionVersion": "1.30.1", "locale": "en"},
            "cascadeConfig": {
                "plannerConfig": {"requestedModelUid": "MODEL_X", "conversational": {"plannerMode": "CONVERSATIONAL_PLANNER_MODE_DEFAULT"}},
                "brainConfig": {"enabled": true}
            }
        });
        let decoded = decoder()
            .decode_request(&head("application/json"), body.to_string().as_bytes())
            .unwrap();

        assert_eq!(decoded.prompt, "first line\nsecond line");
        assert_eq!(decoded.cascade_id.as_deref(), Some("abc-123"));
        assert_eq!(decoded.model.as_deref(), Some("MODEL_X"));
        assert_eq!(decoded.planner_mode.as_deref(), Some("CONVERSATIONAL_PLANNER_MODE_DEFAULT"));
        assert!(decoded.brain_enabled);
        assert_eq!(decoded.ide_version.as_deref(), Some("1.9.0"));
        assert_eq!(decoded.source, Source::Windsurf);
        assert_eq!(decoded.metadata.get("api_key_present"), Some(&json!(true)));
        assert_eq!(decoded.metadata.get_str("locale"), Some("en"));

        let serialized = serde_json::to_string(&decoded.metadata).unwrap();
        assert!(!serialized.contains("secret"));
    }

    #[test]
    fn test_missing_cascade_id_is_fault() {
        let err = decoder()
            .decode_request(&head("application/json"), br#"{"items":[]}"#)
            .unwrap_err();
        assert_eq!(err, DecodeFault::MissingField("cascadeId"));
    }

    #[test]
    fn test_binary_body_is_unsupported() {
        let err = decoder()
            .decode_request(&head("application/proto"), b"\x0a\x03abc")
            .unwrap_err();
        assert!(matches!(err, DecodeFault::UnsupportedContentType(_)));
    }

    #[test]
    fn test_registry_recognizes_cascade_shape() {
        let registry = DecoderRegistry::with_defaults(&["SendUserCascadeMessage".to_string()]);
        let cascade = json!({"cascadeId": "abc", "items": [{"text": "hi"}]});
        let chat = json!({"messages": [{"role": "user", "content": "hi"}]});

        assert_eq!(registry.recognize(&cascade).map(|d| d.name()), Some("cascade-json"));
        assert!(registry.recognize(&chat).is_none());
        assert!(registry.recognize(&json!({"cascadeId": 7, "items": []})).is_none());
        assert_eq!(registry.named("cascade-json").map(|d| d.name()), Some("cascade-json"));
    }

    #[test]
    fn test_registry_first_match_wins() {
        struct Other;
        impl RpcDecoder for Other {
            fn name(&self) -> &'static str {
                "other"
            }
            fn accepts(&self, _method: &str) -> bool {
                true
            }
            fn decode_request(&self, _: &MessageHead, _: &[u8]) -> Result<DecodedRequest, DecodeFault> {
                Err(DecodeFault::MissingField("never"))
            }
        }

        let mut registry = DecoderRegistry::with_defaults(&["SendUserCascadeMessage".to_string()]);
        registry.register(Box::new(Other));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.find("SendUserCascadeMessage").map(|d| d.name()), Some("cascade-json"));
        assert_eq!(registry.find("Anything").map(|d| d.name()), Some("other"));
    }
}
