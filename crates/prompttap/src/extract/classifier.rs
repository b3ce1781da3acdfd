//! Decides which decoder, if any, a request goes to

use crate::capture::{TransportPath, host_in};
use crate::config::Config;
use crate::reassembly::MessageHead;

/// Where a request came from, as far as extraction cares
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Channel {
    /// Cascade-style RPC named by the last path segment
    Rpc { method: String },
    /// Any request to a cloud AI endpoint; bodyless methods are dropped later
    Provider { host: String },
    Irrelevant,
}

#[derive(Debug, Clone)]
pub struct Classifier {
    intercept_hosts: Vec<String>,
    rpc_methods: Vec<String>,
}

impl Classifier {
    pub fn new(intercept_hosts: Vec<String>, rpc_methods: Vec<String>) -> Self {
        Self {
            intercept_hosts,
            rpc_methods,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.proxy.intercept_hosts.clone(),
            config.extract.rpc_methods.clone(),
        )
    }

    pub fn classify(&self, path: TransportPath, host: &str, head: &MessageHead) -> Channel {
        if let Some(method) = head.path().and_then(|p| self.rpc_method(p)) {
            return match path {
                TransportPath::Loopback => Channel::Rpc { method },
                TransportPath::Mitm if host_in(host, &self.intercept_hosts) => Channel::Rpc { method },
                TransportPath::Mitm => Channel::Irrelevant,
            };
        }

        match path {
            TransportPath::Mitm if host_in(host, &self.intercept_hosts) => {
                Channel::Provider {
                    host: host.to_string(),
                }
            }
            _ => Channel::Irrelevant,
        }
    }

    /// Configured RPC method the request path ends in
    fn rpc_method(&self, path: &str) -> Option<String> {
        let last = path.trim_end_matches('/').rsplit('/').next()?;
        self.rpc_methods
            .iter()
            .find(|m| m.as_str() == last)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reassembly::http::parse_head;

    fn classifier() -> Classifier {
        Classifier::new(
            vec!["api.openai.com".into(), "*.codeium.com".into()],
            vec!["SendUserCascadeMessage".into()],
        )
    }

    fn request(line: &str) -> MessageHead {
        parse_head(format!("{line}\r\nHost: x\r\n\r\n").as_bytes()).unwrap()
    }

    #[test]
    fn test_loopback_rpc_method() {
        let head = request(
            "POST /exa.language_server_pb.LanguageServerService/SendUserCascadeMessage HTTP/1.1",
        );
        assert_eq!(
            classifier().classify(TransportPath::Loopback, "127.0.0.1", &head),
            Channel::Rpc {
                method: "SendUserCascadeMessage".into()
            }
        );
    }

    #[test]
    fn test_loopback_unknown_method_is_irrelevant() {
        let head = request("POST /exa.language_server_pb.LanguageServerService/Heartbeat HTTP/1.1");
        assert_eq!(
            classifier().classify(TransportPath::Loopback, "127.0.0.1", &head),
            Channel::Irrelevant
        );
    }

    #[test]
    fn test_mitm_intercept_host() {
        let c = classifier();
        assert_eq!(
            c.classify(TransportPath::Mitm, "api.openai.com", &request("POST /v1/chat/completions HTTP/1.1")),
            Channel::Provider {
                host: "api.openai.com".into()
            }
        );
        assert_eq!(
            c.classify(TransportPath::Mitm, "api.openai.com", &request("GET /v1/models HTTP/1.1")),
            Channel::Provider {
                host: "api.openai.com".into()
            }
        );
        assert_eq!(
            c.classify(TransportPath::Mitm, "example.com", &request("POST /v1/chat HTTP/1.1")),
            Channel::Irrelevant
        );
    }

    #[test]
    fn test_mitm_cascade_rpc_on_cloud_host() {
        let head = request("POST /exa.api_server_pb.ApiServerService/SendUserCascadeMessage HTTP/1.1");
        assert_eq!(
            classifier().classify(TransportPath::Mitm, "server.codeium.com", &head),
            Channel::Rpc {
                method: "SendUserCascadeMessage".into()
            }
        );
    }
}
