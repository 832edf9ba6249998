//! Signed registration attestations published to the Almanac.

use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::identity::{verify_digest, Identity};
use crate::model::canonical_json;

/// A network endpoint and its selection weight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentEndpoint {
    pub url: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

impl AgentEndpoint {
    pub fn new(url: impl Into<String>, weight: u32) -> Self {
        Self {
            url: url.into(),
            weight,
        }
    }
}

/// An agent's claim to a set of endpoints and protocols.
///
/// Fields are normalized on construction (protocols sorted and deduplicated,
/// endpoints sorted by URL) so the digest does not depend on input order.
/// `sequence` must grow with every new registration of the same address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub agent_address: String,
    pub endpoints: Vec<AgentEndpoint>,
    pub protocols: Vec<String>,
    pub sequence: u64,
    #[serde(default)]
    pub signature: Option<String>,
}

impl AgentRegistration {
    pub fn new(
        agent_address: impl Into<String>,
        mut endpoints: Vec<AgentEndpoint>,
        mut protocols: Vec<String>,
        sequence: u64,
    ) -> Self {
        endpoints.sort_by(|a, b| a.url.cmp(&b.url).then(a.weight.cmp(&b.weight)));
        endpoints.dedup();
        protocols.sort();
        protocols.dedup();
        Self {
            agent_address: agent_address.into(),
            endpoints,
            protocols,
            sequence,
            signature: None,
        }
    }

    pub fn digest(&self) -> [u8; 32] {
        let endpoints: Vec<_> = self
            .endpoints
            .iter()
            .map(|e| json!({"url": e.url, "weight": e.weight}))
            .collect();
        let unsigned = json!({
            "agent_address": self.agent_address,
            "endpoints": endpoints,
            "protocols": self.protocols,
            "sequence": self.sequence,
        });
        Sha256::digest(canonical_json(&unsigned).as_bytes()).into()
    }

    pub fn sign(&mut self, identity: &Identity) {
        self.signature = Some(identity.sign_digest(&self.digest()));
    }

    /// False when unsigned or when the signature does not match the address.
    pub fn verify(&self) -> bool {
        match &self.signature {
            Some(signature) => verify_digest(&self.agent_address, &self.digest(), signature),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(identity: &Identity) -> AgentRegistration {
        AgentRegistration::new(
            identity.address(),
            vec![
                AgentEndpoint::new("http://b:8000/submit", 1),
                AgentEndpoint::new("http://a:8000/submit", 2),
            ],
            vec!["proto:2".to_string(), "proto:1".to_string(), "proto:2".to_string()],
            7,
        )
    }

    #[test]
    fn test_fields_are_normalized() {
        let id = Identity::from_seed("registrar", 0).unwrap();
        let reg = registration(&id);
        assert_eq!(reg.protocols, vec!["proto:1", "proto:2"]);
        assert_eq!(reg.endpoints[0].url, "http://a:8000/submit");
    }

    #[test]
    fn test_digest_is_order_independent() {
        let id = Identity::from_seed("registrar", 0).unwrap();
        let reordered = AgentRegistration::new(
            id.address(),
            vec![
                AgentEndpoint::new("http://a:8000/submit", 2),
                AgentEndpoint::new("http://b:8000/submit", 1),
            ],
            vec!["proto:1".to_string(), "proto:2".to_string()],
            7,
        );
        assert_eq!(registration(&id).digest(), reordered.digest());
    }

    #[test]
    fn test_sign_and_verify() {
        let id = Identity::from_seed("registrar", 0).unwrap();
        let mut reg = registration(&id);
        assert!(!reg.verify());

        reg.sign(&id);
        assert!(reg.verify());

        let mut tampered = reg.clone();
        tampered.sequence += 1;
        assert!(!tampered.verify());

        let mut tampered = reg;
        tampered.endpoints.push(AgentEndpoint::new("http://evil/submit", 100));
        assert!(!tampered.verify());
    }

    #[test]
    fn test_endpoint_weight_defaults_to_one() {
        let endpoint: AgentEndpoint = serde_json::from_str(r#"{"url": "http://h"}"#).unwrap();
        assert_eq!(endpoint.weight, 1);
    }
}
