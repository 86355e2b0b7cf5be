//! Identity of a simulated endpoint
//!
//! Every endpoint has a public URI (its address-of-record), the private
//! identity and password it would authenticate with, an instance ID
//! (RFC 5626 `+sip.instance`) and a contact address unique to the endpoint.
//! Public identities sharing a subscriber (see
//! [`EndpointIdentity::public_identity`]) keep the private identity, password
//! and instance ID of the primary endpoint but get their own URI and contact.
//!
//! # Examples
//!
//! ```rust
//! use sipdrill_scenario_core::endpoint::EndpointIdentity;
//!
//! let ep1 = EndpointIdentity::new("6505550001", "sipdrill.test");
//! assert_eq!(ep1.uri, "sip:6505550001@sipdrill.test");
//! assert_eq!(ep1.private_id, "6505550001@sipdrill.test");
//! assert!(ep1.expected_pub_gruu().starts_with("sip:6505550001@sipdrill.test;gr=urn:uuid:"));
//!
//! let ep2 = ep1.public_identity("6505550002");
//! assert_eq!(ep2.private_id, ep1.private_id);
//! assert_eq!(ep2.instance_id, ep1.instance_id);
//! assert_ne!(ep2.contact, ep1.contact);
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who an endpoint is and where it can be reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointIdentity {
    /// Public identity, `sip:<user>@<domain>`
    pub uri: String,
    /// Private identity used for authentication
    pub private_id: String,
    pub password: String,
    /// Value of `+sip.instance` on registered contacts
    pub instance_id: Uuid,
    /// Contact address, unique per endpoint
    pub contact: String,
}

impl EndpointIdentity {
    pub fn new(user: &str, domain: &str) -> Self {
        Self {
            uri: format!("sip:{}@{}", user, domain),
            private_id: format!("{}@{}", user, domain),
            password: format!("{:08x}{:08x}", rand::random::<u32>(), rand::random::<u32>()),
            instance_id: Uuid::new_v4(),
            contact: Self::contact_for(user),
        }
    }

    fn contact_for(user: &str) -> String {
        let simple = Uuid::new_v4().simple().to_string();
        format!("sip:{}@ue-{}.invalid", user, &simple[..12])
    }

    /// Another public identity of the same subscriber
    pub fn public_identity(&self, user: &str) -> Self {
        let domain = self.uri.rsplit_once('@').map_or("", |(_, d)| d);
        Self {
            uri: format!("sip:{}@{}", user, domain),
            private_id: self.private_id.clone(),
            password: self.password.clone(),
            instance_id: self.instance_id,
            contact: Self::contact_for(user),
        }
    }

    /// User part of the public URI
    pub fn user(&self) -> &str {
        self.uri
            .strip_prefix("sip:")
            .unwrap_or(&self.uri)
            .split('@')
            .next()
            .unwrap_or_default()
    }

    /// Host of the contact address
    pub fn contact_host(&self) -> &str {
        self.contact.rsplit_once('@').map_or(&self.contact, |(_, host)| host)
    }

    /// Contact header value carrying the instance ID
    pub fn contact_header(&self) -> String {
        format!("<{}>;+sip.instance=\"<urn:uuid:{}>\"", self.contact, self.instance_id)
    }

    /// Public GRUU the registrar is expected to assign (RFC 5627)
    pub fn expected_pub_gruu(&self) -> String {
        format!("{};gr=urn:uuid:{}", self.uri, self.instance_id)
    }
}
