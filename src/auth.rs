//! Long-term credential state (RFC 5389 §10.2).
//!
//! A client starts anonymous. The first 401 teaches it the server's realm
//! and nonce; from then on every request carries USERNAME, REALM, NONCE and
//! MESSAGE-INTEGRITY. A 438 only rotates the nonce. The state lives behind
//! an async lock on the client so a nonce rotation is atomic with respect to
//! the retry it triggers.

use stun_codec::rfc5389::attributes::{Fingerprint, MessageIntegrity, Nonce, Realm, Username};
use stun_codec::Message;

use crate::attr::Attribute;
use crate::Error;

pub(crate) struct AuthState {
    username: Option<Username>,
    password: String,
    realm: Option<Realm>,
    nonce: Option<Nonce>,
}

impl AuthState {
    pub(crate) fn new(username: &str, password: &str) -> Result<Self, Error> {
        let username = if username.is_empty() {
            None
        } else {
            Some(Username::new(username.to_owned())?)
        };
        Ok(Self {
            username,
            password: password.to_owned(),
            realm: None,
            nonce: None,
        })
    }

    pub(crate) fn has_credentials(&self) -> bool {
        self.username.is_some()
    }

    /// Whether the 401 bootstrap has completed.
    pub(crate) fn is_authenticated(&self) -> bool {
        self.username.is_some() && self.realm.is_some() && self.nonce.is_some()
    }

    /// Adopts the realm and nonce offered by a 401 response.
    pub(crate) fn learn(&mut self, realm: Realm, nonce: Nonce) {
        self.realm = Some(realm);
        self.nonce = Some(nonce);
    }

    /// Replaces the nonce after a 438 Stale Nonce. The realm, and therefore
    /// the derived key, is unchanged.
    pub(crate) fn rotate_nonce(&mut self, nonce: Nonce) {
        self.nonce = Some(nonce);
    }

    /// Appends the credential attributes (when authenticated) and the
    /// FINGERPRINT, which is always the final attribute.
    pub(crate) fn seal(&self, mut message: Message<Attribute>) -> Result<Message<Attribute>, Error> {
        if let (Some(username), Some(realm), Some(nonce)) =
            (&self.username, &self.realm, &self.nonce)
        {
            message.add_attribute(username.clone());
            message.add_attribute(realm.clone());
            message.add_attribute(nonce.clone());
            let integrity = MessageIntegrity::new_long_term_credential(
                &message,
                username,
                realm,
                &self.password,
            )?;
            message.add_attribute(integrity);
        }
        let fingerprint = Fingerprint::new(&message)?;
        message.add_attribute(fingerprint);
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::random;
    use stun_codec::rfc5766::attributes::RequestedTransport;
    use stun_codec::rfc5766::methods::ALLOCATE;
    use stun_codec::{MessageClass, TransactionId};

    fn allocate_request() -> Message<Attribute> {
        let mut message = Message::new(
            MessageClass::Request,
            ALLOCATE,
            TransactionId::new(random()),
        );
        message.add_attribute(RequestedTransport::new(17));
        message
    }

    #[test]
    fn anonymous_seal_adds_only_fingerprint() {
        let auth = AuthState::new("", "").unwrap();
        let message = auth.seal(allocate_request()).unwrap();
        let kinds: Vec<_> = message.attributes().cloned().collect();
        assert_eq!(kinds.len(), 2);
        assert!(matches!(kinds[0], Attribute::RequestedTransport(_)));
        assert!(matches!(kinds[1], Attribute::Fingerprint(_)));
    }

    #[test]
    fn credentials_alone_do_not_authenticate() {
        let auth = AuthState::new("user", "secret").unwrap();
        assert!(auth.has_credentials());
        assert!(!auth.is_authenticated());
        // Until the realm is learned, requests stay anonymous.
        let message = auth.seal(allocate_request()).unwrap();
        assert!(message.get_attribute::<Username>().is_none());
    }

    #[test]
    fn sealed_request_orders_integrity_before_fingerprint() {
        let mut auth = AuthState::new("user", "secret").unwrap();
        auth.learn(
            Realm::new("realm".to_owned()).unwrap(),
            Nonce::new("nonce".to_owned()).unwrap(),
        );
        assert!(auth.is_authenticated());

        let message = auth.seal(allocate_request()).unwrap();
        let attrs: Vec<_> = message.attributes().cloned().collect();
        assert!(matches!(attrs[attrs.len() - 1], Attribute::Fingerprint(_)));
        assert!(matches!(
            attrs[attrs.len() - 2],
            Attribute::MessageIntegrity(_)
        ));

        let integrity = message.get_attribute::<MessageIntegrity>().unwrap();
        let username = Username::new("user".to_owned()).unwrap();
        let realm = Realm::new("realm".to_owned()).unwrap();
        integrity
            .check_long_term_credential(&username, &realm, "secret")
            .unwrap();
    }

    #[test]
    fn nonce_rotation_keeps_realm() {
        let mut auth = AuthState::new("user", "secret").unwrap();
        auth.learn(
            Realm::new("realm".to_owned()).unwrap(),
            Nonce::new("old".to_owned()).unwrap(),
        );
        auth.rotate_nonce(Nonce::new("new".to_owned()).unwrap());

        let message = auth.seal(allocate_request()).unwrap();
        assert_eq!(message.get_attribute::<Nonce>().unwrap().value(), "new");
        assert_eq!(message.get_attribute::<Realm>().unwrap().text(), "realm");
    }
}
