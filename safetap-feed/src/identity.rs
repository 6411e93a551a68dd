/// Who is chatting
use uuid::Uuid;

const ANONYMOUS_NAME: &str = "Guest";
const NAME_ID_CHARS: usize = 8;

/// Stable participant id plus a human readable name
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct Identity {
    pub id: String,
    pub name: String,
}

impl Identity {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    /// Signed-in participant, named after the start of its id
    pub fn authenticated(uid: impl Into<String>) -> Self {
        let id = uid.into();
        let short: String = id.chars().take(NAME_ID_CHARS).collect();
        Self {
            name: format!("User {short}"),
            id,
        }
    }

    /// Participant with a random id for this session only
    pub fn anonymous() -> Self {
        Self::new(Uuid::new_v4().to_string(), ANONYMOUS_NAME)
    }
}

/// Supplies the identity used for sends and for telling own messages apart
pub trait IdentityProvider: Send + Sync {
    fn identity(&self) -> Identity;
}

/// Provider that always hands out the same identity
#[derive(Clone, Debug)]
pub struct StaticIdentity(Identity);

impl StaticIdentity {
    pub fn new(identity: Identity) -> Self {
        Self(identity)
    }

    /// Authenticated when a uid is configured, anonymous otherwise
    pub fn resolve(uid: Option<&str>) -> Self {
        match uid.map(str::trim).filter(|uid| !uid.is_empty()) {
            Some(uid) => Self(Identity::authenticated(uid)),
            None => Self(Identity::anonymous()),
        }
    }
}

impl IdentityProvider for StaticIdentity {
    fn identity(&self) -> Identity {
        self.0.clone()
    }
}

#[cfg(test)]
mod test {
    use super::{Identity, IdentityProvider, StaticIdentity};

    #[test]
    fn test_authenticated_name() {
        let identity = Identity::authenticated("a1b2c3d4e5f6");
        assert_eq!(identity.id, "a1b2c3d4e5f6");
        assert_eq!(identity.name, "User a1b2c3d4");
        assert_eq!(Identity::authenticated("abc").name, "User abc");
    }

    #[test]
    fn test_anonymous_ids_differ() {
        let first = Identity::anonymous();
        let second = Identity::anonymous();
        assert_eq!(first.name, "Guest");
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn test_static_identity_is_stable() {
        let provider = StaticIdentity::resolve(None);
        assert_eq!(provider.identity(), provider.identity());
        let provider = StaticIdentity::resolve(Some("  "));
        assert_eq!(provider.identity().name, "Guest");
        let provider = StaticIdentity::resolve(Some("uid-12345678"));
        assert_eq!(provider.identity().name, "User uid-1234");
    }
}
