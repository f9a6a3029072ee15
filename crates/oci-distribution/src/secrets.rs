//! Types for working with registry access secrets

/// A method for authenticating to a registry
#[derive(Clone, PartialEq, Eq)]
pub enum RegistryAuth {
    /// Access the registry anonymously
    Anonymous,
    /// Access the registry using HTTP Basic authentication
    Basic(String, String),
}

impl std::fmt::Debug for RegistryAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryAuth::Anonymous => write!(f, "Anonymous"),
            RegistryAuth::Basic(user, _) => write!(f, "Basic({}, <redacted>)", user),
        }
    }
}

pub(crate) trait Authenticable {
    fn apply_authentication(self, auth: &RegistryAuth) -> Self;
}

impl Authenticable for reqwest::RequestBuilder {
    fn apply_authentication(self, auth: &RegistryAuth) -> Self {
        match auth {
            RegistryAuth::Anonymous => self,
            RegistryAuth::Basic(username, password) => self.basic_auth(username, Some(password)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn debug_hides_password() {
        let auth = RegistryAuth::Basic("robot".to_owned(), "hunter2".to_owned());
        let text = format!("{:?}", auth);
        assert!(text.contains("robot"));
        assert!(!text.contains("hunter2"));
    }
}
