//! SOCKS5 method negotiation
//!
//! The server front end picks one [`Authenticator`] at startup and runs it
//! against every client before any stream is opened for that client.

mod password;

pub use password::PasswordAuth;

use super::consts::*;
use crate::error::Socks5Error;
use anyhow::{bail, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Authentication method types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    /// No authentication required
    None,
    /// Username/password authentication
    Password,
}

impl AuthMethod {
    /// Convert to SOCKS5 method byte
    pub fn to_byte(self) -> u8 {
        match self {
            AuthMethod::None => SOCKS5_AUTH_METHOD_NONE,
            AuthMethod::Password => SOCKS5_AUTH_METHOD_PASSWORD,
        }
    }
}

/// The authenticator the SOCKS5 listener applies to every client
#[derive(Clone, PartialEq, Eq)]
pub enum Authenticator {
    /// Accept clients offering "no authentication"
    NoAuth,
    /// Require RFC 1929 username/password matching this pair
    UserPass {
        /// Expected username
        username: String,
        /// Expected password
        password: String,
    },
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Authenticator::NoAuth => f.write_str("NoAuth"),
            Authenticator::UserPass { username, .. } => f
                .debug_struct("UserPass")
                .field("username", username)
                .finish_non_exhaustive(),
        }
    }
}

impl Authenticator {
    /// Pick the authenticator from an optional credential pair
    pub fn from_credentials(credentials: Option<(String, String)>) -> Self {
        match credentials {
            Some((username, password)) => Authenticator::UserPass { username, password },
            None => Authenticator::NoAuth,
        }
    }

    /// The method this authenticator accepts
    pub fn method(&self) -> AuthMethod {
        match self {
            Authenticator::NoAuth => AuthMethod::None,
            Authenticator::UserPass { .. } => AuthMethod::Password,
        }
    }

    /// Run method negotiation and, for `UserPass`, the credential check
    ///
    /// A client that does not offer the configured method gets `0xFF` and an
    /// error. Wrong credentials get the RFC 1929 failure status.
    pub async fn negotiate<S>(&self, stream: &mut S) -> Result<AuthMethod>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await?;

        let version = buf[0];
        let num_methods = buf[1];

        if version != SOCKS5_VERSION {
            bail!(Socks5Error::UnsupportedVersion(version));
        }

        let mut methods = vec![0u8; num_methods as usize];
        stream.read_exact(&mut methods).await?;

        let method = self.method();
        if !methods.contains(&method.to_byte()) {
            stream
                .write_all(&[SOCKS5_VERSION, SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE])
                .await?;
            stream.flush().await?;
            bail!(Socks5Error::NoAcceptableMethod);
        }

        stream.write_all(&[SOCKS5_VERSION, method.to_byte()]).await?;
        stream.flush().await?;

        if let Authenticator::UserPass { username, password } = self {
            PasswordAuth::authenticate(stream, username, password).await?;
        }

        Ok(method)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    #[test]
    fn test_from_credentials() {
        assert_eq!(Authenticator::from_credentials(None), Authenticator::NoAuth);
        let auth = Authenticator::from_credentials(Some(("user".into(), "pass".into())));
        assert_eq!(auth.method(), AuthMethod::Password);
    }

    #[test]
    fn test_debug_hides_password() {
        let auth = Authenticator::from_credentials(Some(("user".into(), "hunter2".into())));
        let printed = format!("{:?}", auth);
        assert!(printed.contains("user"));
        assert!(!printed.contains("hunter2"));
    }

    #[tokio::test]
    async fn test_no_auth_negotiation() {
        let mut stream = Builder::new()
            .read(&[SOCKS5_VERSION, 2, SOCKS5_AUTH_METHOD_PASSWORD, SOCKS5_AUTH_METHOD_NONE])
            .write(&[SOCKS5_VERSION, SOCKS5_AUTH_METHOD_NONE])
            .build();

        let method = Authenticator::NoAuth.negotiate(&mut stream).await.unwrap();
        assert_eq!(method, AuthMethod::None);
    }

    #[tokio::test]
    async fn test_no_acceptable_method() {
        let mut stream = Builder::new()
            .read(&[SOCKS5_VERSION, 1, SOCKS5_AUTH_METHOD_NONE])
            .write(&[SOCKS5_VERSION, SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE])
            .build();

        let auth = Authenticator::from_credentials(Some(("user".into(), "pass".into())));
        let err = auth.negotiate(&mut stream).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Socks5Error>(),
            Some(Socks5Error::NoAcceptableMethod)
        ));
    }

    #[tokio::test]
    async fn test_password_negotiation() {
        let mut stream = Builder::new()
            .read(&[SOCKS5_VERSION, 1, SOCKS5_AUTH_METHOD_PASSWORD])
            .write(&[SOCKS5_VERSION, SOCKS5_AUTH_METHOD_PASSWORD])
            .read(&[SOCKS5_AUTH_VERSION, 4])
            .read(b"user")
            .read(&[4])
            .read(b"pass")
            .write(&[SOCKS5_AUTH_VERSION, SOCKS5_AUTH_SUCCESS])
            .build();

        let auth = Authenticator::from_credentials(Some(("user".into(), "pass".into())));
        assert_eq!(auth.negotiate(&mut stream).await.unwrap(), AuthMethod::Password);
    }

    #[tokio::test]
    async fn test_rejects_socks4() {
        let mut stream = Builder::new().read(&[0x04, 1]).build();
        let err = Authenticator::NoAuth.negotiate(&mut stream).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Socks5Error>(),
            Some(Socks5Error::UnsupportedVersion(4))
        ));
    }
}
