//! Git source resolution
//!
//! Only the remote ref advertisement is read; nothing is cloned. The build
//! Job's init container fetches the resolved commit itself.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use git2::{Cred, Direction, ErrorClass, ErrorCode, Remote, RemoteCallbacks};
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

use serverless_common::crd::{Function, RepositoryAuthType};
use serverless_common::Error;

use crate::client::KubeClient;
use crate::config::RequeueConfig;
use crate::docker::secret_strings;

/// Credentials for a git remote
#[derive(Clone, PartialEq, Eq)]
pub struct GitAuth {
    /// Authentication method
    pub type_: RepositoryAuthType,
    /// Secret data as strings
    pub credentials: BTreeMap<String, String>,
    /// Secret the credentials were read from
    pub secret_name: String,
}

impl std::fmt::Debug for GitAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitAuth")
            .field("type_", &self.type_)
            .field("secret_name", &self.secret_name)
            .finish_non_exhaustive()
    }
}

/// What to resolve
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GitOptions {
    /// Repository URL
    pub url: String,
    /// Branch, tag or full commit id
    pub reference: String,
    /// Optional credentials
    pub auth: Option<GitAuth>,
}

/// Source resolution failures, classified by how soon a retry can succeed
#[derive(Debug, Error)]
pub enum SourceError {
    /// The remote rejected the credentials
    #[error("authorization failed: {0}")]
    Auth(String),

    /// Retrying without a spec change cannot succeed
    #[error("{0}")]
    NotRecoverable(String),

    /// Network and server-side failures
    #[error("{0}")]
    Transient(String),
}

impl From<git2::Error> for SourceError {
    fn from(e: git2::Error) -> Self {
        match (e.code(), e.class()) {
            (ErrorCode::Auth, _) | (ErrorCode::Certificate, _) => Self::Auth(e.message().to_string()),
            (ErrorCode::NotFound, _) | (ErrorCode::InvalidSpec, _) => {
                Self::NotRecoverable(e.message().to_string())
            }
            (_, ErrorClass::Invalid) => Self::NotRecoverable(e.message().to_string()),
            _ => Self::Transient(e.message().to_string()),
        }
    }
}

/// Requeue delay and condition message for a resolver failure
pub fn next_requeue(err: &SourceError, requeue: &RequeueConfig) -> (Duration, String) {
    match err {
        SourceError::NotRecoverable(_) => (
            requeue.source_error,
            format!("Stop reconciliation, reason: {err}"),
        ),
        SourceError::Auth(_) => (
            requeue.git_fetch,
            "Authorization to git server failed".to_string(),
        ),
        SourceError::Transient(_) => (
            requeue.git_fetch,
            format!("Sources update failed, reason: {err}"),
        ),
    }
}

/// Resolve a git reference to a commit id
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SourceResolver: Send + Sync {
    /// Commit the reference currently points at
    async fn last_commit(&self, options: &GitOptions) -> Result<String, SourceError>;
}

/// Read git options from the Function spec and its auth Secret
pub async fn read_git_options(
    client: &dyn KubeClient,
    function: &Function,
    namespace: &str,
) -> Result<GitOptions, Error> {
    let Some(git) = function.spec.source.git_repository.as_ref() else {
        return Err(Error::validation("Function has no git repository"));
    };

    let auth = match &git.auth {
        Some(auth) => {
            let secret = client
                .get_secret(namespace, &auth.secret_name)
                .await?
                .ok_or_else(|| {
                    Error::validation(format!(
                        "secret {}/{} not found",
                        namespace, auth.secret_name
                    ))
                })?;
            Some(GitAuth {
                type_: auth.type_,
                credentials: secret_strings(&secret),
                secret_name: auth.secret_name.clone(),
            })
        }
        None => None,
    };

    if git.reference.is_empty() {
        return Err(Error::validation("reference has to be specified"));
    }

    Ok(GitOptions {
        url: git.url.clone(),
        reference: git.reference.clone(),
        auth,
    })
}

/// [`SourceResolver`] listing remote refs with libgit2
#[derive(Clone, Copy, Debug, Default)]
pub struct Git2Resolver;

#[async_trait]
impl SourceResolver for Git2Resolver {
    async fn last_commit(&self, options: &GitOptions) -> Result<String, SourceError> {
        if is_commit_id(&options.reference) {
            return Ok(options.reference.clone());
        }
        let options = options.clone();
        tokio::task::spawn_blocking(move || list_and_match(&options))
            .await
            .map_err(|e| SourceError::Transient(format!("resolver task failed: {e}")))?
    }
}

fn is_commit_id(reference: &str) -> bool {
    reference.len() == 40 && reference.chars().all(|c| c.is_ascii_hexdigit())
}

fn callbacks(auth: Option<&GitAuth>) -> RemoteCallbacks<'_> {
    let mut callbacks = RemoteCallbacks::new();
    let Some(auth) = auth else {
        return callbacks;
    };
    callbacks.credentials(move |_url, username_from_url, _allowed| {
        let get = |key: &str| auth.credentials.get(key).map(String::as_str);
        match auth.type_ {
            RepositoryAuthType::Basic => Cred::userpass_plaintext(
                get("username").unwrap_or_default(),
                get("password").unwrap_or_default(),
            ),
            RepositoryAuthType::Key => Cred::ssh_key_from_memory(
                username_from_url.unwrap_or("git"),
                None,
                get("key").unwrap_or_default(),
                get("password"),
            ),
        }
    });
    callbacks
}

fn list_and_match(options: &GitOptions) -> Result<String, SourceError> {
    let mut remote = Remote::create_detached(options.url.as_str())?;
    let connection =
        remote.connect_auth(Direction::Fetch, Some(callbacks(options.auth.as_ref())), None)?;
    let refs: Vec<(String, String)> = connection
        .list()?
        .iter()
        .map(|head| (head.name().to_string(), head.oid().to_string()))
        .collect();
    match_reference(&refs, &options.reference).ok_or_else(|| {
        SourceError::NotRecoverable(format!(
            "reference {} not found in {}",
            options.reference, options.url
        ))
    })
}

/// Commit for `reference` among advertised `(name, oid)` pairs
///
/// Branches win over tags. Annotated tags resolve to the peeled commit.
fn match_reference(refs: &[(String, String)], reference: &str) -> Option<String> {
    let find = |name: &str| {
        refs.iter()
            .find(|(n, _)| n == name)
            .map(|(_, oid)| oid.clone())
    };
    find(&format!("refs/heads/{reference}"))
        .or_else(|| find(&format!("refs/tags/{reference}^{{}}")))
        .or_else(|| find(&format!("refs/tags/{reference}")))
}
