//! Lookups into the chat orchestrator's account table.

use std::future::Future;
use std::pin::Pin;

use anyhow::Result;

use crate::db::Db;

/// External user directory consulted by the identity resolver.
pub trait UserDirectory: Send + Sync {
    /// Resolve a user id carried in a token to that user's email.
    fn lookup_email_by_user_id<'a>(
        &'a self,
        user_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + 'a>>;

    /// Whether the account with this email holds the global admin role.
    fn is_global_admin<'a>(
        &'a self,
        email: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>>;
}

/// User directory backed by the `user` table.
pub struct UserStore {
    db: Db,
}

impl UserStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    async fn email_for(&self, user_id: &str) -> Result<Option<String>> {
        let mut res = self
            .db
            .query("SELECT VALUE email FROM user WHERE user_id = $user_id LIMIT 1")
            .bind(("user_id", user_id.to_string()))
            .await?;

        let emails: Vec<String> = res.take(0)?;
        Ok(emails.into_iter().find(|e| !e.is_empty()))
    }

    async fn role_for(&self, email: &str) -> Result<Option<String>> {
        let mut res = self
            .db
            .query("SELECT VALUE role FROM user WHERE email = $email LIMIT 1")
            .bind(("email", email.trim().to_lowercase()))
            .await?;

        let roles: Vec<String> = res.take(0)?;
        Ok(roles.into_iter().next())
    }
}

impl UserDirectory for UserStore {
    fn lookup_email_by_user_id<'a>(
        &'a self,
        user_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + 'a>> {
        Box::pin(self.email_for(user_id))
    }

    fn is_global_admin<'a>(
        &'a self,
        email: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>> {
        Box::pin(async move { Ok(self.role_for(email).await?.as_deref() == Some("admin")) })
    }
}
