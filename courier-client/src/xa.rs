//! XA resource of an XA session.

use crate::{connection::ConnectionShared, interceptor::SessionInterceptor};
use courier_core::{Result, Xid};
use std::{fmt, sync::Arc};
use tracing::debug;

/// Two-phase commit participant bound to one XA session.
///
/// Work done while the session is associated with a branch is staged in that
/// branch. Committing releases its acknowledged deliveries; rolling back hands
/// them back to their consumers.
#[derive(Clone)]
pub struct XaResource {
    session: Arc<SessionInterceptor>,
    connection: Arc<ConnectionShared>,
}

impl XaResource {
    pub(crate) fn new(session: Arc<SessionInterceptor>, connection: Arc<ConnectionShared>) -> Self {
        Self { session, connection }
    }

    /// Associate the session with a new branch.
    ///
    /// # Errors
    /// Returns `IllegalState` if the branch exists or the session is busy with another.
    pub fn start(&self, xid: &Xid) -> Result<()> {
        self.session.start_branch(xid)?;
        debug!(%xid, "Started XA branch");
        Ok(())
    }

    /// End the association with `xid`; `failed` marks the branch rollback-only.
    ///
    /// # Errors
    /// Returns `IllegalState` if the session is not associated with `xid`.
    pub fn end(&self, xid: &Xid, failed: bool) -> Result<()> {
        self.session.end_branch(xid, failed)
    }

    /// Prepare the branch on the server.
    ///
    /// # Errors
    /// Returns `IllegalState` unless the branch was ended successfully.
    pub async fn prepare(&self, xid: &Xid) -> Result<()> {
        let connection = self.connection.delegate();
        self.session.resource_manager().prepare(xid, connection.as_ref()).await
    }

    /// Commit the branch, in one phase straight from ended, or after prepare.
    ///
    /// # Errors
    /// Returns `IllegalState` for calls out of order, or the server's error.
    pub async fn commit(&self, xid: &Xid, one_phase: bool) -> Result<()> {
        let connection = self.connection.delegate();
        let acks = self.session.resource_manager().commit(xid, one_phase, connection.as_ref()).await?;
        self.session.complete(&acks, false);
        Ok(())
    }

    /// Roll the branch back and redeliver what it received.
    ///
    /// # Errors
    /// Returns the server's error for a prepared or unknown branch.
    pub async fn rollback(&self, xid: &Xid) -> Result<()> {
        let connection = self.connection.delegate();
        let acks = self.session.resource_manager().rollback(xid, connection.as_ref()).await?;
        self.session.complete(&acks, true);
        Ok(())
    }

    /// Prepared branches awaiting resolution on the server.
    ///
    /// # Errors
    /// Returns the server's error.
    pub async fn recover(&self) -> Result<Vec<Xid>> {
        let connection = self.connection.delegate();
        self.session.resource_manager().recover(connection.as_ref()).await
    }
}

impl fmt::Debug for XaResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XaResource").field("session", &self.session).finish()
    }
}
