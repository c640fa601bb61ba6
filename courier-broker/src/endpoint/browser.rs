use super::ConnectionContext;
use crate::{
    channel::Channel,
    selector::{Filter, Selector},
};
use async_trait::async_trait;
use courier_core::{delegate::BrowserDelegate, types::BrowserId, Message, Result};
use parking_lot::Mutex;
use std::{collections::VecDeque, sync::Arc};

/// Server side of a queue browser.
///
/// Iterates a snapshot taken at creation or on [`BrowserDelegate::reset`];
/// browsing never consumes.
pub struct ServerBrowser {
    id: BrowserId,
    channel: Channel,
    selector: Option<Selector>,
    context: Arc<ConnectionContext>,
    snapshot: Mutex<VecDeque<Arc<Message>>>,
}

impl ServerBrowser {
    pub(crate) fn new(
        id: BrowserId,
        channel: Channel,
        selector: Option<Selector>,
        context: Arc<ConnectionContext>,
    ) -> Result<Self> {
        let browser = Self { id, channel, selector, context, snapshot: Mutex::new(VecDeque::new()) };
        browser.refresh()?;
        Ok(browser)
    }

    fn refresh(&self) -> Result<()> {
        let filter = self.selector.as_ref().map(|s| s as &dyn Filter);
        let messages = self.channel.browse(filter)?;
        *self.snapshot.lock() = messages.into();
        Ok(())
    }
}

#[async_trait]
impl BrowserDelegate for ServerBrowser {
    fn browser_id(&self) -> BrowserId {
        self.id
    }

    async fn has_next(&self) -> Result<bool> {
        self.context.ensure_open()?;
        Ok(!self.snapshot.lock().is_empty())
    }

    async fn next_messages(&self, max: usize) -> Result<Vec<Message>> {
        self.context.ensure_open()?;
        let mut snapshot = self.snapshot.lock();
        let count = max.min(snapshot.len());
        Ok(snapshot.drain(..count).map(|message| Message::clone(&message)).collect())
    }

    async fn reset(&self) -> Result<()> {
        self.context.ensure_open()?;
        self.refresh()
    }

    async fn close(&self) -> Result<()> {
        self.snapshot.lock().clear();
        Ok(())
    }
}
