use async_trait::async_trait;
use log::debug;

use super::Destination;
use crate::error::Result;
use crate::feed::ItemHandler;
use crate::metrics;
use crate::thread::ForumThread;

const HANDLER: &str = "skyblock-updates";
const PATCH_NOTES_FORUM: &str = "SkyBlock Patch Notes";

/// Posts links to new SkyBlock threads.
#[derive(Debug, Clone)]
pub struct ForumUpdateHandler {
    destination: Destination,
}

impl ForumUpdateHandler {
    #[must_use]
    pub fn new(destination: Destination) -> ForumUpdateHandler {
        ForumUpdateHandler { destination }
    }

    fn is_relevant(thread: &ForumThread) -> bool {
        thread.forum.as_deref() == Some(PATCH_NOTES_FORUM) || thread.title.contains("SkyBlock")
    }
}

#[async_trait]
impl ItemHandler<ForumThread> for ForumUpdateHandler {
    async fn handle_item(&self, thread: &ForumThread) -> Result<()> {
        if !Self::is_relevant(thread) {
            debug!("Ignoring thread {} ({})", thread.guid, thread.title);
            return Ok(());
        }

        metrics::record_data_change(HANDLER);

        let content = match &self.destination.mention {
            Some(mention) => format!("{mention}\n\n{}", thread.link),
            None => thread.link.clone(),
        };
        self.destination.send(HANDLER, Some(&content), Vec::new()).await
    }
}
