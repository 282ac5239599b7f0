//! Forum thread listings published as RSS 2.0.

use log::warn;
use serde::Deserialize;

use crate::error::Result;
use crate::feed::{FeedItem, FeedParser};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForumThread {
    pub guid: u64,
    pub title: String,
    pub link: String,
    pub forum: Option<String>,
    pub author: Option<String>,
    pub published: Option<String>,
}

impl FeedItem for ForumThread {
    fn id(&self) -> u64 {
        self.guid
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ForumThreadParser;

impl FeedParser for ForumThreadParser {
    type Item = ForumThread;

    fn parse(&self, content: &str) -> Result<Vec<ForumThread>> {
        let rss: Rss = quick_xml::de::from_str(content)?;
        Ok(rss
            .channel
            .items
            .into_iter()
            .filter_map(RawItem::into_thread)
            .collect())
    }
}

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    items: Vec<RawItem>,
}

#[derive(Debug, Deserialize)]
struct RawItem {
    title: Option<String>,
    link: Option<String>,
    guid: Option<Text>,
    #[serde(default)]
    category: Vec<Text>,
    #[serde(rename = "dc:creator", alias = "creator")]
    creator: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
}

/// Element text, ignoring attributes such as `isPermaLink` or `domain`.
#[derive(Debug, Deserialize)]
struct Text {
    #[serde(rename = "$text", default)]
    value: String,
}

impl RawItem {
    fn into_thread(self) -> Option<ForumThread> {
        let raw_guid = self.guid.map(|g| g.value).unwrap_or_default();
        let Ok(guid) = raw_guid.trim().parse::<u64>() else {
            warn!("Skipping thread with non-numeric guid {raw_guid:?}");
            return None;
        };

        Some(ForumThread {
            guid,
            title: self.title.map(|t| t.trim().to_string()).unwrap_or_default(),
            link: self.link.map(|l| l.trim().to_string()).unwrap_or_default(),
            forum: self
                .category
                .into_iter()
                .map(|c| c.value.trim().to_string())
                .find(|c| !c.is_empty()),
            author: self.creator,
            published: self.pub_date,
        })
    }
}
