use async_trait::async_trait;
use log::{debug, info};
use serde::Deserialize;
use std::collections::HashSet;

use super::{Destination, group_thousands};
use crate::detect::ChangedValue;
use crate::error::Result;
use crate::metrics;
use crate::watcher::DataHandler;
use crate::webhook::{Embed, GREEN};

const HANDLER: &str = "fire-sales";

#[derive(Debug, Deserialize)]
struct FireSales {
    #[serde(default)]
    sales: Vec<Sale>,
}

#[derive(Debug, Clone, Deserialize)]
struct Sale {
    item_id: String,
    /// Epoch milliseconds.
    start: i64,
    end: i64,
    amount: i64,
    price: i64,
}

/// Announces fire sales that were not listed in the previous document.
#[derive(Debug, Clone)]
pub struct FireSaleHandler {
    destination: Destination,
}

impl FireSaleHandler {
    #[must_use]
    pub fn new(destination: Destination) -> FireSaleHandler {
        FireSaleHandler { destination }
    }
}

#[async_trait]
impl DataHandler for FireSaleHandler {
    async fn handle_data(
        &self,
        old: Option<&str>,
        new: &str,
        changes: &[ChangedValue],
    ) -> Result<()> {
        metrics::record_data_change(HANDLER);
        info!("Fire sale data changed!");
        debug!("Changed values: {changes:?}");
        let Some(old) = old else {
            return Ok(());
        };
        let old: FireSales = serde_json::from_str(old)?;
        let new: FireSales = serde_json::from_str(new)?;

        let added = new_sales(&old.sales, new.sales);
        if added.is_empty() {
            info!("No new sale data found!");
            return Ok(());
        }

        let mut embed = Embed::new(Some("New Fire Sale!"), None, None, GREEN);
        for sale in &added {
            info!("Found new sale data for item {}!", sale.item_id);
            embed.add_field(&sale.item_id, describe(sale), false);
        }

        self.destination
            .send(HANDLER, self.destination.mention.as_deref(), vec![embed])
            .await
    }
}

/// Sales in `new` whose `item_id` is absent from `old`, in `new` order.
fn new_sales(old: &[Sale], new: Vec<Sale>) -> Vec<Sale> {
    let known: HashSet<&str> = old.iter().map(|s| s.item_id.as_str()).collect();
    new.into_iter()
        .filter(|s| !known.contains(s.item_id.as_str()))
        .collect()
}

fn describe(sale: &Sale) -> String {
    let start = sale.start / 1000;
    let end = sale.end / 1000;
    format!(
        "Start Time: <t:{start}:F> (<t:{start}:R>)\n\
         End Time: <t:{end}:F> (<t:{end}:R>)\n\
         Amount: {}x\n\
         Price: {} SkyBlock Gems",
        group_thousands(sale.amount),
        group_thousands(sale.price)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockServer, Reply};
    use crate::webhook::Notifier;
    use serde_json::Value;

    fn sale(item_id: &str) -> String {
        format!(
            concat!(
                r#"{{"item_id":"{}","start":1700000000000,"#,
                r#""end":1700086400000,"amount":5000,"price":1250}}"#
            ),
            item_id
        )
    }

    fn document(items: &[&str]) -> String {
        let sales: Vec<String> = items.iter().map(|id| sale(id)).collect();
        format!(r#"{{"success":true,"sales":[{}]}}"#, sales.join(","))
    }

    fn handler(server: &MockServer) -> FireSaleHandler {
        FireSaleHandler::new(Destination {
            notifier: Notifier::default(),
            webhook_url: Some(server.url()),
            mention: Some("<@&77>".into()),
        })
    }

    #[tokio::test]
    async fn test_only_unseen_items_are_announced() {
        let server = MockServer::start(vec![Reply::status(204, "")]).await;
        let handler = handler(&server);

        handler
            .handle_data(
                Some(document(&["PET_SKIN_A", "HAT_B"]).as_str()),
                &document(&["HAT_B", "RUNE_C", "PET_SKIN_A", "DYE_D"]),
                &[],
            )
            .await
            .unwrap();

        let body: Value = serde_json::from_str(&server.requests()[0].body).unwrap();
        assert_eq!(body["content"], "<@&77>");
        let fields = body["embeds"][0]["fields"].as_array().unwrap();
        let names: Vec<&str> = fields.iter().map(|f| f["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["RUNE_C", "DYE_D"]);
        let value = fields[0]["value"].as_str().unwrap();
        assert!(value.contains("<t:1700000000:F>"));
        assert!(value.contains("Amount: 5,000x"));
        assert!(value.contains("Price: 1,250 SkyBlock Gems"));
    }

    #[tokio::test]
    async fn test_removed_items_alone_send_nothing() {
        let server = MockServer::start(vec![Reply::status(204, "")]).await;
        let handler = handler(&server);

        handler
            .handle_data(Some(document(&["A", "B"]).as_str()), &document(&["B"]), &[])
            .await
            .unwrap();

        assert_eq!(server.hits(), 0);
    }

    #[tokio::test]
    async fn test_first_document_is_counted_but_sends_nothing() {
        let server = MockServer::start(vec![Reply::status(204, "")]).await;
        let handler = handler(&server);
        let changes = metrics::DATA_CHANGES_DETECTED.with_label_values(&[HANDLER]);
        let before = changes.get();

        handler.handle_data(None, &document(&["A"]), &[]).await.unwrap();

        assert_eq!(server.hits(), 0);
        assert!(changes.get() > before);
    }

    #[tokio::test]
    async fn test_malformed_document_is_an_error() {
        let server = MockServer::start(vec![Reply::status(204, "")]).await;
        let handler = handler(&server);

        let result = handler.handle_data(Some("{}"), "[", &[]).await;

        assert!(result.unwrap_err().is_parse());
        assert_eq!(server.hits(), 0);
    }
}
