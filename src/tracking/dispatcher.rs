use std::sync::Arc;

use super::session::ActiveSession;
use crate::api::{Attachment, Listing, Marketplace};
use crate::core::{ListingId, Result, UserId};
use crate::notify::format::{attachment_caption, listing_keyboard, listing_summary};
use crate::notify::{ListingLinks, Notifier};

/// Outcome of pushing one tick's new listings, in delivery order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: Vec<ListingId>,
    pub failed: Vec<ListingId>,
    /// Attachments that could not be forwarded. Their listing still counts
    /// as delivered once the summary is out.
    pub skipped_attachments: usize,
}

/// Pushes listings to the notification channel: every attachment as its own
/// document, then one summary message.
pub struct Dispatcher {
    marketplace: Arc<dyn Marketplace>,
    notifier: Arc<dyn Notifier>,
    links: ListingLinks,
}

impl Dispatcher {
    pub fn new(
        marketplace: Arc<dyn Marketplace>,
        notifier: Arc<dyn Notifier>,
        links: ListingLinks,
    ) -> Self {
        Self {
            marketplace,
            notifier,
            links,
        }
    }

    /// A failed listing never blocks the ones after it.
    pub async fn dispatch(
        &self,
        user_id: UserId,
        session: &ActiveSession,
        listings: &[Listing],
    ) -> DispatchReport {
        let mut report = DispatchReport::default();

        for listing in listings {
            match self.deliver(user_id, session, listing, &mut report).await {
                Ok(()) => {
                    tracing::info!("📨 Listing {} delivered to user {}", listing.id, user_id);
                    report.delivered.push(listing.id);
                }
                Err(e) => {
                    tracing::warn!(
                        "Delivery of listing {} to user {} failed: {}",
                        listing.id,
                        user_id,
                        e
                    );
                    report.failed.push(listing.id);
                }
            }
        }

        report
    }

    /// Only the summary decides the listing's fate, so a dead attachment link
    /// cannot make the listing retry forever.
    async fn deliver(
        &self,
        user_id: UserId,
        session: &ActiveSession,
        listing: &Listing,
        report: &mut DispatchReport,
    ) -> Result<()> {
        let caption = attachment_caption(listing);

        for attachment in &listing.files {
            if let Err(e) = self
                .forward_attachment(user_id, session, attachment, &caption)
                .await
            {
                tracing::warn!(
                    "Attachment {} of listing {} not forwarded to user {}: {}",
                    attachment.filename,
                    listing.id,
                    user_id,
                    e
                );
                report.skipped_attachments += 1;
            }
        }

        let summary = listing_summary(listing, &self.links, !listing.files.is_empty());
        self.notifier
            .send_text(
                user_id,
                &summary,
                Some(listing_keyboard(listing.id, &self.links)),
            )
            .await?;

        Ok(())
    }

    async fn forward_attachment(
        &self,
        user_id: UserId,
        session: &ActiveSession,
        attachment: &Attachment,
        caption: &str,
    ) -> Result<()> {
        let bytes = self
            .marketplace
            .fetch_attachment(session.cookie(), &attachment.url)
            .await?;
        self.notifier
            .send_document(
                user_id,
                bytes,
                attachment.filename.clone(),
                Some(caption.to_string()),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MockMarketplace;
    use crate::core::TrackerError;
    use crate::crypto::vault::test_vault;
    use crate::notify::MockNotifier;
    use crate::storage::{CredentialStore, MemoryStore};
    use crate::tracking::SessionManager;
    use mockall::predicate::eq;
    use mockall::Sequence;
    use serde_json::json;

    fn listing(value: serde_json::Value) -> Listing {
        serde_json::from_value(value).unwrap()
    }

    async fn stored_session(user_id: UserId) -> ActiveSession {
        let store = MemoryStore::new();
        let vault = test_vault();
        store
            .store_cookie(user_id, vault.encrypt("sid=1").unwrap())
            .await
            .unwrap();
        SessionManager::new(Arc::new(MockMarketplace::new()), Arc::new(vault), Arc::new(store))
            .ensure_session(user_id)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_attachments_precede_summary() {
        let mut seq = Sequence::new();
        let mut marketplace = MockMarketplace::new();
        let mut notifier = MockNotifier::new();

        marketplace
            .expect_fetch_attachment()
            .with(eq("sid=1"), eq("https://files.example/brief.pdf"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(vec![1, 2, 3]));
        notifier
            .expect_send_document()
            .withf(|user, bytes, name, caption| {
                *user == 9
                    && bytes == &vec![1, 2, 3]
                    && name == "brief.pdf"
                    && caption.as_deref() == Some("Landing page")
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _, _| Ok(1));
        notifier
            .expect_send_text()
            .withf(|user, html, keyboard| {
                *user == 9 && html.contains("Landing page") && keyboard.is_some()
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(2));

        let dispatcher = Dispatcher::new(
            Arc::new(marketplace),
            Arc::new(notifier),
            ListingLinks::new("https://kwork.ru"),
        );
        let listings = vec![listing(json!({
            "id": 55,
            "name": "Landing page [:fire]",
            "files": [{"url": "https://files.example/brief.pdf", "fname": "brief.pdf"}]
        }))];

        let report = dispatcher
            .dispatch(9, &stored_session(9).await, &listings)
            .await;
        assert_eq!(report.delivered, vec![55]);
        assert!(report.failed.is_empty());
    }

    #[tokio::test]
    async fn test_failure_does_not_block_later_listings() {
        let mut notifier = MockNotifier::new();
        notifier
            .expect_send_text()
            .withf(|_, html, _| html.contains("First"))
            .times(1)
            .returning(|_, _, _| Err(TrackerError::Delivery("chat not found".into())));
        notifier
            .expect_send_text()
            .withf(|_, html, _| html.contains("Second"))
            .times(1)
            .returning(|_, _, _| Ok(3));

        let dispatcher = Dispatcher::new(
            Arc::new(MockMarketplace::new()),
            Arc::new(notifier),
            ListingLinks::new("https://kwork.ru"),
        );
        let listings = vec![
            listing(json!({"id": 1, "name": "First"})),
            listing(json!({"id": 2, "name": "Second"})),
        ];

        let report = dispatcher
            .dispatch(4, &stored_session(4).await, &listings)
            .await;
        assert_eq!(report.delivered, vec![2]);
        assert_eq!(report.failed, vec![1]);
    }

    #[tokio::test]
    async fn test_broken_attachment_still_sends_summary() {
        let mut marketplace = MockMarketplace::new();
        marketplace
            .expect_fetch_attachment()
            .with(eq("sid=1"), eq("/f/gone.zip"))
            .times(1)
            .returning(|_, _| Err(TrackerError::Network("status 404".into())));
        marketplace
            .expect_fetch_attachment()
            .with(eq("sid=1"), eq("/f/brief.pdf"))
            .times(1)
            .returning(|_, _| Ok(b"pdf".to_vec()));

        let mut notifier = MockNotifier::new();
        notifier
            .expect_send_document()
            .withf(|_, _, name, _| name == "brief.pdf")
            .times(1)
            .returning(|_, _, _, _| Ok(1));
        notifier
            .expect_send_text()
            .withf(|_, html, _| html.contains("Scraper"))
            .times(1)
            .returning(|_, _, _| Ok(2));

        let dispatcher = Dispatcher::new(
            Arc::new(marketplace),
            Arc::new(notifier),
            ListingLinks::new("https://kwork.ru"),
        );
        let listings = vec![listing(json!({
            "id": 12,
            "name": "Scraper",
            "files": [
                {"url": "/f/gone.zip", "fname": "gone.zip"},
                {"url": "/f/brief.pdf", "fname": "brief.pdf"}
            ]
        }))];

        let report = dispatcher
            .dispatch(4, &stored_session(4).await, &listings)
            .await;
        assert_eq!(report.delivered, vec![12]);
        assert!(report.failed.is_empty());
        assert_eq!(report.skipped_attachments, 1);
    }
}
