use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::api::Listing;
use crate::core::ListingId;

/// Listing ids visible on the first page as of the last successful poll.
///
/// A snapshot, not a history: ids that drop off the page are forgotten, so a
/// listing that disappears and later comes back is reported as new again.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SeenSet(Vec<ListingId>);

/// Outcome of comparing a fresh page against the previous snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingDiff {
    /// Listings absent from the previous snapshot, in marketplace order.
    pub new_listings: Vec<Listing>,
    /// Exactly the ids present in the fetched page, duplicates removed.
    pub updated_seen: SeenSet,
}

impl SeenSet {
    pub fn new(ids: impl IntoIterator<Item = ListingId>) -> Self {
        let mut unique = HashSet::new();
        Self(ids.into_iter().filter(|id| unique.insert(*id)).collect())
    }

    /// Decode the persisted JSON array. Missing or corrupt input yields an
    /// empty set, so the next poll reports every open listing.
    pub fn from_json(raw: Option<&str>) -> Self {
        let Some(raw) = raw.filter(|raw| !raw.trim().is_empty()) else {
            return Self::default();
        };

        match serde_json::from_str::<Vec<ListingId>>(raw) {
            Ok(ids) => Self::new(ids),
            Err(e) => {
                tracing::warn!("Discarding unreadable seen-id snapshot: {}", e);
                Self::default()
            }
        }
    }

    pub fn to_json(&self) -> String {
        // A Vec<u64> always serializes.
        serde_json::to_string(&self.0).unwrap_or_else(|_| "[]".to_string())
    }

    pub fn ids(&self) -> &[ListingId] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, id: ListingId) -> bool {
        self.0.contains(&id)
    }

    /// Copy of this snapshot without `ids`; used to keep undelivered listings
    /// eligible for the next poll.
    pub fn without(&self, ids: &[ListingId]) -> Self {
        let excluded: HashSet<ListingId> = ids.iter().copied().collect();
        Self(
            self.0
                .iter()
                .copied()
                .filter(|id| !excluded.contains(id))
                .collect(),
        )
    }

    pub fn diff(&self, fetched: Vec<Listing>) -> ListingDiff {
        let previous: HashSet<ListingId> = self.0.iter().copied().collect();
        let mut visible = HashSet::with_capacity(fetched.len());
        let mut updated = Vec::with_capacity(fetched.len());
        let mut new_listings = Vec::new();

        for listing in fetched {
            if !visible.insert(listing.id) {
                continue;
            }
            updated.push(listing.id);

            if !previous.contains(&listing.id) {
                new_listings.push(listing);
            }
        }

        ListingDiff {
            new_listings,
            updated_seen: SeenSet(updated),
        }
    }
}
