//! Item collection bounded by `max_items` and an optional `since` cutoff.
//!
//! Adapters feed items in the order the source returns them. For sources
//! that list newest-first the window closes at the first item older than
//! `since`; for anything else it keeps scanning and filters client-side,
//! since an old item says nothing about the ones after it.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::ItemRecord;

/// The order in which a source returns items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ItemOrder {
    NewestFirst,
    Unordered,
}

#[derive(Debug)]
pub struct ItemWindow {
    max_items: usize,
    since: Option<DateTime<Utc>>,
    order: ItemOrder,
    items: Vec<ItemRecord>,
    closed: bool,
}

impl ItemWindow {
    pub fn new(max_items: usize, since: Option<DateTime<Utc>>, order: ItemOrder) -> Self {
        Self {
            max_items,
            since,
            order,
            items: Vec::new(),
            closed: max_items == 0,
        }
    }

    /// Offers the next item. Returns `false` once the caller should stop
    /// collecting.
    ///
    /// Items without a timestamp are kept: nothing proves they are older
    /// than the cutoff.
    pub fn offer(&mut self, item: ItemRecord) -> bool {
        if self.closed {
            return false;
        }

        let too_old = matches!(
            (self.since, item.timestamp),
            (Some(since), Some(ts)) if ts < since
        );
        if too_old {
            if self.order == ItemOrder::NewestFirst {
                self.closed = true;
                return false;
            }
            return true;
        }

        self.items.push(item);
        if self.items.len() >= self.max_items {
            self.closed = true;
        }
        !self.closed
    }

    /// Offers items until the window closes.
    pub fn extend(&mut self, items: impl IntoIterator<Item = ItemRecord>) {
        for item in items {
            if !self.offer(item) {
                break;
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn into_items(self) -> Vec<ItemRecord> {
        self.items
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn item_at(day: u32) -> ItemRecord {
        ItemRecord::new(format!("day {day}"), format!("https://x/{day}"))
            .with_timestamp(Some(Utc.with_ymd_and_hms(2024, 5, day, 12, 0, 0).unwrap()))
    }

    fn since_day(day: u32) -> Option<DateTime<Utc>> {
        Some(Utc.with_ymd_and_hms(2024, 5, day, 0, 0, 0).unwrap())
    }

    #[test]
    fn respects_max_items_as_upper_bound() {
        let mut window = ItemWindow::new(2, None, ItemOrder::NewestFirst);
        window.extend([item_at(5), item_at(4), item_at(3)]);
        assert_eq!(window.len(), 2);
        assert!(window.is_closed());
    }

    #[test]
    fn newest_first_stops_at_first_old_item() {
        let mut window = ItemWindow::new(10, since_day(3), ItemOrder::NewestFirst);
        // Day 4 after the old item must not be collected: the early stop has fired.
        window.extend([item_at(5), item_at(2), item_at(4)]);
        let items = window.into_items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].caption, "day 5");
    }

    #[test]
    fn unordered_filters_without_stopping() {
        let mut window = ItemWindow::new(10, since_day(3), ItemOrder::Unordered);
        window.extend([item_at(5), item_at(2), item_at(4)]);
        let captions: Vec<_> = window.into_items().into_iter().map(|i| i.caption).collect();
        assert_eq!(captions, vec!["day 5", "day 4"]);
    }

    #[test]
    fn undated_items_pass_the_cutoff() {
        let mut window = ItemWindow::new(10, since_day(3), ItemOrder::NewestFirst);
        window.extend([ItemRecord::new("undated", "u")]);
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn zero_max_items_collects_nothing() {
        let mut window = ItemWindow::new(0, None, ItemOrder::Unordered);
        assert!(!window.offer(item_at(1)));
        assert!(window.is_empty());
    }
}
