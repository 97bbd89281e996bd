//! Owner-facing notices posted by background format runs.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::catalog::ProductId;

/// Severity of a notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// A message for the owner of one product.
#[derive(Debug, Clone, Serialize)]
pub struct Notice {
    pub product_id: ProductId,
    pub level: NoticeLevel,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl Notice {
    pub fn new(product_id: ProductId, level: NoticeLevel, message: impl Into<String>) -> Self {
        Self {
            product_id,
            level,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

/// Notices kept per product, oldest first.
///
/// Each product keeps at most `capacity` notices; older ones are dropped.
#[derive(Debug, Clone)]
pub struct NoticeBoard {
    notices: Arc<RwLock<HashMap<ProductId, Vec<Notice>>>>,
    capacity: usize,
}

impl Default for NoticeBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl NoticeBoard {
    pub const DEFAULT_CAPACITY: usize = 50;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            notices: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    pub fn post(&self, notice: Notice) {
        match notice.level {
            NoticeLevel::Error => tracing::error!("Product {}: {}", notice.product_id, notice.message),
            NoticeLevel::Warning => {
                tracing::warn!("Product {}: {}", notice.product_id, notice.message)
            }
            NoticeLevel::Info => tracing::info!("Product {}: {}", notice.product_id, notice.message),
        }

        let mut notices = self.notices.write();
        let list = notices.entry(notice.product_id).or_default();
        list.push(notice);
        if list.len() > self.capacity {
            let excess = list.len() - self.capacity;
            list.drain(..excess);
        }
    }

    pub fn for_product(&self, product_id: ProductId) -> Vec<Notice> {
        self.notices
            .read()
            .get(&product_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Removes and returns a product's notices.
    pub fn take(&self, product_id: ProductId) -> Vec<Notice> {
        self.notices.write().remove(&product_id).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notices_are_per_product() {
        let board = NoticeBoard::new();
        board.post(Notice::new(1, NoticeLevel::Info, "ready"));
        board.post(Notice::new(2, NoticeLevel::Error, "failed"));

        let first = board.for_product(1);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].message, "ready");
        assert!(board.for_product(3).is_empty());

        assert_eq!(board.take(2).len(), 1);
        assert!(board.for_product(2).is_empty());
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let board = NoticeBoard::with_capacity(2);
        for i in 0..3 {
            board.post(Notice::new(1, NoticeLevel::Warning, format!("n{i}")));
        }
        let messages: Vec<_> = board
            .for_product(1)
            .into_iter()
            .map(|n| n.message)
            .collect();
        assert_eq!(messages, vec!["n1", "n2"]);
    }

    #[test]
    fn test_notice_serializes_level_lowercase() {
        let json = serde_json::to_value(Notice::new(4, NoticeLevel::Warning, "x")).unwrap();
        assert_eq!(json["level"], "warning");
        assert_eq!(json["product_id"], 4);
    }
}
