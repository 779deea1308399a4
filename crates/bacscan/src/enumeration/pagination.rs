//! Page envelopes for object enumeration

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Largest page the engine is asked for
pub const MAX_PAGE_SIZE: u32 = 1000;

/// 1-based page envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub page: u32,
    pub page_size: u32,
    pub total_items: u64,
    pub total_pages: u32,
    pub has_next: bool,
    pub has_previous: bool,
}

impl Pagination {
    /// Derive the envelope from a total item count
    pub fn compute(page: u32, page_size: u32, total_items: u64) -> Self {
        let total_pages = total_items.div_ceil(u64::from(page_size.max(1)));
        let total_pages = u32::try_from(total_pages).unwrap_or(u32::MAX);
        Self {
            page,
            page_size,
            total_items,
            total_pages,
            has_next: page < total_pages,
            has_previous: page > 1,
        }
    }

    /// Take the engine's envelope, filling gaps from the request and the
    /// number of objects actually returned
    pub fn from_engine(value: Option<&Value>, page: u32, page_size: u32, returned: usize) -> Self {
        let field = |key: &str| value.and_then(|v| v.get(key));
        let number = |key: &str| field(key).and_then(Value::as_u64);

        let page = number("page")
            .and_then(|p| u32::try_from(p).ok())
            .unwrap_or(page);
        let page_size = number("page_size")
            .and_then(|p| u32::try_from(p).ok())
            .filter(|p| *p > 0)
            .unwrap_or(page_size);
        let total_items = number("total_items").unwrap_or(returned as u64);

        let mut pagination = Self::compute(page, page_size, total_items);
        if let Some(total_pages) = number("total_pages").and_then(|p| u32::try_from(p).ok()) {
            pagination.total_pages = total_pages;
            pagination.has_next = page < total_pages;
        }
        if let Some(has_next) = field("has_next").and_then(Value::as_bool) {
            pagination.has_next = has_next;
        }
        if let Some(has_previous) = field("has_previous").and_then(Value::as_bool) {
            pagination.has_previous = has_previous;
        }
        pagination
    }
}

/// Reject page requests outside `page >= 1`, `1 <= page_size <= 1000`
pub fn validate_page(page: u32, page_size: u32) -> Result<()> {
    if page < 1 {
        return Err(Error::Validation(format!("page must be at least 1, got {}", page)));
    }
    if !(1..=MAX_PAGE_SIZE).contains(&page_size) {
        return Err(Error::Validation(format!(
            "page_size must be between 1 and {}, got {}",
            MAX_PAGE_SIZE, page_size
        )));
    }
    Ok(())
}
