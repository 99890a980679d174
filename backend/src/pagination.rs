//! Pagination and query helpers for record listings
//!
//! `page`, `per_page`, `sort_by` and `sort_order` are reserved query keys;
//! every other key of a record list query is an equality filter.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

use crate::store::{ListQuery, SortSpec};
use crate::validation::RawFields;

/// Default page size if not specified
pub const DEFAULT_PAGE_SIZE: i64 = 25;
/// Maximum allowed page size
pub const MAX_PAGE_SIZE: i64 = 100;
/// Default page number (1-indexed for API consumers)
pub const DEFAULT_PAGE: i64 = 1;

/// Standard pagination query parameters
#[derive(Debug, Clone, Deserialize)]
pub struct PaginationParams {
    /// Page number (1-indexed)
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_per_page")]
    pub per_page: i64,
    pub sort_by: Option<String>,
    /// asc or desc
    #[serde(default = "default_sort_order")]
    pub sort_order: String,
}

fn default_page() -> i64 {
    DEFAULT_PAGE
}

fn default_per_page() -> i64 {
    DEFAULT_PAGE_SIZE
}

fn default_sort_order() -> String {
    "desc".to_string()
}

impl PaginationParams {
    pub fn offset(&self) -> i64 {
        (self.page.max(1) - 1) * self.limit()
    }

    pub fn limit(&self) -> i64 {
        self.per_page.clamp(1, MAX_PAGE_SIZE)
    }

    pub fn is_descending(&self) -> bool {
        !self.sort_order.eq_ignore_ascii_case("asc")
    }

    /// Store query for this page. The filter is filled in by the caller.
    pub fn to_list_query(&self) -> ListQuery {
        let sort = match &self.sort_by {
            Some(field) if !field.trim().is_empty() => SortSpec {
                field: field.trim().to_string(),
                descending: self.is_descending(),
            },
            _ => SortSpec {
                descending: self.is_descending(),
                ..SortSpec::default()
            },
        };

        ListQuery {
            limit: self.limit(),
            offset: self.offset(),
            sort,
            ..ListQuery::default()
        }
    }
}

impl Default for PaginationParams {
    fn default() -> Self {
        Self {
            page: DEFAULT_PAGE,
            per_page: DEFAULT_PAGE_SIZE,
            sort_by: None,
            sort_order: default_sort_order(),
        }
    }
}

/// Splits a raw record list query into paging parameters and field filters.
/// Unparseable paging values fall back to their defaults.
pub fn split_record_query(query: HashMap<String, String>) -> (PaginationParams, RawFields) {
    let mut params = PaginationParams::default();
    let mut filter = RawFields::new();

    for (key, value) in query {
        match key.as_str() {
            "page" => params.page = value.parse().unwrap_or(DEFAULT_PAGE),
            "per_page" => params.per_page = value.parse().unwrap_or(DEFAULT_PAGE_SIZE),
            "sort_by" => params.sort_by = Some(value),
            "sort_order" => params.sort_order = value,
            _ => {
                filter.insert(key, JsonValue::String(value));
            }
        }
    }

    (params, filter)
}

/// Pagination metadata returned with list responses
#[derive(Debug, Clone, Serialize)]
pub struct PaginationMeta {
    pub page: i64,
    pub per_page: i64,
    pub total: i64,
    pub total_pages: i64,
    pub has_next: bool,
    pub has_prev: bool,
}

impl PaginationMeta {
    pub fn new(page: i64, per_page: i64, total: i64) -> Self {
        let total_pages = (total + per_page - 1) / per_page;
        Self {
            page,
            per_page,
            total,
            total_pages,
            has_next: page < total_pages,
            has_prev: page > 1,
        }
    }
}

/// Standard paginated response wrapper
#[derive(Debug, Clone, Serialize)]
pub struct PaginatedResponse<T> {
    pub data: Vec<T>,
    pub meta: PaginationMeta,
}

impl<T> PaginatedResponse<T> {
    pub fn new(data: Vec<T>, params: &PaginationParams, total: i64) -> Self {
        Self {
            data,
            meta: PaginationMeta::new(params.page.max(1), params.limit(), total),
        }
    }
}
