use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use super::title::{Title, TitleType};

/// Ordering key for listings. Listings are always descending; ties are broken
/// by title key, also descending, so merged fragment results and Central
/// results come out in the same order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    #[default]
    StartYear,
    LastUpdated,
    Id,
}

impl SortKey {
    /// Column expression used in `ORDER BY`.
    pub fn column(&self) -> &'static str {
        match self {
            SortKey::StartYear => "start_year",
            SortKey::LastUpdated => "last_updated",
            SortKey::Id => "CAST(SUBSTRING(tconst, 3) AS UNSIGNED)",
        }
    }

    fn compare(&self, a: &Title, b: &Title) -> Ordering {
        let primary = match self {
            SortKey::StartYear => a.start_year.cmp(&b.start_year),
            SortKey::LastUpdated => a.last_updated.cmp(&b.last_updated),
            SortKey::Id => Ordering::Equal,
        };
        primary.then_with(|| a.id.cmp(&b.id))
    }
}

/// Sorts titles descending by `key`.
pub fn sort_titles(titles: &mut [Title], key: SortKey) {
    titles.sort_by(|a, b| key.compare(b, a));
}

/// Search criteria. Every field is optional; an empty filter matches all.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TitleFilter {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub year_from: Option<i32>,
    #[serde(default)]
    pub year_to: Option<i32>,
    #[serde(default)]
    pub title_type: Option<TitleType>,
    #[serde(default)]
    pub genres: Vec<String>,
}

impl TitleFilter {
    pub fn by_type(title_type: Option<TitleType>) -> Self {
        Self {
            title_type,
            ..Default::default()
        }
    }

    /// Text pattern for `LIKE`, with wildcards in the search text escaped.
    pub fn like_pattern(&self) -> Option<String> {
        let text = self.text.as_deref()?.trim();
        if text.is_empty() {
            return None;
        }
        let escaped = text
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_");
        Some(format!("%{}%", escaped))
    }

    pub fn matches(&self, title: &Title) -> bool {
        if let Some(t) = self.title_type {
            if title.title_type != t {
                return false;
            }
        }
        if let Some(text) = self.text.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            if !title
                .primary_title
                .to_lowercase()
                .contains(&text.to_lowercase())
            {
                return false;
            }
        }
        if let Some(from) = self.year_from {
            if title.start_year.map_or(true, |y| y < from) {
                return false;
            }
        }
        if let Some(to) = self.year_to {
            if title.start_year.map_or(true, |y| y > to) {
                return false;
            }
        }
        self.genres.iter().all(|wanted| {
            title
                .genres
                .iter()
                .any(|g| g.eq_ignore_ascii_case(wanted))
        })
    }
}

/// Row window applied after ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub offset: u64,
    pub limit: u64,
}

impl Window {
    /// Cuts this window out of an already ordered result set.
    pub fn apply<T>(&self, items: Vec<T>) -> Vec<T> {
        let offset = usize::try_from(self.offset).unwrap_or(usize::MAX);
        let limit = usize::try_from(self.limit).unwrap_or(usize::MAX);
        items.into_iter().skip(offset).take(limit).collect()
    }
}

/// A read over the titles table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitleQuery {
    pub filter: TitleFilter,
    pub sort: SortKey,
    /// `None` fetches every matching row.
    pub window: Option<Window>,
}

impl TitleQuery {
    pub fn all(filter: TitleFilter, sort: SortKey) -> Self {
        Self {
            filter,
            sort,
            window: None,
        }
    }

    pub fn paged(filter: TitleFilter, sort: SortKey, pagination: Pagination) -> Self {
        Self {
            filter,
            sort,
            window: Some(pagination.window()),
        }
    }
}

/// One-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub page: u64,
    pub page_size: u64,
}

impl Pagination {
    pub fn new(page: u64, page_size: u64) -> Self {
        Self {
            page: page.max(1),
            page_size: page_size.max(1),
        }
    }

    /// Offsets past `u64::MAX` saturate to an empty page.
    pub fn window(&self) -> Window {
        Window {
            offset: self.page.saturating_sub(1).saturating_mul(self.page_size),
            limit: self.page_size,
        }
    }

    /// Slices an already ordered result set.
    pub fn slice<T>(&self, items: Vec<T>) -> Vec<T> {
        self.window().apply(items)
    }
}

/// A page of titles plus the total number of matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Page {
    pub items: Vec<Title>,
    pub total: u64,
    pub page: u64,
    pub page_size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NewTitle, TitleId};
    use chrono::{TimeZone, Utc};

    fn title(n: u64, year: Option<i32>, t: TitleType, name: &str) -> Title {
        let mut new = NewTitle::new(t, name).with_genres(["Drama"]);
        new.start_year = year;
        new.into_title(
            TitleId::from_number(n),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, n as u32 % 60).unwrap(),
        )
    }

    #[test]
    fn test_sort_by_year_desc_nulls_last() {
        let mut titles = vec![
            title(1, Some(2001), TitleType::Movie, "a"),
            title(2, None, TitleType::Movie, "b"),
            title(3, Some(2010), TitleType::Movie, "c"),
            title(4, Some(2010), TitleType::Movie, "d"),
        ];
        sort_titles(&mut titles, SortKey::StartYear);
        let order: Vec<u64> = titles.iter().map(|t| t.id.number().unwrap()).collect();
        assert_eq!(order, vec![4, 3, 1, 2]);
    }

    #[test]
    fn test_filter_matches() {
        let t = title(1, Some(2005), TitleType::TvSeries, "Lost Highway");
        assert!(TitleFilter::default().matches(&t));
        assert!(TitleFilter::by_type(Some(TitleType::TvSeries)).matches(&t));
        assert!(!TitleFilter::by_type(Some(TitleType::Movie)).matches(&t));

        let text = TitleFilter {
            text: Some("highway".into()),
            ..Default::default()
        };
        assert!(text.matches(&t));

        let years = TitleFilter {
            year_from: Some(2006),
            ..Default::default()
        };
        assert!(!years.matches(&t));

        let genres = TitleFilter {
            genres: vec!["drama".into()],
            ..Default::default()
        };
        assert!(genres.matches(&t));
    }

    #[test]
    fn test_like_pattern_escapes_wildcards() {
        let filter = TitleFilter {
            text: Some("100%_real".into()),
            ..Default::default()
        };
        assert_eq!(filter.like_pattern().unwrap(), "%100\\%\\_real%");
        assert!(TitleFilter::default().like_pattern().is_none());
    }

    #[test]
    fn test_pagination_window_and_slice() {
        let p = Pagination::new(2, 3);
        assert_eq!(p.window(), Window { offset: 3, limit: 3 });
        assert_eq!(p.slice((0..10).collect()), vec![3, 4, 5]);
        assert_eq!(Pagination::new(0, 0), Pagination::new(1, 1));
    }

    #[test]
    fn test_pagination_saturates_on_huge_pages() {
        let p = Pagination::new(u64::MAX, 20);
        assert_eq!(p.window(), Window { offset: u64::MAX, limit: 20 });
        assert!(p.slice((0..10).collect::<Vec<i32>>()).is_empty());

        let p = Pagination::new(2, u64::MAX);
        assert_eq!(p.window().offset, u64::MAX);
        assert!(p.slice(vec![1, 2, 3]).is_empty());
    }
}
