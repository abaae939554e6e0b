//! Query planning.
//!
//! A feature service caps every query at `maxRecordCount` records. For each
//! filter the planner looks at the record count and decides whether one
//! request is enough, whether the filter has to be paged through with
//! `resultOffset`, or whether it cannot be served at all.

use crate::error::{RestCacheError, Result};
use crate::service::ServiceModel;

/// Filter that matches every record.
pub const MATCH_ALL: &str = "1=1";

/// The `where` clauses to sync. An empty list syncs nothing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Filters {
    #[default]
    All,
    One(String),
    Many(Vec<String>),
}

impl Filters {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            Filters::All => vec![MATCH_ALL.to_string()],
            Filters::One(filter) => vec![filter],
            Filters::Many(filters) => filters,
        }
    }
}

impl From<&str> for Filters {
    fn from(filter: &str) -> Self {
        Filters::One(filter.to_string())
    }
}

impl From<String> for Filters {
    fn from(filter: String) -> Self {
        Filters::One(filter)
    }
}

impl From<Vec<String>> for Filters {
    fn from(filters: Vec<String>) -> Self {
        Filters::Many(filters)
    }
}

impl<T: Into<Filters>> From<Option<T>> for Filters {
    fn from(filters: Option<T>) -> Self {
        filters.map_or(Filters::All, Into::into)
    }
}

/// One page request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryEntry {
    pub filter: String,
    /// `resultOffset`; `None` means the parameter is not sent.
    pub offset: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FilterPlan {
    /// Nothing matches; the filter is skipped.
    Empty { filter: String },
    /// Everything fits into one response.
    Single { filter: String, count: u64 },
    /// Offsets `0, page_size, 2 * page_size, ...` until a page comes back empty.
    Paged {
        filter: String,
        count: u64,
        page_size: u32,
    },
}

impl FilterPlan {
    pub fn filter(&self) -> &str {
        match self {
            FilterPlan::Empty { filter }
            | FilterPlan::Single { filter, .. }
            | FilterPlan::Paged { filter, .. } => filter,
        }
    }

    /// Record count reported when the plan was made.
    pub fn expected_records(&self) -> u64 {
        match self {
            FilterPlan::Empty { .. } => 0,
            FilterPlan::Single { count, .. } | FilterPlan::Paged { count, .. } => *count,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, FilterPlan::Empty { .. })
    }

    /// Page requests in execution order. Unbounded for `Paged`.
    pub fn entries(&self) -> PlanEntries<'_> {
        PlanEntries {
            plan: self,
            index: 0,
        }
    }
}

pub struct PlanEntries<'a> {
    plan: &'a FilterPlan,
    index: u64,
}

impl Iterator for PlanEntries<'_> {
    type Item = QueryEntry;

    fn next(&mut self) -> Option<QueryEntry> {
        let offset = match self.plan {
            FilterPlan::Empty { .. } => return None,
            FilterPlan::Single { .. } if self.index > 0 => return None,
            FilterPlan::Single { .. } => None,
            FilterPlan::Paged { page_size, .. } => {
                Some(self.index.checked_mul(u64::from(*page_size))?)
            }
        };
        self.index += 1;
        Some(QueryEntry {
            filter: self.plan.filter().to_string(),
            offset,
        })
    }
}

/// Plans for all filters, in order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryPlan {
    filters: Vec<FilterPlan>,
}

impl QueryPlan {
    pub fn filters(&self) -> &[FilterPlan] {
        &self.filters
    }

    /// True when no filter has any records.
    pub fn is_empty(&self) -> bool {
        self.filters.iter().all(FilterPlan::is_empty)
    }
}

impl IntoIterator for QueryPlan {
    type Item = FilterPlan;
    type IntoIter = std::vec::IntoIter<FilterPlan>;

    fn into_iter(self) -> Self::IntoIter {
        self.filters.into_iter()
    }
}

pub struct QueryPlanner<'a> {
    model: &'a ServiceModel,
}

impl<'a> QueryPlanner<'a> {
    pub fn new(model: &'a ServiceModel) -> Self {
        Self { model }
    }

    /// Decide how to fetch the `count` records matching `filter`.
    pub fn plan_filter(&self, filter: &str, count: u64) -> Result<FilterPlan> {
        let cap = self.model.max_record_count();
        let filter = filter.to_string();

        if count == 0 {
            Ok(FilterPlan::Empty { filter })
        } else if self.model.supports_pagination() {
            Ok(FilterPlan::Paged {
                filter,
                count,
                page_size: cap,
            })
        } else if count > u64::from(cap) {
            Err(RestCacheError::TooManyRecords {
                filter,
                count,
                max_record_count: cap,
            })
        } else {
            Ok(FilterPlan::Single { filter, count })
        }
    }

    /// Plan every filter up front, calling `count` once per filter.
    ///
    /// Syncing plans lazily instead so that a failing filter does not prevent
    /// earlier ones from being written.
    pub fn plan<F>(&self, filters: Filters, mut count: F) -> Result<QueryPlan>
    where
        F: FnMut(&str) -> Result<u64>,
    {
        let filters = filters
            .into_vec()
            .into_iter()
            .map(|filter| {
                let records = count(&filter)?;
                self.plan_filter(&filter, records)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(QueryPlan { filters })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::testing::{SERVICE_URL, point_metadata};

    fn model(max_record_count: u32, paginate: bool) -> ServiceModel {
        ServiceModel::from_metadata(
            SERVICE_URL,
            &point_metadata(max_record_count, paginate),
            &[],
            &[],
        )
        .expect("valid metadata")
    }

    #[test]
    fn filters_normalize() {
        assert_eq!(Filters::All.into_vec(), vec!["1=1"]);
        assert_eq!(Filters::from("a = 1").into_vec(), vec!["a = 1"]);
        assert_eq!(Filters::from(None::<&str>), Filters::All);
        let many = vec!["a = 1".to_string(), "a = 2".to_string()];
        assert_eq!(Filters::from(many.clone()).into_vec(), many);
        assert!(Filters::Many(Vec::new()).into_vec().is_empty());
    }

    #[test]
    fn paged_plan_offsets_step_by_cap() -> Result<()> {
        let model = model(2, true);
        let plan = QueryPlanner::new(&model).plan_filter("1=1", 5)?;

        let offsets: Vec<Option<u64>> = plan.entries().take(4).map(|e| e.offset).collect();
        assert_eq!(offsets, vec![Some(0), Some(2), Some(4), Some(6)]);
        assert_eq!(plan.expected_records(), 5);
        Ok(())
    }

    #[test]
    fn single_plan_sends_no_offset() -> Result<()> {
        let model = model(10, false);
        let plan = QueryPlanner::new(&model).plan_filter("a > 3", 10)?;

        let entries: Vec<QueryEntry> = plan.entries().collect();
        assert_eq!(
            entries,
            vec![QueryEntry {
                filter: "a > 3".to_string(),
                offset: None
            }]
        );
        Ok(())
    }

    #[test]
    fn empty_filter_has_no_entries() -> Result<()> {
        let model = model(10, true);
        let plan = QueryPlanner::new(&model).plan_filter("1=0", 0)?;
        assert!(plan.is_empty());
        assert_eq!(plan.entries().count(), 0);
        Ok(())
    }

    #[test]
    fn too_many_records_without_pagination() {
        let model = model(1000, false);
        let err = QueryPlanner::new(&model)
            .plan_filter("1=1", 1001)
            .expect_err("filter cannot be served");
        match err {
            RestCacheError::TooManyRecords {
                filter,
                count,
                max_record_count,
            } => {
                assert_eq!(filter, "1=1");
                assert_eq!(count, 1001);
                assert_eq!(max_record_count, 1000);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn eager_plan_counts_each_filter() -> Result<()> {
        let model = model(3, false);
        let mut counted = Vec::new();
        let plan = QueryPlanner::new(&model).plan(
            Filters::Many(vec!["a".to_string(), "b".to_string()]),
            |filter| {
                counted.push(filter.to_string());
                Ok(if filter == "a" { 0 } else { 3 })
            },
        )?;

        assert_eq!(counted, vec!["a", "b"]);
        assert!(plan.filters()[0].is_empty());
        assert_eq!(
            plan.filters()[1],
            FilterPlan::Single {
                filter: "b".to_string(),
                count: 3
            }
        );
        assert!(!plan.is_empty());
        Ok(())
    }
}
