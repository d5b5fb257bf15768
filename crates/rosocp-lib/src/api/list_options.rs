//! Query string handling for list endpoints
//!
//! This module provides:
//! - Paging, ordering and output format options
//! - Resource filters (`cluster`, `project`, ...) and the monitoring date window

use super::error::ApiError;
use crate::storage::{Predicate, SelectQuery, SortOrder, SqlValue};
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};

pub const DEFAULT_LIMIT: i64 = 10;
pub const DEFAULT_OFFSET: i64 = 0;

const DATE_FORMAT: &str = "%Y-%m-%d";
const DEFAULT_ORDER_COLUMN: &str = "clusters.last_reported_at";

/// Decoded query string; repeated keys are kept in order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryParams(Vec<(String, String)>);

impl QueryParams {
    pub fn parse(raw: Option<&str>) -> Self {
        let pairs = raw
            .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
            .unwrap_or_default();
        Self(pairs)
    }

    /// First non-empty value of `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, v)| k == key && !v.is_empty())
            .map(|(_, v)| v.as_str())
    }

    pub fn all(&self, key: &str) -> Vec<String> {
        self.0
            .iter()
            .filter(|(k, v)| k == key && !v.is_empty())
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Same parameters with `limit` and `offset` replaced, url-encoded
    pub fn with_page(&self, limit: i64, offset: i64) -> String {
        let mut out = url::form_urlencoded::Serializer::new(String::new());
        for (k, v) in self.0.iter().filter(|(k, _)| k != "limit" && k != "offset") {
            out.append_pair(k, v);
        }
        out.append_pair("limit", &limit.to_string());
        out.append_pair("offset", &offset.to_string());
        out.finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFormat {
    Json,
    Csv,
}

/// Accept header wins over the `format` parameter
pub fn response_format(accept: Option<&str>, format: Option<&str>) -> Result<ResponseFormat, ApiError> {
    match accept.map(str::trim) {
        Some("text/csv") => return Ok(ResponseFormat::Csv),
        Some("application/json") => return Ok(ResponseFormat::Json),
        _ => {}
    }
    match format.map(str::to_lowercase).as_deref() {
        None | Some("") | Some("json") => Ok(ResponseFormat::Json),
        Some("csv") => Ok(ResponseFormat::Csv),
        Some(other) => Err(ApiError::bad_request(format!("invalid value for format: {other:?}"))),
    }
}

/// Which listing is being served; selects the order and filter columns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Listing {
    Container,
    Namespace,
}

impl Listing {
    fn order_column(&self, key: &str) -> Option<&'static str> {
        let column = match (self, key) {
            (_, "cluster") => "clusters.cluster_alias",
            (_, "last_reported") => DEFAULT_ORDER_COLUMN,
            (Listing::Container, "workload_type") => "workloads.workload_type",
            (Listing::Container, "workload") => "workloads.workload_name",
            (Listing::Container, "project") => "workloads.namespace",
            (Listing::Container, "container") => "recommendation_sets.container_name",
            (Listing::Namespace, "project") => "namespace_recommendation_sets.namespace_name",
            (Listing::Namespace, "cpu_request_current") => "namespace_recommendation_sets.cpu_request_current",
            (Listing::Namespace, "cpu_variation") => "namespace_recommendation_sets.cpu_variation",
            (Listing::Namespace, "memory_request_current") => {
                "namespace_recommendation_sets.memory_request_current"
            }
            (Listing::Namespace, "memory_variation") => "namespace_recommendation_sets.memory_variation",
            _ => return None,
        };
        Some(column)
    }

    fn monitoring_end_column(&self) -> &'static str {
        match self {
            Listing::Container => "recommendation_sets.monitoring_end_time",
            Listing::Namespace => "namespace_recommendation_sets.monitoring_end_time",
        }
    }

    fn project_column(&self) -> &'static str {
        match self {
            Listing::Container => "workloads.namespace",
            Listing::Namespace => "namespace_recommendation_sets.namespace_name",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListOptions {
    pub limit: i64,
    pub offset: i64,
    pub order_by: &'static str,
    pub order: SortOrder,
    pub format: ResponseFormat,
}

fn parse_int(value: Option<&str>, default: i64) -> i64 {
    value.and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl ListOptions {
    pub fn parse(params: &QueryParams, accept: Option<&str>, listing: Listing) -> Result<Self, ApiError> {
        let format = response_format(accept, params.get("format"))?;

        let order = match params.get("order_how").map(str::to_lowercase).as_deref() {
            None | Some("desc") => SortOrder::Desc,
            Some("asc") => SortOrder::Asc,
            Some(other) => return Err(ApiError::bad_request(format!("invalid order_how value: {other}"))),
        };
        let order_by = match params.get("order_by").map(str::trim) {
            None | Some("") => DEFAULT_ORDER_COLUMN,
            Some(key) => listing
                .order_column(key)
                .ok_or_else(|| ApiError::bad_request(format!("invalid order_by value: {key}")))?,
        };

        let limit = parse_int(params.get("limit"), DEFAULT_LIMIT);
        let offset = parse_int(params.get("offset"), DEFAULT_OFFSET).max(0);

        Ok(Self {
            limit: if limit > 0 { limit } else { DEFAULT_LIMIT },
            offset,
            order_by,
            order,
            format,
        })
    }
}

fn parse_date(value: &str, name: &str) -> Result<DateTime<Utc>, ApiError> {
    let date = NaiveDate::parse_from_str(value, DATE_FORMAT)
        .map_err(|_| ApiError::bad_request(format!("invalid {name}: expected YYYY-MM-DD")))?;
    Ok(Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN)))
}

/// `[start, end)` over monitoring end; `end_date` is inclusive.
/// An inverted window is kept and simply matches nothing.
pub fn monitoring_window(
    params: &QueryParams,
    now: DateTime<Utc>,
) -> Result<(DateTime<Utc>, DateTime<Utc>), ApiError> {
    let start = match params.get("start_date") {
        Some(value) => parse_date(value, "start_date")?,
        None => {
            let first = NaiveDate::from_ymd_opt(now.year(), now.month(), 1).unwrap_or(now.date_naive());
            Utc.from_utc_datetime(&first.and_time(chrono::NaiveTime::MIN))
        }
    };
    let end = match params.get("end_date") {
        Some(value) => parse_date(value, "end_date")? + Duration::days(1),
        None => now,
    };
    Ok((start, end))
}

fn contains(column: &str, values: &[String]) -> Predicate {
    Predicate::or(
        values
            .iter()
            .map(|v| Predicate::new(format!("{column} ILIKE ?"), vec![SqlValue::Text(format!("%{v}%"))]))
            .collect(),
    )
}

/// Add the request's filters and date window to `query`
pub fn apply_filters(
    query: &mut SelectQuery,
    params: &QueryParams,
    listing: Listing,
    now: DateTime<Utc>,
) -> Result<(), ApiError> {
    let (start, end) = monitoring_window(params, now)?;
    let column = listing.monitoring_end_column();
    query.where_sql(format!("{column} >= ?"), vec![SqlValue::Timestamp(start)]);
    query.where_sql(format!("{column} < ?"), vec![SqlValue::Timestamp(end)]);

    let clusters = params.all("cluster");
    if !clusters.is_empty() {
        query.filter(Predicate::or(vec![
            contains("clusters.cluster_alias", &clusters),
            contains("clusters.cluster_uuid", &clusters),
        ]));
    }
    let projects = params.all("project");
    if !projects.is_empty() {
        query.filter(contains(listing.project_column(), &projects));
    }

    if listing == Listing::Container {
        let workloads = params.all("workload");
        if !workloads.is_empty() {
            query.filter(contains("workloads.workload_name", &workloads));
        }
        let containers = params.all("container");
        if !containers.is_empty() {
            query.filter(contains("recommendation_sets.container_name", &containers));
        }
        let types = params.all("workload_type");
        if !types.is_empty() {
            query.filter(Predicate::or(
                types
                    .into_iter()
                    .map(|t| Predicate::new("workloads.workload_type = ?", vec![SqlValue::Text(t)]))
                    .collect(),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(raw: &str) -> QueryParams {
        QueryParams::parse(Some(raw))
    }

    #[test]
    fn test_defaults() {
        let options = ListOptions::parse(&QueryParams::default(), None, Listing::Container).unwrap();
        assert_eq!(options.limit, 10);
        assert_eq!(options.offset, 0);
        assert_eq!(options.order_by, "clusters.last_reported_at");
        assert_eq!(options.order, SortOrder::Desc);
        assert_eq!(options.format, ResponseFormat::Json);
    }

    #[test]
    fn test_order_keys_depend_on_listing() {
        let p = params("order_by=container&order_how=ASC");
        let options = ListOptions::parse(&p, None, Listing::Container).unwrap();
        assert_eq!(options.order_by, "recommendation_sets.container_name");
        assert_eq!(options.order, SortOrder::Asc);

        assert!(ListOptions::parse(&p, None, Listing::Namespace).is_err());
        let p = params("order_by=cpu_variation");
        assert_eq!(
            ListOptions::parse(&p, None, Listing::Namespace).unwrap().order_by,
            "namespace_recommendation_sets.cpu_variation"
        );
        assert!(ListOptions::parse(&params("order_how=sideways"), None, Listing::Container).is_err());
    }

    #[test]
    fn test_bad_numbers_fall_back() {
        let options = ListOptions::parse(&params("limit=abc&offset=-5"), None, Listing::Container).unwrap();
        assert_eq!(options.limit, 10);
        assert_eq!(options.offset, 0);
    }

    #[test]
    fn test_format_negotiation() {
        assert_eq!(response_format(Some("text/csv"), Some("json")).unwrap(), ResponseFormat::Csv);
        assert_eq!(response_format(Some("*/*"), Some("csv")).unwrap(), ResponseFormat::Csv);
        assert_eq!(response_format(None, None).unwrap(), ResponseFormat::Json);
        assert!(response_format(None, Some("xml")).is_err());
    }

    #[test]
    fn test_window_defaults_and_inclusive_end() {
        let now = Utc.with_ymd_and_hms(2024, 3, 20, 12, 0, 0).unwrap();
        let (start, end) = monitoring_window(&QueryParams::default(), now).unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap());
        assert_eq!(end, now);

        let (start, end) = monitoring_window(&params("start_date=2024-02-01&end_date=2024-02-10"), now).unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2024, 2, 11, 0, 0, 0).unwrap());

        assert!(monitoring_window(&params("start_date=02/01/2024"), now).is_err());
    }

    #[test]
    fn test_end_date_before_default_start_is_accepted() {
        let now = Utc.with_ymd_and_hms(2024, 3, 20, 12, 0, 0).unwrap();
        let (start, end) = monitoring_window(&params("end_date=2024-02-10"), now).unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2024, 2, 11, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_filters_are_or_within_and_across() {
        let now = Utc.with_ymd_and_hms(2024, 3, 20, 12, 0, 0).unwrap();
        let mut query = SelectQuery::new("*", "recommendation_sets");
        let p = params("cluster=prod&project=a&project=b&workload_type=deployment&container=web");
        apply_filters(&mut query, &p, Listing::Container, now).unwrap();

        let described = query.describe();
        assert!(described.contains(
            "(clusters.cluster_alias ILIKE '%prod%' OR clusters.cluster_uuid ILIKE '%prod%')"
        ));
        assert!(described.contains("(workloads.namespace ILIKE '%a%' OR workloads.namespace ILIKE '%b%')"));
        assert!(described.contains("(workloads.workload_type = 'deployment')"));
        assert!(described.contains("(recommendation_sets.container_name ILIKE '%web%')"));
    }

    #[test]
    fn test_namespace_listing_ignores_container_filters() {
        let now = Utc.with_ymd_and_hms(2024, 3, 20, 12, 0, 0).unwrap();
        let mut query = SelectQuery::new("*", "namespace_recommendation_sets");
        apply_filters(&mut query, &params("project=a&container=web"), Listing::Namespace, now).unwrap();

        let described = query.describe();
        assert!(described.contains("namespace_recommendation_sets.namespace_name ILIKE '%a%'"));
        assert!(!described.contains("container_name"));
    }

    #[test]
    fn test_with_page_keeps_other_params() {
        let p = params("cluster=prod&limit=5&offset=0");
        assert_eq!(p.with_page(5, 10), "cluster=prod&limit=5&offset=10");
    }
}
